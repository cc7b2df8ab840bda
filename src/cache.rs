use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::http::{Response, StatusCode};

/// One previously forwarded response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub body: Bytes,
    /// Declared `Content-Type`; empty when the origin sent none.
    pub content_type: String,
    pub status: StatusCode,
}

impl CacheEntry {
    pub fn from_response(response: &Response) -> Self {
        Self {
            body: response.body.clone(),
            content_type: response.content_type().to_string(),
            status: response.status,
        }
    }

    /// The response served to clients for this entry.
    pub fn to_response(&self) -> Response {
        let response = Response::new(self.status, self.body.clone());
        if self.content_type.is_empty() {
            response
        } else {
            response.with_header("Content-Type", self.content_type.clone())
        }
    }
}

/// Shared map from request target to cached response.
///
/// Unbounded and never expires. Clones share the same map; the lock is held
/// only for the map operation itself.
#[derive(Clone, Default)]
pub struct CacheStore {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let entries = self.entries.lock().await;
        entries.get(key).cloned()
    }

    /// Store `entry` under `key`, replacing any previous entry.
    pub async fn put(&self, key: impl Into<String>, entry: CacheEntry) {
        let mut entries = self.entries.lock().await;
        entries.insert(key.into(), entry);
    }

    pub async fn len(&self) -> usize {
        let entries = self.entries.lock().await;
        entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        let entries = self.entries.lock().await;
        entries.is_empty()
    }
}
