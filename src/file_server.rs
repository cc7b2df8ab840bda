//! Static file handler: GET reads and POST writes files beneath a root
//! directory, keyed by the request path.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::acceptor::ConnectionHandler;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::http::{serve_one, Request, Response, StatusCode};

/// Content type served for a file extension; `None` for unsupported ones.
pub fn content_type_for(path: &str) -> Option<&'static str> {
    let ext = Path::new(path).extension()?.to_str()?;
    match ext {
        "html" => Some("text/html"),
        "txt" => Some("text/plain"),
        "gif" => Some("image/gif"),
        "jpeg" | "jpg" => Some("image/jpeg"),
        "css" => Some("text/css"),
        _ => None,
    }
}

pub struct FileHandler {
    root: PathBuf,
    read_timeout: Duration,
}

impl FileHandler {
    pub fn new(root: impl Into<PathBuf>, config: &ProxyConfig) -> Self {
        Self {
            root: root.into(),
            read_timeout: config.read_timeout,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn serve_connection<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        serve_one(stream, self.read_timeout, |request| async move {
            self.handle_request(&request).await
        })
        .await
    }

    pub async fn handle_request(&self, request: &Request) -> Result<Response> {
        match request.method.as_str() {
            "GET" => Ok(self.get(request.path()).await),
            "POST" => Ok(self.post(request.path(), &request.body).await),
            other => Err(ProxyError::UnsupportedMethod(other.to_string())),
        }
    }

    async fn get(&self, url_path: &str) -> Response {
        let Some(content_type) = content_type_for(url_path) else {
            return Response::text(
                StatusCode::BAD_REQUEST,
                "400 Bad Request (unsupported extension)\n",
            );
        };
        let Some(path) = self.resolve(url_path) else {
            return Response::bad_request();
        };

        match fs::read(&path).await {
            Ok(contents) => {
                debug!("Serving {} ({} bytes)", path.display(), contents.len());
                Response::new(StatusCode::OK, contents).with_header("Content-Type", content_type)
            }
            Err(e) => {
                debug!("Cannot read {}: {}", path.display(), e);
                Response::plain(StatusCode::NOT_FOUND)
            }
        }
    }

    async fn post(&self, url_path: &str, body: &[u8]) -> Response {
        let Some(content_type) = content_type_for(url_path) else {
            return Response::text(StatusCode::BAD_REQUEST, "Bad Request\n");
        };
        let Some(path) = self.resolve(url_path) else {
            return Response::bad_request();
        };

        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                debug!("Cannot create {}: {}", parent.display(), e);
            }
        }
        if let Err(e) = fs::write(&path, body).await {
            warn!("Failed to save {}: {}", path.display(), e);
            return Response::text(StatusCode::INTERNAL_SERVER_ERROR, "Error saving file\n");
        }

        info!("Saved {} ({} bytes)", path.display(), body.len());
        Response::new(StatusCode::CREATED, "File saved successfully\n")
            .with_header("Content-Type", content_type)
    }

    /// Map a URL path onto the root, refusing anything that would escape it.
    fn resolve(&self, url_path: &str) -> Option<PathBuf> {
        let relative = Path::new(url_path.trim_start_matches('/'));
        let mut path = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(path)
    }
}

#[async_trait]
impl ConnectionHandler for FileHandler {
    async fn handle(&self, stream: TcpStream) {
        self.serve_connection(stream).await
    }
}
