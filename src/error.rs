use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::http::StatusCode;

/// Failures surfaced by the acceptor, the protocol adapter and the handlers.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The listening socket could not be bound. Fatal for the caller.
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// A single `accept` call failed. The accept loop logs it and continues.
    #[error("accept error: {0}")]
    Accept(#[source] io::Error),

    /// The inbound byte stream was not a well-formed HTTP/1.x request.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("method {0} is not implemented")]
    UnsupportedMethod(String),

    /// The outbound connection to the origin could not be opened.
    #[error("failed to connect to {authority}: {source}")]
    Dial {
        authority: String,
        #[source]
        source: io::Error,
    },

    /// The origin's response head could not be read or parsed.
    #[error("failed to read origin response: {0}")]
    ForwardRead(String),

    /// The origin's response body could not be buffered.
    #[error("failed to read origin response body: {0}")]
    BodyRead(String),

    #[error("failed to write response: {0}")]
    WriteResponse(#[source] io::Error),

    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: Stage, after: Duration },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Status of the canned response a handler writes for this failure.
    ///
    /// `None` means no response is attempted: either the failure happened
    /// outside a connection (bind, accept) or writing itself failed.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ProxyError::MalformedRequest(_) => Some(StatusCode::BAD_REQUEST),
            ProxyError::UnsupportedMethod(_) => Some(StatusCode::NOT_IMPLEMENTED),
            ProxyError::Dial { .. } | ProxyError::ForwardRead(_) => {
                Some(StatusCode::BAD_GATEWAY)
            }
            ProxyError::Timeout { stage, .. } => Some(match stage {
                Stage::Request => StatusCode::BAD_REQUEST,
                Stage::Connect | Stage::Response => StatusCode::BAD_GATEWAY,
                Stage::Body => StatusCode::INTERNAL_SERVER_ERROR,
            }),
            ProxyError::BodyRead(_) | ProxyError::Io(_) => {
                Some(StatusCode::INTERNAL_SERVER_ERROR)
            }
            ProxyError::Bind { .. } | ProxyError::Accept(_) | ProxyError::WriteResponse(_) => None,
        }
    }
}

/// The bounded I/O step a [`ProxyError::Timeout`] expired in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Reading the inbound request.
    Request,
    /// Opening the outbound connection.
    Connect,
    /// Reading the origin's response head.
    Response,
    /// Buffering the origin's response body.
    Body,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Request => "reading request",
            Stage::Connect => "connecting to origin",
            Stage::Response => "reading origin response",
            Stage::Body => "reading origin body",
        };
        f.write_str(name)
    }
}

pub type Result<T, E = ProxyError> = std::result::Result<T, E>;
