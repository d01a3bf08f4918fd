//! Error taxonomy for the session layer.
//!
//! Connection-level failures ([`HandshakeError`], [`TransportError`]) are
//! recovered by the reconnect loop and never reach request callers.
//! Request-level failures ([`RequestError`]) are always converted into a
//! closed response for the offending rid.

use std::error::Error as StdError;
use std::fmt::Write as _;

/// Negotiation with the broker's auth endpoint failed.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake request failed: {0}")]
    Request(#[source] Box<dyn StdError + Send + Sync>),
    #[error("handshake rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("invalid handshake response: {0}")]
    InvalidResponse(String),
    #[error("invalid broker endpoint: {0}")]
    Endpoint(String),
}

/// Connector-level I/O failure.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("transport I/O error: {0}")]
    Io(String),
    #[error("transport is closed")]
    Closed,
}

/// A request path could not be mapped onto the node tree.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PathResolutionError {
    #[error("node not found: {0}")]
    NotFound(String),
    #[error("invalid path: {0}")]
    Invalid(String),
}

/// Failure while handling a single request.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// Malformed or unknown request.
    #[error("{0}")]
    Protocol(String),
    #[error(transparent)]
    PathResolution(#[from] PathResolutionError),
    /// A method broke its own contract. This is a programming defect.
    #[error("internal error: {0}")]
    IllegalState(&'static str),
    /// The method ran and reported a failure.
    #[error("{0}")]
    Invocation(String),
    #[error("invalid request payload: {0}")]
    Json(#[from] serde_json::Error),
}

impl RequestError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn invocation(message: impl Into<String>) -> Self {
        Self::Invocation(message.into())
    }

    /// Short classification string for logging/metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "protocol",
            Self::PathResolution(_) => "path_resolution",
            Self::IllegalState(_) => "illegal_state",
            Self::Invocation(_) => "invocation",
            Self::Json(_) => "json",
        }
    }

    /// Diagnostic text sent to the peer in `error.detail`: the debug form of
    /// the error followed by its source chain.
    pub fn detail(&self) -> String {
        let mut out = format!("{self:?}");
        let mut source = self.source();
        while let Some(cause) = source {
            let _ = write!(out, "\ncaused by: {cause}");
            source = cause.source();
        }
        out
    }
}
