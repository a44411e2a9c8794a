use std::fmt;

use shared::error::ApiError;
use thiserror::Error;

use crate::transport::TransportKind;

/// Failures while opening or running a transport session. These never reach
/// callers of the connection manager; they are logged and counted.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("{kind} handshake failed: {message}")]
    Handshake { kind: TransportKind, message: String },
    #[error("no transport connectors match the configured preference list")]
    NoConnectors,
}

/// Error value surfaced by the query cache.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueryError {
    #[error("fetch for {key} failed after {attempts} attempt(s): {message}")]
    Fetch {
        key: String,
        attempts: u32,
        message: String,
    },
    #[error("cached value for {key} has a different type than requested")]
    TypeMismatch { key: String },
}

impl QueryError {
    pub fn key(&self) -> &str {
        match self {
            QueryError::Fetch { key, .. } | QueryError::TypeMismatch { key } => key,
        }
    }
}

/// Errors a query fetcher may return. Non-transient failures are surfaced
/// after the first attempt instead of being retried.
pub trait FetchError: fmt::Display + Send + 'static {
    fn is_transient(&self) -> bool {
        true
    }
}

impl FetchError for String {}

impl FetchError for &'static str {}

impl FetchError for ClientError {
    fn is_transient(&self) -> bool {
        ClientError::is_transient(self)
    }
}

/// A mutation failure. Mutations are never retried and leave the cache as it was.
#[derive(Debug, Error)]
#[error("mutation failed: {0}")]
pub struct MutationError<E>(pub E);

impl<E> MutationError<E> {
    pub fn into_inner(self) -> E {
        self.0
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Query(#[from] QueryError),
}

impl ClientError {
    /// Whether a retry of the same request might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Api(err) => err.is_retryable(),
            ClientError::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            ClientError::Url(_) | ClientError::Decode(_) => false,
            ClientError::Query(QueryError::Fetch { .. }) => true,
            ClientError::Query(_) => false,
        }
    }
}
