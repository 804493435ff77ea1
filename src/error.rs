//! Error taxonomy for the HTTP codec, route dispatch, and process tree.
//!
//! Every variant that reaches a client is mapped to an HTTP status code via
//! [`ServerError::status_code`]; the two "swallowed" variants
//! (`ClientClosedConnection`, `ClientSocketError`) never produce a response
//! and are instead logged and the connection dropped.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("client closed connection")]
    ClientClosedConnection,

    #[error("client socket error: {0}")]
    ClientSocketError(String),

    #[error("request header is too long")]
    RequestHeaderTooLong,

    #[error("method \"{0}\" is not supported by server API")]
    HttpUnsupportedMethod(String),

    #[error("HTTP version \"{0}\" is not supported by server API")]
    HttpUnsupportedVersion(String),

    #[error("{message}")]
    RequestError { message: String, status: u16 },

    #[error("no such child process \"{0}\"")]
    NoSuchChildProcess(String),

    #[error("child process \"{0}\" terminated")]
    ChildProcessGone(String),

    #[error("string does not match URI format: \"{0}\"")]
    InvalidUri(String),

    #[error("fork() failed: {0}")]
    ForkFailed(String),

    #[error("repeated binding of forwarding endpoint to same process manager")]
    RepeatedBinding,

    #[error("max process name number exceeded")]
    MaxProcessNumberExceeded,

    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// HTTP status this error should be reported with, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ServerError::ClientClosedConnection | ServerError::ClientSocketError(_) => None,
            ServerError::RequestHeaderTooLong => Some(431),
            ServerError::HttpUnsupportedMethod(_) => Some(405),
            ServerError::HttpUnsupportedVersion(_) => Some(505),
            ServerError::RequestError { status, .. } => Some(*status),
            ServerError::NoSuchChildProcess(_) => Some(404),
            ServerError::ChildProcessGone(_) => Some(410),
            ServerError::InvalidUri(_) => Some(400),
            ServerError::ForkFailed(_)
            | ServerError::RepeatedBinding
            | ServerError::MaxProcessNumberExceeded
            | ServerError::Internal(_) => Some(500),
            ServerError::Io(_) => Some(500),
        }
    }

    pub fn request(message: impl Into<String>) -> Self {
        ServerError::RequestError {
            message: message.into(),
            status: 400,
        }
    }

    pub fn request_with_status(message: impl Into<String>, status: u16) -> Self {
        ServerError::RequestError {
            message: message.into(),
            status,
        }
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
