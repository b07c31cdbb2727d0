//! Uniform result shape for every network operation (login, capture, analyze).
//!
//! Network calls never return `Err`: they return a [`RequestOutcome`] that the
//! orchestrator turns into status/log messages. The variants map one-to-one to
//! the failure taxonomy the UI understands.

use std::fmt;

/// Max characters of a response body carried inside a [`RequestOutcome::ClientError`]
pub const BODY_PREVIEW_CHARS: usize = 200;

/// Outcome of a single request against the camera or the remote service.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome<T> {
    /// Request completed and the payload decoded
    Success(T),
    /// 401/403 (or analyze without any credential)
    AuthFailure,
    /// Non-success status, or an explicit failure flag in a 200 body
    ClientError { status: u16, message: String },
    /// Connection refused, DNS, timeout...
    TransportFailure(String),
    /// 200 with a body we could not decode
    DecodeFailure(String),
    /// Rejected locally before any network traffic
    PreconditionFailure(String),
}

impl<T> RequestOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, RequestOutcome::Success(_))
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, RequestOutcome::AuthFailure)
    }

    /// Payload if successful
    pub fn success(self) -> Option<T> {
        match self {
            RequestOutcome::Success(v) => Some(v),
            _ => None,
        }
    }

    /// Build a transport failure from a reqwest error.
    ///
    /// Timeouts get their own wording so the status line says what happened.
    pub fn transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            RequestOutcome::TransportFailure(format!("request timed out: {}", err))
        } else if err.is_connect() {
            RequestOutcome::TransportFailure(format!("connection failed: {}", err))
        } else {
            RequestOutcome::TransportFailure(err.to_string())
        }
    }

    /// Build a client error from a status and raw body, truncating the body.
    pub fn client_error(status: u16, body: &str) -> Self {
        RequestOutcome::ClientError {
            status,
            message: truncate_body(body),
        }
    }
}

impl<T> fmt::Display for RequestOutcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOutcome::Success(_) => write!(f, "Success"),
            RequestOutcome::AuthFailure => write!(f, "Authentication failed"),
            RequestOutcome::ClientError { status, message } => {
                if message.is_empty() {
                    write!(f, "Request failed with status {}", status)
                } else {
                    write!(f, "Request failed with status {}: {}", status, message)
                }
            }
            RequestOutcome::TransportFailure(cause) => write!(f, "Transport error: {}", cause),
            RequestOutcome::DecodeFailure(cause) => write!(f, "Invalid response: {}", cause),
            RequestOutcome::PreconditionFailure(reason) => write!(f, "{}", reason),
        }
    }
}

/// Cut a response body down to [`BODY_PREVIEW_CHARS`] characters (char-boundary safe).
pub fn truncate_body(body: &str) -> String {
    match body.char_indices().nth(BODY_PREVIEW_CHARS) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
