use thiserror::Error;

use crate::types::EntityIndex;

pub type ContractResult<T> = std::result::Result<T, ContractError>;

/// Configuration and contract violations. These are fatal to the operation
/// that hit them and are never coerced into something partially valid.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContractError {
    #[error("entity index {index} out of range (count {count})")]
    IndexOutOfRange { index: EntityIndex, count: usize },
    #[error("stride mismatch: expected {expected} bytes, got {actual}")]
    StrideMismatch { expected: usize, actual: usize },
    #[error("unknown encoding tag {0}")]
    UnknownEncoding(u8),
    #[error("unknown meta layout {0}")]
    UnknownLayout(String),
    #[error("layout mismatch: mirror uses {expected}, frame declares {actual}")]
    LayoutMismatch { expected: String, actual: String },
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

pub type FeedResult<T> = std::result::Result<T, FeedError>;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("upstream returned status {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("price feed exhausted {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
    #[error("price feed closed")]
    Closed,
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Url(#[from] url::ParseError),
}

impl FeedError {
    pub fn with_http_status(status: reqwest::StatusCode, body: &str) -> Self {
        let body = match body.char_indices().nth(200) {
            Some((cut, _)) => format!("{}...", &body[..cut]),
            None => body.to_string(),
        };
        FeedError::Status { status, body }
    }
}

pub type ServerResult<T> = std::result::Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid control message: {0}")]
    InvalidMessage(String),
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("unsupported websocket scheme {0}")]
    UnsupportedScheme(String),
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),
    #[error("connection closed")]
    Closed,
    #[error("max reconnection attempts ({0}) exceeded")]
    ReconnectExhausted(u32),
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error(transparent)]
    Pick(#[from] PickError),
    #[error(transparent)]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PickError {
    #[error("picking service stopped")]
    ServiceStopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_body_truncates_on_char_boundary() {
        let body = format!("{}é tail", "a".repeat(199));
        match FeedError::with_http_status(reqwest::StatusCode::BAD_GATEWAY, &body) {
            FeedError::Status { status, body } => {
                assert_eq!(status, reqwest::StatusCode::BAD_GATEWAY);
                assert!(body.ends_with("aé..."));
                assert_eq!(body.chars().count(), 203);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_short_status_body_is_kept() {
        match FeedError::with_http_status(reqwest::StatusCode::NOT_FOUND, "ünknown") {
            FeedError::Status { body, .. } => assert_eq!(body, "ünknown"),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
