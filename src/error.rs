//! Crate-level error with HTTP mapping.
//!
//! Tree errors never reach HTTP (they surface as toasts over the message
//! channel); everything the REST surface can produce maps here.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::codec::CodecError;
use crate::engine::EngineError;
use crate::store::StoreError;
use crate::tree::TreeError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("bad permutation for parent {0}")]
    BadPermutation(String),

    #[error("invalid move: {0}")]
    InvalidMove(String),

    #[error("malformed input at line {line}, column {column}: {detail}")]
    Malformed {
        line: usize,
        column: usize,
        detail: String,
    },

    #[error("unsupported format")]
    UnsupportedFormat,

    #[error("not found")]
    NotFound,

    #[error("request too large")]
    TooLarge,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("storage failure: {0}")]
    Store(StoreError),

    #[error("service unavailable")]
    Unavailable,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<TreeError> for Error {
    fn from(err: TreeError) -> Self {
        match err {
            TreeError::UnknownNode(id) => Error::UnknownNode(id),
            TreeError::BadPermutation(parent) => Error::BadPermutation(parent),
            TreeError::InvalidMove(detail) => Error::InvalidMove(detail),
        }
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Error::NotFound,
            other => Error::Store(other),
        }
    }
}

impl From<CodecError> for Error {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Malformed {
                line,
                column,
                detail,
            } => Error::Malformed {
                line,
                column,
                detail,
            },
            CodecError::Unsupported(_) => Error::UnsupportedFormat,
        }
    }
}

impl Error {
    fn status(&self) -> StatusCode {
        match self {
            Error::UnknownNode(_) | Error::NotFound => StatusCode::NOT_FOUND,
            Error::BadPermutation(_)
            | Error::InvalidMove(_)
            | Error::Malformed { .. }
            | Error::UnsupportedFormat
            | Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Error::Engine(_) | Error::Store(_) | Error::Unavailable => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({ "detail": self.to_string() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_error_kinds() {
        assert_eq!(Error::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            Error::BadRequest("limit".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Malformed {
                line: 1,
                column: 0,
                detail: "x".into()
            }
            .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(Error::TooLarge.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            Error::Engine(EngineError::HandshakeTimeout).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn tree_errors_convert_by_kind() {
        let err: Error = TreeError::UnknownNode("n1".into()).into();
        assert!(matches!(err, Error::UnknownNode(_)));
        let err: Error = TreeError::BadPermutation("p".into()).into();
        assert!(matches!(err, Error::BadPermutation(_)));
    }
}
