//! Errors surfaced to HTTP clients.
//!
use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("No image provided!")]
    MissingInput,
    #[error("{0}")]
    BadRequest(String),
    #[error("Camera is off")]
    CameraOff,
    #[error("Not found")]
    NotFound,
    /// A request body the extractors refused, e.g. for being too large.
    #[error("{message}")]
    Rejected { status: StatusCode, message: String },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::MissingInput | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::CameraOff | AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Rejected { status, .. } => *status,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        AppError::Rejected {
            status: err.status(),
            message: err.body_text(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            AppError::Internal(err) => {
                log::error!("Request failed: {err:#}");
                (status, "Internal Server Error").into_response()
            }
            other => (status, other.to_string()).into_response(),
        }
    }
}

#[cfg(test)]
mod test {
    use anyhow::anyhow;

    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(AppError::MissingInput.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            AppError::BadRequest("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(AppError::CameraOff.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::from(anyhow!("disk full")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_rejection_keeps_its_status() {
        let err = AppError::Rejected {
            status: StatusCode::PAYLOAD_TOO_LARGE,
            message: "length limit exceeded".into(),
        };
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(err.to_string(), "length limit exceeded");
    }

    #[test]
    fn test_messages() {
        assert_eq!(AppError::MissingInput.to_string(), "No image provided!");
        assert_eq!(AppError::CameraOff.to_string(), "Camera is off");
    }

    #[test]
    fn test_internal_details_are_not_exposed() {
        let response = AppError::from(anyhow!("secret path /etc/x")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
