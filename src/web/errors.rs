use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::dispatch::{DeliveryError, FailureStage};
use crate::envelope::EnvelopeError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid request body: {0}")]
    InvalidRequest(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<FailureStage>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) | ApiError::MissingField(_) => {
                StatusCode::BAD_REQUEST
            }
            // The sender is the relay account, so this one is ours.
            ApiError::Envelope(EnvelopeError::Sender) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Envelope(_) => StatusCode::BAD_REQUEST,
            ApiError::Delivery(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match &self {
            ApiError::InvalidRequest(_) => ErrorBody {
                success: false,
                error: "invalid request data".to_owned(),
                stage: None,
            },
            ApiError::MissingField(_) | ApiError::Envelope(_) => ErrorBody {
                success: false,
                error: self.to_string(),
                stage: None,
            },
            ApiError::Delivery(err) => ErrorBody {
                success: false,
                error: err.stage.public_message().to_owned(),
                stage: Some(err.stage),
            },
        };

        (self.status(), Json(body)).into_response()
    }
}
