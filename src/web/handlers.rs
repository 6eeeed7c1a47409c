use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RelayConfig;
use crate::dispatch;
use crate::envelope::MailEnvelope;
use crate::web::errors::ApiError;

/// Shared, read-only state handed to every request.
#[derive(Debug, Clone)]
pub struct AppState {
    pub relay: RelayConfig,
}

/// JSON body of `POST /send-email`. Absent fields deserialize as empty and
/// are rejected by [`SendEmailRequest::validate`].
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SendEmailRequest {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Serialize)]
pub struct SendEmailResponse {
    pub success: bool,
}

impl SendEmailRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        [
            ("to", &self.to),
            ("subject", &self.subject),
            ("body", &self.body),
        ]
        .into_iter()
        .find(|(_, value)| value.trim().is_empty())
        .map_or(Ok(()), |(field, _)| Err(ApiError::MissingField(field)))
    }
}

pub async fn send_email(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SendEmailRequest>, JsonRejection>,
) -> Result<Json<SendEmailResponse>, ApiError> {
    let Json(request) = payload.map_err(|rejection| {
        warn!(error = %rejection.body_text(), "invalid JSON body");
        ApiError::InvalidRequest(rejection.body_text())
    })?;
    request
        .validate()
        .inspect_err(|err| warn!(error = %err, "rejected request"))?;

    info!(to = %request.to, subject = %request.subject, "send-email request received");

    let envelope = MailEnvelope::new(
        &state.relay.username,
        &request.to,
        &request.subject,
        &request.body,
    )
    .inspect_err(|err| warn!(error = %err, "rejected unsafe field"))?;

    dispatch::deliver(&state.relay, &envelope).await?;

    Ok(Json(SendEmailResponse { success: true }))
}
