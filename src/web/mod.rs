//! # Web application module
//!
//! A single JSON endpoint, `POST /send-email`, behind CORS and request
//! tracing:
//! * Validate the `{to, subject, body}` payload
//! * Build the envelope
//! * Hand it to the dispatcher and map the outcome to a response

mod app;
mod errors;
mod handlers;

pub use app::build_app;
pub use errors::ApiError;
pub use handlers::{AppState, SendEmailRequest, SendEmailResponse};
