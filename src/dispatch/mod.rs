//! # Mail dispatcher
//!
//! Picks a delivery path from the relay port and runs one SMTP session to
//! completion or to the first failure:
//! * port 465: [`implicit_tls`], TLS first, then a hand-driven SMTP dialogue
//! * anything else: [`standard`], one combined send through `lettre`, which
//!   upgrades with STARTTLS when the relay offers it
//!
//! Every failure carries the [`FailureStage`] where it happened.

pub mod implicit_tls;
pub mod standard;

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, info_span, Instrument};

use crate::config::RelayConfig;
use crate::envelope::MailEnvelope;

pub const IMPLICIT_TLS_PORT: u16 = 465;

/// Where a delivery attempt stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Configuration,
    TlsConnect,
    ClientCreate,
    Auth,
    MailFrom,
    RcptTo,
    DataOpen,
    DataWrite,
    StandardDelivery,
}

impl FailureStage {
    /// Short text shown to API callers. The underlying cause is only logged.
    pub fn public_message(&self) -> &'static str {
        match self {
            FailureStage::Configuration => "missing SMTP configuration",
            FailureStage::TlsConnect => {
                "could not connect to the SMTP server (TLS)"
            }
            FailureStage::ClientCreate => "could not create SMTP client",
            FailureStage::Auth => "SMTP authentication failed",
            FailureStage::MailFrom => "MAIL FROM failed",
            FailureStage::RcptTo => "RCPT TO failed",
            FailureStage::DataOpen => "could not open SMTP data stream",
            FailureStage::DataWrite => "error writing SMTP message",
            FailureStage::StandardDelivery => "could not send the email",
        }
    }
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureStage::Configuration => "configuration",
            FailureStage::TlsConnect => "tls_connect",
            FailureStage::ClientCreate => "client_create",
            FailureStage::Auth => "auth",
            FailureStage::MailFrom => "mail_from",
            FailureStage::RcptTo => "rcpt_to",
            FailureStage::DataOpen => "data_open",
            FailureStage::DataWrite => "data_write",
            FailureStage::StandardDelivery => "standard_delivery",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
#[error("{stage}: {cause}")]
pub struct DeliveryError {
    pub stage: FailureStage,
    pub cause: String,
}

impl DeliveryError {
    pub fn new(stage: FailureStage, cause: impl std::fmt::Display) -> Self {
        DeliveryError {
            stage,
            cause: cause.to_string(),
        }
    }
}

/// `Ok(())` once the relay accepted the message.
pub type DeliveryOutcome = Result<(), DeliveryError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPath {
    ImplicitTls,
    Standard,
}

impl DeliveryPath {
    /// Port convention only, the relay is never asked what it supports.
    ///
    /// ```
    /// # use mail_relay::dispatch::DeliveryPath;
    /// assert_eq!(DeliveryPath::for_port(465), DeliveryPath::ImplicitTls);
    /// assert_eq!(DeliveryPath::for_port(587), DeliveryPath::Standard);
    /// ```
    pub fn for_port(port: u16) -> Self {
        if port == IMPLICIT_TLS_PORT {
            DeliveryPath::ImplicitTls
        } else {
            DeliveryPath::Standard
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            DeliveryPath::ImplicitTls => "implicit_tls",
            DeliveryPath::Standard => "standard",
        }
    }
}

/// Sends `envelope` through the configured relay.
///
/// Opens exactly one connection, which is closed again before returning.
/// Nothing is retried and there is no fallback between paths.
pub async fn deliver(
    config: &RelayConfig,
    envelope: &MailEnvelope,
) -> DeliveryOutcome {
    let relay = match config.validate() {
        Ok(relay) => relay,
        Err(err) => {
            error!(stage = %err.stage, cause = %err.cause, "delivery not attempted");
            return Err(err);
        }
    };

    let path = DeliveryPath::for_port(relay.port);
    let span = info_span!(
        "deliver",
        path = path.as_str(),
        relay = %format!("{}:{}", relay.host, relay.port),
        to = %envelope.to(),
    );

    async move {
        let outcome = match path {
            DeliveryPath::ImplicitTls => {
                implicit_tls::deliver(&relay, envelope).await
            }
            DeliveryPath::Standard => standard::deliver(&relay, envelope).await,
        };

        match &outcome {
            Ok(()) => {
                info!(message_id = %envelope.message_id(), "email sent")
            }
            Err(err) => {
                error!(stage = %err.stage, cause = %err.cause, "delivery failed")
            }
        }
        outcome
    }
    .instrument(span)
    .await
}
