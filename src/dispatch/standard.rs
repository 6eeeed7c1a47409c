//! Delivery on every port other than 465.
//!
//! The whole exchange is one `lettre` call. It connects in plaintext,
//! switches to TLS with STARTTLS when the relay offers it, authenticates
//! with PLAIN, sends and quits. `lettre` does not report which of those
//! steps failed, so there is a single failure stage for this path.

use lettre::address::{AddressError, Envelope};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::transport::smtp::extension::ClientId;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use thiserror::Error;
use tracing::debug;

use crate::config::Relay;
use crate::dispatch::{DeliveryError, DeliveryOutcome, FailureStage};
use crate::envelope::MailEnvelope;

#[derive(Debug, Error)]
enum TransportError {
    #[error("invalid address: {0}")]
    Address(#[from] AddressError),
    #[error("invalid envelope: {0}")]
    Envelope(#[from] lettre::error::Error),
    #[error(transparent)]
    Smtp(#[from] lettre::transport::smtp::Error),
}

pub async fn deliver(relay: &Relay, envelope: &MailEnvelope) -> DeliveryOutcome {
    send(relay, envelope)
        .await
        .map_err(|err| DeliveryError::new(FailureStage::StandardDelivery, err))
}

fn transport(relay: &Relay) -> Result<AsyncSmtpTransport<Tokio1Executor>, TransportError> {
    let tls = TlsParameters::new(relay.host.clone())?;

    Ok(
        AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(relay.host.as_str())
            .port(relay.port)
            .tls(Tls::Opportunistic(tls))
            .hello_name(ClientId::Domain(relay.helo_name.clone()))
            .credentials(Credentials::new(
                relay.username.clone(),
                relay.password.clone(),
            ))
            .authentication(vec![Mechanism::Plain])
            .timeout(Some(relay.timeout))
            .build(),
    )
}

async fn send(relay: &Relay, envelope: &MailEnvelope) -> Result<(), TransportError> {
    let addresses = Envelope::new(
        Some(envelope.from().parse()?),
        vec![envelope.to().parse()?],
    )?;

    let response = transport(relay)?
        .send_raw(&addresses, &envelope.render())
        .await?;
    debug!(code = %response.code(), "relay accepted message");

    Ok(())
}
