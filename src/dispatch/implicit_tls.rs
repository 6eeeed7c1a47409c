//! Delivery over implicit TLS (port 465).
//!
//! The relay expects ciphertext from the first byte, so the TLS handshake
//! happens before any SMTP is spoken and the dialogue is then driven step by
//! step over the encrypted stream.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_native_tls::{native_tls, TlsConnector, TlsStream};
use tracing::{debug, warn};

use crate::config::Relay;
use crate::dispatch::{DeliveryError, DeliveryOutcome, FailureStage};
use crate::envelope::MailEnvelope;
use crate::smtp::{timed, SmtpError, SmtpSession};

pub async fn deliver(relay: &Relay, envelope: &MailEnvelope) -> DeliveryOutcome {
    // Certificate chain and host name are always verified.
    let connector = native_tls::TlsConnector::new()
        .map_err(|err| DeliveryError::new(FailureStage::TlsConnect, err))?;

    deliver_with(connector, relay, envelope).await
}

/// [`deliver`] with the trust settings of `connector`.
pub(crate) async fn deliver_with(
    connector: native_tls::TlsConnector,
    relay: &Relay,
    envelope: &MailEnvelope,
) -> DeliveryOutcome {
    let stream = connect(connector.into(), relay)
        .await
        .map_err(|err| DeliveryError::new(FailureStage::TlsConnect, err))?;
    debug!("TLS session established");

    run_session(stream, relay, envelope).await
}

async fn connect(
    connector: TlsConnector,
    relay: &Relay,
) -> Result<TlsStream<TcpStream>, SmtpError> {
    let tcp = timed(
        relay.timeout,
        TcpStream::connect((relay.host.as_str(), relay.port)),
    )
    .await?;

    timed(relay.timeout, connector.connect(&relay.host, tcp)).await
}

/// Drives the SMTP dialogue over an already established stream.
async fn run_session<S>(
    stream: S,
    relay: &Relay,
    envelope: &MailEnvelope,
) -> DeliveryOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = SmtpSession::open(stream, relay.timeout)
        .await
        .map_err(|err| DeliveryError::new(FailureStage::ClientCreate, err))?;

    let outcome = transact(&mut session, relay, envelope).await;

    // After a broken DATA phase the relay would read QUIT as message content.
    let data_broken =
        matches!(&outcome, Err(err) if err.stage == FailureStage::DataWrite);
    if !data_broken {
        if let Err(err) = session.quit().await {
            warn!(error = %err, "QUIT failed, connection closed anyway");
        }
    }

    outcome
}

async fn transact<S>(
    session: &mut SmtpSession<S>,
    relay: &Relay,
    envelope: &MailEnvelope,
) -> DeliveryOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let at = |stage: FailureStage| {
        move |err: SmtpError| DeliveryError::new(stage, err)
    };

    // EHLO/HELO failures are reported as auth failures.
    session
        .hello(&relay.helo_name)
        .await
        .map_err(at(FailureStage::Auth))?;
    session
        .auth_plain(&relay.username, &relay.password)
        .await
        .map_err(at(FailureStage::Auth))?;
    session
        .mail_from(envelope.from())
        .await
        .map_err(at(FailureStage::MailFrom))?;
    session
        .rcpt_to(envelope.to())
        .await
        .map_err(at(FailureStage::RcptTo))?;

    let mut data = session.data().await.map_err(at(FailureStage::DataOpen))?;
    data.write(&envelope.render())
        .await
        .map_err(at(FailureStage::DataWrite))?;
    data.close().await.map_err(at(FailureStage::DataWrite))?;

    Ok(())
}
