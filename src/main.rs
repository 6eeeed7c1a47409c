use std::error::Error;
use std::net::SocketAddr;

use mail_relay::config::AppConfig;
use mail_relay::tracing::setup_tracing;
use mail_relay::web::{build_app, AppState};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing();

    let config = AppConfig::from_env().inspect_err(|err| {
        error!(error = %err, "invalid configuration");
    })?;
    config.log_summary();

    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    let listener = TcpListener::bind(addr).await?;
    let app = build_app(
        AppState {
            relay: config.relay,
        },
        config.cors_origin,
    );

    info!(%addr, "HTTP server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = signal::ctrl_c().await {
                error!(error = %err, "couldn't listen for CTRL-C");
                std::future::pending::<()>().await;
            }
            info!("CTRL-C received, shutting down");
        })
        .await?;

    Ok(())
}
