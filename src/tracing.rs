use tracing_subscriber::EnvFilter;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber. Output format is picked at build time
/// with the `tracing_json` and `tracing_noansi` features.
pub fn setup_tracing() {
    // Forward `log` records from dependencies (native-tls, hyper) as events.
    tracing_log::LogTracer::init().expect("Couldn't set the log forwarder");

    let json_subs = tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter())
        .finish();

    let mut fmt_subs = tracing_subscriber::fmt().with_env_filter(env_filter());

    if cfg!(feature = "tracing_noansi") {
        fmt_subs = fmt_subs.with_ansi(false)
    }

    let fmt_subs = fmt_subs.finish();

    if cfg!(feature = "tracing_json") {
        tracing::subscriber::set_global_default(json_subs)
            .expect("Couldn't set global tracing subscriber");
    } else {
        tracing::subscriber::set_global_default(fmt_subs)
            .expect("Couldn't set global tracing subscriber");
    }
}
