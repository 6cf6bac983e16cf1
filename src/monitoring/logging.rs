// DANS : src/monitoring/logging.rs
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

/// Initialise `tracing`.
///
/// Le niveau vient de `RUST_LOG` ("info" par défaut). La sortie est en JSON,
/// sauf si `LOG_FORMAT=pretty` (pratique en développement).
pub fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let pretty = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("pretty"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true);

    // `try_init` : un second appel (tests, binaire relancé en lib) ne doit pas paniquer.
    let _ = if pretty {
        builder.try_init()
    } else {
        builder.json().try_init()
    };
}
