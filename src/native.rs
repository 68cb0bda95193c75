use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing subscriber for the binary.
/// Uses RUST_LOG env var for filtering (defaults to info). Logs go to stderr so
/// stdout only carries records.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(true).with_writer(std::io::stderr))
            .with(filter)
            .init();
    }
}
