use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global tracing subscriber.
/// `RUST_LOG` wins when set; otherwise `verbose` selects debug output for this crate.
pub fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "warn,wallet_ledger=debug"
    } else {
        "warn"
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    // A second init (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .try_init();
}
