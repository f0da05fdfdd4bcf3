use anyhow::anyhow;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber
///
/// Filters come from `RUST_LOG` and default to `info`. Output goes to stderr,
/// leaving stdout free for protocol traffic.
pub fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}
