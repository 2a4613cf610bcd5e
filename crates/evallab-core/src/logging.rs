use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install a global `tracing` subscriber writing to stderr.
///
/// `EVALLAB_LOG` (or `RUST_LOG`) takes precedence over `level`. A bare level
/// such as `"debug"` applies to the evallab crates only; anything containing
/// `=` is used as a full filter directive. Calling this twice returns an
/// error from the second call and leaves the first subscriber in place.
pub fn init(level: Option<&str>, json: bool) -> Result<()> {
    let level = level.unwrap_or("info");
    let filter = EnvFilter::try_from_env("EVALLAB_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(directive(level)));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_ansi(false)
                    .with_target(true),
            )
            .try_init()
            .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))?;
    } else {
        registry
            .with(
                fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .try_init()
            .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))?;
    }
    Ok(())
}

fn directive(level: &str) -> String {
    if level.contains('=') {
        level.to_string()
    } else {
        format!("evallab_core={level},evallab_store={level}")
    }
}
