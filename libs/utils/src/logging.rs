//! `tracing` bootstrap shared by the binaries and the test harnesses.

use anyhow::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Plain,
    Json,
}

impl LogFormat {
    pub fn from_config(s: &str) -> anyhow::Result<LogFormat> {
        match s {
            "plain" => Ok(LogFormat::Plain),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("unknown log format '{s}', expected 'plain' or 'json'"),
        }
    }
}

/// Install the process-wide subscriber. `RUST_LOG` overrides the default
/// `info` filter.
pub fn init(format: LogFormat) -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let base = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Plain => base.try_init(),
        LogFormat::Json => base.json().try_init(),
    }
    .map_err(|e| anyhow::anyhow!(e))
    .context("install tracing subscriber")?;

    Ok(())
}

/// Best-effort subscriber for unit tests; safe to call from every test.
pub fn init_for_tests() {
    use once_cell::sync::OnceCell;
    static INITED: OnceCell<()> = OnceCell::new();
    INITED.get_or_init(|| {
        let _ = init(LogFormat::Plain);
    });
}
