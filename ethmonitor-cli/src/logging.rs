//! Structured logging setup, following `block-watcher`'s `LogOptions`
//! pattern: a `tracing_subscriber` filter driven by `--log-filter`/`RUST_LOG`,
//! plain or JSON output for container environments.

use anyhow::Result as AnyResult;
use structopt::StructOpt;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Clone, Debug, StructOpt)]
pub struct LogOptions {
    /// Log filter, using the `tracing_subscriber::EnvFilter` syntax, e.g.
    /// `ethmonitor=debug,info`.
    #[structopt(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,

    /// Emit logs as newline-delimited JSON instead of human-readable text.
    #[structopt(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl LogOptions {
    pub fn init(&self) -> AnyResult<()> {
        let filter = EnvFilter::try_new(&self.log_filter)?;
        let subscriber = FmtSubscriber::builder().with_env_filter(filter);
        if self.log_json {
            subscriber.json().try_init().map_err(|e| anyhow::anyhow!(e))?;
        } else {
            subscriber.try_init().map_err(|e| anyhow::anyhow!(e))?;
        }
        Ok(())
    }
}
