#![warn(clippy::all, clippy::pedantic, clippy::cargo, clippy::nursery)]

mod allocator;
mod logging;
mod prometheus;
mod rpc;
mod shutdown;

use std::{sync::Arc, time::Duration};

use anyhow::{Context as _, Result as AnyResult};
use dotenv::dotenv;
use ethmonitor::{Monitor, MonitorOptions, RpcSource};
use rpc::Web3RpcSource;
use structopt::StructOpt;
use tokio::{runtime, spawn, sync::oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use self::{allocator::Allocator, logging::LogOptions};

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " ", env!("CARGO_PKG_DESCRIPTION"));

#[cfg(not(feature = "mimalloc"))]
#[global_allocator]
pub static ALLOCATOR: Allocator<allocator::StdAlloc> = allocator::new_std();

#[cfg(feature = "mimalloc")]
#[global_allocator]
pub static ALLOCATOR: Allocator<allocator::MiMalloc> = allocator::new_mimalloc();

/// `ethmonitor`'s `MonitorOptions`, flattened onto the CLI the way
/// `order-watcher::Options` composes its internal `ethereum::Options`.
#[derive(Clone, Debug, StructOpt)]
struct CliMonitorOptions {
    #[structopt(long, env = "ETHMONITOR_POLLING_INTERVAL_SECS", default_value = "1")]
    polling_interval_secs: u64,

    #[structopt(long, env = "ETHMONITOR_TIMEOUT_SECS", default_value = "60")]
    timeout_secs: u64,

    /// Block height to start following from; defaults to the chain's
    /// current head at startup.
    #[structopt(long, env = "ETHMONITOR_START_BLOCK_NUMBER")]
    start_block_number: Option<u64>,

    #[structopt(long, env = "ETHMONITOR_TRAIL_BEHIND_HEAD", default_value = "0")]
    trail_num_blocks_behind_head: u64,

    #[structopt(long, env = "ETHMONITOR_RETENTION_LIMIT", default_value = "200")]
    block_retention_limit: usize,

    #[structopt(long, env = "ETHMONITOR_WITH_LOGS")]
    with_logs: bool,

    #[structopt(long, env = "ETHMONITOR_NON_STRICT_SUBSCRIBERS")]
    non_strict_subscribers: bool,

    #[structopt(long, env = "ETHMONITOR_DEBUG_LOGGING")]
    debug_logging: bool,
}

impl From<CliMonitorOptions> for MonitorOptions {
    fn from(cli: CliMonitorOptions) -> Self {
        Self {
            polling_interval: Duration::from_secs(cli.polling_interval_secs),
            timeout: Duration::from_secs(cli.timeout_secs),
            start_block_number: cli.start_block_number,
            trail_num_blocks_behind_head: cli.trail_num_blocks_behind_head,
            block_retention_limit: cli.block_retention_limit,
            with_logs: cli.with_logs,
            strict_subscribers: !cli.non_strict_subscribers,
            debug_logging: cli.debug_logging,
            ..Self::default()
        }
    }
}

#[derive(StructOpt)]
struct Options {
    #[structopt(flatten)]
    log: LogOptions,
    #[structopt(flatten)]
    prometheus: prometheus::Options,
    #[structopt(flatten)]
    monitor: CliMonitorOptions,

    /// EVM JSON-RPC HTTP endpoint to follow.
    #[structopt(long, env = "ETHEREUM_RPC_URL", default_value = "http://localhost:8545")]
    ethereum_rpc_url: String,
}

fn main() -> AnyResult<()> {
    dotenv().ok();
    let matches = Options::clap().version(VERSION).get_matches();
    let options = Options::from_clap(&matches);

    ALLOCATOR.start_metering();
    options.log.init()?;

    runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("error creating tokio runtime")?
        .block_on(run(options))
}

async fn run(options: Options) -> AnyResult<()> {
    let rpc: Arc<dyn RpcSource> =
        Arc::new(Web3RpcSource::new(&options.ethereum_rpc_url).context("failed to build rpc transport")?);
    let monitor = Arc::new(Monitor::new(rpc, options.monitor.into()));

    spawn(prometheus::main(options.prometheus));

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    spawn(async {
        if let Err(err) = shutdown::signal_shutdown().await {
            warn!(?err, "error waiting for shutdown signal");
        }
        let _ = shutdown_tx.send(());
    });

    let cancel = CancellationToken::new();
    let monitor_cancel = cancel.clone();
    let monitor_task = spawn({
        let monitor = Arc::clone(&monitor);
        async move { monitor.run(monitor_cancel).await }
    });

    let mut subscription = monitor.subscribe().await;
    spawn(async move {
        while let Some(batch) = subscription.recv().await {
            for block in batch {
                info!(number = block.number(), hash = ?block.hash(), event = ?block.event, "block event");
            }
        }
    });

    shutdown_rx.await.ok();
    cancel.cancel();
    monitor_task.await.context("monitor task panicked")??;

    info!("program terminating normally");
    Ok(())
}
