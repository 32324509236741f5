//! Runs a cluster node, the proposing client or the event monitor.
//!
//! A local five-node demo needs seven terminals:
//! ```bash
//! cargo run -- monitor --log events.csv
//! cargo run -- client --values 42,99,7,1234,56
//! cargo run -- node --id 1          # ...and likewise --id 2 through 5
//! PAXOS_FAIL_CASE=leader-after:2 cargo run -- node --id 5
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use paxos_cluster::cli::{Cli, ClientArgs, Command, MonitorArgs, NodeArgs};
use paxos_cluster::client;
use paxos_cluster::monitor::Monitor;
use paxos_cluster::runtime::spawn_node;

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Node(args) => run_node(args),
        Command::Client(args) => run_client(args),
        Command::Monitor(args) => run_monitor(args),
    }
}

/// Node threads run until the process is killed or a crash is injected.
fn run_node(args: NodeArgs) -> Result<()> {
    let config = args.into_config()?;
    let (handle, events) = spawn_node(config).context("node failed to start")?;
    info!(node = handle.id(), "node started");

    // Events are already logged; draining keeps the channel from growing.
    for _ in events.iter() {}
    Ok(())
}

fn run_client(args: ClientArgs) -> Result<()> {
    let config = args.into_config()?;
    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    let report = runtime.block_on(client::run(config))?;
    info!(
        leader = ?report.leader,
        acknowledged = ?report.acknowledged,
        "client finished"
    );
    if !report.abandoned.is_empty() {
        warn!(abandoned = ?report.abandoned, "some values were never acknowledged");
    }
    Ok(())
}

fn run_monitor(args: MonitorArgs) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    runtime.block_on(async {
        let monitor = Monitor::bind(args.listen, &args.log).await?;
        info!(addr = %monitor.local_addr()?, log = %args.log.display(), "monitor listening");
        monitor.run_until_ctrl_c().await
    })
}
