//! Command-line interface: one binary, three roles.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueHint};

use crate::client::ClientConfig;
use crate::config::{
    ClusterLayout, CrashBehavior, DEFAULT_BASE_PORT, DEFAULT_CLIENT_PORT, DEFAULT_CLUSTER_SIZE,
    DEFAULT_KNOWN_VALUES, DEFAULT_MONITOR_PORT, FailureMode, KnownValues, NodeId, Timing, Value,
};
use crate::runtime::NodeConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "Leader election and single-value Paxos", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one cluster member.
    Node(NodeArgs),
    /// Submit values to the elected leader.
    Client(ClientArgs),
    /// Record cluster events to a CSV log.
    Monitor(MonitorArgs),
}

/// Addresses shared by nodes and the client.
#[derive(Args, Debug, Clone)]
pub struct NetworkArgs {
    /// Host every node, the client and the monitor run on.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub host: IpAddr,

    /// Node `n` listens for peers on `base-port + n` and for proposals on
    /// `base-port + 100 + n`.
    #[arg(long, default_value_t = DEFAULT_BASE_PORT)]
    pub base_port: u16,

    /// Client announcement port; acks arrive on the next port.
    #[arg(long, default_value_t = DEFAULT_CLIENT_PORT)]
    pub client_port: u16,

    #[arg(long, default_value_t = DEFAULT_MONITOR_PORT)]
    pub monitor_port: u16,

    /// Do not send events to the monitor.
    #[arg(long)]
    pub no_monitor: bool,
}

impl NetworkArgs {
    pub fn layout(&self, size: u32) -> Result<ClusterLayout> {
        let monitor = (!self.no_monitor).then_some(self.monitor_port);
        ClusterLayout::new(size, self.host, self.base_port, self.client_port, monitor)
    }
}

#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// This node's identity, in 1..=cluster-size.
    #[arg(long, env = "PAXOS_NODE_ID")]
    pub id: NodeId,

    #[arg(long, env = "PAXOS_CLUSTER_SIZE", default_value_t = DEFAULT_CLUSTER_SIZE)]
    pub cluster_size: u32,

    /// Injected failure: none, leader-after:<n>, follower-after-election, or 0/2/3/4.
    #[arg(long, env = "PAXOS_FAIL_CASE", default_value_t = FailureMode::None)]
    pub fail_case: FailureMode,

    /// Values the cluster will agree on; anything else is rejected.
    #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_KNOWN_VALUES)]
    pub known_values: Vec<Value>,

    /// How long an election waits for candidacies. 0 waits forever.
    #[arg(long, default_value_t = 3000)]
    pub election_timeout_ms: u64,

    /// How long a round waits for each quorum. 0 waits forever.
    #[arg(long, default_value_t = 0)]
    pub round_timeout_ms: u64,

    #[command(flatten)]
    pub network: NetworkArgs,
}

impl NodeArgs {
    pub fn into_config(self) -> Result<NodeConfig> {
        let layout = self.network.layout(self.cluster_size)?;
        layout.ensure_member(self.id)?;
        Ok(NodeConfig {
            id: self.id,
            layout,
            timing: Timing {
                election_timeout: optional_millis(self.election_timeout_ms),
                round_timeout: optional_millis(self.round_timeout_ms),
                ..Timing::default()
            },
            known_values: KnownValues::new(self.known_values),
            failure_mode: self.fail_case,
            crash_behavior: CrashBehavior::ExitProcess,
        })
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    #[arg(long, env = "PAXOS_CLUSTER_SIZE", default_value_t = DEFAULT_CLUSTER_SIZE)]
    pub cluster_size: u32,

    /// Values to propose, in order.
    #[arg(
        long,
        value_delimiter = ',',
        allow_hyphen_values = true,
        default_values_t = DEFAULT_KNOWN_VALUES
    )]
    pub values: Vec<Value>,

    #[arg(long, default_value_t = 2000)]
    pub send_delay_ms: u64,

    #[arg(long, default_value_t = 8000)]
    pub ack_timeout_ms: u64,

    /// How long to wait for a new leader after a missed ack.
    #[arg(long, default_value_t = 10_000)]
    pub leader_wait_ms: u64,

    /// Give up on a value after this many sends. Retries forever if unset.
    #[arg(long)]
    pub max_attempts: Option<u32>,

    #[command(flatten)]
    pub network: NetworkArgs,
}

impl ClientArgs {
    pub fn into_config(self) -> Result<ClientConfig> {
        Ok(ClientConfig {
            layout: self.network.layout(self.cluster_size)?,
            values: self.values,
            send_delay: Duration::from_millis(self.send_delay_ms),
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            leader_wait: Duration::from_millis(self.leader_wait_ms),
            max_attempts: self.max_attempts,
        })
    }
}

#[derive(Args, Debug, Clone)]
pub struct MonitorArgs {
    #[arg(long, default_value = "0.0.0.0:6000")]
    pub listen: SocketAddr,

    /// CSV file to write; truncated on start.
    #[arg(long, default_value = "events.csv", value_hint = ValueHint::FilePath)]
    pub log: PathBuf,
}

fn optional_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
