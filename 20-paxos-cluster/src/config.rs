//! Cluster layout, protocol timing and failure-injection settings.
//!
//! Every address a node talks to is derived from a [`ClusterLayout`]: peers
//! listen on `base_port + id`, a leader accepts client proposals on
//! `base_port + 100 + id`, the client waits for leader announcements on
//! `client_port` and for acknowledgements on `client_port + 1`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Result, anyhow, ensure};

/// Identity of a cluster member, always in `1..=size`.
pub type NodeId = u32;

/// A value clients propose and the cluster agrees on.
pub type Value = i32;

pub const DEFAULT_CLUSTER_SIZE: u32 = 5;
pub const DEFAULT_BASE_PORT: u16 = 5000;
pub const PROPOSAL_PORT_OFFSET: u16 = 100;
pub const DEFAULT_CLIENT_PORT: u16 = 7000;
pub const DEFAULT_MONITOR_PORT: u16 = 6000;
pub const DEFAULT_KNOWN_VALUES: [Value; 5] = [42, 99, 7, 1234, 56];

/// Static description of the cluster and the addresses derived from it.
#[derive(Debug, Clone)]
pub struct ClusterLayout {
    size: u32,
    host: IpAddr,
    base_port: u16,
    client_port: u16,
    monitor_port: Option<u16>,
}

impl ClusterLayout {
    pub fn new(
        size: u32,
        host: IpAddr,
        base_port: u16,
        client_port: u16,
        monitor_port: Option<u16>,
    ) -> Result<Self> {
        ensure!(size >= 1, "cluster requires at least one node");
        ensure!(
            u32::from(base_port) + u32::from(PROPOSAL_PORT_OFFSET) + size <= u32::from(u16::MAX),
            "base port {base_port} leaves no room for {size} proposal ports"
        );
        ensure!(
            client_port < u16::MAX,
            "client port {client_port} leaves no room for the ack port"
        );
        Ok(Self {
            size,
            host,
            base_port,
            client_port,
            monitor_port,
        })
    }

    /// Loopback layout without a monitor, used by tests and local demos.
    pub fn local(size: u32, base_port: u16, client_port: u16) -> Result<Self> {
        Self::new(
            size,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            base_port,
            client_port,
            None,
        )
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Minimum number of votes, the leader's own included, that binds a round.
    pub fn quorum(&self) -> usize {
        self.size as usize / 2 + 1
    }

    pub fn contains(&self, id: NodeId) -> bool {
        (1..=self.size).contains(&id)
    }

    pub fn ensure_member(&self, id: NodeId) -> Result<()> {
        if self.contains(id) {
            Ok(())
        } else {
            Err(anyhow!(
                "node id {id} outside cluster of {} nodes",
                self.size
            ))
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + use<> {
        1..=self.size
    }

    /// Every member except `id`.
    pub fn peers_of(&self, id: NodeId) -> impl Iterator<Item = NodeId> + use<> {
        (1..=self.size).filter(move |peer| *peer != id)
    }

    pub fn peer_addr(&self, id: NodeId) -> SocketAddr {
        SocketAddr::new(self.host, self.offset_port(0, id))
    }

    pub fn proposal_addr(&self, id: NodeId) -> SocketAddr {
        SocketAddr::new(self.host, self.offset_port(PROPOSAL_PORT_OFFSET, id))
    }

    pub fn client_announce_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.client_port)
    }

    pub fn client_ack_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.client_port + 1)
    }

    pub fn monitor_addr(&self) -> Option<SocketAddr> {
        self.monitor_port.map(|port| SocketAddr::new(self.host, port))
    }

    fn offset_port(&self, offset: u16, id: NodeId) -> u16 {
        // Members are range checked in `new`, so this never truncates for them.
        (u32::from(self.base_port) + u32::from(offset) + id) as u16
    }
}

impl Default for ClusterLayout {
    fn default() -> Self {
        Self {
            size: DEFAULT_CLUSTER_SIZE,
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            base_port: DEFAULT_BASE_PORT,
            client_port: DEFAULT_CLIENT_PORT,
            monitor_port: Some(DEFAULT_MONITOR_PORT),
        }
    }
}

/// Allow-list both leader and followers check proposals against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownValues(Vec<Value>);

impl KnownValues {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn contains(&self, value: Value) -> bool {
        self.0.contains(&value)
    }
}

impl Default for KnownValues {
    fn default() -> Self {
        Self(DEFAULT_KNOWN_VALUES.to_vec())
    }
}

/// Intervals and bounds that drive every timed activity of a node.
///
/// `None` on the two optional waits blocks without bound: an election then
/// waits for every peer and a round waits for its quorum forever.
#[derive(Debug, Clone)]
pub struct Timing {
    /// Pause before the very first candidacy broadcast so peers can bind.
    pub startup_grace: Duration,
    /// How long an election collects candidacies before deciding.
    pub election_timeout: Option<Duration>,
    /// Delay before a fresh leader announces itself to the client.
    pub settle_delay: Duration,
    pub heartbeat_interval: Duration,
    /// Maximum heartbeat silence before a follower presumes the leader dead.
    pub liveness_threshold: Duration,
    pub liveness_tick: Duration,
    /// Bound on each quorum-collection phase of a consensus round.
    pub round_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    pub notify_attempts: u32,
    pub notify_backoff: Duration,
    /// Back-off before re-running an election that heard from too few peers.
    pub stalled_retry: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_secs(1),
            election_timeout: Some(Duration::from_secs(3)),
            settle_delay: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(1),
            liveness_threshold: Duration::from_secs(3),
            liveness_tick: Duration::from_secs(1),
            round_timeout: None,
            connect_timeout: Duration::from_millis(500),
            notify_attempts: 10,
            notify_backoff: Duration::from_millis(200),
            stalled_retry: Duration::from_secs(1),
        }
    }
}

/// Deliberate crash points used to exercise leader failover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    #[default]
    None,
    /// The leader dies as the n-th client proposal arrives, before handling it.
    LeaderAfterProposals(u32),
    /// Every node that is not the leader dies right after the first election.
    FollowerAfterElection,
}

impl FromStr for FailureMode {
    type Err = anyhow::Error;

    /// Accepts `none`, `leader-after:<n>`, `follower-after-election` and the
    /// legacy numeric fail cases `0`, `2`, `3` and `4`.
    fn from_str(raw: &str) -> Result<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "" | "0" | "none" => return Ok(Self::None),
            "2" => return Ok(Self::LeaderAfterProposals(1)),
            "3" | "follower-after-election" => return Ok(Self::FollowerAfterElection),
            "4" => return Ok(Self::LeaderAfterProposals(2)),
            _ => {}
        }

        let Some(count) = normalized.strip_prefix("leader-after:") else {
            return Err(anyhow!(
                "invalid fail case '{raw}', expected none, leader-after:<n>, \
                 follower-after-election or 0/2/3/4"
            ));
        };
        let count: u32 = count
            .parse()
            .map_err(|err| anyhow!("invalid proposal count in '{raw}': {err}"))?;
        ensure!(count >= 1, "leader-after needs a count of at least 1");
        Ok(Self::LeaderAfterProposals(count))
    }
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::LeaderAfterProposals(count) => write!(f, "leader-after:{count}"),
            Self::FollowerAfterElection => write!(f, "follower-after-election"),
        }
    }
}

/// What an injected crash (or a fatal bind failure) does to the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashBehavior {
    /// Terminate the whole process, as a real crash would.
    ExitProcess,
    /// Silence the node in place; lets tests crash one node of an in-process cluster.
    Halt,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addresses_follow_port_layout() {
        let layout = ClusterLayout::default();
        assert_eq!(layout.peer_addr(3).port(), 5003);
        assert_eq!(layout.proposal_addr(3).port(), 5103);
        assert_eq!(layout.client_announce_addr().port(), 7000);
        assert_eq!(layout.client_ack_addr().port(), 7001);
        assert_eq!(layout.monitor_addr().map(|addr| addr.port()), Some(6000));
    }

    #[test]
    fn test_quorum_is_strict_majority() {
        assert_eq!(ClusterLayout::local(5, 5000, 7000).unwrap().quorum(), 3);
        assert_eq!(ClusterLayout::local(4, 5000, 7000).unwrap().quorum(), 3);
        assert_eq!(ClusterLayout::local(3, 5000, 7000).unwrap().quorum(), 2);
        assert_eq!(ClusterLayout::local(1, 5000, 7000).unwrap().quorum(), 1);
    }

    #[test]
    fn test_layout_rejects_invalid_sizes() {
        assert!(ClusterLayout::local(0, 5000, 7000).is_err());
        assert!(ClusterLayout::local(5, u16::MAX - 50, 7000).is_err());
        assert!(ClusterLayout::local(5, 5000, u16::MAX).is_err());
    }

    #[test]
    fn test_peers_exclude_self() {
        let layout = ClusterLayout::default();
        let peers: Vec<NodeId> = layout.peers_of(2).collect();
        assert_eq!(peers, vec![1, 3, 4, 5]);
        assert!(layout.ensure_member(5).is_ok());
        assert!(layout.ensure_member(6).is_err());
        assert!(layout.ensure_member(0).is_err());
    }

    #[test]
    fn test_failure_mode_parsing() {
        assert_eq!("none".parse::<FailureMode>().unwrap(), FailureMode::None);
        assert_eq!("0".parse::<FailureMode>().unwrap(), FailureMode::None);
        assert_eq!(
            "2".parse::<FailureMode>().unwrap(),
            FailureMode::LeaderAfterProposals(1)
        );
        assert_eq!(
            "4".parse::<FailureMode>().unwrap(),
            FailureMode::LeaderAfterProposals(2)
        );
        assert_eq!(
            "3".parse::<FailureMode>().unwrap(),
            FailureMode::FollowerAfterElection
        );
        assert_eq!(
            "Leader-After:7".parse::<FailureMode>().unwrap(),
            FailureMode::LeaderAfterProposals(7)
        );
        assert!("leader-after:0".parse::<FailureMode>().is_err());
        assert!("leader-after:x".parse::<FailureMode>().is_err());
        assert!("crash".parse::<FailureMode>().is_err());
    }

    #[test]
    fn test_failure_mode_display_round_trips() {
        for mode in [
            FailureMode::None,
            FailureMode::LeaderAfterProposals(2),
            FailureMode::FollowerAfterElection,
        ] {
            assert_eq!(mode.to_string().parse::<FailureMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_known_values_default_allow_list() {
        let known = KnownValues::default();
        for value in [42, 99, 7, 1234, 56] {
            assert!(known.contains(value));
        }
        assert!(!known.contains(9999));
    }
}
