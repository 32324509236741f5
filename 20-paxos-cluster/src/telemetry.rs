//! Protocol events, monitor datagrams and structured logging.
//!
//! Every protocol step a node takes is a [`NodeEvent`]. [`Telemetry::emit`]
//! logs it through `tracing`, ships the matching CSV line to the monitor over
//! UDP and forwards it to whoever holds the receiver returned by
//! [`crate::runtime::spawn_node`]. Nothing here ever blocks protocol progress:
//! a missing monitor or a dropped receiver is ignored.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use crossbeam_channel::Sender;
use tracing::{debug, info, warn};

use crate::config::{NodeId, Value};
use crate::consensus::RoundPhase;
use crate::failure::CrashReason;

/// Fixed first line of the monitor's event log.
pub const CSV_HEADER: &str = "timestamp,source,destination,action,proposal_num,proposal_val";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    ElectionStarted {
        epoch: u32,
        candidate: Value,
    },
    /// A counted candidacy was tagged with a different election epoch.
    EpochMismatch {
        epoch: u32,
        from: NodeId,
        their_epoch: u32,
    },
    ElectionStalled {
        epoch: u32,
        heard_from: usize,
    },
    LeaderElected {
        epoch: u32,
        candidate: Value,
        leader: NodeId,
    },
    LeaderAnnounced {
        leader: NodeId,
    },
    ValueReceived {
        value: Value,
    },
    ValueRejected {
        value: Value,
    },
    PrepareSent {
        proposal: u32,
    },
    PromiseQuorum {
        proposal: u32,
        promises: usize,
    },
    AcceptSent {
        proposal: u32,
        value: Value,
    },
    ConsensusReached {
        proposal: u32,
        value: Value,
    },
    ClientAcked {
        value: Value,
    },
    PrepareReceived {
        from: NodeId,
        proposal: u32,
    },
    AcceptReceived {
        from: NodeId,
        proposal: u32,
        value: Value,
    },
    AcceptedSent {
        to: NodeId,
        proposal: u32,
        value: Value,
    },
    AcceptRejected {
        from: NodeId,
        proposal: u32,
        value: Value,
    },
    LeaderTimedOut {
        leader: Option<NodeId>,
    },
    RoundTimedOut {
        proposal: u32,
        phase: RoundPhase,
    },
    Crashed {
        reason: CrashReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Severity {
    Debug,
    Info,
    Warn,
}

impl NodeEvent {
    /// Monitor record for this event as observed by `node`.
    pub fn record(&self, node: NodeId) -> MonitorRecord {
        let source = node.to_string();
        let all = "all".to_string();
        let client = "client".to_string();
        match *self {
            Self::ElectionStarted { epoch, candidate } => MonitorRecord::new(
                source,
                all,
                "ELECT_START",
                Some(epoch.into()),
                Some(candidate.into()),
            ),
            Self::EpochMismatch {
                epoch,
                from,
                their_epoch,
            } => MonitorRecord::new(
                source,
                from.to_string(),
                "EPOCH_MISMATCH",
                Some(epoch.into()),
                Some(their_epoch.into()),
            ),
            Self::ElectionStalled { epoch, heard_from } => MonitorRecord::new(
                source,
                all,
                "ELECT_STALLED",
                Some(epoch.into()),
                Some(heard_from as i64),
            ),
            Self::LeaderElected {
                candidate, leader, ..
            } => MonitorRecord::new(
                source,
                all,
                "ELECT",
                Some(candidate.into()),
                Some(leader.into()),
            ),
            Self::LeaderAnnounced { leader } => {
                MonitorRecord::new(source, client, "ANNOUNCE", None, Some(leader.into()))
            }
            Self::ValueReceived { value } => {
                MonitorRecord::new(source, client, "RECV_VALUE", Some(value.into()), None)
            }
            Self::ValueRejected { value } => {
                MonitorRecord::new(source, client, "REJECT_VALUE", Some(value.into()), None)
            }
            Self::PrepareSent { proposal } => {
                MonitorRecord::new(source, all, "SEND", Some(proposal.into()), None)
            }
            Self::PromiseQuorum { proposal, promises } => MonitorRecord::new(
                source,
                all,
                "PROMISE_QUORUM",
                Some(proposal.into()),
                Some(promises as i64),
            ),
            Self::AcceptSent { proposal, value } => MonitorRecord::new(
                source,
                all,
                "SEND_ACCEPT",
                Some(proposal.into()),
                Some(value.into()),
            ),
            Self::ConsensusReached { proposal, value } => MonitorRecord::new(
                source,
                all,
                "CONSENSUS",
                Some(proposal.into()),
                Some(value.into()),
            ),
            Self::ClientAcked { value } => {
                MonitorRecord::new(source, client, "SEND_OK", None, Some(value.into()))
            }
            Self::PrepareReceived { from, proposal } => MonitorRecord::new(
                source,
                from.to_string(),
                "RECV_PREPARE",
                Some(proposal.into()),
                None,
            ),
            Self::AcceptReceived {
                from,
                proposal,
                value,
            } => MonitorRecord::new(
                source,
                from.to_string(),
                "RECV_ACCEPT",
                Some(proposal.into()),
                Some(value.into()),
            ),
            Self::AcceptedSent {
                to,
                proposal,
                value,
            } => MonitorRecord::new(
                source,
                to.to_string(),
                "SEND_ACCEPTED",
                Some(proposal.into()),
                Some(value.into()),
            ),
            Self::AcceptRejected {
                from,
                proposal,
                value,
            } => MonitorRecord::new(
                source,
                from.to_string(),
                "REJECT_ACCEPT",
                Some(proposal.into()),
                Some(value.into()),
            ),
            Self::LeaderTimedOut { leader } => MonitorRecord::new(
                source,
                leader.map(|id| id.to_string()).unwrap_or_default(),
                "LEADER_TIMEOUT",
                None,
                None,
            ),
            Self::RoundTimedOut { proposal, .. } => {
                MonitorRecord::new(source, all, "ROUND_TIMEOUT", Some(proposal.into()), None)
            }
            Self::Crashed { reason } => MonitorRecord::new(
                source,
                String::new(),
                "CRASH",
                None,
                Some(reason.exit_code().into()),
            ),
        }
    }

    fn severity(&self) -> Severity {
        match self {
            Self::EpochMismatch { .. }
            | Self::ElectionStalled { .. }
            | Self::ValueRejected { .. }
            | Self::AcceptRejected { .. }
            | Self::LeaderTimedOut { .. }
            | Self::RoundTimedOut { .. }
            | Self::Crashed { .. } => Severity::Warn,
            Self::PrepareReceived { .. }
            | Self::AcceptReceived { .. }
            | Self::AcceptedSent { .. }
            | Self::PromiseQuorum { .. } => Severity::Debug,
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for NodeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ElectionStarted { epoch, candidate } => {
                write!(f, "election epoch {epoch} started with candidate {candidate}")
            }
            Self::EpochMismatch {
                epoch,
                from,
                their_epoch,
            } => write!(
                f,
                "counted candidacy from node {from} tagged epoch {their_epoch} during epoch {epoch}"
            ),
            Self::ElectionStalled { epoch, heard_from } => write!(
                f,
                "election epoch {epoch} heard from only {heard_from} peers, retrying"
            ),
            Self::LeaderElected { epoch, leader, .. } => {
                write!(f, "leader elected: {leader} (epoch {epoch})")
            }
            Self::LeaderAnnounced { leader } => write!(f, "announced leader {leader} to client"),
            Self::ValueReceived { value } => write!(f, "received value {value} from client"),
            Self::ValueRejected { value } => write!(f, "rejected unknown value {value}"),
            Self::PrepareSent { proposal } => write!(f, "sent PREPARE for proposal {proposal}"),
            Self::PromiseQuorum { proposal, promises } => {
                write!(f, "proposal {proposal} promised by {promises} nodes")
            }
            Self::AcceptSent { proposal, value } => {
                write!(f, "sent ACCEPT for proposal {proposal} with value {value}")
            }
            Self::ConsensusReached { proposal, value } => {
                write!(f, "consensus on {value} (proposal {proposal})")
            }
            Self::ClientAcked { value } => write!(f, "acknowledged value {value} to client"),
            Self::PrepareReceived { from, proposal } => {
                write!(f, "PREPARE {proposal} from leader {from}")
            }
            Self::AcceptReceived {
                from,
                proposal,
                value,
            } => write!(f, "accepted value {value} from leader {from} (proposal {proposal})"),
            Self::AcceptedSent {
                to,
                proposal,
                value,
            } => write!(f, "sent ACCEPTED to leader {to} (proposal {proposal}, value {value})"),
            Self::AcceptRejected {
                from,
                proposal,
                value,
            } => write!(f, "rejected value {value} from leader {from} (proposal {proposal})"),
            Self::LeaderTimedOut { leader: Some(leader) } => {
                write!(f, "leader {leader} missed heartbeats, starting re-election")
            }
            Self::LeaderTimedOut { leader: None } => {
                write!(f, "leader missed heartbeats, starting re-election")
            }
            Self::RoundTimedOut { proposal, phase } => {
                write!(f, "proposal {proposal} timed out waiting for {phase} quorum")
            }
            Self::Crashed { reason } => write!(f, "crashing: {reason}"),
        }
    }
}

/// One line of the monitor's CSV event log, minus the timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorRecord {
    pub source: String,
    pub destination: String,
    pub action: &'static str,
    pub proposal_num: Option<i64>,
    pub proposal_val: Option<i64>,
}

impl MonitorRecord {
    pub fn new(
        source: String,
        destination: String,
        action: &'static str,
        proposal_num: Option<i64>,
        proposal_val: Option<i64>,
    ) -> Self {
        Self {
            source,
            destination,
            action,
            proposal_num,
            proposal_val,
        }
    }

    /// Renders the record with `timestamp`; absent fields stay empty.
    pub fn to_line(&self, timestamp: &str) -> String {
        let field = |value: Option<i64>| value.map(|v| v.to_string()).unwrap_or_default();
        format!(
            "{timestamp},{},{},{},{},{}\n",
            self.source,
            self.destination,
            self.action,
            field(self.proposal_num),
            field(self.proposal_val)
        )
    }
}

/// Local wall-clock time as `YYYY-MM-DDTHH:MM:SS.mmm`.
pub fn timestamp_now() -> String {
    chrono::Local::now()
        .format("%Y-%m-%dT%H:%M:%S%.3f")
        .to_string()
}

/// Fire-and-forget UDP sender for monitor lines.
pub struct MonitorReporter {
    socket: Option<(UdpSocket, SocketAddr)>,
}

impl MonitorReporter {
    pub fn new(target: Option<SocketAddr>) -> Self {
        let socket = target.and_then(|target| {
            let unspecified = match target.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            };
            match UdpSocket::bind(SocketAddr::new(unspecified, 0)) {
                Ok(socket) => Some((socket, target)),
                Err(err) => {
                    warn!(error = %err, "monitor socket unavailable, events stay local");
                    None
                }
            }
        });
        Self { socket }
    }

    pub fn disabled() -> Self {
        Self { socket: None }
    }

    pub fn report(&self, record: &MonitorRecord) {
        if let Some((socket, target)) = &self.socket {
            let line = record.to_line(&timestamp_now());
            if let Err(err) = socket.send_to(line.as_bytes(), target) {
                debug!(error = %err, "monitor datagram dropped");
            }
        }
    }
}

/// Per-node event sink.
pub struct Telemetry {
    node: NodeId,
    monitor: MonitorReporter,
    events: Sender<NodeEvent>,
}

impl Telemetry {
    pub fn new(node: NodeId, monitor: MonitorReporter, events: Sender<NodeEvent>) -> Self {
        Self {
            node,
            monitor,
            events,
        }
    }

    pub fn emit(&self, event: NodeEvent) {
        match event.severity() {
            Severity::Debug => debug!(node = self.node, "{event}"),
            Severity::Info => info!(node = self.node, "{event}"),
            Severity::Warn => warn!(node = self.node, "{event}"),
        }
        self.monitor.report(&event.record(self.node));
        // Nobody listening is fine; the receiver is optional.
        let _ = self.events.send(event);
    }
}
