//! Leader election and single-value Paxos over a small TCP cluster.
//!
//! Every member runs the same node: it elects a leader by exchanging random
//! candidate numbers, then lets that leader drive one Paxos round per value
//! an external client submits. The leader broadcasts heartbeats; followers
//! that stop hearing them start a fresh election.
//!
//! # Architecture
//!
//! Each node is a set of named OS threads sharing protocol state:
//!
//! - **Peer listener**: one fixed-size frame per TCP connection, into the inbox
//! - **Election engine**: highest `(random number, id)` wins
//! - **Consensus engine**: PREPARE/PROMISE then ACCEPT/ACCEPTED against a majority
//! - **Heartbeat sender / liveness monitor**: leader failure detection
//! - **Proposal listener**: client values, on the leader only
//!
//! The client and the monitor are small tokio programs living in the same
//! binary.
//!
//! # Modules
//!
//! - [`runtime`]: node startup, shared context, [`runtime::NodeHandle`]
//! - [`election`], [`consensus`], [`liveness`]: the protocol activities
//! - [`inbox`], [`state`]: queue and shared state the activities coordinate through
//! - [`listener`], [`link`], [`message`]: inbound and outbound wire traffic
//! - [`telemetry`]: events, logging and monitor datagrams
//! - [`failure`]: injected crashes for failover experiments
//! - [`client`], [`monitor`]: external collaborators
//! - [`config`], [`cli`]: layout, timing and command-line parsing

pub mod cli;
pub mod client;
pub mod config;
pub mod consensus;
pub mod election;
pub mod failure;
pub mod inbox;
pub mod link;
pub mod listener;
pub mod liveness;
pub mod message;
pub mod monitor;
pub mod runtime;
pub mod state;
pub mod telemetry;
