//! Deliberate crash points for failover experiments.
//!
//! The injector only decides *whether* to crash; the runtime decides *how*
//! (see [`crate::config::CrashBehavior`]).

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::config::FailureMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashReason {
    /// Injected leader crash on receipt of the `after`-th client proposal.
    LeaderInjected { after: u32 },
    /// Injected crash of a non-leader right after an election.
    FollowerInjected,
    /// A required listening port could not be bound.
    BindFailed { addr: SocketAddr },
}

impl CrashReason {
    /// A leader dying on its very first proposal exits 99, later ones 96.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::LeaderInjected { after: 1 } => 99,
            Self::LeaderInjected { .. } => 96,
            Self::FollowerInjected => 97,
            Self::BindFailed { .. } => 1,
        }
    }
}

impl fmt::Display for CrashReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LeaderInjected { after } => {
                write!(f, "simulated leader failure at client proposal {after}")
            }
            Self::FollowerInjected => write!(f, "simulated follower failure after election"),
            Self::BindFailed { addr } => write!(f, "could not bind {addr}"),
        }
    }
}

pub struct FailureInjector {
    mode: FailureMode,
    proposals_received: AtomicU32,
}

impl FailureInjector {
    pub fn new(mode: FailureMode) -> Self {
        Self {
            mode,
            proposals_received: AtomicU32::new(0),
        }
    }

    pub fn mode(&self) -> FailureMode {
        self.mode
    }

    /// Called by the proposal listener for every client proposal, before the
    /// value is handed to consensus.
    pub fn on_proposal(&self, is_leader: bool) -> Option<CrashReason> {
        let received = self.proposals_received.fetch_add(1, Ordering::SeqCst) + 1;
        match self.mode {
            FailureMode::LeaderAfterProposals(after) if is_leader && received == after => {
                Some(CrashReason::LeaderInjected { after })
            }
            _ => None,
        }
    }

    /// Called once an election has picked a leader.
    pub fn on_election(&self, is_leader: bool) -> Option<CrashReason> {
        match self.mode {
            FailureMode::FollowerAfterElection if !is_leader => Some(CrashReason::FollowerInjected),
            _ => None,
        }
    }
}
