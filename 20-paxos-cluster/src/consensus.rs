//! Single-decree Paxos rounds, driven by the elected leader.
//!
//! The consensus activity runs for the whole life of the node and plays one
//! of two roles on every pass, depending on who the current leader is:
//!
//! - **Leader**: take the latest client value from the [`ProposalSlot`],
//!   validate it against the known-values allow-list, then run PREPARE /
//!   PROMISE and ACCEPT / ACCEPTED against a majority before acknowledging
//!   the client.
//! - **Follower**: answer PREPARE with PROMISE (carrying any previously
//!   accepted value) and ACCEPT with ACCEPTED, after validating the value.
//!
//! Nothing happens until the first election has completed.
//!
//! [`ProposalSlot`]: crate::state::ProposalSlot

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::debug;

use crate::config::Value;
use crate::inbox::PopError;
use crate::message::{Message, MessageKind};
use crate::runtime::NodeContext;
use crate::telemetry::NodeEvent;

/// How long one pass of the loop waits for work before re-checking the
/// leader and shutdown flags.
const POLL: Duration = Duration::from_millis(100);

/// Phase of a round the leader is collecting votes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    Promise,
    Accepted,
}

impl RoundPhase {
    fn kind(self) -> MessageKind {
        match self {
            Self::Promise => MessageKind::Promise,
            Self::Accepted => MessageKind::Accepted,
        }
    }
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Promise => write!(f, "PROMISE"),
            Self::Accepted => write!(f, "ACCEPTED"),
        }
    }
}

/// How a leader-driven round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    Decided { proposal: u32, value: Value },
    /// The value is not on the allow-list; no proposal number was consumed.
    Rejected { value: Value },
    TimedOut { proposal: u32, phase: RoundPhase },
    /// The node halted mid-round.
    Halted,
}

pub(crate) fn spawn_consensus(ctx: Arc<NodeContext>) -> Result<()> {
    thread::Builder::new()
        .name(format!("consensus-{}", ctx.id))
        .spawn(move || run_consensus(&ctx))
        .map(|_| ())
        .context("failed to spawn consensus engine")
}

fn run_consensus(ctx: &NodeContext) {
    loop {
        if ctx.is_halted() {
            return;
        }
        if !ctx.state.election_done() {
            thread::sleep(POLL);
            continue;
        }

        if ctx.state.is_leader(ctx.id) {
            match ctx.proposals.take_timeout(POLL) {
                Ok(value) => {
                    lead_round(ctx, value);
                }
                Err(PopError::TimedOut) => drain_idle(ctx),
                Err(PopError::Closed) => return,
            }
        } else {
            match ctx.inbox.pop_timeout(POLL) {
                Ok(message) => follow(ctx, message),
                Err(PopError::TimedOut) => {}
                Err(PopError::Closed) => return,
            }
        }
    }
}

/// Handles whatever reached an idle leader's inbox: late votes from the
/// previous round, a competing COORDINATOR, or candidacies to park.
fn drain_idle(ctx: &NodeContext) {
    while let Ok(message) = ctx.inbox.pop_timeout(Duration::ZERO) {
        follow(ctx, message);
    }
}

/// Runs one full Paxos round for a client `value`.
pub(crate) fn lead_round(ctx: &NodeContext, value: Value) -> RoundOutcome {
    ctx.emit(NodeEvent::ValueReceived { value });
    if !ctx.known_values.contains(value) {
        ctx.emit(NodeEvent::ValueRejected { value });
        return RoundOutcome::Rejected { value };
    }

    let proposal = ctx.state.next_proposal();
    ctx.emit(NodeEvent::PrepareSent { proposal });
    ctx.broadcast(&Message::prepare(ctx.id, proposal));

    let promises = match collect_quorum(ctx, RoundPhase::Promise, proposal) {
        Ok(votes) => votes,
        Err(outcome) => return outcome,
    };
    ctx.emit(NodeEvent::PromiseQuorum { proposal, promises });

    ctx.state.record_accepted(proposal, value);
    ctx.broadcast(&Message::accept(ctx.id, proposal, value));
    ctx.emit(NodeEvent::AcceptSent { proposal, value });

    if let Err(outcome) = collect_quorum(ctx, RoundPhase::Accepted, proposal) {
        return outcome;
    }
    ctx.emit(NodeEvent::ConsensusReached { proposal, value });

    if ctx.notifier.acknowledge(value) {
        ctx.emit(NodeEvent::ClientAcked { value });
    } else {
        debug!(node = ctx.id, value, "client unreachable, acknowledgement dropped");
    }
    RoundOutcome::Decided { proposal, value }
}

/// Waits until a majority, counting the leader itself, has answered
/// `proposal` in `phase`. Returns the number of votes.
///
/// Votes for other proposal numbers are stale and dropped. A COORDINATOR
/// still updates the leader, and candidacies are parked for the election
/// engine.
fn collect_quorum(
    ctx: &NodeContext,
    phase: RoundPhase,
    proposal: u32,
) -> Result<usize, RoundOutcome> {
    let quorum = ctx.layout.quorum();
    let deadline = ctx.timing.round_timeout.map(|timeout| Instant::now() + timeout);
    let mut votes = 1;

    while votes < quorum {
        let next = match deadline {
            Some(deadline) => ctx.inbox.pop_until(deadline),
            None => ctx.inbox.pop(),
        };
        match next {
            Ok(message) if message.kind == phase.kind() && message.proposal_number == proposal => {
                votes += 1;
            }
            Ok(message) if message.kind == MessageKind::Coordinator => {
                if let Some(leader) = message.coordinator_winner() {
                    ctx.state.set_leader(leader);
                }
            }
            Ok(message) if message.kind == MessageKind::Election => {
                ctx.state.defer_candidacy(message);
            }
            Ok(message) => {
                debug!(node = ctx.id, ?message, %phase, proposal, "dropping message during round");
            }
            Err(PopError::TimedOut) => {
                ctx.emit(NodeEvent::RoundTimedOut { proposal, phase });
                return Err(RoundOutcome::TimedOut { proposal, phase });
            }
            Err(PopError::Closed) => return Err(RoundOutcome::Halted),
        }
    }
    Ok(votes)
}

/// Acceptor-side handling of one inbound message.
pub(crate) fn follow(ctx: &NodeContext, message: Message) {
    let leader = message.sender_id;
    match message.kind {
        MessageKind::Prepare => {
            let proposal = message.proposal_number;
            ctx.emit(NodeEvent::PrepareReceived {
                from: leader,
                proposal,
            });
            ctx.send(
                leader,
                &Message::promise(ctx.id, proposal, ctx.state.accepted_value()),
            );
        }
        MessageKind::Accept => {
            let (proposal, value) = (message.proposal_number, message.value);
            if !ctx.known_values.contains(value) {
                ctx.emit(NodeEvent::AcceptRejected {
                    from: leader,
                    proposal,
                    value,
                });
                return;
            }
            ctx.state.record_accepted(proposal, value);
            ctx.emit(NodeEvent::AcceptReceived {
                from: leader,
                proposal,
                value,
            });
            ctx.send(leader, &Message::accepted(ctx.id, proposal, value));
            ctx.emit(NodeEvent::AcceptedSent {
                to: leader,
                proposal,
                value,
            });
        }
        MessageKind::Coordinator => {
            if let Some(winner) = message.coordinator_winner() {
                ctx.state.set_leader(winner);
            }
        }
        MessageKind::Election => ctx.state.defer_candidacy(message),
        MessageKind::Promise | MessageKind::Accepted | MessageKind::Heartbeat => {
            debug!(node = ctx.id, ?message, "ignoring stray message");
        }
    }
}
