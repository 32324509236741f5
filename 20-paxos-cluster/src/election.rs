//! Leader election: highest random candidate number wins.
//!
//! Every node draws a random number, broadcasts it in an ELECTION message and
//! waits for the candidacies of all its peers. The highest
//! `(number, node id)` pair wins. Since every node sees the same set of
//! pairs, they all pick the same leader without a second round.
//!
//! Each run is tagged with a local epoch carried in the `proposal_number`
//! field. Candidacies from a different epoch still count; the mismatch is
//! only reported. The wait for candidacies is bounded by
//! [`Timing::election_timeout`](crate::config::Timing): when it expires with
//! a majority heard from, the run decides on what it has, otherwise it is
//! retried with a fresh epoch.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rand::Rng;
use tracing::{debug, warn};

use crate::config::{NodeId, Value};
use crate::inbox::PopError;
use crate::listener;
use crate::message::{Message, MessageKind};
use crate::runtime::NodeContext;
use crate::telemetry::NodeEvent;

/// Candidate numbers are drawn from `0..CANDIDATE_RANGE`.
const CANDIDATE_RANGE: Value = 10_000;

/// Longest single wait on the inbox, so parked candidacies are picked up
/// while the engine is blocked.
const CANDIDACY_POLL: Duration = Duration::from_millis(50);

/// A node's bid in one election.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub number: Value,
    pub node: NodeId,
}

impl Candidate {
    /// Strictly greater number wins; equal numbers go to the higher node id.
    pub fn beats(&self, other: &Candidate) -> bool {
        (self.number, self.node) > (other.number, other.node)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionOutcome {
    Elected { epoch: u32, leader: NodeId },
    /// The window closed before a majority answered.
    Stalled { epoch: u32, heard_from: usize },
    Halted,
}

pub(crate) fn draw_candidate() -> Value {
    rand::thread_rng().gen_range(0..CANDIDATE_RANGE)
}

/// Starts an election on its own thread after `delay`.
///
/// Used once at startup and again by the liveness monitor whenever the
/// leader goes quiet.
pub(crate) fn spawn_election(ctx: Arc<NodeContext>, delay: Duration) -> Result<()> {
    thread::Builder::new()
        .name(format!("election-{}", ctx.id))
        .spawn(move || {
            thread::sleep(delay);
            elect(&ctx);
        })
        .map(|_| ())
        .context("failed to spawn election engine")
}

fn elect(ctx: &Arc<NodeContext>) {
    loop {
        match run_election(ctx, draw_candidate()) {
            ElectionOutcome::Elected { leader, .. } => {
                after_election(ctx, leader);
                return;
            }
            ElectionOutcome::Stalled { .. } => thread::sleep(ctx.timing.stalled_retry),
            ElectionOutcome::Halted => return,
        }
    }
}

/// Runs one election round with `candidate` as this node's number.
pub(crate) fn run_election(ctx: &NodeContext, candidate: Value) -> ElectionOutcome {
    if ctx.is_halted() {
        return ElectionOutcome::Halted;
    }
    let epoch = ctx.state.begin_epoch();
    ctx.state.clear_heartbeat();
    ctx.emit(NodeEvent::ElectionStarted { epoch, candidate });
    ctx.broadcast(&Message::election(ctx.id, epoch, candidate));

    let expected = ctx.layout.size() as usize - 1;
    let deadline = ctx.timing.election_timeout.map(|window| Instant::now() + window);
    let mut best = Candidate {
        number: candidate,
        node: ctx.id,
    };
    // A peer that re-ran its election shows up twice; it is still one voice.
    let mut heard_from = BTreeSet::new();
    let mut set_aside = Vec::new();
    let mut expired = false;

    while heard_from.len() < expected {
        let next = match ctx.state.take_deferred_candidacy() {
            Some(message) => Ok(message),
            None => {
                let slice = Instant::now() + CANDIDACY_POLL;
                let until = deadline.map_or(slice, |deadline| deadline.min(slice));
                ctx.inbox.pop_until(until)
            }
        };
        match next {
            Ok(message) if message.kind == MessageKind::Election => {
                if message.proposal_number != epoch {
                    ctx.emit(NodeEvent::EpochMismatch {
                        epoch,
                        from: message.sender_id,
                        their_epoch: message.proposal_number,
                    });
                }
                let bid = Candidate {
                    number: message.value,
                    node: message.sender_id,
                };
                if bid.beats(&best) {
                    best = bid;
                }
                heard_from.insert(message.sender_id);
            }
            Ok(message) => set_aside.push(message),
            Err(PopError::TimedOut) => {
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    expired = true;
                    break;
                }
            }
            Err(PopError::Closed) => return ElectionOutcome::Halted,
        }
    }
    // Whatever else arrived belongs to the consensus engine, in order.
    ctx.inbox.restore_front(set_aside);

    if expired {
        let heard_from = heard_from.len();
        if heard_from + 1 < ctx.layout.quorum() {
            ctx.emit(NodeEvent::ElectionStalled { epoch, heard_from });
            return ElectionOutcome::Stalled { epoch, heard_from };
        }
        warn!(
            node = ctx.id,
            epoch,
            heard_from,
            "election window closed, deciding with a majority"
        );
    }

    let leader = best.node;
    ctx.state.set_leader(leader);
    ctx.broadcast(&Message::coordinator(ctx.id, epoch, leader));
    ctx.emit(NodeEvent::LeaderElected {
        epoch,
        candidate,
        leader,
    });
    ctx.state.mark_election_done();
    ElectionOutcome::Elected { epoch, leader }
}

/// Post-election duties: injected follower crash, or taking over as leader.
fn after_election(ctx: &Arc<NodeContext>, leader: NodeId) {
    let is_leader = leader == ctx.id;
    if let Some(reason) = ctx.failures.on_election(is_leader) {
        ctx.crash(reason);
        return;
    }
    if !is_leader {
        return;
    }

    listener::serve_proposals(ctx);
    if ctx.is_halted() {
        return;
    }
    thread::sleep(ctx.timing.settle_delay);
    if ctx.notifier.announce_leader(ctx.id) {
        ctx.emit(NodeEvent::LeaderAnnounced { leader: ctx.id });
    } else {
        debug!(node = ctx.id, "client not listening for leader announcements");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timing;
    use crate::runtime::tests::{test_context, test_context_with, test_timing};

    fn unbounded() -> Timing {
        Timing {
            election_timeout: None,
            ..test_timing()
        }
    }

    #[test]
    fn test_higher_number_wins() {
        let low = Candidate { number: 10, node: 5 };
        let high = Candidate { number: 11, node: 1 };
        assert!(high.beats(&low));
        assert!(!low.beats(&high));
    }

    #[test]
    fn test_equal_numbers_break_ties_by_id() {
        let a = Candidate { number: 500, node: 2 };
        let b = Candidate { number: 500, node: 4 };
        assert!(b.beats(&a));
        assert!(!a.beats(&b));
        assert!(!a.beats(&a));
    }

    #[test]
    fn test_candidates_stay_in_range() {
        for _ in 0..1000 {
            assert!((0..CANDIDATE_RANGE).contains(&draw_candidate()));
        }
    }

    #[test]
    fn test_highest_candidacy_becomes_leader() {
        let (ctx, transport) = test_context_with(2, unbounded());
        for (node, number) in [(1, 300), (3, 9000), (4, 12), (5, 8999)] {
            ctx.inbox.push(Message::election(node, 1, number));
        }

        assert_eq!(
            run_election(&ctx, 4000),
            ElectionOutcome::Elected {
                epoch: 1,
                leader: 3
            }
        );
        assert_eq!(ctx.state.leader_id(), Some(3));
        assert!(ctx.state.election_done());

        let sent = transport.sent();
        assert_eq!(sent.len(), 8);
        assert!(sent[..4].iter().all(|(_, m)| *m == Message::election(2, 1, 4000)));
        assert!(sent[4..].iter().all(|(_, m)| *m == Message::coordinator(2, 1, 3)));
    }

    #[test]
    fn test_own_candidacy_can_win() {
        let (ctx, _transport) = test_context_with(1, unbounded());
        for node in 2..=5 {
            ctx.inbox.push(Message::election(node, 1, 100));
        }
        assert_eq!(
            run_election(&ctx, 100),
            ElectionOutcome::Elected {
                epoch: 1,
                leader: 5
            }
        );
    }

    #[test]
    fn test_other_messages_are_returned_in_order() {
        let (ctx, _transport) = test_context_with(2, unbounded());
        ctx.inbox.push(Message::prepare(5, 1));
        ctx.inbox.push(Message::election(1, 1, 1));
        ctx.inbox.push(Message::accept(5, 1, 42));
        for node in [3, 4, 5] {
            ctx.inbox.push(Message::election(node, 1, 2));
        }

        run_election(&ctx, 0);

        assert_eq!(ctx.inbox.pop().unwrap(), Message::prepare(5, 1));
        assert_eq!(ctx.inbox.pop().unwrap(), Message::accept(5, 1, 42));
        assert!(ctx.inbox.is_empty());
    }

    #[test]
    fn test_parked_candidacies_are_counted() {
        let (ctx, _transport) = test_context_with(2, unbounded());
        ctx.state.defer_candidacy(Message::election(5, 1, 9999));
        for node in [1, 3, 4] {
            ctx.inbox.push(Message::election(node, 1, 5));
        }
        assert_eq!(
            run_election(&ctx, 5),
            ElectionOutcome::Elected {
                epoch: 1,
                leader: 5
            }
        );
    }

    #[test]
    fn test_mismatched_epochs_still_count() {
        let (ctx, _transport) = test_context_with(2, unbounded());
        ctx.state.begin_epoch();
        // This run is epoch 2; peers still tag epoch 1.
        for node in [1, 3, 4, 5] {
            ctx.inbox.push(Message::election(node, 1, node as Value));
        }
        assert_eq!(
            run_election(&ctx, 0),
            ElectionOutcome::Elected {
                epoch: 2,
                leader: 5
            }
        );
    }

    #[test]
    fn test_window_decides_with_a_majority() {
        let timing = Timing {
            election_timeout: Some(Duration::from_millis(150)),
            ..test_timing()
        };
        let (ctx, _transport) = test_context_with(3, timing);
        ctx.inbox.push(Message::election(1, 1, 7000));
        ctx.inbox.push(Message::election(2, 1, 10));

        assert_eq!(
            run_election(&ctx, 20),
            ElectionOutcome::Elected {
                epoch: 1,
                leader: 1
            }
        );
    }

    #[test]
    fn test_window_stalls_without_a_majority() {
        let timing = Timing {
            election_timeout: Some(Duration::from_millis(150)),
            ..test_timing()
        };
        let (ctx, _transport) = test_context_with(3, timing);
        ctx.inbox.push(Message::election(1, 1, 7000));

        assert_eq!(
            run_election(&ctx, 20),
            ElectionOutcome::Stalled {
                epoch: 1,
                heard_from: 1
            }
        );
        assert_eq!(ctx.state.leader_id(), None);
        assert!(!ctx.state.election_done());
    }

    #[test]
    fn test_repeated_candidacies_from_one_peer_are_not_a_majority() {
        let timing = Timing {
            election_timeout: Some(Duration::from_millis(150)),
            ..test_timing()
        };
        let (ctx, transport) = test_context_with(3, timing);
        ctx.inbox.push(Message::election(1, 1, 7000));
        ctx.inbox.push(Message::election(1, 2, 7001));

        assert_eq!(
            run_election(&ctx, 20),
            ElectionOutcome::Stalled {
                epoch: 1,
                heard_from: 1
            }
        );
        assert_eq!(ctx.state.leader_id(), None);
        assert!(
            !transport
                .sent()
                .iter()
                .any(|(_, message)| message.kind == MessageKind::Coordinator)
        );
    }

    #[test]
    fn test_unbounded_run_waits_for_every_distinct_peer() {
        let (ctx, _transport) = test_context_with(2, unbounded());
        for (node, number) in [(1, 10), (1, 11), (3, 12), (4, 13)] {
            ctx.inbox.push(Message::election(node, 1, number));
        }
        let late = {
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                ctx.inbox.push(Message::election(5, 1, 1));
            })
        };

        assert_eq!(
            run_election(&ctx, 0),
            ElectionOutcome::Elected {
                epoch: 1,
                leader: 4
            }
        );
        assert!(ctx.inbox.is_empty());
        late.join().unwrap();
    }

    #[test]
    fn test_halted_node_does_not_run() {
        let (ctx, transport) = test_context(1);
        ctx.halt();
        assert_eq!(run_election(&ctx, 1), ElectionOutcome::Halted);
        assert!(transport.sent().is_empty());
    }
}
