//! Protocol state shared by the activities of one node.
//!
//! Scalars live in atomics: no invariant spans two of them, so each is read
//! and written on its own. The heartbeat timestamp and the parked election
//! candidacies need a small mutex each. Client proposals travel through a
//! [`ProposalSlot`], a mutex/condvar pair that wakes the leader once per
//! submitted value.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::config::{NodeId, Value};
use crate::inbox::PopError;
use crate::message::Message;

const UNKNOWN_LEADER: NodeId = 0;

pub struct NodeState {
    leader_id: AtomicU32,
    election_done: AtomicBool,
    election_epoch: AtomicU32,
    highest_proposal: AtomicU32,
    accepted_value: AtomicI32,
    accepted_proposal: AtomicU32,
    last_heartbeat: Mutex<Option<Instant>>,
    deferred_candidacies: Mutex<VecDeque<Message>>,
    halted: AtomicBool,
}

impl NodeState {
    pub fn new() -> Self {
        Self {
            leader_id: AtomicU32::new(UNKNOWN_LEADER),
            election_done: AtomicBool::new(false),
            election_epoch: AtomicU32::new(0),
            highest_proposal: AtomicU32::new(0),
            accepted_value: AtomicI32::new(0),
            accepted_proposal: AtomicU32::new(0),
            last_heartbeat: Mutex::new(None),
            deferred_candidacies: Mutex::new(VecDeque::new()),
            halted: AtomicBool::new(false),
        }
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        match self.leader_id.load(Ordering::SeqCst) {
            UNKNOWN_LEADER => None,
            id => Some(id),
        }
    }

    pub fn set_leader(&self, leader: NodeId) {
        self.leader_id.store(leader, Ordering::SeqCst);
    }

    pub fn is_leader(&self, id: NodeId) -> bool {
        self.leader_id() == Some(id)
    }

    pub fn election_done(&self) -> bool {
        self.election_done.load(Ordering::SeqCst)
    }

    pub fn mark_election_done(&self) {
        self.election_done.store(true, Ordering::SeqCst);
    }

    pub fn election_epoch(&self) -> u32 {
        self.election_epoch.load(Ordering::SeqCst)
    }

    /// Starts a new election epoch and returns its number.
    pub fn begin_epoch(&self) -> u32 {
        self.election_epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Forgets the current leader ahead of a re-election.
    pub fn reset_for_election(&self) {
        self.election_done.store(false, Ordering::SeqCst);
        self.leader_id.store(UNKNOWN_LEADER, Ordering::SeqCst);
        self.clear_heartbeat();
    }

    pub fn highest_proposal(&self) -> u32 {
        self.highest_proposal.load(Ordering::SeqCst)
    }

    /// Bumps the leader's round counter and returns the new proposal number.
    pub fn next_proposal(&self) -> u32 {
        self.highest_proposal.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Most recently accepted `(proposal, value)`, if any.
    pub fn accepted(&self) -> Option<(u32, Value)> {
        match self.accepted_proposal.load(Ordering::SeqCst) {
            0 => None,
            proposal => Some((proposal, self.accepted_value.load(Ordering::SeqCst))),
        }
    }

    pub fn accepted_value(&self) -> Option<Value> {
        self.accepted().map(|(_, value)| value)
    }

    pub fn record_accepted(&self, proposal: u32, value: Value) {
        self.accepted_value.store(value, Ordering::SeqCst);
        self.accepted_proposal.store(proposal, Ordering::SeqCst);
    }

    pub fn observe_heartbeat(&self, at: Instant) {
        *self.heartbeat() = Some(at);
    }

    pub fn clear_heartbeat(&self) {
        *self.heartbeat() = None;
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        *self.heartbeat()
    }

    /// True when a heartbeat was seen once and has been silent longer than `threshold`.
    pub fn heartbeat_stale(&self, now: Instant, threshold: Duration) -> bool {
        self.last_heartbeat()
            .is_some_and(|seen| now.saturating_duration_since(seen) > threshold)
    }

    /// Parks a candidacy that reached the consensus engine so the next
    /// election run can count it.
    pub fn defer_candidacy(&self, message: Message) {
        self.candidacies().push_back(message);
    }

    pub fn take_deferred_candidacy(&self) -> Option<Message> {
        self.candidacies().pop_front()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Returns `true` only for the call that actually halted the node.
    pub fn halt(&self) -> bool {
        !self.halted.swap(true, Ordering::SeqCst)
    }

    fn heartbeat(&self) -> MutexGuard<'_, Option<Instant>> {
        self.last_heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn candidacies(&self) -> MutexGuard<'_, VecDeque<Message>> {
        self.deferred_candidacies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for NodeState {
    fn default() -> Self {
        Self::new()
    }
}

struct Pending {
    value: Option<Value>,
    closed: bool,
}

/// Latest value submitted by the client and not yet picked up by the leader.
///
/// A newer submission overwrites an unconsumed one.
pub struct ProposalSlot {
    pending: Mutex<Pending>,
    signal: Condvar,
}

impl ProposalSlot {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Pending {
                value: None,
                closed: false,
            }),
            signal: Condvar::new(),
        }
    }

    pub fn submit(&self, value: Value) {
        let mut pending = self.lock();
        if pending.closed {
            return;
        }
        pending.value = Some(value);
        drop(pending);
        self.signal.notify_one();
    }

    /// Takes the pending value, waiting up to `timeout` for one.
    pub fn take_timeout(&self, timeout: Duration) -> Result<Value, PopError> {
        let deadline = Instant::now() + timeout;
        let mut pending = self.lock();
        loop {
            if pending.closed {
                return Err(PopError::Closed);
            }
            if let Some(value) = pending.value.take() {
                return Ok(value);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(PopError::TimedOut);
            }
            pending = self
                .signal
                .wait_timeout(pending, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn close(&self) {
        let mut pending = self.lock();
        pending.closed = true;
        pending.value = None;
        drop(pending);
        self.signal.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ProposalSlot {
    fn default() -> Self {
        Self::new()
    }
}
