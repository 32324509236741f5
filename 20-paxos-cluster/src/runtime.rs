//! Node runtime: shared context, thread layout and the handle given to callers.
//!
//! A node is a handful of long-lived named threads sharing one [`NodeContext`]:
//!
//! - **Peer listener**: accepts peer connections, records heartbeats and
//!   queues every other message in the inbox
//! - **Election engine**: one run at startup, another after each leader timeout
//! - **Consensus engine**: leader rounds or acceptor replies, forever
//! - **Heartbeat sender** and **liveness monitor**: leader failure detection
//! - **Proposal listener**: started only once the node wins an election
//!
//! There is no central event loop. The threads coordinate through the
//! atomics in [`NodeState`], the [`Inbox`] and the [`ProposalSlot`].

use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use crossbeam_channel::{Receiver, unbounded};
use tracing::{error, info};

use crate::config::{
    ClusterLayout, CrashBehavior, FailureMode, KnownValues, NodeId, Timing, Value,
};
use crate::failure::{CrashReason, FailureInjector};
use crate::inbox::Inbox;
use crate::link::{ClientNotifier, PeerLink, PeerTransport};
use crate::message::Message;
use crate::state::{NodeState, ProposalSlot};
use crate::telemetry::{MonitorReporter, NodeEvent, Telemetry};
use crate::{consensus, election, listener, liveness};

/// Everything needed to start one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub id: NodeId,
    pub layout: ClusterLayout,
    pub timing: Timing,
    pub known_values: KnownValues,
    pub failure_mode: FailureMode,
    /// What an injected or fatal failure does. The binary exits the
    /// process; in-process clusters halt the node instead.
    pub crash_behavior: CrashBehavior,
}

impl NodeConfig {
    pub fn new(id: NodeId, layout: ClusterLayout) -> Self {
        Self {
            id,
            layout,
            timing: Timing::default(),
            known_values: KnownValues::default(),
            failure_mode: FailureMode::None,
            crash_behavior: CrashBehavior::Halt,
        }
    }
}

/// State and services shared by all threads of one node.
pub(crate) struct NodeContext {
    pub(crate) id: NodeId,
    pub(crate) layout: ClusterLayout,
    pub(crate) timing: Timing,
    pub(crate) known_values: KnownValues,
    pub(crate) state: NodeState,
    pub(crate) inbox: Inbox,
    pub(crate) proposals: ProposalSlot,
    pub(crate) notifier: ClientNotifier,
    pub(crate) failures: FailureInjector,
    /// Set once the proposal port is bound; later wins reuse it.
    pub(crate) serving_proposals: AtomicBool,
    transport: Box<dyn PeerTransport>,
    telemetry: Telemetry,
    crash_behavior: CrashBehavior,
}

impl NodeContext {
    pub(crate) fn new(
        config: NodeConfig,
        transport: Box<dyn PeerTransport>,
    ) -> (Self, Receiver<NodeEvent>) {
        let (events_tx, events_rx) = unbounded();
        let monitor = MonitorReporter::new(config.layout.monitor_addr());
        let notifier = ClientNotifier::new(
            &config.layout,
            config.timing.notify_attempts,
            config.timing.notify_backoff,
            config.timing.connect_timeout,
        );
        let ctx = Self {
            id: config.id,
            layout: config.layout,
            timing: config.timing,
            known_values: config.known_values,
            state: NodeState::new(),
            inbox: Inbox::default(),
            proposals: ProposalSlot::new(),
            notifier,
            failures: FailureInjector::new(config.failure_mode),
            serving_proposals: AtomicBool::new(false),
            transport,
            telemetry: Telemetry::new(config.id, monitor, events_tx),
            crash_behavior: config.crash_behavior,
        };
        (ctx, events_rx)
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.state.is_halted()
    }

    /// Sends to one peer. A halted node sends nothing.
    pub(crate) fn send(&self, to: NodeId, message: &Message) {
        if !self.is_halted() {
            self.transport.send(to, message);
        }
    }

    /// Sends to every peer, never to self.
    pub(crate) fn broadcast(&self, message: &Message) {
        for peer in self.layout.peers_of(self.id) {
            self.send(peer, message);
        }
    }

    pub(crate) fn emit(&self, event: NodeEvent) {
        if !self.is_halted() {
            self.telemetry.emit(event);
        }
    }

    /// Reports `reason` and stops the node the configured way.
    pub(crate) fn crash(&self, reason: CrashReason) {
        self.emit(NodeEvent::Crashed { reason });
        match self.crash_behavior {
            CrashBehavior::ExitProcess => {
                error!(node = self.id, code = reason.exit_code(), "{reason}, exiting");
                std::process::exit(reason.exit_code());
            }
            CrashBehavior::Halt => self.halt(),
        }
    }

    /// Stops every activity of this node. Idempotent.
    pub(crate) fn halt(&self) {
        if !self.state.halt() {
            return;
        }
        info!(node = self.id, "halting");
        self.inbox.close();
        self.proposals.close();
        // Accept loops only notice the flag once a connection arrives.
        self.wake(self.layout.peer_addr(self.id));
        if self.serving_proposals.load(Ordering::SeqCst) {
            self.wake(self.layout.proposal_addr(self.id));
        }
    }

    fn wake(&self, addr: SocketAddr) {
        let _ = TcpStream::connect_timeout(&addr, self.timing.connect_timeout);
    }
}

/// Snapshot of a node's protocol state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub leader_id: Option<NodeId>,
    pub election_done: bool,
    pub election_epoch: u32,
    pub highest_proposal: u32,
    /// Most recently accepted `(proposal, value)`.
    pub accepted: Option<(u32, Value)>,
    pub halted: bool,
}

/// Handle to a running node.
///
/// Dropping the handle does not stop the node; call [`NodeHandle::shutdown`].
#[derive(Clone)]
pub struct NodeHandle {
    ctx: Arc<NodeContext>,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.ctx.id
    }

    pub fn status(&self) -> NodeStatus {
        let state = &self.ctx.state;
        NodeStatus {
            node_id: self.ctx.id,
            leader_id: state.leader_id(),
            election_done: state.election_done(),
            election_epoch: state.election_epoch(),
            highest_proposal: state.highest_proposal(),
            accepted: state.accepted(),
            halted: state.is_halted(),
        }
    }

    /// Stops the node as if it had crashed, without exiting the process.
    pub fn shutdown(&self) {
        self.ctx.halt();
    }
}

/// Binds the peer port and starts every activity of one node.
///
/// Returns the handle together with the node's event stream. Events are
/// also logged and sent to the monitor, so the receiver may be dropped.
///
/// # Errors
///
/// Returns error if:
/// - `config.id` is not a member of `config.layout`
/// - The peer port cannot be bound
/// - A thread cannot be spawned
pub fn spawn_node(config: NodeConfig) -> Result<(NodeHandle, Receiver<NodeEvent>)> {
    config.layout.ensure_member(config.id)?;
    let peer_listener = listener::bind_peer_listener(&config.layout, config.id)?;

    let transport = PeerLink::new(config.layout.clone(), config.timing.connect_timeout);
    let (ctx, events) = NodeContext::new(config, Box::new(transport));
    let ctx = Arc::new(ctx);
    info!(
        node = ctx.id,
        addr = %ctx.layout.peer_addr(ctx.id),
        failure = %ctx.failures.mode(),
        "node listening for peers"
    );

    listener::spawn_peer_listener(Arc::clone(&ctx), peer_listener)?;
    consensus::spawn_consensus(Arc::clone(&ctx))?;
    liveness::spawn_heartbeat_sender(Arc::clone(&ctx))?;
    liveness::spawn_liveness_monitor(Arc::clone(&ctx))?;
    election::spawn_election(Arc::clone(&ctx), ctx.timing.startup_grace)?;

    Ok((NodeHandle { ctx }, events))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Mutex, PoisonError};
    use std::thread;
    use std::time::{Duration, Instant};

    /// Transport that records instead of sending.
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        sent: Mutex<Vec<(NodeId, Message)>>,
    }

    impl RecordingTransport {
        pub(crate) fn sent(&self) -> Vec<(NodeId, Message)> {
            self.sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Waits until at least `count` messages were sent.
        pub(crate) fn wait_for(&self, count: usize, timeout: Duration) {
            let deadline = Instant::now() + timeout;
            while self.sent().len() < count {
                assert!(
                    Instant::now() < deadline,
                    "only {} of {count} messages sent",
                    self.sent().len()
                );
                thread::sleep(Duration::from_millis(5));
            }
        }
    }

    impl PeerTransport for Arc<RecordingTransport> {
        fn send(&self, to: NodeId, message: &Message) -> bool {
            self.sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((to, *message));
            true
        }
    }

    /// Timing for contexts whose client never listens.
    pub(crate) fn test_timing() -> Timing {
        Timing {
            notify_attempts: 1,
            notify_backoff: Duration::ZERO,
            connect_timeout: Duration::from_millis(100),
            ..Timing::default()
        }
    }

    pub(crate) fn test_context(id: NodeId) -> (Arc<NodeContext>, Arc<RecordingTransport>) {
        test_context_with(id, test_timing())
    }

    /// Five-node context on unused loopback ports with a recording transport.
    pub(crate) fn test_context_with(
        id: NodeId,
        timing: Timing,
    ) -> (Arc<NodeContext>, Arc<RecordingTransport>) {
        let layout = ClusterLayout::local(5, 41000, 41900).unwrap();
        let mut config = NodeConfig::new(id, layout);
        config.timing = timing;
        let transport = Arc::new(RecordingTransport::default());
        let (ctx, _events) = NodeContext::new(config, Box::new(Arc::clone(&transport)));
        (Arc::new(ctx), transport)
    }

    #[test]
    fn test_broadcast_skips_self() {
        let (ctx, transport) = test_context(2);
        ctx.broadcast(&Message::heartbeat(2));
        let peers: Vec<NodeId> = transport.sent().iter().map(|(to, _)| *to).collect();
        assert_eq!(peers, vec![1, 3, 4, 5]);
    }

    #[test]
    fn test_halted_node_is_silent() {
        let (ctx, transport) = test_context(1);
        ctx.halt();
        ctx.broadcast(&Message::heartbeat(1));
        assert!(transport.sent().is_empty());
        assert!(ctx.is_halted());
    }

    #[test]
    fn test_crash_with_halt_behavior_reports_and_stops() {
        let layout = ClusterLayout::local(5, 41000, 41900).unwrap();
        let mut config = NodeConfig::new(4, layout);
        config.timing = test_timing();
        let transport = Arc::new(RecordingTransport::default());
        let (ctx, events) = NodeContext::new(config, Box::new(transport));

        ctx.crash(CrashReason::FollowerInjected);

        assert!(ctx.is_halted());
        assert_eq!(
            events.try_recv().unwrap(),
            NodeEvent::Crashed {
                reason: CrashReason::FollowerInjected
            }
        );
        ctx.emit(NodeEvent::LeaderAnnounced { leader: 4 });
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_spawn_rejects_unknown_member() {
        let layout = ClusterLayout::local(5, 41000, 41900).unwrap();
        assert!(spawn_node(NodeConfig::new(6, layout)).is_err());
    }
}
