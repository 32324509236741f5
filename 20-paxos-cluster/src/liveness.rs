//! Leader heartbeats and follower-side failure detection.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::error;

use crate::election;
use crate::message::Message;
use crate::runtime::NodeContext;
use crate::telemetry::NodeEvent;

/// While elected leader, broadcasts a HEARTBEAT every interval.
pub(crate) fn spawn_heartbeat_sender(ctx: Arc<NodeContext>) -> Result<()> {
    thread::Builder::new()
        .name(format!("heartbeat-{}", ctx.id))
        .spawn(move || {
            while !ctx.is_halted() {
                if ctx.state.election_done() && ctx.state.is_leader(ctx.id) {
                    ctx.broadcast(&Message::heartbeat(ctx.id));
                }
                thread::sleep(ctx.timing.heartbeat_interval);
            }
        })
        .map(|_| ())
        .context("failed to spawn heartbeat sender")
}

/// Watches the leader's heartbeats and starts a fresh election when they
/// stop.
pub(crate) fn spawn_liveness_monitor(ctx: Arc<NodeContext>) -> Result<()> {
    thread::Builder::new()
        .name(format!("liveness-{}", ctx.id))
        .spawn(move || {
            loop {
                thread::sleep(ctx.timing.liveness_tick);
                if ctx.is_halted() {
                    return;
                }
                if !check_leader(&ctx, Instant::now()) {
                    continue;
                }
                if let Err(err) = election::spawn_election(Arc::clone(&ctx), Duration::ZERO) {
                    error!(node = ctx.id, error = %err, "could not start re-election");
                }
            }
        })
        .map(|_| ())
        .context("failed to spawn liveness monitor")
}

/// Returns `true` when the leader is presumed dead. In that case the leader
/// is forgotten and the election gate closed before returning.
///
/// A node that never saw a heartbeat never suspects anyone.
pub(crate) fn check_leader(ctx: &NodeContext, now: Instant) -> bool {
    let state = &ctx.state;
    if !state.election_done()
        || state.is_leader(ctx.id)
        || !state.heartbeat_stale(now, ctx.timing.liveness_threshold)
    {
        return false;
    }
    ctx.emit(NodeEvent::LeaderTimedOut {
        leader: state.leader_id(),
    });
    state.reset_for_election();
    true
}
