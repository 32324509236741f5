//! Inbound TCP: peer messages and client proposals.
//!
//! Both listeners read exactly one fixed-size frame per connection and close
//! it. Short or malformed frames are discarded. The peer listener handles
//! connections inline so messages reach the inbox in arrival order; the
//! proposal listener hands each connection to a short-lived thread.

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::{ClusterLayout, NodeId};
use crate::failure::CrashReason;
use crate::message::{ClientFrame, Message, MessageKind, PROPOSE, WireError};
use crate::runtime::NodeContext;

/// Binds the peer port of node `id`. Failing to do so is fatal at startup.
pub(crate) fn bind_peer_listener(layout: &ClusterLayout, id: NodeId) -> Result<TcpListener> {
    let addr = layout.peer_addr(id);
    TcpListener::bind(addr).with_context(|| format!("failed to bind peer port {addr}"))
}

pub(crate) fn spawn_peer_listener(ctx: Arc<NodeContext>, listener: TcpListener) -> Result<()> {
    thread::Builder::new()
        .name(format!("peer-listener-{}", ctx.id))
        .spawn(move || {
            for stream in listener.incoming() {
                if ctx.is_halted() {
                    break;
                }
                match stream {
                    Ok(stream) => {
                        if let Err(err) = handle_peer_connection(&ctx, stream) {
                            debug!(node = ctx.id, error = %err, "discarding peer frame");
                        }
                    }
                    Err(err) => warn!(node = ctx.id, error = %err, "peer accept error"),
                }
            }
        })
        .map(|_| ())
        .context("failed to spawn peer listener")
}

fn handle_peer_connection(ctx: &NodeContext, mut stream: TcpStream) -> Result<(), WireError> {
    stream.set_read_timeout(Some(ctx.timing.connect_timeout))?;
    let message = Message::read_from(&mut stream)?;
    route(ctx, message);
    Ok(())
}

/// Heartbeats only refresh liveness; everything else goes to the inbox.
pub(crate) fn route(ctx: &NodeContext, message: Message) {
    if message.kind == MessageKind::Heartbeat {
        ctx.state.observe_heartbeat(Instant::now());
        return;
    }
    if !ctx.inbox.push(message) {
        debug!(node = ctx.id, ?message, "inbox full, message dropped");
    }
}

/// Starts accepting client proposals on this node's proposal port.
///
/// Only the first win binds the port; the listener then lives as long as the
/// node. A bind failure crashes the node.
pub(crate) fn serve_proposals(ctx: &Arc<NodeContext>) {
    if ctx.serving_proposals.load(Ordering::SeqCst) {
        return;
    }
    let addr = ctx.layout.proposal_addr(ctx.id);
    let listener = match TcpListener::bind(addr) {
        Ok(listener) => listener,
        Err(err) => {
            warn!(node = ctx.id, %addr, error = %err, "failed to bind proposal port");
            ctx.crash(CrashReason::BindFailed { addr });
            return;
        }
    };
    ctx.serving_proposals.store(true, Ordering::SeqCst);
    info!(node = ctx.id, %addr, "accepting client proposals");

    let accept_ctx = Arc::clone(ctx);
    let spawned = thread::Builder::new()
        .name(format!("proposal-listener-{}", ctx.id))
        .spawn(move || accept_proposals(accept_ctx, listener));
    if let Err(err) = spawned {
        warn!(node = ctx.id, error = %err, "failed to spawn proposal listener");
    }
}

fn accept_proposals(ctx: Arc<NodeContext>, listener: TcpListener) {
    for stream in listener.incoming() {
        if ctx.is_halted() {
            break;
        }
        match stream {
            Ok(stream) => {
                let ctx = Arc::clone(&ctx);
                let spawned = thread::Builder::new()
                    .name(format!("proposal-conn-{}", ctx.id))
                    .spawn(move || {
                        if let Err(err) = handle_proposal(&ctx, stream) {
                            debug!(node = ctx.id, error = %err, "discarding client frame");
                        }
                    });
                if let Err(err) = spawned {
                    warn!(error = %err, "failed to spawn proposal handler");
                }
            }
            Err(err) => warn!(node = ctx.id, error = %err, "proposal accept error"),
        }
    }
}

fn handle_proposal(ctx: &NodeContext, mut stream: TcpStream) -> Result<(), WireError> {
    stream.set_read_timeout(Some(ctx.timing.connect_timeout))?;
    let frame = ClientFrame::read_from(&mut stream, PROPOSE)?;

    if let Some(reason) = ctx.failures.on_proposal(ctx.state.is_leader(ctx.id)) {
        ctx.crash(reason);
        return Ok(());
    }
    debug!(node = ctx.id, value = frame.value, "client proposal queued");
    ctx.proposals.submit(frame.value);
    Ok(())
}
