//! Outbound delivery: peer messages and client notifications.
//!
//! Every send opens a fresh TCP connection, writes one frame and closes it.
//! A refused or failed connect simply drops the message; the protocol relies
//! on quorums and periodic re-broadcast instead of sender retries.

use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::config::{ClusterLayout, NodeId, Value};
use crate::message::{ClientFrame, Message, WireError, encode_announcement};

/// Point-to-point delivery of one message to a peer, by identity.
pub trait PeerTransport: Send + Sync {
    /// Returns `false` if the message was dropped.
    fn send(&self, to: NodeId, message: &Message) -> bool;
}

/// TCP transport resolving peers through the cluster layout.
pub struct PeerLink {
    layout: ClusterLayout,
    connect_timeout: Duration,
}

impl PeerLink {
    pub fn new(layout: ClusterLayout, connect_timeout: Duration) -> Self {
        Self {
            layout,
            connect_timeout,
        }
    }
}

impl PeerTransport for PeerLink {
    fn send(&self, to: NodeId, message: &Message) -> bool {
        let addr = self.layout.peer_addr(to);
        let result = message
            .encode()
            .and_then(|bytes| try_send(addr, &bytes, self.connect_timeout));
        match result {
            Ok(()) => true,
            Err(err) => {
                debug!(peer = to, kind = ?message.kind, error = %err, "peer message dropped");
                false
            }
        }
    }
}

/// Opens a connection, writes `bytes`, closes the connection.
fn try_send(addr: SocketAddr, bytes: &[u8], connect_timeout: Duration) -> Result<(), WireError> {
    let mut stream = TcpStream::connect_timeout(&addr, connect_timeout)?;
    stream.write_all(bytes)?;
    Ok(())
}

/// Pushes leader announcements and acknowledgements to the external client.
///
/// The client may not be listening yet, so each push retries the connect a
/// bounded number of times before giving up.
pub struct ClientNotifier {
    announce_addr: SocketAddr,
    ack_addr: SocketAddr,
    attempts: u32,
    backoff: Duration,
    connect_timeout: Duration,
}

impl ClientNotifier {
    pub fn new(
        layout: &ClusterLayout,
        attempts: u32,
        backoff: Duration,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            announce_addr: layout.client_announce_addr(),
            ack_addr: layout.client_ack_addr(),
            attempts,
            backoff,
            connect_timeout,
        }
    }

    pub fn announce_leader(&self, leader: NodeId) -> bool {
        match encode_announcement(leader) {
            Ok(bytes) => self.deliver(self.announce_addr, &bytes),
            Err(_) => false,
        }
    }

    pub fn acknowledge(&self, value: Value) -> bool {
        match ClientFrame::ack(value).encode() {
            Ok(bytes) => self.deliver(self.ack_addr, &bytes),
            Err(_) => false,
        }
    }

    fn deliver(&self, addr: SocketAddr, bytes: &[u8]) -> bool {
        for attempt in 1..=self.attempts.max(1) {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(mut stream) => {
                    return match stream.write_all(bytes) {
                        Ok(()) => true,
                        Err(err) => {
                            debug!(client = %addr, error = %err, "client write failed");
                            false
                        }
                    };
                }
                Err(err) => {
                    debug!(client = %addr, attempt, error = %err, "client not reachable yet");
                    if attempt < self.attempts {
                        thread::sleep(self.backoff);
                    }
                }
            }
        }
        false
    }
}
