//! Wire formats for peer, client and leader-announcement traffic.
//!
//! Every frame is a fixed-size record with no length prefix. `bincode`'s
//! default configuration (fixed-width little-endian integers, `u32` enum
//! tags) lays out a [`Message`] exactly like the C struct
//! `{enum kind; int sender; int proposal; int value}`: 16 bytes, where the
//! enum tag is the variant index in declaration order.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{NodeId, Value};

/// Size of an encoded [`Message`].
pub const MESSAGE_LEN: usize = 16;
/// Size of an encoded [`ClientFrame`].
pub const CLIENT_FRAME_LEN: usize = 8;
/// Size of an encoded leader announcement.
pub const ANNOUNCEMENT_LEN: usize = 4;

/// Client-to-leader proposal tag.
pub const PROPOSE: i32 = 1000;
/// Leader-to-client acknowledgement tag.
pub const ACK: i32 = 1001;

/// `value` carried by a PROMISE from a node that never accepted anything.
pub const NO_VALUE: Value = -1;

/// Kinds of peer messages, in wire-tag order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Election,
    Coordinator,
    Prepare,
    Promise,
    Accept,
    Accepted,
    Heartbeat,
}

/// A peer protocol message.
///
/// `value` depends on `kind`: candidate number (ELECTION), winner id
/// (COORDINATOR), previously accepted value or [`NO_VALUE`] (PROMISE),
/// proposed or accepted value (ACCEPT / ACCEPTED), unused otherwise.
/// ELECTION and COORDINATOR carry the sender's election epoch in
/// `proposal_number`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub sender_id: NodeId,
    pub proposal_number: u32,
    pub value: Value,
}

impl Message {
    pub fn election(sender: NodeId, epoch: u32, candidate: Value) -> Self {
        Self::new(MessageKind::Election, sender, epoch, candidate)
    }

    pub fn coordinator(sender: NodeId, epoch: u32, winner: NodeId) -> Self {
        Self::new(MessageKind::Coordinator, sender, epoch, winner as Value)
    }

    pub fn prepare(sender: NodeId, proposal: u32) -> Self {
        Self::new(MessageKind::Prepare, sender, proposal, 0)
    }

    pub fn promise(sender: NodeId, proposal: u32, accepted: Option<Value>) -> Self {
        Self::new(
            MessageKind::Promise,
            sender,
            proposal,
            accepted.unwrap_or(NO_VALUE),
        )
    }

    pub fn accept(sender: NodeId, proposal: u32, value: Value) -> Self {
        Self::new(MessageKind::Accept, sender, proposal, value)
    }

    pub fn accepted(sender: NodeId, proposal: u32, value: Value) -> Self {
        Self::new(MessageKind::Accepted, sender, proposal, value)
    }

    pub fn heartbeat(sender: NodeId) -> Self {
        Self::new(MessageKind::Heartbeat, sender, 0, 0)
    }

    /// Winner named by a COORDINATOR message, if the id is usable.
    pub fn coordinator_winner(&self) -> Option<NodeId> {
        if self.kind != MessageKind::Coordinator {
            return None;
        }
        NodeId::try_from(self.value).ok().filter(|id| *id != 0)
    }

    fn new(kind: MessageKind, sender_id: NodeId, proposal_number: u32, value: Value) -> Self {
        Self {
            kind,
            sender_id,
            proposal_number,
            value,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Reads exactly one message; a short read is an error.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, WireError> {
        let mut buf = [0u8; MESSAGE_LEN];
        read_frame(reader, &mut buf)?;
        Self::decode(&buf)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), WireError> {
        writer.write_all(&self.encode()?)?;
        Ok(())
    }
}

/// `{kind, value}` record exchanged between the client and the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub kind: i32,
    pub value: Value,
}

impl ClientFrame {
    pub fn propose(value: Value) -> Self {
        Self { kind: PROPOSE, value }
    }

    pub fn ack(value: Value) -> Self {
        Self { kind: ACK, value }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Decodes a frame and checks it carries the `expected` tag.
    pub fn decode_kind(bytes: &[u8], expected: i32) -> Result<Self, WireError> {
        let frame = Self::decode(bytes)?;
        if frame.kind != expected {
            return Err(WireError::UnexpectedKind {
                expected,
                found: frame.kind,
            });
        }
        Ok(frame)
    }

    pub fn read_from<R: Read>(reader: &mut R, expected: i32) -> Result<Self, WireError> {
        let mut buf = [0u8; CLIENT_FRAME_LEN];
        read_frame(reader, &mut buf)?;
        Self::decode_kind(&buf, expected)
    }
}

/// Raw leader identity pushed to the client, with no envelope.
pub fn encode_announcement(leader: NodeId) -> Result<Vec<u8>, WireError> {
    Ok(bincode::serialize(&(leader as i32))?)
}

pub fn decode_announcement(bytes: &[u8]) -> Result<NodeId, WireError> {
    let raw: i32 = bincode::deserialize(bytes)?;
    NodeId::try_from(raw).map_err(|_| WireError::InvalidLeader(raw))
}

fn read_frame<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), WireError> {
    reader.read_exact(buf).map_err(|err| match err.kind() {
        io::ErrorKind::UnexpectedEof => WireError::ShortRead {
            expected: buf.len(),
        },
        _ => WireError::Io(err),
    })
}

/// Failures while reading or writing a frame.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("connection closed before a full {expected}-byte frame arrived")]
    ShortRead { expected: usize },

    #[error("malformed frame: {0}")]
    Decode(#[from] bincode::Error),

    #[error("unexpected frame kind {found}, expected {expected}")]
    UnexpectedKind { expected: i32, found: i32 },

    #[error("invalid leader identity {0}")]
    InvalidLeader(i32),

    #[error(transparent)]
    Io(#[from] io::Error),
}
