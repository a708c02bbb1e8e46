//! Gossip Wire Protocol
//!
//! Two channels share one port:
//! - **UDP** carries [`Packet`]s: probes, membership rumours and batched user
//!   broadcasts. A packet never exceeds the configured gossip budget.
//! - **TCP** carries length-prefixed [`Stream`] frames: push/pull exchanges
//!   (join and anti-entropy) and reliable user messages.
//!
//! Everything is encoded with bincode.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::TransportError;
use crate::membership::types::{Node, NodeId};

/// Upper bound on a TCP frame. Full-state exchanges of large clusters stay
/// well below this.
pub const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

/// Bytes the `User` packet framing adds before the first message.
pub const USER_PACKET_OVERHEAD: usize = 4 + 8;

/// Bytes each message inside a `User` packet costs on top of its payload.
pub const USER_MESSAGE_OVERHEAD: usize = 8;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MemberState {
    Alive,
    Suspect,
    Dead,
    /// Departed gracefully.
    Left,
}

impl MemberState {
    /// Alive and suspect members still count as cluster members.
    pub fn is_live(self) -> bool {
        matches!(self, MemberState::Alive | MemberState::Suspect)
    }
}

/// Datagram protocol.
///
/// - `Ping/Ack`: direct liveness probe. `target` lets a restarted process on
///   the same address ignore probes meant for its previous identity.
/// - `Alive/Suspect/Dead`: membership rumours ordered by incarnation.
/// - `User`: a batch of queued broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Packet {
    Ping {
        seq: u32,
        from: NodeId,
        target: NodeId,
    },

    Ack {
        seq: u32,
        from: NodeId,
    },

    Alive {
        node: Node,
        incarnation: u64,
    },

    Suspect {
        id: NodeId,
        incarnation: u64,
        from: NodeId,
    },

    Dead {
        id: NodeId,
        incarnation: u64,
        from: NodeId,
    },

    User {
        messages: Vec<Vec<u8>>,
    },
}

/// One entry of a push/pull member list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushNodeState {
    pub node: Node,
    pub incarnation: u64,
    pub state: MemberState,
}

/// Stream protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Stream {
    /// Full membership plus full user state. The receiver answers with its own.
    PushPull {
        join: bool,
        members: Vec<PushNodeState>,
        user_state: Vec<u8>,
    },

    /// Reliable user message.
    User { payload: Vec<u8> },
}

pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, TransportError> {
    Ok(bincode::serialize(packet)?)
}

pub fn decode_packet(bytes: &[u8]) -> Result<Packet, TransportError> {
    Ok(bincode::deserialize(bytes)?)
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, frame: &Stream) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = bincode::serialize(frame)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(bytes.len()));
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Stream, TransportError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(bincode::deserialize(&buf)?)
}
