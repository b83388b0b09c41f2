//! Reliable UDP: framed packets, per-packet acknowledgement, windowed send
//! and retransmission over a plain datagram socket.

use std::io::Cursor;
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::Error;

mod endpoint;
mod listen;

pub use endpoint::RudpStream;
pub use listen::RudpListener;

/// Fixed packet header length: type, sequence and payload length, each a
/// big-endian u32.
pub const HEADER_LEN: usize = 12;

/// Seconds the socket may sit idle before the receive loop reports a
/// timeout.
pub(crate) const SOCKET_MAX_TIMEOUT: Duration = Duration::from_secs(60);

/// Cadence of the retransmission sweep over unacknowledged packets.
pub(crate) const RETRANSMIT_EVERY: Duration = Duration::from_secs(7);

/// Pause after answering a SYN so the other side can consume the ACK
/// before anything else lands on its socket.
pub(crate) const POST_SYN_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Syn = 0,
    Data = 1,
    Ack = 2,
    End = 3,
    Rst = 4,
}

impl PacketType {
    fn from_u32(raw: u32) -> Option<PacketType> {
        match raw {
            0 => Some(PacketType::Syn),
            1 => Some(PacketType::Data),
            2 => Some(PacketType::Ack),
            3 => Some(PacketType::End),
            4 => Some(PacketType::Rst),
            _ => None,
        }
    }
}

/// One framed datagram. Sequence numbers live in a 16-bit space even
/// though the header stores them as u32.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketType,
    pub seq: u16,
    pub payload: Vec<u8>,
}

impl Packet {
    /// A payload-less packet; for ACKs `seq` is the sequence number being
    /// acknowledged.
    pub fn control(kind: PacketType, seq: u16) -> Packet {
        Packet {
            kind,
            seq,
            payload: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());

        buf.write_u32::<BigEndian>(self.kind as u32).unwrap();
        buf.write_u32::<BigEndian>(self.seq as u32).unwrap();
        buf.write_u32::<BigEndian>(self.payload.len() as u32).unwrap();
        buf.extend_from_slice(&self.payload);

        buf
    }

    pub fn parse(raw: &[u8]) -> Result<Packet, Error> {
        if raw.len() < HEADER_LEN {
            return Err(Error::BadPacket(format!("short packet: {} bytes", raw.len())));
        }

        let mut cursor = Cursor::new(raw);
        let kind = cursor.read_u32::<BigEndian>()?;
        let seq = cursor.read_u32::<BigEndian>()?;
        let len = cursor.read_u32::<BigEndian>()? as usize;

        let kind = PacketType::from_u32(kind)
            .ok_or_else(|| Error::BadPacket(format!("unknown packet type {kind}")))?;

        // a length field running past the datagram is clamped to what
        // actually arrived
        let end = HEADER_LEN + len.min(raw.len() - HEADER_LEN);

        Ok(Packet {
            kind,
            seq: (seq % 65536) as u16,
            payload: raw[HEADER_LEN..end].to_vec(),
        })
    }
}

/// 0 -> 1 -> ... -> 65535 -> 0.
pub(crate) fn next_seq(seq: u16) -> u16 {
    seq.wrapping_add(1)
}

/// Position of `seq` relative to the first DATA sequence of the current
/// message, modulo the 16-bit sequence space.
pub(crate) fn slot_index(seq: u16, first: u16) -> usize {
    seq.wrapping_sub(first) as usize
}
