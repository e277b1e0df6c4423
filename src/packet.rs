//! Audio datagram framing: a fixed 14-byte big-endian header followed by the
//! sealed payload.

use anyhow::{bail, Result};

/// seq(4) + timestamp(8) + payload_length(2).
pub const HEADER_LEN: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub sequence: u32,
    pub timestamp_ns: i64,
    pub payload_len: u16,
}

pub fn encode(sequence: u32, timestamp_ns: i64, payload: &[u8]) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(HEADER_LEN + payload.len());
    datagram.extend_from_slice(&sequence.to_be_bytes());
    datagram.extend_from_slice(&timestamp_ns.to_be_bytes());
    datagram.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    datagram.extend_from_slice(payload);
    datagram
}

pub fn decode(datagram: &[u8]) -> Result<(PacketHeader, &[u8])> {
    if datagram.len() < HEADER_LEN {
        bail!("datagram too short ({} bytes)", datagram.len());
    }

    let header = PacketHeader {
        sequence: u32::from_be_bytes(datagram[0..4].try_into().unwrap()),
        timestamp_ns: i64::from_be_bytes(datagram[4..12].try_into().unwrap()),
        payload_len: u16::from_be_bytes(datagram[12..14].try_into().unwrap()),
    };

    let payload = &datagram[HEADER_LEN..];
    if header.payload_len as usize != payload.len() {
        bail!(
            "payload length mismatch: header says {}, datagram carries {}",
            header.payload_len,
            payload.len()
        );
    }

    Ok((header, payload))
}
