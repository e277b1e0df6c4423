//! ASCII control messages shared between the audio socket's two roles.
//!
//! All control traffic is a single short text datagram; anything that does
//! not match a known prefix is ignored by the receiving side.

pub const PROBE: &str = "AUSTREAM_PROBE";
pub const ALIVE_PREFIX: &str = "AUSTREAM_ALIVE:";
pub const AUTH_PREFIX: &str = "AUSTREAM_AUTH:";
pub const OK_PREFIX: &str = "AUSTREAM_OK:";
pub const FAIL: &str = "AUSTREAM_FAIL";
pub const NEED_PIN: &str = "AUSTREAM_NEED_PIN";
pub const HEARTBEAT: &str = "AUSTREAM_HEARTBEAT";

/// Prefix of the legacy un-authenticated hello. Those clients are told to
/// upgrade and are never registered.
pub const LEGACY_CLIENT_PREFIX: &str = "AUSTREAM_CLIENT";

/// A message a client sends to the sender's control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMessage<'a> {
    Probe,
    Auth { pin_hash: &'a str },
    Heartbeat,
    LegacyHello,
}

pub fn parse_client(datagram: &[u8]) -> Option<ClientMessage<'_>> {
    let text = std::str::from_utf8(datagram).ok()?;

    if text == PROBE {
        Some(ClientMessage::Probe)
    } else if let Some(pin_hash) = text.strip_prefix(AUTH_PREFIX) {
        Some(ClientMessage::Auth { pin_hash })
    } else if text == HEARTBEAT {
        Some(ClientMessage::Heartbeat)
    } else if text.starts_with(LEGACY_CLIENT_PREFIX) {
        Some(ClientMessage::LegacyHello)
    } else {
        None
    }
}

/// A reply the sender emits on the control socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerReply {
    Alive { host: String },
    Ok { buffer_ms: u32 },
    Fail,
    NeedPin,
}

impl ServerReply {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ServerReply::Alive { host } => format!("{ALIVE_PREFIX}{host}").into_bytes(),
            ServerReply::Ok { buffer_ms } => format!("{OK_PREFIX}{buffer_ms}").into_bytes(),
            ServerReply::Fail => FAIL.as_bytes().to_vec(),
            ServerReply::NeedPin => NEED_PIN.as_bytes().to_vec(),
        }
    }
}

pub fn parse_reply(datagram: &[u8]) -> Option<ServerReply> {
    let text = std::str::from_utf8(datagram).ok()?;

    if let Some(host) = text.strip_prefix(ALIVE_PREFIX) {
        Some(ServerReply::Alive {
            host: host.to_string(),
        })
    } else if let Some(buffer_ms) = text.strip_prefix(OK_PREFIX) {
        Some(ServerReply::Ok {
            buffer_ms: buffer_ms.parse().ok()?,
        })
    } else if text == FAIL {
        Some(ServerReply::Fail)
    } else if text == NEED_PIN {
        Some(ServerReply::NeedPin)
    } else {
        None
    }
}

pub fn auth_request(pin_hash: &str) -> Vec<u8> {
    format!("{AUTH_PREFIX}{pin_hash}").into_bytes()
}
