//! Packet envelope, message types and the JSON bodies carried by control packets.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

pub const PROTOCOL_VERSION: i32 = 1;

pub const STATUS_OK: i64 = 0;
pub const STATUS_BAD_REQUEST: i64 = -1;
pub const STATUS_AUTH_FAILED: i64 = -2;

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Heartbeat = 1,
    Ping = 2,
    Pong = 3,
    Register = 4,
    RegisterStatus = 5,
    Auth = 6,
    AuthStatus = 7,
    P2p = 8,
    Ack = 9,
    Group = 10,
    Room = 11,
}

impl MessageType {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            1 => Some(Self::Heartbeat),
            2 => Some(Self::Ping),
            3 => Some(Self::Pong),
            4 => Some(Self::Register),
            5 => Some(Self::RegisterStatus),
            6 => Some(Self::Auth),
            7 => Some(Self::AuthStatus),
            8 => Some(Self::P2p),
            9 => Some(Self::Ack),
            10 => Some(Self::Group),
            11 => Some(Self::Room),
            _ => None,
        }
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// P2P, GROUP and ROOM travel through the dispatch pipeline.
    pub fn is_routable(self) -> bool {
        matches!(self, Self::P2p | Self::Group | Self::Room)
    }
}

impl TryFrom<i32> for MessageType {
    type Error = ProtocolError;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        Self::from_i32(v).ok_or(ProtocolError::UnknownMessageType(v))
    }
}

/// The wire envelope. `mid` stays 0 until a dispatch worker stamps it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet {
    pub ver: i32,
    pub mt: i32,
    pub mid: i64,
    pub sid: i64,
    pub rid: i64,
    pub ext: Bytes,
    pub pl: Bytes,
}

impl Packet {
    pub fn new(mt: MessageType) -> Self {
        Self {
            ver: PROTOCOL_VERSION,
            mt: mt.as_i32(),
            ..Default::default()
        }
    }

    pub fn message_type(&self) -> Result<MessageType, ProtocolError> {
        MessageType::try_from(self.mt)
    }

    pub fn with_version(mut self, ver: i32) -> Self {
        self.ver = ver;
        self
    }

    pub fn with_route(mut self, sid: i64, rid: i64) -> Self {
        self.sid = sid;
        self.rid = rid;
        self
    }

    pub fn with_ext(mut self, ext: impl Into<Bytes>) -> Self {
        self.ext = ext.into();
        self
    }

    pub fn with_payload(mut self, pl: impl Into<Bytes>) -> Self {
        self.pl = pl.into();
        self
    }

    /// PONG answering a PING: same version, all ids zero, empty body.
    pub fn pong(ver: i32) -> Self {
        Self::new(MessageType::Pong).with_version(ver)
    }

    /// `REGISTER_STATUS` / `AUTH_STATUS` reply carrying a JSON `ResponseInfo`.
    pub fn status(ver: i32, mt: MessageType, status: i64, msg: &str) -> Self {
        let body = ResponseInfo {
            status,
            msg: msg.to_string(),
        };
        // ResponseInfo always serializes
        let pl = serde_json::to_vec(&body).unwrap_or_default();
        Self::new(mt).with_version(ver).with_payload(pl)
    }

    /// Serialized size of this packet including the 4-byte length prefix.
    pub fn frame_len(&self) -> usize {
        crate::codec::LENGTH_PREFIX_LEN + crate::codec::HEADER_LEN + self.ext.len() + self.pl.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceInfo {
    #[serde(alias = "Token")]
    pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthInfo {
    #[serde(alias = "Uid")]
    pub uid: i64,
    #[serde(alias = "Token")]
    pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseInfo {
    pub status: i64,
    pub msg: String,
}

impl ResponseInfo {
    pub fn decode(pl: &[u8]) -> Option<Self> {
        serde_json::from_slice(pl).ok()
    }
}
