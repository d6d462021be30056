//! Binary wire protocol for the Fete realtime transport.
//!
//! Every frame on the socket is one bincode-encoded [`Envelope`]:
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────────┬──────────┐
//! │ kind     │ sender    │ channel  │ timestamp_ms │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ 8 bytes      │ variable │
//! └──────────┴───────────┴──────────┴──────────────┴──────────┘
//! ```
//!
//! `channel` is the room, session, or share the frame belongs to
//! (`Uuid::nil()` for connection-level frames such as ping/pong).
//! The payload is a bincode-encoded struct owned by the consuming
//! engine; [`Envelope::payload_as`] decodes it on delivery. Payloads
//! carrying dynamic JSON values (document operations) are encoded with
//! [`Envelope::json`] and read back with [`Envelope::payload_as_json`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Named event kinds carried over the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventKind {
    /// New chat message in a room
    ChatMessage = 1,
    /// Server acknowledgment of a chat message / edit / delete
    MessageAck = 2,
    /// Message content edited
    MessageEdit = 3,
    /// Message removed from its room
    MessageDelete = 4,
    /// Reaction toggled on a message
    Reaction = 5,
    /// Read receipt for a room
    ReadReceipt = 6,
    /// Typing signal for a room
    Typing = 7,
    /// Presence record broadcast
    Presence = 8,
    /// Channel membership join
    ChannelJoin = 9,
    /// Channel membership leave
    ChannelLeave = 10,
    /// Collaborative document operation
    Operation = 11,
    /// Lock acquired/released/expired notification
    LockUpdate = 12,
    /// View/download event on a shared document
    ShareAccess = 13,
    /// Heartbeat ping
    Ping = 14,
    /// Heartbeat pong
    Pong = 15,
}

/// Platform role of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Family member planning the occasion
    Family,
    /// Service coordinator
    Coordinator,
    /// Venue operator
    Venue,
}

/// Identity of a participant, attached to outbound frames and presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: Uuid,
    pub name: String,
    pub role: Role,
}

impl UserIdentity {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: Uuid::new_v4(),
            name: name.into(),
            role,
        }
    }

    /// Create with an explicit id (restored sessions, tests).
    pub fn with_id(user_id: Uuid, name: impl Into<String>, role: Role) -> Self {
        Self {
            user_id,
            name: name.into(),
            role,
        }
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Client-supplied timestamps drive the last-write-wins merge rule and
/// are not monotonic across peers with clock skew. That is a known
/// correctness gap of the wall-clock ordering semantics, carried
/// deliberately rather than papered over with logical clocks.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Top-level transport frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: EventKind,
    /// Originating user
    pub sender: Uuid,
    /// Room / session / share the frame belongs to (nil for connection-level)
    pub channel: Uuid,
    /// Sender wall-clock time, milliseconds since epoch
    pub timestamp_ms: u64,
    /// Engine-owned payload (varies by kind)
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Create an envelope with a typed payload.
    pub fn new<T: Serialize>(
        kind: EventKind,
        sender: Uuid,
        channel: Uuid,
        payload: &T,
    ) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            kind,
            sender,
            channel,
            timestamp_ms: now_ms(),
            payload,
        })
    }

    /// Create an envelope whose payload is encoded as JSON.
    ///
    /// Payloads embedding `serde_json::Value` need a self-describing
    /// format; bincode cannot decode them. The envelope itself stays
    /// bincode on the wire.
    pub fn json<T: Serialize>(
        kind: EventKind,
        sender: Uuid,
        channel: Uuid,
        payload: &T,
    ) -> Result<Self, ProtocolError> {
        let payload =
            serde_json::to_vec(payload).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            kind,
            sender,
            channel,
            timestamp_ms: now_ms(),
            payload,
        })
    }

    /// Create a payload-less connection-level envelope.
    pub fn control(kind: EventKind, sender: Uuid) -> Self {
        Self {
            kind,
            sender,
            channel: Uuid::nil(),
            timestamp_ms: now_ms(),
            payload: Vec::new(),
        }
    }

    /// Create a heartbeat ping.
    pub fn ping(sender: Uuid) -> Self {
        Self::control(EventKind::Ping, sender)
    }

    /// Create a heartbeat pong.
    pub fn pong(sender: Uuid) -> Self {
        Self::control(EventKind::Pong, sender)
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (env, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(env)
    }

    /// Decode the payload as a typed struct.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let (value, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(value)
    }

    /// Decode a payload built with [`Envelope::json`].
    pub fn payload_as_json<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol-level errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    /// Frame kind did not match what the caller expected
    UnexpectedKind(EventKind),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "deserialization error: {e}"),
            Self::UnexpectedKind(k) => write!(f, "unexpected frame kind: {k:?}"),
            Self::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
