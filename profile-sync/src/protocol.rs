//! Wire protocol between replicas and relay nodes.
//!
//! One WebSocket per (room, role):
//! ```text
//! ws://relay:9090/<room>?role=observer
//! ```
//!
//! Two frame kinds share the socket:
//!
//! - **Binary**: bincode-encoded [`SyncMessage`] carrying the yrs sync
//!   handshake and incremental updates.
//! - **Text**: JSON [`PushMessage`] sent only to observer connections,
//!   out of band from the sync protocol:
//!
//! ```text
//! {"type":"update","room":"profile-alice","document":{...},"timestamp":1700000000000}
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Prefix that turns a document id into its room id.
pub const ROOM_PREFIX: &str = "profile-";

/// Path answered with a plain HTTP response instead of a WebSocket upgrade.
pub const HEALTH_PATH: &str = "/health";

/// Wire-level address of one replicated document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Derive the room for a document id. Characters that are not safe in a
    /// URL path segment or a file name are replaced with `_`.
    pub fn for_document(doc_id: &str) -> Self {
        let safe: String = doc_id
            .chars()
            .map(|c| if is_room_char(c) { c } else { '_' })
            .collect();
        Self(format!("{ROOM_PREFIX}{safe}"))
    }

    /// Parse a room id taken from a connection path.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        if raw.is_empty() || !raw.chars().all(is_room_char) {
            return Err(ProtocolError::InvalidRoom(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_room_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection role, fixed at handshake time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
    /// Reads and writes the replicated document.
    #[default]
    Full,
    /// Receives read-only push notifications; its updates are dropped.
    Observer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Full => "full",
            Role::Observer => "observer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Role::Full),
            "observer" => Ok(Role::Observer),
            other => Err(ProtocolError::InvalidRole(other.to_string())),
        }
    }
}

/// Room and role resolved once from the handshake request URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub room: RoomId,
    pub role: Role,
}

impl ConnectionTarget {
    /// Parse `/<room>?role=<role>`. A missing `role` means [`Role::Full`].
    pub fn parse(path: &str, query: Option<&str>) -> Result<Self, ProtocolError> {
        let room = RoomId::parse(path.trim_start_matches('/'))?;

        let mut role = Role::Full;
        for pair in query.unwrap_or_default().split('&') {
            if let Some(value) = pair.strip_prefix("role=") {
                role = value.parse()?;
            }
        }

        Ok(Self { room, role })
    }
}

/// Message types for the binary sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Yrs state vector, asks the other side for what it is missing
    SyncStep1 = 1,
    /// Yrs state diff answering a SyncStep1
    SyncStep2 = 2,
    /// Incremental CRDT update
    Update = 3,
    /// Heartbeat / flush ping
    Ping = 4,
    /// Answer to Ping
    Pong = 5,
}

/// Binary sync frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub room: RoomId,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn with_payload(msg_type: MessageType, room: &RoomId, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            room: room.clone(),
            payload,
        }
    }

    pub fn sync_step1(room: &RoomId, state_vector: Vec<u8>) -> Self {
        Self::with_payload(MessageType::SyncStep1, room, state_vector)
    }

    pub fn sync_step2(room: &RoomId, state_diff: Vec<u8>) -> Self {
        Self::with_payload(MessageType::SyncStep2, room, state_diff)
    }

    pub fn update(room: &RoomId, yrs_update: Vec<u8>) -> Self {
        Self::with_payload(MessageType::Update, room, yrs_update)
    }

    pub fn ping(room: &RoomId) -> Self {
        Self::with_payload(MessageType::Ping, room, Vec::new())
    }

    pub fn pong(room: &RoomId) -> Self {
        Self::with_payload(MessageType::Pong, room, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

/// Out-of-band notification pushed to observer connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PushMessage {
    Update {
        room: RoomId,
        document: serde_json::Value,
        /// Milliseconds since the Unix epoch
        timestamp: u64,
    },
}

impl PushMessage {
    pub fn update(room: &RoomId, document: serde_json::Value) -> Self {
        PushMessage::Update {
            room: room.clone(),
            document,
            timestamp: unix_millis(),
        }
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Normalize a relay candidate to a WebSocket base URL without trailing slash.
pub fn relay_ws_url(relay: &str) -> String {
    let trimmed = relay.trim().trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_string()
    } else {
        format!("ws://{trimmed}")
    }
}

/// Full connection URL for a room on a relay.
pub fn room_url(relay: &str, room: &RoomId, role: Role) -> String {
    format!("{}/{}?role={}", relay_ws_url(relay), room, role)
}

/// Health endpoint URL of a relay.
pub fn health_url(relay: &str) -> String {
    format!("{}{}", relay_ws_url(relay), HEALTH_PATH)
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidRoom(String),
    InvalidRole(String),
    InvalidUpdate(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidRoom(r) => write!(f, "Invalid room id: {r:?}"),
            Self::InvalidRole(r) => write!(f, "Invalid connection role: {r:?}"),
            Self::InvalidUpdate(e) => write!(f, "Invalid CRDT update: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_for_document() {
        assert_eq!(RoomId::for_document("alice").as_str(), "profile-alice");
        assert_eq!(
            RoomId::for_document("alice"),
            RoomId::for_document("alice")
        );
        assert_eq!(RoomId::for_document("a/b c").as_str(), "profile-a_b_c");
    }

    #[test]
    fn test_room_parse_rejects_bad_ids() {
        assert!(RoomId::parse("").is_err());
        assert!(RoomId::parse("a/b").is_err());
        assert!(RoomId::parse("profile-alice").is_ok());
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("full".parse::<Role>().unwrap(), Role::Full);
        assert_eq!("observer".parse::<Role>().unwrap(), Role::Observer);
        assert!("admin".parse::<Role>().is_err());
        assert_eq!(Role::default(), Role::Full);
    }

    #[test]
    fn test_connection_target() {
        let t = ConnectionTarget::parse("/profile-alice", Some("role=observer")).unwrap();
        assert_eq!(t.room.as_str(), "profile-alice");
        assert_eq!(t.role, Role::Observer);

        let t = ConnectionTarget::parse("/profile-alice", None).unwrap();
        assert_eq!(t.role, Role::Full);

        let t = ConnectionTarget::parse("/room", Some("x=1&role=full")).unwrap();
        assert_eq!(t.role, Role::Full);

        assert!(ConnectionTarget::parse("/", None).is_err());
        assert!(ConnectionTarget::parse("/room", Some("role=boss")).is_err());
    }

    #[test]
    fn test_sync_message_roundtrip() {
        let room = RoomId::for_document("alice");
        let msg = SyncMessage::update(&room, vec![1, 2, 3]);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Update);
        assert_eq!(decoded.room, room);
        assert_eq!(decoded.payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(SyncMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_push_message_shape() {
        let room = RoomId::for_document("alice");
        let push = PushMessage::update(&room, serde_json::json!({"name": "Alice"}));
        let value: serde_json::Value = serde_json::from_str(&push.to_text().unwrap()).unwrap();

        assert_eq!(value["type"], "update");
        assert_eq!(value["room"], "profile-alice");
        assert_eq!(value["document"]["name"], "Alice");
        assert!(value["timestamp"].as_u64().unwrap() > 0);

        let parsed = PushMessage::from_text(&push.to_text().unwrap()).unwrap();
        assert_eq!(parsed, push);
    }

    #[test]
    fn test_relay_urls() {
        assert_eq!(relay_ws_url("http://relay.example/"), "ws://relay.example");
        assert_eq!(relay_ws_url("https://relay.example"), "wss://relay.example");
        assert_eq!(relay_ws_url("ws://127.0.0.1:9090"), "ws://127.0.0.1:9090");
        assert_eq!(relay_ws_url("127.0.0.1:9090"), "ws://127.0.0.1:9090");

        let room = RoomId::for_document("bob");
        assert_eq!(
            room_url("http://r:1/", &room, Role::Observer),
            "ws://r:1/profile-bob?role=observer"
        );
        assert_eq!(health_url("ws://r:1"), "ws://r:1/health");
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::SyncStep1 as u8, 1);
        assert_eq!(MessageType::SyncStep2 as u8, 2);
        assert_eq!(MessageType::Update as u8, 3);
        assert_eq!(MessageType::Ping as u8, 4);
        assert_eq!(MessageType::Pong as u8, 5);
    }
}
