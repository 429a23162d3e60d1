//! Gateway wire protocol: opcodes, message framing, and close-code policy.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Close code sent when we sever a connection that we intend to resume.
///
/// Private application-level code; the server treats anything that is not
/// a normal closure as a resumable disconnect.
pub const CLOSE_CODE_RESUMING: u16 = 4200;

/// Normal closure, used when the session should not be resumed.
pub const CLOSE_CODE_NORMAL: u16 = 1000;

/// Gateway operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Server dispatches an event (carries `t` and `s`)
    Dispatch = 0,
    /// Keep the connection alive (client/server)
    Heartbeat = 1,
    /// Authenticate and open a new session (client only)
    Identify = 2,
    /// Re-attach to an existing session (client only)
    Resume = 6,
    /// Server requests the client reconnect and resume (server only)
    Reconnect = 7,
    /// The session is invalid; payload says whether it is resumable (server only)
    InvalidSession = 9,
    /// Sent immediately after connecting (server only)
    Hello = 10,
    /// Heartbeat acknowledged (server only)
    HeartbeatAck = 11,
}

impl OpCode {
    /// Create an `OpCode` from a raw integer value.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Dispatch),
            1 => Some(Self::Heartbeat),
            2 => Some(Self::Identify),
            6 => Some(Self::Resume),
            7 => Some(Self::Reconnect),
            9 => Some(Self::InvalidSession),
            10 => Some(Self::Hello),
            11 => Some(Self::HeartbeatAck),
            _ => None,
        }
    }

    /// Get the raw integer value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Opcodes that may be written before the shard is `Ready`.
    #[must_use]
    pub const fn is_critical(self) -> bool {
        matches!(self, Self::Heartbeat | Self::Identify | Self::Resume)
    }
}

impl Serialize for OpCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for OpCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = u8::deserialize(deserializer)?;
        OpCode::from_u8(raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown gateway opcode {raw}")))
    }
}

/// A single gateway frame after decoding and decompression.
///
/// Dispatch frames (op 0) carry `t` (event name) and `s` (sequence).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayMessage {
    /// Operation code
    pub op: OpCode,

    /// Event name (Dispatch only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,

    /// Sequence number (Dispatch only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,

    /// Event data payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<Value>,
}

impl GatewayMessage {
    /// Create a Heartbeat frame carrying the last known sequence (or null).
    #[must_use]
    pub fn heartbeat(sequence: Option<u64>) -> Self {
        Self {
            op: OpCode::Heartbeat,
            t: None,
            s: None,
            d: Some(sequence.map_or(Value::Null, |s| Value::Number(s.into()))),
        }
    }

    /// Create an Identify frame.
    #[must_use]
    pub fn identify(payload: &IdentifyPayload) -> Self {
        Self {
            op: OpCode::Identify,
            t: None,
            s: None,
            d: serde_json::to_value(payload).ok(),
        }
    }

    /// Create a Resume frame.
    #[must_use]
    pub fn resume(payload: &ResumePayload) -> Self {
        Self {
            op: OpCode::Resume,
            t: None,
            s: None,
            d: serde_json::to_value(payload).ok(),
        }
    }

    /// Parse the Hello payload (op 10).
    pub fn as_hello(&self) -> Option<HelloPayload> {
        if self.op != OpCode::Hello {
            return None;
        }
        self.d
            .as_ref()
            .and_then(|d| serde_json::from_value(d.clone()).ok())
    }

    /// Parse the InvalidSession resumable flag (op 9).
    pub fn as_invalid_session(&self) -> Option<bool> {
        if self.op != OpCode::InvalidSession {
            return None;
        }
        Some(self.d.as_ref().and_then(Value::as_bool).unwrap_or(false))
    }
}

impl std::fmt::Display for GatewayMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.t, self.s) {
            (Some(t), Some(s)) => write!(f, "GatewayMessage(op={}, t={t}, s={s})", self.op.as_u8()),
            _ => write!(f, "GatewayMessage(op={})", self.op.as_u8()),
        }
    }
}

/// Connection properties reported in Identify.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// Identify payload (op 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyPayload {
    pub token: String,
    pub properties: IdentifyProperties,
    pub intents: u64,
    /// Per-message ("identify") compression flag
    pub compress: bool,
    /// `[shard_id, shard_count]`
    pub shard: [u32; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_threshold: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<Value>,
}

/// Resume payload (op 6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumePayload {
    pub token: String,
    pub seq: u64,
    pub session_id: String,
}

/// Hello payload (op 10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval: u64,
}

/// READY dispatch payload fields the shard itself consumes.
///
/// The full payload is forwarded to the consumer untouched; only the
/// session bookkeeping fields are deserialized here.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadyPayload {
    pub session_id: String,
    pub resume_gateway_url: Option<String>,
}

/// What to do after the connection closes with a given code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseBehavior {
    /// Raise a fatal error; schedule nothing
    Fatal,
    /// Clear the session and reconnect with a fresh Identify
    Reconnect,
    /// Keep the session and reconnect with Resume
    Resume,
}

/// Map a close code to its recovery behavior.
///
/// Unrecognized codes deliberately fall back to `Resume`; callers log this
/// so a newly introduced fatal code does not fail silently.
#[must_use]
pub fn close_behavior(code: u16) -> CloseBehavior {
    match code {
        // Irrecoverable protocol/config problems
        4004 | 4010 | 4011 | 4012 | 4013 | 4014 => CloseBehavior::Fatal,
        // Clean severance or a session that cannot be re-attached
        1000 | 1001 | 4001 | 4002 | 4007 | 4009 => CloseBehavior::Reconnect,
        _ => CloseBehavior::Resume,
    }
}

/// Human-readable description for known vendor close codes.
#[must_use]
pub fn close_code_description(code: u16) -> &'static str {
    match code {
        1000 => "Normal closure",
        1001 => "Going away",
        4000 => "Unknown error",
        4001 => "Unknown opcode",
        4002 => "Decode error",
        4003 => "Not authenticated",
        4004 => "Authentication failed",
        4005 => "Already authenticated",
        4007 => "Invalid sequence",
        4008 => "Rate limited",
        4009 => "Session timed out",
        4010 => "Invalid shard",
        4011 => "Sharding required",
        4012 => "Invalid API version",
        4013 => "Invalid intents",
        4014 => "Disallowed intents",
        CLOSE_CODE_RESUMING => "Resuming",
        _ => "Unknown close code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for op in [
            OpCode::Dispatch,
            OpCode::Heartbeat,
            OpCode::Identify,
            OpCode::Resume,
            OpCode::Reconnect,
            OpCode::InvalidSession,
            OpCode::Hello,
            OpCode::HeartbeatAck,
        ] {
            assert_eq!(OpCode::from_u8(op.as_u8()), Some(op));
        }
        assert_eq!(OpCode::from_u8(3), None);
        assert_eq!(OpCode::from_u8(42), None);
    }

    #[test]
    fn test_message_serializes_op_as_number() {
        let msg = GatewayMessage::heartbeat(Some(41));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"op\":1"));
        assert!(json.contains("\"d\":41"));
    }

    #[test]
    fn test_heartbeat_null_sequence() {
        let msg = GatewayMessage::heartbeat(None);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"d\":null"));
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let result: Result<GatewayMessage, _> = serde_json::from_str(r#"{"op":42,"d":null}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_dispatch_parse() {
        let msg: GatewayMessage =
            serde_json::from_str(r#"{"op":0,"t":"MESSAGE_CREATE","s":7,"d":{"id":"1"}}"#).unwrap();
        assert_eq!(msg.op, OpCode::Dispatch);
        assert_eq!(msg.t.as_deref(), Some("MESSAGE_CREATE"));
        assert_eq!(msg.s, Some(7));
    }

    #[test]
    fn test_hello_parse() {
        let msg: GatewayMessage =
            serde_json::from_str(r#"{"op":10,"d":{"heartbeat_interval":41250}}"#).unwrap();
        let hello = msg.as_hello().unwrap();
        assert_eq!(hello.heartbeat_interval, 41250);
    }

    #[test]
    fn test_invalid_session_flag() {
        let resumable: GatewayMessage = serde_json::from_str(r#"{"op":9,"d":true}"#).unwrap();
        assert_eq!(resumable.as_invalid_session(), Some(true));

        let fresh: GatewayMessage = serde_json::from_str(r#"{"op":9,"d":false}"#).unwrap();
        assert_eq!(fresh.as_invalid_session(), Some(false));

        // A null payload is treated as not resumable
        let null: GatewayMessage = serde_json::from_str(r#"{"op":9,"d":null}"#).unwrap();
        assert_eq!(null.as_invalid_session(), Some(false));
    }

    #[test]
    fn test_identify_payload_shape() {
        let payload = IdentifyPayload {
            token: "tok".into(),
            properties: IdentifyProperties::default(),
            intents: 513,
            compress: false,
            shard: [2, 8],
            large_threshold: Some(250),
            presence: None,
        };
        let json = serde_json::to_value(GatewayMessage::identify(&payload)).unwrap();
        assert_eq!(json["op"], 2);
        assert_eq!(json["d"]["shard"][0], 2);
        assert_eq!(json["d"]["shard"][1], 8);
        assert_eq!(json["d"]["large_threshold"], 250);
        assert!(json["d"].get("presence").is_none());
    }

    #[test]
    fn test_close_behavior_fatal() {
        for code in [4004, 4010, 4011, 4012, 4013, 4014] {
            assert_eq!(close_behavior(code), CloseBehavior::Fatal, "code {code}");
        }
    }

    #[test]
    fn test_close_behavior_reconnect() {
        for code in [1000, 1001, 4001, 4002, 4007, 4009] {
            assert_eq!(close_behavior(code), CloseBehavior::Reconnect, "code {code}");
        }
    }

    #[test]
    fn test_close_behavior_defaults_to_resume() {
        assert_eq!(close_behavior(4000), CloseBehavior::Resume);
        assert_eq!(close_behavior(4008), CloseBehavior::Resume);
        // Unrecognized codes keep the session
        assert_eq!(close_behavior(4999), CloseBehavior::Resume);
        assert_eq!(close_behavior(1006), CloseBehavior::Resume);
    }
}
