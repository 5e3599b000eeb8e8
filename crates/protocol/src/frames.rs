//! Frame types carried over a gateway WebSocket connection.
//!
//! Three frame kinds, JSON-encoded, one frame per message:
//! - Request  (client → server): `{"type":"req","id":…,"method":…,"params":…}`
//!   or a JSON-RPC 2.0 envelope (`{"jsonrpc":"2.0",…}`).
//! - Response (server → client): `{"id":…, "result":…}` or `{"id":…, "error":{…}}`.
//! - Event    (server → client): `{"event":…, "payload":…, "seq":…}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Highest protocol version this server negotiates.
pub const PROTOCOL_VERSION_MAX: u32 = 3;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    /// `"req"` for the native envelope. Absent when `jsonrpc` is used.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub frame_type: Option<String>,
    /// `"2.0"` for the JSON-RPC envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    /// Opaque request id echoed back on the response.
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RequestFrame {
    /// Whether the client used the JSON-RPC envelope (affects numeric
    /// error-code mapping on responses).
    pub fn is_jsonrpc(&self) -> bool {
        self.jsonrpc.as_deref() == Some("2.0")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    /// JSON-RPC numeric code; set only when the request used that envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_code: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    pub fn ok(id: Value, result: Value) -> Self {
        Self { id, result: Some(result), error: None }
    }

    pub fn err(id: Value, code: &str, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(ErrorShape {
                code: code.to_owned(),
                message: message.into(),
                rpc_code: None,
            }),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    /// Dotted event name (`chat.delta`, `cron.fired`, …).
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    /// Monotone per run/topic, starting at 0. Gaps mean lost events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connect handshake payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    #[serde(default)]
    pub auth: ConnectAuth,
    #[serde(default)]
    pub client: ClientInfo,
    #[serde(default = "d_max_protocol")]
    pub max_protocol: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_identity: Option<DeviceIdentity>,
}

fn d_max_protocol() -> u32 {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub platform: String,
}

/// Device-identity challenge-response material.
///
/// `signature = hex(HMAC-SHA256(device_key, nonce || "." || signed_at))`
/// over the server-issued challenge nonce.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub id: String,
    pub public_key: String,
    pub signature: String,
    pub signed_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HelloResponse {
    pub protocol: u32,
    pub server: ServerInfo,
    pub features: Value,
    pub snapshot: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub platform: String,
}
