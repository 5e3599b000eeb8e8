//! Namespaced error codes returned in `error.code`, with the JSON-RPC
//! numeric mapping used when the client spoke that envelope.

pub const AUTH_REQUIRED: &str = "AUTH_REQUIRED";
pub const AUTH_FAILED: &str = "AUTH_FAILED";
pub const HANDSHAKE_FAILED: &str = "HANDSHAKE_FAILED";
pub const PERMISSION_DENIED: &str = "PERMISSION_DENIED";
pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
pub const NOT_LINKED: &str = "NOT_LINKED";
pub const NOT_PAIRED: &str = "NOT_PAIRED";
pub const AGENT_TIMEOUT: &str = "AGENT_TIMEOUT";
pub const UNAVAILABLE: &str = "UNAVAILABLE";
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

/// JSON-RPC numeric code for a namespaced error code.
///
/// `METHOD_NOT_FOUND` and `INTERNAL_ERROR` use their reserved values; all
/// other classes share the implementation-defined `-32000` with the class
/// carried in the message.
pub fn jsonrpc_code(code: &str) -> i64 {
    match code {
        METHOD_NOT_FOUND => -32601,
        INTERNAL_ERROR => -32603,
        _ => -32000,
    }
}
