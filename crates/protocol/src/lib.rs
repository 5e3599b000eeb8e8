//! Wire protocol for the gateway WebSocket fabric: frame types, error
//! codes, event scope guards, connection authorization, and the
//! approved-device store.

pub mod auth;
pub mod device;
pub mod error_codes;
pub mod frames;
pub mod scopes;

pub use auth::{authorize_connect, is_loopback_address, safe_equal, AuthDecision, AuthMethod};
pub use frames::{
    ConnectAuth, ConnectParams, DeviceIdentity, ErrorShape, EventFrame, HelloResponse,
    RequestFrame, ResponseFrame, PROTOCOL_VERSION_MAX,
};
pub use scopes::{event_passes_scope_guard, required_scopes, OPERATOR_DEFAULT_SCOPES};
