//! Connection authorization.
//!
//! Order (first success wins): loopback bypass, shared token, password,
//! device identity. Comparisons are constant-time via SHA-256 digest +
//! `subtle` so the digest lengths always match.

use std::net::IpAddr;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use ag_domain::config::AuthMode;

use crate::device::DeviceStore;
use crate::frames::DeviceIdentity;

/// How a connection was authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    LocalDirect,
    Token,
    Password,
    DeviceToken,
}

impl AuthMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthMethod::LocalDirect => "LOCAL_DIRECT",
            AuthMethod::Token => "TOKEN",
            AuthMethod::Password => "PASSWORD",
            AuthMethod::DeviceToken => "DEVICE_TOKEN",
        }
    }
}

/// Outcome of the authorization sequence.
#[derive(Debug, Clone)]
pub enum AuthDecision {
    Accepted { method: AuthMethod },
    Rejected { reason: &'static str },
}

/// Timing-safe string comparison (handles either side missing).
pub fn safe_equal(a: Option<&str>, b: Option<&str>) -> bool {
    let (Some(a), Some(b)) = (a, b) else {
        return false;
    };
    // Hashing normalizes lengths so ct_eq always compares 32 bytes.
    let ha = Sha256::digest(a.as_bytes());
    let hb = Sha256::digest(b.as_bytes());
    ha.ct_eq(&hb).into()
}

/// Return true when `addr` is a loopback address (IPv4 `127.0.0.0/8`,
/// IPv6 `::1`, or an IPv4-mapped `::ffff:127.x`).
pub fn is_loopback_address(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => {
            if v6.is_loopback() {
                return true;
            }
            match v6.to_ipv4_mapped() {
                Some(mapped) => mapped.is_loopback(),
                None => false,
            }
        }
    }
}

/// Inputs to the authorization sequence, gathered by the connection
/// handler before `connect` is processed.
pub struct AuthRequest<'a> {
    pub remote_addr: Option<IpAddr>,
    pub mode: AuthMode,
    pub config_token: Option<&'a str>,
    pub config_password: Option<&'a str>,
    pub request_token: Option<&'a str>,
    pub request_password: Option<&'a str>,
    pub device_identity: Option<&'a DeviceIdentity>,
    /// Nonce the server sent in `connect.challenge`.
    pub challenge_nonce: &'a str,
}

/// Run the authorization sequence. First success wins.
pub fn authorize_connect(req: &AuthRequest<'_>, devices: &DeviceStore) -> AuthDecision {
    if let Some(addr) = req.remote_addr {
        if is_loopback_address(&addr) {
            return AuthDecision::Accepted { method: AuthMethod::LocalDirect };
        }
    }

    match req.mode {
        AuthMode::Token => {
            if req.config_token.is_none() {
                // Token auth is configured but no secret was provided at
                // startup; never accept remote clients in this state.
                if req.device_identity.is_none() {
                    return AuthDecision::Rejected { reason: "token_missing_config" };
                }
            } else if req.request_token.is_none() {
                if req.device_identity.is_none() {
                    return AuthDecision::Rejected { reason: "token_missing" };
                }
            } else if safe_equal(req.config_token, req.request_token) {
                return AuthDecision::Accepted { method: AuthMethod::Token };
            } else {
                return AuthDecision::Rejected { reason: "token_mismatch" };
            }
        }
        AuthMode::Password => {
            if req.request_password.is_none() {
                if req.device_identity.is_none() {
                    return AuthDecision::Rejected { reason: "password_missing" };
                }
            } else if req.config_password.is_none() {
                return AuthDecision::Rejected { reason: "password_missing_config" };
            } else if safe_equal(req.config_password, req.request_password) {
                return AuthDecision::Accepted { method: AuthMethod::Password };
            } else {
                return AuthDecision::Rejected { reason: "password_mismatch" };
            }
        }
    }

    // Device identity fallback: the signature must cover the server nonce
    // and the device must already be approved.
    if let Some(identity) = req.device_identity {
        return match devices.verify(identity, req.challenge_nonce) {
            Ok(()) => AuthDecision::Accepted { method: AuthMethod::DeviceToken },
            Err(reason) => AuthDecision::Rejected { reason },
        };
    }

    AuthDecision::Rejected { reason: "unsupported_auth_mode" }
}
