//! Event scope guards.
//!
//! Every guarded event name maps to a required scope set; a connection
//! receives an event iff its scope set intersects the required set.
//! Events with no guard entry are delivered to every connection.

pub const OPERATOR_READ: &str = "operator.read";
pub const OPERATOR_WRITE: &str = "operator.write";
pub const OPERATOR_ADMIN: &str = "operator.admin";
pub const OPERATOR_APPROVALS: &str = "operator.approvals";
pub const OPERATOR_PAIRING: &str = "operator.pairing";

/// Scopes granted to an operator connection that requested none explicitly.
pub const OPERATOR_DEFAULT_SCOPES: &[&str] = &[
    OPERATOR_ADMIN,
    OPERATOR_READ,
    OPERATOR_WRITE,
    OPERATOR_APPROVALS,
    OPERATOR_PAIRING,
];

const READ: &[&str] = &[OPERATOR_READ];
const ADMIN: &[&str] = &[OPERATOR_ADMIN];
const APPROVALS: &[&str] = &[OPERATOR_APPROVALS];

/// Required scopes for an event, or `None` when the event is unguarded.
///
/// Events are matched on the segment before the first dot for the
/// family-guarded names (`chat.delta` → `chat`), with explicit entries
/// for the multi-segment pairing/approval events.
pub fn required_scopes(event: &str) -> Option<&'static [&'static str]> {
    // Explicit multi-segment entries first.
    match event {
        "node.pair.requested" | "node.pair.resolved" => return Some(ADMIN),
        "device.pair.requested" | "device.pair.resolved" => return Some(ADMIN),
        "exec.approval.requested" | "exec.approval.resolved" => return Some(APPROVALS),
        "node.invoke.request" | "node.invoke.response" => return Some(ADMIN),
        "voicewake.changed" => return Some(ADMIN),
        "connect.challenge" | "tick" | "shutdown" => return None,
        _ => {}
    }

    let family = event.split('.').next().unwrap_or(event);
    match family {
        "agent" | "chat" | "cron" | "presence" | "health" | "heartbeat" | "system" => Some(READ),
        _ => None,
    }
}

/// Check whether a connection with `client_scopes` may receive `event`.
pub fn event_passes_scope_guard<S: AsRef<str>>(event: &str, client_scopes: &[S]) -> bool {
    match required_scopes(event) {
        None => true,
        Some(required) => client_scopes
            .iter()
            .any(|s| required.contains(&s.as_ref())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_events_require_read() {
        assert!(event_passes_scope_guard("chat.delta", &["operator.read"]));
        assert!(!event_passes_scope_guard("chat.delta", &["operator.admin"]));
    }

    #[test]
    fn pairing_events_require_admin() {
        assert!(event_passes_scope_guard("node.pair.requested", &["operator.admin"]));
        assert!(!event_passes_scope_guard("device.pair.resolved", &["operator.read"]));
    }

    #[test]
    fn approval_events_require_approvals_scope() {
        assert!(event_passes_scope_guard(
            "exec.approval.requested",
            &["operator.approvals"]
        ));
        assert!(!event_passes_scope_guard(
            "exec.approval.requested",
            &["operator.read", "operator.write"]
        ));
    }

    #[test]
    fn unguarded_events_pass_empty_scope_set() {
        let empty: [&str; 0] = [];
        assert!(event_passes_scope_guard("tick", &empty));
        assert!(event_passes_scope_guard("connect.challenge", &empty));
        assert!(event_passes_scope_guard("shutdown", &empty));
        // Unknown families are unguarded too.
        assert!(event_passes_scope_guard("debug.custom", &empty));
    }

    #[test]
    fn guarded_events_fail_empty_scope_set() {
        let empty: [&str; 0] = [];
        assert!(!event_passes_scope_guard("chat.final", &empty));
        assert!(!event_passes_scope_guard("presence", &empty));
    }

    #[test]
    fn any_intersecting_scope_passes() {
        assert!(event_passes_scope_guard(
            "cron.fired",
            &["operator.pairing", "operator.read"]
        ));
    }
}
