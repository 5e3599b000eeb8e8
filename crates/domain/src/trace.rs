use serde::Serialize;

/// Structured trace events emitted across all agentgate crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    SessionResolved {
        session_key: String,
        session_id: String,
        is_new: bool,
    },
    SessionReset {
        session_key: String,
        old_session_id: String,
        new_session_id: String,
        reason: String,
    },
    RouteResolved {
        channel: String,
        peer_id: String,
        session_key: String,
        matched_by: String,
    },
    IdentityResolved {
        raw_peer_id: String,
        canonical: String,
    },
    RunStarted {
        run_id: String,
        session_key: String,
    },
    RunFinished {
        run_id: String,
        status: String,
        duration_ms: u64,
    },
    CronFired {
        job_id: String,
        status: String,
        duration_ms: u64,
    },
    ChannelInbound {
        channel: String,
        peer_kind: String,
        accepted: bool,
    },
    SlowConsumerClosed {
        conn_id: String,
        dropped: u64,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "ag_event");
    }
}
