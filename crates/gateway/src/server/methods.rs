//! RPC method dispatch.
//!
//! Requests arrive on an authenticated connection (the `connect`
//! handshake itself is handled by the socket loop). Responses carry
//! exactly one of `result`/`error`; when the client spoke JSON-RPC the
//! numeric code is filled in as well. Idempotent methods (`chat.send`,
//! `cron.add`, `sessions.spawn`) go through the dedupe cache.

use serde::Deserialize;
use serde_json::Value;

use ag_domain::tool::Role;
use ag_protocol::error_codes as codes;
use ag_protocol::frames::{ErrorShape, RequestFrame, ResponseFrame};
use ag_sessions::store::{SessionEntry, SessionPatch};

use crate::cron::model::CronJob;
use crate::cron::service::RunMode;
use crate::runtime::chat_queue::{self, SubmitParams};
use crate::server::heartbeat::WakeMode;
use crate::state::AppState;

/// What dispatch needs to know about the calling connection.
pub struct CallerInfo {
    pub conn_id: String,
    pub authenticated: bool,
    pub scopes: Vec<String>,
}

/// Scope a method requires, if any.
fn required_scope(method: &str) -> Option<&'static str> {
    match method {
        "ping" | "health" | "connect" => None,
        "chat.history" | "sessions.list" | "cron.list" | "cron.status" | "cron.runs"
        | "event.replay" => Some("operator.read"),
        _ => Some("operator.write"),
    }
}

pub async fn dispatch(state: &AppState, caller: &CallerInfo, request: RequestFrame) -> ResponseFrame {
    let method = request.method.clone();
    let id = request.id.clone();
    let jsonrpc = request.is_jsonrpc();

    // Auth gate: only connect/health/ping are reachable pre-auth.
    if !caller.authenticated && !matches!(method.as_str(), "connect" | "health" | "ping") {
        return finish(
            ResponseFrame::err(id, codes::AUTH_REQUIRED, "send 'connect' first"),
            jsonrpc,
        );
    }

    if let Some(scope) = required_scope(&method) {
        if !caller.scopes.iter().any(|s| s == scope) {
            return finish(
                ResponseFrame::err(
                    id,
                    codes::PERMISSION_DENIED,
                    format!("method {method} requires scope {scope}"),
                ),
                jsonrpc,
            );
        }
    }

    let response = match method.as_str() {
        "ping" => ResponseFrame::ok(
            id,
            serde_json::json!({ "pong": true, "ts": chrono::Utc::now().timestamp_millis() }),
        ),
        "health" => ResponseFrame::ok(
            id,
            serde_json::json!({
                "ok": true,
                "connections": state.bus.conns.len(),
                "sessions": state.store.list().len(),
            }),
        ),
        "chat.send" => chat_send(state, caller, id, request.params).await,
        "chat.abort" => chat_abort(state, id, request.params),
        "chat.history" => chat_history(state, id, request.params),
        "chat.inject" => chat_inject(state, id, request.params),
        "sessions.list" => sessions_list(state, id),
        "sessions.spawn" => sessions_spawn(state, caller, id, request.params).await,
        "sessions.reset" => sessions_reset(state, id, request.params),
        "sessions.patch" => sessions_patch(state, id, request.params),
        "sessions.delete" => sessions_delete(state, id, request.params),
        "cron.add" => cron_add(state, id, request.params).await,
        "cron.update" => cron_update(state, id, request.params),
        "cron.remove" => cron_remove(state, id, request.params),
        "cron.run" => cron_run(state, id, request.params).await,
        "cron.list" => cron_list(state, id, request.params),
        "cron.status" => ResponseFrame::ok(id, state.cron.status(state.config.cron.enabled)),
        "cron.runs" => cron_runs(state, id, request.params),
        "cron.wake" => cron_wake(state, id, request.params),
        "event.replay" => event_replay(state, caller, id, request.params),
        _ => ResponseFrame::err(
            id,
            codes::METHOD_NOT_FOUND,
            format!("unknown method: {method}"),
        ),
    };

    finish(response, jsonrpc)
}

fn finish(mut response: ResponseFrame, jsonrpc: bool) -> ResponseFrame {
    if jsonrpc {
        if let Some(error) = &mut response.error {
            error.rpc_code = Some(codes::jsonrpc_code(&error.code));
        }
    }
    response
}

fn invalid<T: std::fmt::Display>(id: Value, e: T) -> ResponseFrame {
    ResponseFrame::err(id, codes::INVALID_REQUEST, e.to_string())
}

fn internal<T: std::fmt::Display>(id: Value, e: T) -> ResponseFrame {
    ResponseFrame::err(id, codes::INTERNAL_ERROR, e.to_string())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// chat.*
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatSendParams {
    session_key: String,
    message: String,
    #[serde(default)]
    idempotency_key: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

async fn chat_send(state: &AppState, caller: &CallerInfo, id: Value, params: Value) -> ResponseFrame {
    let params: ChatSendParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return invalid(id, e),
    };

    // Idempotency: a retried key returns the original outcome.
    if let Some(key) = &params.idempotency_key {
        if let Some(entry) = state.dedupe.get("chat.send", key) {
            return cached_response(id, entry);
        }
    }

    let agent = &state.config.agent;
    if let Err(e) = state.store.ensure(&params.session_key, || {
        SessionEntry::new(&agent.model_provider, &agent.model)
    }) {
        return internal(id, e);
    }

    let submitted = chat_queue::submit(state, SubmitParams {
        session_key: params.session_key.clone(),
        message: params.message,
        conn_id: Some(caller.conn_id.clone()),
        client_run_id: params.idempotency_key.clone(),
        model_override: params.model,
        delivery: None,
    });

    match submitted {
        Ok(run_id) => {
            let payload = serde_json::json!({ "runId": run_id });
            if let Some(key) = &params.idempotency_key {
                state.dedupe.put_ok("chat.send", key, payload.clone());
            }
            ResponseFrame::ok(id, payload)
        }
        Err(e) => {
            let error = ErrorShape {
                code: codes::UNAVAILABLE.to_owned(),
                message: e.to_string(),
                rpc_code: None,
            };
            if let Some(key) = &params.idempotency_key {
                state.dedupe.put_err("chat.send", key, error.clone());
            }
            ResponseFrame { id, result: None, error: Some(error) }
        }
    }
}

fn cached_response(id: Value, entry: crate::server::dedupe::DedupeEntry) -> ResponseFrame {
    if entry.ok {
        ResponseFrame::ok(id, entry.payload.unwrap_or(Value::Null))
    } else {
        ResponseFrame {
            id,
            result: None,
            error: entry.error.or_else(|| {
                Some(ErrorShape {
                    code: codes::INTERNAL_ERROR.to_owned(),
                    message: "cached failure".into(),
                    rpc_code: None,
                })
            }),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatAbortParams {
    session_key: String,
    #[serde(default)]
    run_id: Option<String>,
}

fn chat_abort(state: &AppState, id: Value, params: Value) -> ResponseFrame {
    let params: ChatAbortParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return invalid(id, e),
    };
    let aborted = state
        .chat
        .abort(state, &params.session_key, params.run_id.as_deref());
    ResponseFrame::ok(id, serde_json::json!({ "aborted": aborted }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatHistoryParams {
    session_key: String,
    #[serde(default)]
    limit: Option<usize>,
}

fn chat_history(state: &AppState, id: Value, params: Value) -> ResponseFrame {
    let params: ChatHistoryParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return invalid(id, e),
    };
    let Some(entry) = state.store.get(&params.session_key) else {
        return ResponseFrame::ok(id, serde_json::json!({ "messages": [] }));
    };
    let messages = state
        .agents
        .get(&entry.session_id)
        .map(|session| session.lock().history(params.limit))
        .unwrap_or_default();
    ResponseFrame::ok(id, serde_json::json!({ "messages": messages }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatInjectParams {
    session_key: String,
    role: Role,
    content: String,
}

fn chat_inject(state: &AppState, id: Value, params: Value) -> ResponseFrame {
    let params: ChatInjectParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return invalid(id, e),
    };
    let agent = &state.config.agent;
    let entry = match state.store.ensure(&params.session_key, || {
        SessionEntry::new(&agent.model_provider, &agent.model)
    }) {
        Ok((entry, _)) => entry,
        Err(e) => return internal(id, e),
    };
    let agent_id = state.agent_id_for_key(&params.session_key);
    let session = state
        .agents
        .get_or_create(&entry.session_id, &params.session_key, &agent_id);
    session.lock().inject(params.role, params.content);
    ResponseFrame::ok(id, serde_json::json!({ "ok": true }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// sessions.*
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn sessions_list(state: &AppState, id: Value) -> ResponseFrame {
    let sessions: Vec<Value> = state
        .store
        .list()
        .into_iter()
        .map(|(key, entry)| {
            let mut value = serde_json::to_value(&entry).unwrap_or(Value::Null);
            if let Some(map) = value.as_object_mut() {
                map.insert("sessionKey".into(), Value::String(key));
            }
            value
        })
        .collect();
    ResponseFrame::ok(id, serde_json::json!({ "sessions": sessions }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionsSpawnParams {
    parent_key: String,
    prompt: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    idempotency_key: Option<String>,
}

async fn sessions_spawn(
    state: &AppState,
    caller: &CallerInfo,
    id: Value,
    params: Value,
) -> ResponseFrame {
    let params: SessionsSpawnParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return invalid(id, e),
    };

    if let Some(key) = &params.idempotency_key {
        if let Some(entry) = state.dedupe.get("sessions.spawn", key) {
            return cached_response(id, entry);
        }
    }

    let Some(parent) = state.store.get(&params.parent_key) else {
        return invalid(id, format!("unknown parent session: {}", params.parent_key));
    };
    let depth = parent.spawn_depth + 1;
    let max_depth = state.config.agent.max_spawn_depth.min(8);
    if depth > max_depth {
        return invalid(id, format!("spawn depth {depth} exceeds max {max_depth}"));
    }

    let agent_id = state.agent_id_for_key(&params.parent_key);
    let child_key = format!("agent:{}:spawn:{}", agent_id, uuid::Uuid::new_v4());
    let agent = &state.config.agent;
    let parent_key = params.parent_key.clone();
    let created = state.store.ensure(&child_key, || {
        let mut entry = SessionEntry::new(&agent.model_provider, &agent.model);
        entry.spawned_by = Some(parent_key.clone());
        entry.spawn_depth = depth;
        entry
    });
    if let Err(e) = created {
        return internal(id, e);
    }

    let submitted = chat_queue::submit(state, SubmitParams {
        session_key: child_key.clone(),
        message: params.prompt,
        conn_id: Some(caller.conn_id.clone()),
        model_override: params.model,
        ..Default::default()
    });
    match submitted {
        Ok(run_id) => {
            let payload = serde_json::json!({ "sessionKey": child_key, "runId": run_id });
            if let Some(key) = &params.idempotency_key {
                state.dedupe.put_ok("sessions.spawn", key, payload.clone());
            }
            ResponseFrame::ok(id, payload)
        }
        Err(e) => ResponseFrame::err(id, codes::UNAVAILABLE, e.to_string()),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionKeyParams {
    session_key: String,
}

fn sessions_reset(state: &AppState, id: Value, params: Value) -> ResponseFrame {
    let params: SessionKeyParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return invalid(id, e),
    };
    // Evict the in-memory session so the next turn starts clean.
    if let Some(entry) = state.store.get(&params.session_key) {
        state.agents.evict(&entry.session_id);
    }
    match state.store.reset(&params.session_key, "rpc") {
        Ok(Some(entry)) => ResponseFrame::ok(
            id,
            serde_json::json!({ "ok": true, "sessionId": entry.session_id }),
        ),
        Ok(None) => invalid(id, format!("unknown session: {}", params.session_key)),
        Err(e) => internal(id, e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionsPatchParams {
    session_key: String,
    patch: SessionPatch,
}

fn sessions_patch(state: &AppState, id: Value, params: Value) -> ResponseFrame {
    let params: SessionsPatchParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return invalid(id, e),
    };
    match state
        .store
        .update_entry(&params.session_key, |entry| params.patch.apply(entry))
    {
        Ok(Some(_)) => ResponseFrame::ok(id, serde_json::json!({ "ok": true })),
        Ok(None) => invalid(id, format!("unknown session: {}", params.session_key)),
        Err(e) => internal(id, e),
    }
}

fn sessions_delete(state: &AppState, id: Value, params: Value) -> ResponseFrame {
    let params: SessionKeyParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return invalid(id, e),
    };
    if let Some(entry) = state.store.get(&params.session_key) {
        state.agents.evict(&entry.session_id);
    }
    match state.store.delete(&params.session_key) {
        Ok(deleted) => ResponseFrame::ok(id, serde_json::json!({ "deleted": deleted })),
        Err(e) => internal(id, e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// cron.*
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
struct CronAddParams {
    job: CronJobSpec,
    #[serde(default, rename = "idempotencyKey")]
    idempotency_key: Option<String>,
}

/// Job spec as clients provide it (no server-assigned fields).
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CronJobSpec {
    name: String,
    #[serde(default = "d_true")]
    enabled: bool,
    schedule: crate::cron::model::Schedule,
    #[serde(default)]
    session_target: crate::cron::model::SessionTarget,
    #[serde(default)]
    wake_mode: Option<WakeMode>,
    payload: crate::cron::model::CronPayload,
    #[serde(default)]
    delivery: Option<crate::cron::model::JobDelivery>,
}

fn d_true() -> bool {
    true
}

async fn cron_add(state: &AppState, id: Value, params: Value) -> ResponseFrame {
    let params: CronAddParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return invalid(id, e),
    };

    if let Some(key) = &params.idempotency_key {
        if let Some(entry) = state.dedupe.get("cron.add", key) {
            return cached_response(id, entry);
        }
    }

    let spec = params.job;
    let mut job = CronJob::new(&spec.name, spec.schedule, spec.payload);
    job.enabled = spec.enabled;
    job.session_target = spec.session_target;
    if let Some(wake_mode) = spec.wake_mode {
        job.wake_mode = wake_mode;
    }
    job.delivery = spec.delivery;

    match state.cron.add_job(job) {
        Ok(job_id) => {
            let payload = serde_json::json!({ "id": job_id });
            if let Some(key) = &params.idempotency_key {
                state.dedupe.put_ok("cron.add", key, payload.clone());
            }
            ResponseFrame::ok(id, payload)
        }
        Err(e) => invalid(id, e),
    }
}

#[derive(Deserialize)]
struct CronUpdateParams {
    id: String,
    patch: crate::cron::model::JobPatch,
}

fn cron_update(state: &AppState, id: Value, params: Value) -> ResponseFrame {
    let params: CronUpdateParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return invalid(id, e),
    };
    match state.cron.update_job(&params.id, &params.patch) {
        Ok(Some(job)) => ResponseFrame::ok(id, serde_json::json!({ "ok": true, "job": job })),
        Ok(None) => invalid(id, format!("unknown job: {}", params.id)),
        Err(e) => invalid(id, e),
    }
}

#[derive(Deserialize)]
struct CronIdParams {
    id: String,
}

fn cron_remove(state: &AppState, id: Value, params: Value) -> ResponseFrame {
    let params: CronIdParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return invalid(id, e),
    };
    match state.cron.remove_job(&params.id) {
        Ok(removed) => ResponseFrame::ok(id, serde_json::json!({ "removed": removed })),
        Err(e) => internal(id, e),
    }
}

#[derive(Deserialize)]
struct CronRunParams {
    id: String,
    #[serde(default = "d_force")]
    mode: RunMode,
}

fn d_force() -> RunMode {
    RunMode::Force
}

async fn cron_run(state: &AppState, id: Value, params: Value) -> ResponseFrame {
    let params: CronRunParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return invalid(id, e),
    };
    match state.cron.run_job(state, &params.id, params.mode).await {
        Ok(ran) => ResponseFrame::ok(id, serde_json::json!({ "ran": ran })),
        Err(e) => internal(id, e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CronListParams {
    #[serde(default)]
    include_disabled: bool,
}

fn cron_list(state: &AppState, id: Value, params: Value) -> ResponseFrame {
    let params: CronListParams =
        serde_json::from_value(params).unwrap_or(CronListParams { include_disabled: false });
    let jobs = state.cron.store.list(params.include_disabled);
    ResponseFrame::ok(id, serde_json::json!({ "jobs": jobs }))
}

#[derive(Deserialize)]
struct CronRunsParams {
    id: String,
    #[serde(default = "d_runs_limit")]
    limit: usize,
}

fn d_runs_limit() -> usize {
    20
}

fn cron_runs(state: &AppState, id: Value, params: Value) -> ResponseFrame {
    let params: CronRunsParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return invalid(id, e),
    };
    match state.cron.store.read_run_log(&params.id, params.limit) {
        Ok(entries) => ResponseFrame::ok(id, serde_json::json!({ "entries": entries })),
        Err(e) => internal(id, e),
    }
}

#[derive(Deserialize)]
struct CronWakeParams {
    text: String,
    #[serde(default = "d_wake_now")]
    mode: WakeMode,
}

fn d_wake_now() -> WakeMode {
    WakeMode::Now
}

fn cron_wake(state: &AppState, id: Value, params: Value) -> ResponseFrame {
    let params: CronWakeParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return invalid(id, e),
    };
    state.heartbeat.wake(&state.bus, params.text, params.mode);
    ResponseFrame::ok(id, serde_json::json!({ "ok": true }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// event.replay
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventReplayParams {
    run_id: String,
    since_seq: u64,
}

fn event_replay(state: &AppState, caller: &CallerInfo, id: Value, params: Value) -> ResponseFrame {
    let params: EventReplayParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return invalid(id, e),
    };
    match state
        .bus
        .replay_to(&caller.conn_id, &params.run_id, params.since_seq)
    {
        Some(replayed) => ResponseFrame::ok(id, serde_json::json!({ "replayed": replayed })),
        None => ResponseFrame::err(
            id,
            codes::UNAVAILABLE,
            "replay window no longer covers the requested range",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_state(dir: &tempfile::TempDir) -> AppState {
        let mut config = ag_domain::config::Config::default();
        config.state.state_dir = dir.path().join("state");
        config.agent.workspace_dir = dir.path().join("workspace");
        let config = Arc::new(config);
        let state_dir = config.state.state_dir.clone();
        std::fs::create_dir_all(&state_dir).unwrap();

        let cron_store =
            crate::cron::store::CronStore::load(&state_dir, config.cron.run_log_cap).unwrap();

        AppState {
            config: config.clone(),
            store: Arc::new(ag_sessions::SessionStore::new(&state_dir).unwrap()),
            identity: Arc::new(ag_sessions::IdentityResolver::default()),
            lifecycle: Arc::new(ag_sessions::LifecycleManager::new(
                config.session.lifecycle.clone(),
            )),
            devices: Arc::new(ag_protocol::device::DeviceStore::in_memory()),
            bus: Arc::new(crate::server::broadcast::EventBus::new()),
            dedupe: Arc::new(crate::server::dedupe::DedupeCache::new()),
            presence: Arc::new(crate::server::presence::PresenceRegistry::new()),
            heartbeat: Arc::new(crate::server::heartbeat::HeartbeatQueue::new()),
            agents: Arc::new(crate::runtime::agents::AgentSessions::new()),
            chat: Arc::new(crate::runtime::chat_queue::ChatQueue::new()),
            tools: Arc::new(crate::runtime::tools::ToolRegistry::new()),
            hooks: Arc::new(crate::hooks::HookRegistry::new()),
            llm: Arc::new(ag_llm::NullClient),
            cron: Arc::new(crate::cron::service::CronService::new(cron_store)),
            channels: Arc::new(crate::channels::ChannelManager::new()),
            workspace: Arc::new(crate::workspace::WorkspaceReader::new(
                config.agent.workspace_dir.clone(),
            )),
            seeds: Arc::new(crate::workspace::SeedTracker::load(&state_dir).unwrap()),
        }
    }

    fn request(method: &str, params: Value) -> RequestFrame {
        RequestFrame {
            frame_type: Some("req".into()),
            jsonrpc: None,
            id: serde_json::json!("r1"),
            method: method.into(),
            params,
        }
    }

    fn operator() -> CallerInfo {
        CallerInfo {
            conn_id: "c1".into(),
            authenticated: true,
            scopes: vec!["operator.read".into(), "operator.write".into()],
        }
    }

    #[tokio::test]
    async fn unauthenticated_calls_fail_auth_required() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let caller = CallerInfo { conn_id: "c1".into(), authenticated: false, scopes: vec![] };

        let response = dispatch(&state, &caller, request("sessions.list", Value::Null)).await;
        assert_eq!(response.error.unwrap().code, codes::AUTH_REQUIRED);

        // ping stays reachable pre-auth.
        let response = dispatch(&state, &caller, request("ping", Value::Null)).await;
        assert_eq!(response.result.unwrap()["pong"], true);
    }

    #[tokio::test]
    async fn missing_scope_fails_permission_denied() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let caller = CallerInfo {
            conn_id: "c1".into(),
            authenticated: true,
            scopes: vec!["operator.read".into()],
        };
        let response = dispatch(
            &state,
            &caller,
            request("sessions.delete", serde_json::json!({"sessionKey": "agent:main:main"})),
        )
        .await;
        assert_eq!(response.error.unwrap().code, codes::PERMISSION_DENIED);
    }

    #[tokio::test]
    async fn unknown_method_maps_to_jsonrpc_code() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let mut req = request("no.such.method", Value::Null);
        req.frame_type = None;
        req.jsonrpc = Some("2.0".into());

        let response = dispatch(&state, &operator(), req).await;
        let error = response.error.unwrap();
        assert_eq!(error.code, codes::METHOD_NOT_FOUND);
        assert_eq!(error.rpc_code, Some(-32601));
    }

    #[tokio::test]
    async fn bad_params_fail_invalid_request() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let response = dispatch(
            &state,
            &operator(),
            request("chat.send", serde_json::json!({"message": "no session key"})),
        )
        .await;
        assert_eq!(response.error.unwrap().code, codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn cron_add_update_remove_flow() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        let response = dispatch(
            &state,
            &operator(),
            request("cron.add", serde_json::json!({
                "job": {
                    "name": "digest",
                    "schedule": {"type": "every", "interval_ms": 60000},
                    "payload": {"kind": "system_event", "text": "tick"},
                }
            })),
        )
        .await;
        let job_id = response.result.unwrap()["id"].as_str().unwrap().to_owned();

        let response = dispatch(
            &state,
            &operator(),
            request("cron.update", serde_json::json!({
                "id": job_id,
                "patch": {"enabled": false, "name": "digest-v2"},
            })),
        )
        .await;
        let job = &response.result.unwrap()["job"];
        assert_eq!(job["enabled"], false);
        assert_eq!(job["name"], "digest-v2");

        let response = dispatch(
            &state,
            &operator(),
            request("cron.list", serde_json::json!({"includeDisabled": true})),
        )
        .await;
        assert_eq!(response.result.unwrap()["jobs"].as_array().unwrap().len(), 1);

        let response = dispatch(
            &state,
            &operator(),
            request("cron.remove", serde_json::json!({"id": job_id})),
        )
        .await;
        assert_eq!(response.result.unwrap()["removed"], true);
    }

    #[tokio::test]
    async fn cron_add_rejects_malformed_expression() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let response = dispatch(
            &state,
            &operator(),
            request("cron.add", serde_json::json!({
                "job": {
                    "name": "bad",
                    "schedule": {"type": "cron", "expression": "* *", "timezone": "UTC"},
                    "payload": {"kind": "system_event", "text": "x"},
                }
            })),
        )
        .await;
        assert_eq!(response.error.unwrap().code, codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn sessions_patch_and_list_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        state
            .store
            .ensure("agent:main:main", || {
                ag_sessions::store::SessionEntry::new("anthropic", "m1")
            })
            .unwrap();

        let response = dispatch(
            &state,
            &operator(),
            request("sessions.patch", serde_json::json!({
                "sessionKey": "agent:main:main",
                "patch": {"modelOverride": "m2", "sendPolicy": "deny"},
            })),
        )
        .await;
        assert_eq!(response.result.unwrap()["ok"], true);

        let response = dispatch(&state, &operator(), request("sessions.list", Value::Null)).await;
        let sessions = response.result.unwrap();
        let sessions = sessions["sessions"].as_array().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0]["model_override"], "m2");
        assert_eq!(sessions[0]["sessionKey"], "agent:main:main");
    }

    #[tokio::test]
    async fn spawn_depth_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        state
            .store
            .ensure("agent:main:main", || {
                let mut entry = ag_sessions::store::SessionEntry::new("anthropic", "m1");
                entry.spawn_depth = 8;
                entry
            })
            .unwrap();

        let response = dispatch(
            &state,
            &operator(),
            request("sessions.spawn", serde_json::json!({
                "parentKey": "agent:main:main",
                "prompt": "go deeper",
            })),
        )
        .await;
        assert_eq!(response.error.unwrap().code, codes::INVALID_REQUEST);
    }
}
