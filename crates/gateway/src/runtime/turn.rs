//! Turn runner — executes one chat run: streams LLM events, dispatches
//! tools, loops on `tool_use`, and emits ordered run events on the bus.
//!
//! Ordering invariants kept here:
//! - every `chat.delta` for a run precedes its `chat.final`;
//! - `chat.tool_start` precedes the matching `chat.tool_end`;
//! - an assistant message with tool calls is appended to the history
//!   before any of its tool results.

use futures_util::StreamExt;
use serde_json::Value;

use ag_domain::tool::{Message, Role, ToolCall};
use ag_llm::{LlmEvent, LlmRequest, StopReason, Usage};
use ag_sessions::store::SessionEntry;

use crate::hooks::HookContext;
use crate::runtime::agents::assemble_system_prompt;
use crate::runtime::chat_queue::ChatRun;
use crate::runtime::coalesce::DeltaCoalescer;
use crate::state::AppState;

/// Tool-loop iterations before the run is force-failed.
const MAX_TOOL_LOOPS: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Failed,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub final_text: String,
}

impl RunOutcome {
    fn aborted() -> Self {
        Self { status: RunStatus::Aborted, final_text: String::new() }
    }
    fn failed() -> Self {
        Self { status: RunStatus::Failed, final_text: String::new() }
    }
}

/// Run one chat turn to completion (which may span multiple LLM calls
/// through the tool loop).
pub async fn run_chat_turn(state: &AppState, run: &ChatRun) -> RunOutcome {
    let started = std::time::Instant::now();
    let run_id = run.run_id.clone();

    state.bus.publish_run(
        &run_id,
        "chat.started",
        serde_json::json!({ "runId": run_id, "sessionKey": run.session_key }),
    );
    ag_domain::trace::TraceEvent::RunStarted {
        run_id: run_id.clone(),
        session_key: run.session_key.clone(),
    }
    .emit();

    let outcome = run_turn_inner(state, run).await;

    if outcome.status == RunStatus::Aborted {
        state.chat.mark_aborted(&run_id);
        state.bus.publish_run(
            &run_id,
            "chat.aborted",
            serde_json::json!({ "runId": run_id }),
        );
    }

    ag_domain::trace::TraceEvent::RunFinished {
        run_id,
        status: match outcome.status {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
        }
        .to_owned(),
        duration_ms: started.elapsed().as_millis() as u64,
    }
    .emit();

    outcome
}

async fn run_turn_inner(state: &AppState, run: &ChatRun) -> RunOutcome {
    let run_id = run.run_id.clone();
    let agent_id = state.agent_id_for_key(&run.session_key);

    // ── Resolve the session entry (created by routing; synthesize for
    //    cron-isolated keys that skip routing) ────────────────────────
    let entry = match ensure_entry(state, &run.session_key) {
        Ok(entry) => entry,
        Err(e) => {
            emit_error(state, &run_id, &e.to_string(), "store");
            return RunOutcome::failed();
        }
    };

    let session = state
        .agents
        .get_or_create(&entry.session_id, &run.session_key, &agent_id);
    let ctx = HookContext {
        agent_id: agent_id.clone(),
        session_id: entry.session_id.clone(),
        session_key: run.session_key.clone(),
    };

    // ── System prompt assembly (first turn or after invalidation) ─────
    let needs_prompt = session.lock().system_prompt.is_none();
    if needs_prompt {
        let (prompt, report) =
            assemble_system_prompt(&state.config.agent, &state.workspace, &state.hooks, &ctx)
                .await;
        session.lock().system_prompt = Some(prompt);
        if let Err(e) = state
            .store
            .update_entry(&run.session_key, |e| e.system_prompt_report = Some(report.clone()))
        {
            tracing::warn!(error = %e, "failed to persist system prompt report");
        }
    }

    // ── Lifecycle hooks up to agent start ─────────────────────────────
    let hook_payload = serde_json::json!({
        "sessionKey": run.session_key,
        "runId": run_id,
        "message": run.message,
    });
    state.hooks.emit("session_start", hook_payload.clone(), &ctx).await;
    state.hooks.emit("before_prompt_build", hook_payload.clone(), &ctx).await;
    state.hooks.emit("before_model_resolve", hook_payload.clone(), &ctx).await;
    let overrides = state
        .hooks
        .emit_before_agent_start(hook_payload.clone(), &ctx)
        .await;

    let mut system_prompt = session
        .lock()
        .system_prompt
        .clone()
        .unwrap_or_default();
    if let Some(replacement) = overrides.system_prompt {
        system_prompt = replacement;
    }
    if let Some(prepend) = overrides.prepend_context {
        system_prompt = format!("{prepend}\n\n{system_prompt}");
    }

    // ── Outgoing message list ─────────────────────────────────────────
    session.lock().messages.push(Message::user(&run.message));
    let mut outgoing: Vec<Message> = {
        let session = session.lock();
        let mut messages = Vec::with_capacity(session.messages.len() + 1);
        messages.push(Message::system(&system_prompt));
        messages.extend(session.messages.iter().cloned());
        messages
    };

    // llm_input handlers may rewrite the outgoing list.
    let input_results = state
        .hooks
        .emit(
            "llm_input",
            serde_json::json!({ "messages": outgoing }),
            &ctx,
        )
        .await;
    for result in input_results {
        if let Some(messages) = result.get("messages") {
            match serde_json::from_value::<Vec<Message>>(messages.clone()) {
                Ok(replacement) => outgoing = replacement,
                Err(e) => tracing::warn!(error = %e, "llm_input hook returned invalid messages"),
            }
        }
    }

    // ── Delta coalescers (text and thinking share the debounce rule) ──
    let delta_sink = run_event_sink(state, &run_id, "chat.delta");
    let text_coalescer = DeltaCoalescer::new(move |text| delta_sink(text));
    let thinking_sink = run_event_sink(state, &run_id, "chat.thinking");
    let thinking_coalescer = DeltaCoalescer::new(move |text| thinking_sink(text));

    let model = run
        .model_override
        .clone()
        .or_else(|| entry.model_override.clone())
        .or_else(|| entry.model.clone());

    let mut total_usage = Usage::default();
    let mut final_text = String::new();
    let mut final_stop_reason = StopReason::EndTurn;

    // ── Tool loop ─────────────────────────────────────────────────────
    for loop_idx in 0..MAX_TOOL_LOOPS {
        tracing::debug!(run_id = %run_id, loop_idx, "llm call");
        if run.abort.is_cancelled() {
            return RunOutcome::aborted();
        }

        let request = LlmRequest {
            messages: sanitize_tool_messages(&outgoing),
            tools: state.tools.definitions(),
            model: model.clone(),
            max_tokens: Some(state.config.agent.max_tokens),
            temperature: Some(state.config.agent.temperature),
            session_id: entry.session_id.clone(),
        };

        let mut stream = match state.llm.chat_stream(request).await {
            Ok(stream) => stream,
            Err(e) => {
                text_coalescer.flush();
                emit_error(state, &run_id, &e.to_string(), "llm_connect");
                return RunOutcome::failed();
            }
        };

        let mut text_buf = String::new();
        let mut pending_tool_calls: Vec<ToolCall> = Vec::new();
        let mut stop_reason = StopReason::EndTurn;
        let mut turn_usage: Option<Usage> = None;
        let mut stream_failed = false;

        while let Some(event) = stream.next().await {
            if run.abort.is_cancelled() {
                return RunOutcome::aborted();
            }
            match event {
                LlmEvent::TextDelta { text } => {
                    text_buf.push_str(&text);
                    text_coalescer.push(&text);
                }
                LlmEvent::ThinkingDelta { text } => {
                    thinking_coalescer.push(&text);
                }
                LlmEvent::ToolCallEnd { id, name, arguments } => {
                    pending_tool_calls.push(ToolCall {
                        call_id: id,
                        tool_name: name,
                        arguments,
                    });
                }
                LlmEvent::Done { stop_reason: reason, usage } => {
                    stop_reason = reason;
                    turn_usage = usage;
                }
                LlmEvent::Error { message, reason } => {
                    text_coalescer.flush();
                    thinking_coalescer.flush();
                    emit_error(state, &run_id, &message, &reason);
                    stream_failed = true;
                    break;
                }
            }
        }
        if stream_failed {
            return RunOutcome::failed();
        }

        state
            .hooks
            .emit(
                "llm_output",
                serde_json::json!({ "text": text_buf, "stopReason": stop_reason }),
                &ctx,
            )
            .await;

        if let Some(usage) = &turn_usage {
            total_usage.add(usage);
        }

        // ── No tool calls → final answer ──────────────────────────────
        if stop_reason != StopReason::ToolUse || pending_tool_calls.is_empty() {
            final_text = text_buf;
            final_stop_reason = stop_reason;
            break;
        }

        // ── Tool dispatch ────────────────────────────────────────────
        // The assistant message is appended before any tool results so
        // the persisted ordering always pairs calls before results.
        let assistant = Message::assistant_with_tool_calls(&text_buf, &pending_tool_calls);
        session.lock().messages.push(assistant.clone());
        outgoing.push(assistant);

        for tc in &pending_tool_calls {
            if run.abort.is_cancelled() {
                return RunOutcome::aborted();
            }

            state.bus.publish_run(
                &run_id,
                "chat.tool_start",
                serde_json::json!({
                    "runId": run_id,
                    "toolCallId": tc.call_id,
                    "name": tc.tool_name,
                    "arguments": tc.arguments,
                }),
            );

            // before_tool_call handlers may rewrite the arguments.
            let mut arguments = tc.arguments.clone();
            let results = state
                .hooks
                .emit(
                    "before_tool_call",
                    serde_json::json!({
                        "toolCallId": tc.call_id,
                        "name": tc.tool_name,
                        "arguments": arguments,
                    }),
                    &ctx,
                )
                .await;
            for result in results {
                if let Some(replacement) = result.get("arguments") {
                    arguments = replacement.clone();
                }
            }

            let dispatch = state
                .tools
                .dispatch(&tc.tool_name, &tc.call_id, arguments, run.abort.clone())
                .await;

            if run.abort.is_cancelled() {
                return RunOutcome::aborted();
            }

            let result_payload = serde_json::json!({
                "toolCallId": tc.call_id,
                "name": tc.tool_name,
                "result": dispatch.content,
                "isError": dispatch.is_error,
            });
            state
                .hooks
                .emit("after_tool_call", result_payload.clone(), &ctx)
                .await;
            state
                .hooks
                .emit("tool_result_persist", result_payload.clone(), &ctx)
                .await;

            let tool_message =
                Message::tool_result(&tc.call_id, &dispatch.content, dispatch.is_error);
            session.lock().messages.push(tool_message.clone());
            outgoing.push(tool_message);

            state.bus.publish_run(
                &run_id,
                "chat.tool_end",
                serde_json::json!({
                    "runId": run_id,
                    "toolCallId": tc.call_id,
                    "result": dispatch.content,
                    "isError": dispatch.is_error,
                }),
            );
        }

        if loop_idx == MAX_TOOL_LOOPS - 1 {
            text_coalescer.flush();
            thinking_coalescer.flush();
            emit_error(
                state,
                &run_id,
                &format!("tool loop limit reached ({MAX_TOOL_LOOPS} iterations)"),
                "tool_loop_limit",
            );
            return RunOutcome::failed();
        }
    }

    // ── Finalize ──────────────────────────────────────────────────────
    text_coalescer.flush();
    thinking_coalescer.flush();

    let final_message = Message::assistant(&final_text);
    state
        .hooks
        .emit(
            "before_message_write",
            serde_json::json!({ "message": final_message }),
            &ctx,
        )
        .await;
    session.lock().messages.push(final_message.clone());

    if let Err(e) = state.store.update_entry(&run.session_key, |e| {
        e.record_usage(total_usage.input_tokens as u64, total_usage.output_tokens as u64);
    }) {
        tracing::warn!(error = %e, "failed to record usage");
    }

    let mut final_payload = serde_json::json!({
        "runId": run_id,
        "sessionKey": run.session_key,
        "message": final_message,
        "usage": { "input": total_usage.input_tokens, "output": total_usage.output_tokens },
        "stopReason": final_stop_reason,
    });
    if let Some(delivery) = &run.delivery {
        final_payload["delivery"] =
            serde_json::json!({ "channel": delivery.channel, "target": delivery.target });
    }
    state.bus.publish_run(&run_id, "chat.final", final_payload);

    state.hooks.emit("agent_end", Value::Null, &ctx).await;
    state.hooks.emit("session_end", Value::Null, &ctx).await;

    RunOutcome { status: RunStatus::Completed, final_text }
}

/// Sink for coalesced run deltas; suppresses output once the run has been
/// aborted (late flush timers).
fn run_event_sink(
    state: &AppState,
    run_id: &str,
    event: &'static str,
) -> impl Fn(String) + Send + Sync + 'static {
    let bus = state.bus.clone();
    let chat = state.chat.clone();
    let run_id = run_id.to_owned();
    move |text: String| {
        if chat.is_aborted(&run_id) {
            return;
        }
        bus.publish_run(
            &run_id,
            event,
            serde_json::json!({ "runId": run_id, "text": text }),
        );
    }
}

fn emit_error(state: &AppState, run_id: &str, message: &str, reason: &str) {
    state.bus.publish_run(
        run_id,
        "chat.error",
        serde_json::json!({ "runId": run_id, "message": message, "reason": reason }),
    );
}

fn ensure_entry(state: &AppState, session_key: &str) -> ag_domain::Result<SessionEntry> {
    let config = &state.config.agent;
    let (entry, _is_new) = state.store.ensure(session_key, || {
        SessionEntry::new(&config.model_provider, &config.model)
    })?;
    Ok(entry)
}

/// Drop tool messages whose `tool_call_id` does not match a call id in
/// the closest preceding assistant message. Providers that enforce ID
/// pairing reject requests with orphaned results.
pub fn sanitize_tool_messages(messages: &[Message]) -> Vec<Message> {
    let mut sanitized = Vec::with_capacity(messages.len());
    let mut live_call_ids: Vec<String> = Vec::new();

    for message in messages {
        match message.role {
            Role::Assistant => {
                live_call_ids = message
                    .tool_call_ids()
                    .into_iter()
                    .map(str::to_owned)
                    .collect();
                sanitized.push(message.clone());
            }
            Role::Tool => {
                let id_matches = message
                    .tool_result_id()
                    .is_some_and(|id| live_call_ids.iter().any(|live| live == id));
                if id_matches {
                    sanitized.push(message.clone());
                } else {
                    tracing::warn!(
                        tool_call_id = ?message.tool_result_id(),
                        "dropping tool message with unmatched tool_call_id"
                    );
                }
            }
            _ => sanitized.push(message.clone()),
        }
    }
    sanitized
}
