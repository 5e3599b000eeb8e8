//! Chat run queue — per-session FIFO of runs with one worker per active
//! session, plus the aborted-run set that suppresses late deltas.
//!
//! At most one run is `running` per session key; the worker picks the
//! head pending entry, executes the turn, removes it, and exits when the
//! queue drains. Aborted run ids are retained for five minutes so stray
//! events from a cancelled LLM stream are dropped silently.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;

use ag_domain::CancelToken;
use ag_sessions::store::{QueueDrop, QueueMode};

use crate::runtime::turn::{self, RunStatus};
use crate::state::AppState;

/// How long aborted run ids are remembered.
pub const ABORTED_TTL_MS: i64 = 300_000;

/// Forwarding target for a run's final text (cron job delivery).
#[derive(Debug, Clone)]
pub struct RunDelivery {
    pub channel: String,
    pub target: String,
    pub best_effort: bool,
}

/// One queued chat request.
pub struct ChatRun {
    pub run_id: String,
    /// Echo of the client's idempotency key, when provided.
    pub client_run_id: Option<String>,
    pub session_key: String,
    /// Originating connection; `None` for cron-initiated runs.
    pub conn_id: Option<String>,
    pub message: String,
    pub model_override: Option<String>,
    pub delivery: Option<RunDelivery>,
    pub started_at: i64,
    pub abort: CancelToken,
}

/// Queueing policy taken from the session entry at enqueue time.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueuePolicy {
    pub mode: QueueMode,
    pub cap: Option<usize>,
    pub drop: QueueDrop,
}

/// Enqueue rejection.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("session queue is full")]
    QueueFull,
}

#[derive(Default)]
pub struct ChatQueue {
    queues: Mutex<HashMap<String, VecDeque<ChatRun>>>,
    workers: Mutex<HashSet<String>>,
    running: Mutex<HashMap<String, RunningRun>>,
    aborted: Mutex<HashMap<String, i64>>,
}

struct RunningRun {
    session_key: String,
    abort: CancelToken,
}

impl ChatQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a run and make sure the session worker is alive.
    /// Returns the run id the caller should watch.
    pub fn enqueue(
        &self,
        state: &AppState,
        run: ChatRun,
        policy: QueuePolicy,
    ) -> Result<String, EnqueueError> {
        let session_key = run.session_key.clone();
        let run_id = run.run_id.clone();

        {
            let mut queues = self.queues.lock();
            let queue = queues.entry(session_key.clone()).or_default();

            // `collect` folds rapid follow-ups into the tail pending entry
            // instead of starting another turn.
            if policy.mode == QueueMode::Collect {
                if let Some(tail) = queue.back_mut() {
                    tail.message.push_str("\n\n");
                    tail.message.push_str(&run.message);
                    return Ok(tail.run_id.clone());
                }
            }

            if let Some(cap) = policy.cap {
                if queue.len() >= cap {
                    match policy.drop {
                        QueueDrop::New => return Err(EnqueueError::QueueFull),
                        // `summarize` is reserved; it degrades to `old`.
                        QueueDrop::Old | QueueDrop::Summarize => {
                            if let Some(dropped) = queue.pop_front() {
                                tracing::warn!(
                                    session_key = %session_key,
                                    run_id = %dropped.run_id,
                                    "queue cap reached, dropping oldest pending run"
                                );
                                self.mark_aborted(&dropped.run_id);
                            }
                        }
                    }
                }
            }

            queue.push_back(run);
        }

        self.ensure_worker(state, &session_key);
        Ok(run_id)
    }

    fn ensure_worker(&self, state: &AppState, session_key: &str) {
        let mut workers = self.workers.lock();
        if workers.contains(session_key) {
            return;
        }
        workers.insert(session_key.to_owned());

        let state = state.clone();
        let session_key = session_key.to_owned();
        tokio::spawn(async move {
            session_worker(state, session_key).await;
        });
    }

    fn pop_next(&self, session_key: &str) -> Option<ChatRun> {
        let run = self.queues.lock().get_mut(session_key)?.pop_front()?;
        self.running.lock().insert(run.run_id.clone(), RunningRun {
            session_key: session_key.to_owned(),
            abort: run.abort.clone(),
        });
        Some(run)
    }

    fn finish_run(&self, run_id: &str) {
        self.running.lock().remove(run_id);
    }

    /// Worker exit protocol: only drop the worker flag when the queue is
    /// confirmed empty under both locks, so a racing enqueue either sees
    /// the flag or a fresh worker is spawned for it.
    fn try_retire_worker(&self, session_key: &str) -> bool {
        let queues = self.queues.lock();
        let empty = queues
            .get(session_key)
            .is_none_or(|queue| queue.is_empty());
        if empty {
            self.workers.lock().remove(session_key);
        }
        empty
    }

    /// Abort a run. With a run id, targets that run (running or pending);
    /// without, targets the session's currently running run.
    /// Returns `true` when something was aborted.
    pub fn abort(&self, state: &AppState, session_key: &str, run_id: Option<&str>) -> bool {
        match run_id {
            Some(run_id) => {
                if let Some(running) = self.running.lock().get(run_id) {
                    if running.session_key == session_key {
                        running.abort.cancel();
                        return true;
                    }
                    return false;
                }
                // Not running — maybe still pending.
                let removed = {
                    let mut queues = self.queues.lock();
                    match queues.get_mut(session_key) {
                        Some(queue) => {
                            let before = queue.len();
                            queue.retain(|r| r.run_id != run_id);
                            before != queue.len()
                        }
                        None => false,
                    }
                };
                if removed {
                    self.mark_aborted(run_id);
                    state.bus.publish_run(
                        run_id,
                        "chat.aborted",
                        serde_json::json!({ "runId": run_id }),
                    );
                }
                removed
            }
            None => {
                let running = self.running.lock();
                let current = running
                    .values()
                    .find(|r| r.session_key == session_key);
                match current {
                    Some(run) => {
                        run.abort.cancel();
                        true
                    }
                    None => false,
                }
            }
        }
    }

    /// Record an aborted run id (late deltas for it are dropped).
    pub fn mark_aborted(&self, run_id: &str) {
        self.aborted
            .lock()
            .insert(run_id.to_owned(), now_ms());
    }

    pub fn is_aborted(&self, run_id: &str) -> bool {
        self.aborted.lock().contains_key(run_id)
    }

    /// Drop aborted entries older than [`ABORTED_TTL_MS`].
    pub fn prune_aborted(&self) -> usize {
        let cutoff = now_ms() - ABORTED_TTL_MS;
        let mut aborted = self.aborted.lock();
        let before = aborted.len();
        aborted.retain(|_, ts| *ts > cutoff);
        before - aborted.len()
    }

    pub fn pending_count(&self, session_key: &str) -> usize {
        self.queues
            .lock()
            .get(session_key)
            .map_or(0, |queue| queue.len())
    }

    pub fn is_running(&self, session_key: &str) -> bool {
        self.running
            .lock()
            .values()
            .any(|r| r.session_key == session_key)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Parameters for submitting a new run.
#[derive(Default)]
pub struct SubmitParams {
    pub session_key: String,
    pub message: String,
    pub conn_id: Option<String>,
    pub client_run_id: Option<String>,
    pub model_override: Option<String>,
    pub delivery: Option<RunDelivery>,
}

/// Build a run from the session's queue policy and enqueue it.
/// The single entry point used by the RPC layer, the auto-reply
/// pipeline, and the cron dispatcher.
pub fn submit(state: &AppState, params: SubmitParams) -> Result<String, EnqueueError> {
    let policy = state
        .store
        .get(&params.session_key)
        .map(|entry| QueuePolicy {
            mode: entry.queue_mode,
            cap: entry.queue_cap,
            drop: entry.queue_drop,
        })
        .unwrap_or_default();

    let run = ChatRun {
        run_id: uuid::Uuid::new_v4().to_string(),
        client_run_id: params.client_run_id,
        session_key: params.session_key,
        conn_id: params.conn_id,
        message: params.message,
        model_override: params.model_override,
        delivery: params.delivery,
        started_at: now_ms(),
        abort: CancelToken::new(),
    };
    state.chat.enqueue(state, run, policy)
}

/// Drains a session's queue serially, then retires.
async fn session_worker(state: AppState, session_key: String) {
    loop {
        let Some(run) = state.chat.pop_next(&session_key) else {
            if state.chat.try_retire_worker(&session_key) {
                return;
            }
            continue;
        };

        let outcome = turn::run_chat_turn(&state, &run).await;
        state.chat.finish_run(&run.run_id);

        if outcome.status == RunStatus::Completed {
            forward_delivery(&state, &run, &outcome.final_text).await;
        }
    }
}

/// Forward a completed run's text: explicit job delivery first, else the
/// session's default delivery context (unless its send policy denies).
async fn forward_delivery(state: &AppState, run: &ChatRun, text: &str) {
    if text.is_empty() {
        return;
    }

    if let Some(delivery) = &run.delivery {
        if let Err(e) = state
            .channels
            .deliver(&delivery.channel, &delivery.target, text)
            .await
        {
            if delivery.best_effort {
                tracing::debug!(channel = %delivery.channel, error = %e, "best-effort delivery failed");
            } else {
                tracing::error!(channel = %delivery.channel, error = %e, "delivery failed");
            }
        }
        return;
    }

    let Some(entry) = state.store.get(&run.session_key) else {
        return;
    };
    if entry.send_policy == Some(ag_sessions::store::SendPolicy::Deny) {
        return;
    }
    let Some(ctx) = &entry.delivery_context else {
        return;
    };
    let (Some(channel), Some(to)) = (ctx.channel.as_deref(), ctx.to.as_deref()) else {
        return;
    };
    if let Err(e) = state.channels.deliver(channel, to, text).await {
        tracing::warn!(channel = %channel, to = %to, error = %e, "outbound delivery failed");
    }
}
