//! Cron service — scheduler loop and payload dispatch.
//!
//! The loop sleeps until the earliest `next_fire_at` across enabled jobs
//! (bounded by `cron.max_sleep_ms`), wakes early on job mutations, fires
//! everything due, and records a run-log entry per fire.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use ag_domain::trace::TraceEvent;
use ag_domain::{Error, Result};
use ag_sessions::session_key::{session_key, SessionScope};
use ag_sessions::store::SessionEntry;

use crate::cron::model::{CronJob, CronPayload, RunLogEntry, RunLogStatus, Schedule, SessionTarget};
use crate::cron::store::CronStore;
use crate::runtime::chat_queue::{self, RunDelivery, SubmitParams};
use crate::state::AppState;

/// On-demand run modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Fire only if the job is currently due.
    Due,
    /// Fire unconditionally.
    Force,
}

pub struct CronService {
    pub store: CronStore,
    notify: Notify,
}

impl CronService {
    pub fn new(store: CronStore) -> Self {
        Self { store, notify: Notify::new() }
    }

    /// Wake the scheduler loop (after any job mutation).
    pub fn poke(&self) {
        self.notify.notify_one();
    }

    pub fn add_job(&self, job: CronJob) -> Result<String> {
        if let Schedule::Cron { expression, .. } = &job.schedule {
            if !crate::cron::eval::is_valid_expression(expression) {
                return Err(Error::Cron(format!("invalid cron expression: {expression}")));
            }
        }
        let id = self.store.add(job)?;
        self.poke();
        Ok(id)
    }

    pub fn remove_job(&self, id: &str) -> Result<bool> {
        let removed = self.store.remove(id)?;
        if removed {
            self.poke();
        }
        Ok(removed)
    }

    /// Apply a partial update to a job. Returns the updated record.
    pub fn update_job(&self, id: &str, patch: &crate::cron::model::JobPatch) -> Result<Option<CronJob>> {
        if let Some(Schedule::Cron { expression, .. }) = &patch.schedule {
            if !crate::cron::eval::is_valid_expression(expression) {
                return Err(Error::Cron(format!("invalid cron expression: {expression}")));
            }
        }
        let updated = self.store.update(id, |job| patch.apply(job))?;
        if updated.is_some() {
            self.poke();
        }
        Ok(updated)
    }

    /// Service status snapshot.
    pub fn status(&self, enabled: bool) -> serde_json::Value {
        let now = chrono::Utc::now().timestamp_millis();
        serde_json::json!({
            "enabled": enabled,
            "jobs": self.store.job_count(),
            "nextWakeAtMs": self.store.next_fire_at(now),
        })
    }

    /// Run one job on demand. Returns whether it actually fired.
    pub async fn run_job(&self, state: &AppState, id: &str, mode: RunMode) -> Result<bool> {
        let Some(job) = self.store.get(id) else {
            return Ok(false);
        };
        let now = chrono::Utc::now().timestamp_millis();
        if mode == RunMode::Due && !self.store.due_jobs(now).iter().any(|j| j.id == *id) {
            return Ok(false);
        }
        fire_job(state, &job).await;
        Ok(true)
    }

    /// The scheduler loop. Spawned once at startup.
    pub async fn run_loop(self: Arc<Self>, state: AppState) {
        let max_sleep = Duration::from_millis(state.config.cron.max_sleep_ms.max(50));
        loop {
            let now = chrono::Utc::now().timestamp_millis();
            let due = self.store.due_jobs(now);
            for job in due {
                fire_job(&state, &job).await;
            }

            let now = chrono::Utc::now().timestamp_millis();
            let sleep = match self.store.next_fire_at(now) {
                Some(next) => Duration::from_millis((next - now).max(0) as u64).min(max_sleep),
                None => max_sleep,
            };
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = self.notify.notified() => {}
            }
        }
    }
}

/// Fire one job: dispatch its payload, record the run log, and handle
/// post-fire bookkeeping (`at` jobs disable themselves).
async fn fire_job(state: &AppState, job: &CronJob) {
    let started = std::time::Instant::now();
    let fired_at = chrono::Utc::now().timestamp_millis();

    let result = dispatch_payload(state, job).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    let (status, error, summary) = match &result {
        Ok(summary) => (RunLogStatus::Ok, None, summary.clone()),
        Err(e) => (RunLogStatus::Error, Some(e.to_string()), None),
    };

    TraceEvent::CronFired {
        job_id: job.id.clone(),
        status: match status {
            RunLogStatus::Ok => "ok",
            RunLogStatus::Error => "error",
            RunLogStatus::Skipped => "skipped",
        }
        .to_owned(),
        duration_ms,
    }
    .emit();

    // The run counts even when the log write fails.
    if let Err(e) = state.cron.store.append_run_log(&job.id, &RunLogEntry {
        ts: fired_at,
        status,
        duration_ms,
        error,
        summary,
    }) {
        tracing::warn!(job_id = %job.id, error = %e, "run-log write failed");
    }

    let one_shot = matches!(job.schedule, Schedule::At { .. });
    let update = state.cron.store.update(&job.id, |j| {
        j.last_run_at = Some(fired_at);
        if one_shot {
            j.enabled = false;
        }
    });
    if let Err(e) = update {
        tracing::warn!(job_id = %job.id, error = %e, "post-fire job update failed");
    }
}

/// Dispatch a job's payload. Returns an optional run summary.
async fn dispatch_payload(state: &AppState, job: &CronJob) -> Result<Option<String>> {
    match &job.payload {
        CronPayload::SystemEvent { text } => {
            state
                .heartbeat
                .wake(&state.bus, text.clone(), job.wake_mode);
            state
                .bus
                .publish("cron.fired", serde_json::json!({ "jobId": job.id }));
            Ok(Some("system event".into()))
        }
        CronPayload::AgentTurn { prompt, model } => {
            let session_key = match job.session_target {
                SessionTarget::Main => session_key(
                    &state.config.session.default_agent,
                    &SessionScope::Main,
                ),
                SessionTarget::Isolated => {
                    format!("cron:{}:{}", job.id, uuid::Uuid::new_v4())
                }
            };

            let agent = &state.config.agent;
            state.store.ensure(&session_key, || {
                SessionEntry::new(&agent.model_provider, &agent.model)
            })?;

            let run_id = chat_queue::submit(state, SubmitParams {
                session_key: session_key.clone(),
                message: prompt.clone(),
                model_override: model.clone(),
                delivery: job.delivery.as_ref().map(|d| RunDelivery {
                    channel: d.channel.clone(),
                    target: d.target.clone(),
                    best_effort: d.best_effort,
                }),
                ..Default::default()
            })
            .map_err(|e| Error::Cron(e.to_string()))?;

            state.bus.publish(
                "cron.fired",
                serde_json::json!({ "jobId": job.id, "runId": run_id }),
            );
            Ok(Some(format!("run {run_id} on {session_key}")))
        }
    }
}
