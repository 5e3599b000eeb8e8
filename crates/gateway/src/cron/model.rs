//! Cron job data model.

use serde::{Deserialize, Serialize};

use crate::cron::eval;
use crate::server::heartbeat::WakeMode;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Schedule variants
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Fires exactly once; the job is disabled after firing.
    At { timestamp_ms: i64 },
    /// Fires every `interval_ms` from `anchor_ms` (default: creation).
    Every {
        interval_ms: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        anchor_ms: Option<i64>,
    },
    /// Standard 5-field cron in an IANA timezone.
    Cron { expression: String, timezone: String },
}

impl Schedule {
    /// Next fire instant strictly after `now_ms`, or `None` when the
    /// schedule has no future occurrence.
    pub fn next_fire_at(&self, now_ms: i64, created_at_ms: i64) -> Option<i64> {
        match self {
            Schedule::At { timestamp_ms } => (*timestamp_ms > now_ms).then_some(*timestamp_ms),
            Schedule::Every { interval_ms, anchor_ms } => {
                if *interval_ms <= 0 {
                    return None;
                }
                let anchor = anchor_ms.unwrap_or(created_at_ms);
                if now_ms < anchor {
                    return Some(anchor);
                }
                let elapsed = now_ms - anchor;
                let periods = elapsed / interval_ms + 1;
                Some(anchor + periods * interval_ms)
            }
            Schedule::Cron { expression, timezone } => {
                let tz = eval::parse_tz(timezone);
                let after = chrono::DateTime::from_timestamp_millis(now_ms)?;
                eval::cron_next_tz(expression, &after, tz).map(|dt| dt.timestamp_millis())
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payload & delivery
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CronPayload {
    /// Broadcast a `system.event`; no agent turn.
    SystemEvent { text: String },
    /// Enqueue a chat run with `prompt` as the user message.
    AgentTurn {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionTarget {
    #[default]
    Main,
    /// A fresh `cron:<job_id>:<uuid>` session per fire.
    Isolated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobDelivery {
    pub channel: String,
    pub target: String,
    #[serde(default)]
    pub best_effort: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Job record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: String,
    pub name: String,
    #[serde(default = "d_true")]
    pub enabled: bool,
    pub schedule: Schedule,
    #[serde(default)]
    pub session_target: SessionTarget,
    #[serde(default = "d_wake_mode")]
    pub wake_mode: WakeMode,
    pub payload: CronPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<JobDelivery>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<i64>,
}

fn d_true() -> bool {
    true
}
fn d_wake_mode() -> WakeMode {
    WakeMode::Now
}

impl CronJob {
    pub fn new(name: &str, schedule: Schedule, payload: CronPayload) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_owned(),
            enabled: true,
            schedule,
            session_target: SessionTarget::default(),
            wake_mode: d_wake_mode(),
            payload,
            delivery: None,
            created_at: now,
            updated_at: now,
            last_run_at: None,
        }
    }

    pub fn next_fire_at(&self, now_ms: i64) -> Option<i64> {
        if !self.enabled {
            return None;
        }
        self.schedule.next_fire_at(now_ms, self.created_at)
    }
}

/// Partial update applied through `cron.update`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPatch {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub schedule: Option<Schedule>,
    pub session_target: Option<SessionTarget>,
    pub wake_mode: Option<WakeMode>,
    pub payload: Option<CronPayload>,
    /// `Some(None)` clears the delivery; `None` leaves it untouched.
    #[serde(default, with = "double_option")]
    pub delivery: Option<Option<JobDelivery>>,
}

impl JobPatch {
    pub fn apply(&self, job: &mut CronJob) {
        if let Some(name) = &self.name {
            job.name = name.clone();
        }
        if let Some(enabled) = self.enabled {
            job.enabled = enabled;
        }
        if let Some(schedule) = &self.schedule {
            job.schedule = schedule.clone();
        }
        if let Some(target) = self.session_target {
            job.session_target = target;
        }
        if let Some(wake_mode) = self.wake_mode {
            job.wake_mode = wake_mode;
        }
        if let Some(payload) = &self.payload {
            job.payload = payload.clone();
        }
        if let Some(delivery) = &self.delivery {
            job.delivery = delivery.clone();
        }
    }
}

/// Distinguishes an absent field from an explicit `null`.
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D, T>(de: D) -> Result<Option<Option<T>>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        Option::<T>::deserialize(de).map(Some)
    }
}

/// One entry in a job's rolling run log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub ts: i64,
    pub status: RunLogStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunLogStatus {
    Ok,
    Error,
    Skipped,
}
