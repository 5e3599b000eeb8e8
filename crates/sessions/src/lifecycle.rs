//! Session reset lifecycle — daily boundary + idle timeout with
//! per-kind and per-channel overrides.
//!
//! Evaluated on every inbound message. A stale session gets a fresh
//! session id under the same key before the turn runs.

use chrono::{DateTime, Utc};

use ag_domain::config::{LifecycleConfig, PeerKind};

use crate::store::SessionEntry;

/// Reason a session was reset, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetReason {
    DailyReset { hour: u8 },
    IdleTimeout { idle_minutes: u32 },
}

impl std::fmt::Display for ResetReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DailyReset { hour } => write!(f, "daily reset (hour={hour})"),
            Self::IdleTimeout { idle_minutes } => write!(f, "idle timeout ({idle_minutes}m)"),
        }
    }
}

/// Evaluates whether a session should be reset.
pub struct LifecycleManager {
    config: LifecycleConfig,
}

impl LifecycleManager {
    pub fn new(config: LifecycleConfig) -> Self {
        Self { config }
    }

    /// Returns `Some(reason)` when the session is stale with respect to
    /// the effective rules for this channel/kind.
    pub fn should_reset(
        &self,
        entry: &SessionEntry,
        channel: &str,
        kind: PeerKind,
        now: DateTime<Utc>,
    ) -> Option<ResetReason> {
        let (daily_hour, idle_mins) = self.resolve_params(channel, kind);
        let last_active = DateTime::from_timestamp_millis(entry.updated_at)?;

        if let Some(hour) = daily_hour {
            if crossed_daily_boundary(last_active, now, hour) {
                return Some(ResetReason::DailyReset { hour });
            }
        }

        if let Some(idle) = idle_mins {
            let elapsed = now.signed_duration_since(last_active).num_minutes();
            if elapsed >= idle as i64 {
                return Some(ResetReason::IdleTimeout { idle_minutes: idle });
            }
        }

        None
    }

    /// Effective (daily_reset_hour, idle_minutes): per-channel overrides
    /// beat per-kind, which beat the global defaults.
    fn resolve_params(&self, channel: &str, kind: PeerKind) -> (Option<u8>, Option<u32>) {
        let mut daily = self.config.daily_reset_hour;
        let mut idle = self.config.idle_minutes;

        if let Some(ovr) = self.config.reset_by_kind.get(kind.as_str()) {
            if ovr.daily_reset_hour.is_some() {
                daily = ovr.daily_reset_hour;
            }
            if ovr.idle_minutes.is_some() {
                idle = ovr.idle_minutes;
            }
        }

        if let Some(ovr) = self.config.reset_by_channel.get(channel) {
            if ovr.daily_reset_hour.is_some() {
                daily = ovr.daily_reset_hour;
            }
            if ovr.idle_minutes.is_some() {
                idle = ovr.idle_minutes;
            }
        }

        (daily, idle)
    }
}

/// Whether the daily boundary at `hour:00` UTC was crossed between
/// `last_active` and `now`.
fn crossed_daily_boundary(last_active: DateTime<Utc>, now: DateTime<Utc>, hour: u8) -> bool {
    // Under a minute of inactivity never resets.
    if now.signed_duration_since(last_active).num_seconds() < 60 {
        return false;
    }

    let Some(today_boundary) = now.date_naive().and_hms_opt(hour as u32, 0, 0) else {
        // hour >= 24: invalid configuration — no boundary.
        return false;
    };
    let today_boundary = today_boundary.and_utc();

    let boundary = if now >= today_boundary {
        today_boundary
    } else {
        today_boundary - chrono::Duration::days(1)
    };

    last_active < boundary && now >= boundary
}
