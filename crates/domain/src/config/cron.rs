use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cron service
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,

    /// Cap on run-log entries retained per job.
    #[serde(default = "d_run_log_cap")]
    pub run_log_cap: usize,

    /// Upper bound on a single scheduler sleep, so job mutations are picked
    /// up even with no wakeup notification.
    #[serde(default = "d_max_sleep_ms")]
    pub max_sleep_ms: u64,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            run_log_cap: d_run_log_cap(),
            max_sleep_ms: d_max_sleep_ms(),
        }
    }
}

fn d_true() -> bool {
    true
}
fn d_run_log_cap() -> usize {
    500
}
fn d_max_sleep_ms() -> u64 {
    30_000
}
