//! Cron persistence: `cron/jobs.json` plus one append-only JSONL run log
//! per job (`cron/runs/<job_id>.jsonl`, capped at the configured number
//! of entries by rewriting the tail).

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use parking_lot::RwLock;

use ag_domain::{Error, Result};
use ag_protocol::device::write_atomic;

use crate::cron::model::{CronJob, RunLogEntry};

pub struct CronStore {
    jobs_path: PathBuf,
    runs_dir: PathBuf,
    run_log_cap: usize,
    jobs: RwLock<HashMap<String, CronJob>>,
}

impl CronStore {
    pub fn load(state_dir: &std::path::Path, run_log_cap: usize) -> Result<Self> {
        let cron_dir = state_dir.join("cron");
        let runs_dir = cron_dir.join("runs");
        std::fs::create_dir_all(&runs_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            for dir in [&cron_dir, &runs_dir] {
                let _ = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700));
            }
        }

        let jobs_path = cron_dir.join("jobs.json");
        let jobs: HashMap<String, CronJob> = if jobs_path.exists() {
            let raw = std::fs::read_to_string(&jobs_path)?;
            serde_json::from_str::<Vec<CronJob>>(&raw)
                .map(|list| list.into_iter().map(|j| (j.id.clone(), j)).collect())
                .unwrap_or_default()
        } else {
            HashMap::new()
        };

        tracing::info!(jobs = jobs.len(), path = %jobs_path.display(), "cron store loaded");
        Ok(Self {
            jobs_path,
            runs_dir,
            run_log_cap,
            jobs: RwLock::new(jobs),
        })
    }

    pub fn add(&self, job: CronJob) -> Result<String> {
        let id = job.id.clone();
        self.jobs.write().insert(id.clone(), job);
        self.persist()?;
        Ok(id)
    }

    pub fn remove(&self, id: &str) -> Result<bool> {
        let removed = self.jobs.write().remove(id).is_some();
        if removed {
            self.persist()?;
            let log = self.run_log_path(id);
            if log.exists() {
                let _ = std::fs::remove_file(log);
            }
        }
        Ok(removed)
    }

    pub fn get(&self, id: &str) -> Option<CronJob> {
        self.jobs.read().get(id).cloned()
    }

    pub fn list(&self, include_disabled: bool) -> Vec<CronJob> {
        let mut jobs: Vec<CronJob> = self
            .jobs
            .read()
            .values()
            .filter(|j| include_disabled || j.enabled)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }

    pub fn job_count(&self) -> usize {
        self.jobs.read().len()
    }

    /// Mutate one job (enable/disable, post-fire bookkeeping) and persist.
    pub fn update<F>(&self, id: &str, mutate: F) -> Result<Option<CronJob>>
    where
        F: FnOnce(&mut CronJob),
    {
        let updated = {
            let mut jobs = self.jobs.write();
            match jobs.get_mut(id) {
                Some(job) => {
                    mutate(job);
                    job.updated_at = chrono::Utc::now().timestamp_millis();
                    Some(job.clone())
                }
                None => None,
            }
        };
        if updated.is_some() {
            self.persist()?;
        }
        Ok(updated)
    }

    /// Minimum `next_fire_at` over enabled jobs.
    pub fn next_fire_at(&self, now_ms: i64) -> Option<i64> {
        self.jobs
            .read()
            .values()
            .filter_map(|j| j.next_fire_at(now_ms))
            .min()
    }

    /// Enabled jobs due at `now_ms` (their next fire computed from
    /// `last_run_at` or creation is not in the future).
    pub fn due_jobs(&self, now_ms: i64) -> Vec<CronJob> {
        self.jobs
            .read()
            .values()
            .filter(|job| job.enabled && Self::is_due(job, now_ms))
            .cloned()
            .collect()
    }

    fn is_due(job: &CronJob, now_ms: i64) -> bool {
        let after = job.last_run_at.unwrap_or(job.created_at);
        match job.schedule.next_fire_at(after, job.created_at) {
            Some(fire_at) => fire_at <= now_ms,
            None => {
                // `at` schedules have no "next" once the instant passed;
                // they are due when never run and the instant is reached.
                if let crate::cron::model::Schedule::At { timestamp_ms } = job.schedule {
                    job.last_run_at.is_none() && timestamp_ms <= now_ms
                } else {
                    false
                }
            }
        }
    }

    // ── Run log ───────────────────────────────────────────────────────

    fn run_log_path(&self, job_id: &str) -> PathBuf {
        self.runs_dir.join(format!("{job_id}.jsonl"))
    }

    /// Append a run-log entry; rewrites the tail when the cap is hit.
    pub fn append_run_log(&self, job_id: &str, entry: &RunLogEntry) -> Result<()> {
        let path = self.run_log_path(job_id);
        let line = serde_json::to_string(entry)?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = file.set_permissions(std::fs::Permissions::from_mode(0o600));
        }
        writeln!(file, "{line}")?;

        let entries = self.read_run_log(job_id, usize::MAX)?;
        if entries.len() > self.run_log_cap {
            let tail = &entries[entries.len() - self.run_log_cap..];
            let mut buf = String::new();
            for entry in tail {
                buf.push_str(&serde_json::to_string(entry)?);
                buf.push('\n');
            }
            write_atomic(&path, buf.as_bytes())?;
        }
        Ok(())
    }

    /// Most recent `limit` run-log entries, oldest first.
    pub fn read_run_log(&self, job_id: &str, limit: usize) -> Result<Vec<RunLogEntry>> {
        let path = self.run_log_path(job_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&path)?;
        let mut entries: Vec<RunLogEntry> = raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        if entries.len() > limit {
            entries.drain(..entries.len() - limit);
        }
        Ok(entries)
    }

    fn persist(&self) -> Result<()> {
        let jobs = self.jobs.read();
        let mut list: Vec<&CronJob> = jobs.values().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let json = serde_json::to_string_pretty(&list)?;
        write_atomic(&self.jobs_path, json.as_bytes())
            .map_err(|e| Error::Store(format!("persisting cron jobs: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cron::model::{CronPayload, RunLogStatus, Schedule};

    fn store(cap: usize) -> (tempfile::TempDir, CronStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CronStore::load(dir.path(), cap).unwrap();
        (dir, store)
    }

    fn job(interval_ms: i64) -> CronJob {
        CronJob::new(
            "test",
            Schedule::Every { interval_ms, anchor_ms: Some(0) },
            CronPayload::SystemEvent { text: "hi".into() },
        )
    }

    #[test]
    fn add_list_remove_roundtrip() {
        let (dir, store) = store(500);
        let id = store.add(job(1_000)).unwrap();
        assert_eq!(store.list(false).len(), 1);

        // Survives reload.
        let reloaded = CronStore::load(dir.path(), 500).unwrap();
        assert!(reloaded.get(&id).is_some());

        assert!(store.remove(&id).unwrap());
        assert!(!store.remove(&id).unwrap());
        assert!(store.list(true).is_empty());
    }

    #[test]
    fn list_filters_disabled() {
        let (_dir, store) = store(500);
        let id = store.add(job(1_000)).unwrap();
        store.update(&id, |j| j.enabled = false).unwrap();
        assert!(store.list(false).is_empty());
        assert_eq!(store.list(true).len(), 1);
    }

    #[test]
    fn due_jobs_respect_last_run() {
        let (_dir, store) = store(500);
        let mut j = job(100);
        j.created_at = 0;
        let id = store.add(j).unwrap();

        // Never run, well past the first period.
        assert_eq!(store.due_jobs(250).len(), 1);

        store.update(&id, |j| j.last_run_at = Some(250)).unwrap();
        assert!(store.due_jobs(260).is_empty());
        assert_eq!(store.due_jobs(300).len(), 1);
    }

    #[test]
    fn at_job_is_due_once() {
        let (_dir, store) = store(500);
        let mut j = CronJob::new(
            "once",
            Schedule::At { timestamp_ms: 1_000 },
            CronPayload::SystemEvent { text: "x".into() },
        );
        j.created_at = 0;
        let id = store.add(j).unwrap();

        assert!(store.due_jobs(500).is_empty());
        assert_eq!(store.due_jobs(1_000).len(), 1);
        store.update(&id, |j| j.last_run_at = Some(1_000)).unwrap();
        assert!(store.due_jobs(2_000).is_empty());
    }

    #[test]
    fn run_log_appends_and_caps() {
        let (_dir, store) = store(3);
        let id = store.add(job(1_000)).unwrap();
        for i in 0..5 {
            store
                .append_run_log(&id, &RunLogEntry {
                    ts: i,
                    status: RunLogStatus::Ok,
                    duration_ms: 1,
                    error: None,
                    summary: None,
                })
                .unwrap();
        }
        let entries = store.read_run_log(&id, usize::MAX).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].ts, 2, "oldest entries rewritten away");

        let last_two = store.read_run_log(&id, 2).unwrap();
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[1].ts, 4);
    }
}
