//! Workspace bootstrap files.
//!
//! The workspace holds a deterministic ordered list of bootstrap files
//! (SOUL.md, INSTRUCTIONS.md, …) whose content is opaque to the core and
//! injected into the system prompt. First-seen timestamps are recorded in
//! `workspace-state.json` so onboarding flows can tell seeded files apart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use ag_domain::Result;
use ag_protocol::device::write_atomic;

/// One bootstrap file with its content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BootstrapFile {
    pub name: String,
    pub content: String,
}

/// Reads bootstrap files from the workspace directory.
pub struct WorkspaceReader {
    dir: PathBuf,
}

impl WorkspaceReader {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read the configured bootstrap files in order. Missing files are
    /// skipped; read failures on present files are logged and skipped.
    pub fn read_bootstrap_files(&self, names: &[String]) -> Vec<BootstrapFile> {
        let mut files = Vec::new();
        for name in names {
            let path = self.dir.join(name);
            if !path.exists() {
                continue;
            }
            match std::fs::read_to_string(&path) {
                Ok(content) => files.push(BootstrapFile { name: name.clone(), content }),
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "bootstrap file unreadable");
                }
            }
        }
        files
    }
}

/// First-seen timestamps for bootstrap files, persisted atomically to
/// `<state_dir>/workspace-state.json`.
pub struct SeedTracker {
    path: PathBuf,
    seeded: Mutex<HashMap<String, i64>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SeedState {
    #[serde(default)]
    seeded: HashMap<String, i64>,
}

impl SeedTracker {
    pub fn load(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join("workspace-state.json");
        let seeded = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str::<SeedState>(&raw)
                .map(|s| s.seeded)
                .unwrap_or_default()
        } else {
            HashMap::new()
        };
        Ok(Self { path, seeded: Mutex::new(seeded) })
    }

    /// Record any not-yet-seen files. Returns how many were new.
    pub fn record_seen(&self, files: &[BootstrapFile]) -> Result<usize> {
        let mut seeded = self.seeded.lock();
        let now = chrono::Utc::now().timestamp_millis();
        let mut added = 0;
        for file in files {
            if !seeded.contains_key(&file.name) {
                seeded.insert(file.name.clone(), now);
                added += 1;
            }
        }
        if added > 0 {
            let state = SeedState { seeded: seeded.clone() };
            write_atomic(&self.path, serde_json::to_string_pretty(&state)?.as_bytes())?;
        }
        Ok(added)
    }

    pub fn seeded_at(&self, name: &str) -> Option<i64> {
        self.seeded.lock().get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_files_in_configured_order_skipping_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("SOUL.md"), "be kind").unwrap();
        std::fs::write(dir.path().join("HOOKS.md"), "hooks").unwrap();

        let reader = WorkspaceReader::new(dir.path().to_path_buf());
        let files = reader.read_bootstrap_files(&[
            "SOUL.md".into(),
            "INSTRUCTIONS.md".into(),
            "HOOKS.md".into(),
        ]);
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["SOUL.md", "HOOKS.md"]);
        assert_eq!(files[0].content, "be kind");
    }

    #[test]
    fn seed_tracker_records_once() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = SeedTracker::load(dir.path()).unwrap();
        let files = vec![BootstrapFile { name: "SOUL.md".into(), content: "x".into() }];

        assert_eq!(tracker.record_seen(&files).unwrap(), 1);
        let first = tracker.seeded_at("SOUL.md").unwrap();
        assert_eq!(tracker.record_seen(&files).unwrap(), 0);
        assert_eq!(tracker.seeded_at("SOUL.md").unwrap(), first);

        // Survives reload.
        let tracker = SeedTracker::load(dir.path()).unwrap();
        assert_eq!(tracker.seeded_at("SOUL.md").unwrap(), first);
    }
}
