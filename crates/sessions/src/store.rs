//! Persisted session store.
//!
//! Maps canonical session keys to [`SessionEntry`] records in
//! `<state_dir>/sessions/store.json`. All mutations go through
//! [`SessionStore::update`]: read → mutate → write-temp → fsync → rename,
//! under an exclusive lock (in-process mutex + advisory file lock on a
//! sentinel, so concurrent gateway processes serialize too). Readers
//! snapshot without locking; they may observe a slightly stale view but
//! never a torn write.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use ag_domain::trace::TraceEvent;
use ag_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session entry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Default delivery route for outbound messages from a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupActivation {
    Mention,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendPolicy {
    Allow,
    Deny,
}

/// Queueing behavior for messages arriving while a run is active.
/// Only `queue` (FIFO) and `collect` are wired; the rest are reserved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    Steer,
    Followup,
    Collect,
    #[default]
    Queue,
    Interrupt,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueDrop {
    #[default]
    Old,
    New,
    Summarize,
}

/// Snapshot of skills enabled for a session when its prompt was built.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillsSnapshot {
    #[serde(default)]
    pub enabled: HashMap<String, bool>,
}

/// Report of the last system prompt build.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemPromptReport {
    #[serde(default)]
    pub built_at: Option<i64>,
    #[serde(default)]
    pub sections: Vec<String>,
}

/// One session's persisted metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    /// UUID, immutable once set (a reset mints a new one under the same key).
    pub session_id: String,
    /// Last update, ms since epoch. Monotone non-decreasing per key.
    pub updated_at: i64,
    /// Parent session key for spawned sub-agent sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawned_by: Option<String>,

    // ── Token counters ───────────────────────────────────────────────
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub context_tokens: u64,
    #[serde(default)]
    pub compaction_count: u32,

    // ── Model ────────────────────────────────────────────────────────
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_override: Option<String>,

    // ── Behavior flags ───────────────────────────────────────────────
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbose_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elevated_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_activation: Option<GroupActivation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_policy: Option<SendPolicy>,
    #[serde(default)]
    pub queue_mode: QueueMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_cap: Option<usize>,
    #[serde(default)]
    pub queue_drop: QueueDrop,

    // ── Routing hints ────────────────────────────────────────────────
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_thread_id: Option<String>,

    // ── Delivery & derived ───────────────────────────────────────────
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_context: Option<DeliveryContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skills_snapshot: Option<SkillsSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_report: Option<SystemPromptReport>,

    /// 0 = main, 1 = sub-agent, … (chain length to root, max 8).
    #[serde(default)]
    pub spawn_depth: u8,
}

impl SessionEntry {
    /// Fresh entry for a newly resolved key.
    pub fn new(model_provider: &str, model: &str) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            updated_at: now_ms(),
            spawned_by: None,
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            context_tokens: 0,
            compaction_count: 0,
            model_provider: Some(model_provider.to_owned()),
            model: Some(model.to_owned()),
            provider_override: None,
            model_override: None,
            thinking_level: None,
            verbose_level: None,
            reasoning_level: None,
            elevated_level: None,
            chat_type: None,
            group_activation: None,
            send_policy: None,
            queue_mode: QueueMode::default(),
            queue_cap: None,
            queue_drop: QueueDrop::default(),
            channel: None,
            last_channel: None,
            last_to: None,
            last_account_id: None,
            last_thread_id: None,
            delivery_context: None,
            skills_snapshot: None,
            system_prompt_report: None,
            spawn_depth: 0,
        }
    }

    /// Bump `updated_at`, keeping it monotone.
    pub fn touch(&mut self) {
        self.updated_at = self.updated_at.max(now_ms());
    }

    pub fn record_usage(&mut self, input_tokens: u64, output_tokens: u64) {
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
        self.total_tokens = self.input_tokens + self.output_tokens;
        self.touch();
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Partial update applied through `sessions.patch`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPatch {
    pub model_override: Option<String>,
    pub provider_override: Option<String>,
    pub thinking_level: Option<String>,
    pub verbose_level: Option<String>,
    pub reasoning_level: Option<String>,
    pub elevated_level: Option<String>,
    pub send_policy: Option<SendPolicy>,
    pub group_activation: Option<GroupActivation>,
    pub queue_mode: Option<QueueMode>,
    pub queue_cap: Option<usize>,
    pub queue_drop: Option<QueueDrop>,
}

impl SessionPatch {
    pub fn apply(&self, entry: &mut SessionEntry) {
        macro_rules! set {
            ($field:ident) => {
                if let Some(v) = &self.$field {
                    entry.$field = Some(v.clone());
                }
            };
        }
        set!(model_override);
        set!(provider_override);
        set!(thinking_level);
        set!(verbose_level);
        set!(reasoning_level);
        set!(elevated_level);
        if let Some(v) = self.send_policy {
            entry.send_policy = Some(v);
        }
        if let Some(v) = self.group_activation {
            entry.group_activation = Some(v);
        }
        if let Some(v) = self.queue_mode {
            entry.queue_mode = v;
        }
        if let Some(v) = self.queue_cap {
            entry.queue_cap = Some(v);
        }
        if let Some(v) = self.queue_drop {
            entry.queue_drop = v;
        }
        entry.touch();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub type StoreMap = HashMap<String, SessionEntry>;

/// JSON-file session store with mutator-pattern updates.
pub struct SessionStore {
    store_path: PathBuf,
    lock_path: PathBuf,
    /// Serializes mutators within this process; the sentinel file lock
    /// serializes across processes.
    write_lock: Mutex<()>,
}

impl SessionStore {
    /// `<state_dir>/sessions/store.json`
    pub fn new(state_dir: &Path) -> Result<Self> {
        let dir = state_dir.join("sessions");
        std::fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700));
        }
        let store_path = dir.join("store.json");
        let lock_path = dir.join(".store.lock");
        tracing::info!(path = %store_path.display(), "session store ready");
        Ok(Self {
            store_path,
            lock_path,
            write_lock: Mutex::new(()),
        })
    }

    /// Read the current store without locking. May be slightly stale with
    /// respect to an in-flight mutator, never torn.
    pub fn snapshot(&self) -> StoreMap {
        match std::fs::read_to_string(&self.store_path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => StoreMap::new(),
        }
    }

    pub fn get(&self, session_key: &str) -> Option<SessionEntry> {
        self.snapshot().get(session_key).cloned()
    }

    pub fn list(&self) -> Vec<(String, SessionEntry)> {
        let mut entries: Vec<_> = self.snapshot().into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Apply a mutator under the exclusive store lock:
    /// read → deserialize → mutate → serialize → temp file → fsync → rename.
    pub fn update<F, R>(&self, mutator: F) -> Result<R>
    where
        F: FnOnce(&mut StoreMap) -> R,
    {
        let _guard = self.write_lock.lock();

        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?;
        lock_file
            .lock_exclusive()
            .map_err(|e| Error::Store(format!("locking {}: {e}", self.lock_path.display())))?;

        let result = (|| {
            let mut store = match std::fs::read_to_string(&self.store_path) {
                Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
                Err(_) => StoreMap::new(),
            };

            let out = mutator(&mut store);

            let json = serde_json::to_string_pretty(&store)?;
            let dir = self.store_path.parent().expect("store path has a parent");
            let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
            tmp.write_all(json.as_bytes())?;
            tmp.as_file().sync_all()?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = tmp
                    .as_file()
                    .set_permissions(std::fs::Permissions::from_mode(0o600));
            }
            tmp.persist(&self.store_path).map_err(|e| {
                Error::Store(format!("rename over {}: {}", self.store_path.display(), e.error))
            })?;
            Ok(out)
        })();

        let _ = fs4::fs_std::FileExt::unlock(&lock_file);
        result
    }

    /// Resolve or create the entry for a key. Returns `(entry, is_new)`.
    pub fn ensure(
        &self,
        session_key: &str,
        make: impl FnOnce() -> SessionEntry,
    ) -> Result<(SessionEntry, bool)> {
        let key = session_key.to_owned();
        self.update(move |store| {
            if let Some(existing) = store.get(&key) {
                (existing.clone(), false)
            } else {
                let entry = make();
                store.insert(key.clone(), entry.clone());
                TraceEvent::SessionResolved {
                    session_key: key,
                    session_id: entry.session_id.clone(),
                    is_new: true,
                }
                .emit();
                (entry, true)
            }
        })
    }

    /// Mutate one entry if present; returns the updated entry.
    pub fn update_entry(
        &self,
        session_key: &str,
        mutate: impl FnOnce(&mut SessionEntry),
    ) -> Result<Option<SessionEntry>> {
        let key = session_key.to_owned();
        self.update(move |store| {
            let entry = store.get_mut(&key)?;
            mutate(entry);
            entry.touch();
            Some(entry.clone())
        })
    }

    /// Mint a new session id for the key, zeroing counters.
    pub fn reset(&self, session_key: &str, reason: &str) -> Result<Option<SessionEntry>> {
        let key = session_key.to_owned();
        let reason = reason.to_owned();
        self.update(move |store| {
            let entry = store.get_mut(&key)?;
            let old_id = std::mem::replace(
                &mut entry.session_id,
                uuid::Uuid::new_v4().to_string(),
            );
            entry.input_tokens = 0;
            entry.output_tokens = 0;
            entry.total_tokens = 0;
            entry.context_tokens = 0;
            entry.compaction_count = 0;
            entry.touch();
            TraceEvent::SessionReset {
                session_key: key,
                old_session_id: old_id,
                new_session_id: entry.session_id.clone(),
                reason,
            }
            .emit();
            Some(entry.clone())
        })
    }

    pub fn delete(&self, session_key: &str) -> Result<bool> {
        let key = session_key.to_owned();
        self.update(move |store| store.remove(&key).is_some())
    }
}
