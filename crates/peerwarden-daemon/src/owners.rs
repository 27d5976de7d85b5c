//! Owner access list, persisted as a local JSON document with rolling backups.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use peerwarden_types::now_iso;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::OwnerSettings;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerRecord {
    #[serde(default)]
    pub allowed: bool,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default = "now_iso")]
    pub created_at: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OwnerRecord {
    fn new(username: &str, first_name: &str) -> Self {
        Self {
            allowed: false,
            username: username.to_string(),
            first_name: first_name.to_string(),
            created_at: now_iso(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OwnerState {
    #[serde(rename = "users", default)]
    pub owners: BTreeMap<String, OwnerRecord>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OwnerState {
    pub fn get(&self, owner: i64) -> Option<&OwnerRecord> {
        self.owners.get(&owner.to_string())
    }
}

const BACKUP_PREFIX: &str = "state-";
const BACKUP_SUFFIX: &str = ".json";

pub struct OwnerStore {
    path: PathBuf,
    backups_dir: PathBuf,
    backups_keep: usize,
    lock: Mutex<()>,
}

impl OwnerStore {
    pub fn new(settings: &OwnerSettings) -> Self {
        Self {
            path: PathBuf::from(&settings.state_path),
            backups_dir: PathBuf::from(&settings.backups_dir),
            backups_keep: settings.backups_keep,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load_unlocked(&self) -> Result<OwnerState> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "owner state missing, starting empty");
                return Ok(OwnerState::default());
            }
            Err(e) => return Err(e.into()),
        };

        let mut raw: Value = serde_json::from_str(&text)?;
        if let Some(owners) = raw.get_mut("users").and_then(Value::as_object_mut) {
            for entry in owners.values_mut() {
                if !entry.is_object() {
                    *entry = Value::Object(Map::new());
                }
            }
        }
        let state: OwnerState = serde_json::from_value(raw.clone())?;
        if serde_json::to_value(&state)? != raw {
            info!(path = %self.path.display(), "persisting normalized owner state");
            self.save_unlocked(&state).await?;
        }
        Ok(state)
    }

    async fn save_unlocked(&self, state: &OwnerState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(state)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), owners = state.owners.len(), "owner state saved");

        // The main file is already durable; a failed backup only warns.
        if let Err(e) = self.backup(state).await {
            warn!(error = %e, "owner state backup failed");
        }
        Ok(())
    }

    async fn backups(&self) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.backups_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(BACKUP_PREFIX) && name.ends_with(BACKUP_SUFFIX) {
                out.push(entry.path());
            }
        }
        // Timestamped names sort chronologically; newest first.
        out.sort_unstable_by(|a, b| b.cmp(a));
        Ok(out)
    }

    /// Write a compact snapshot when it differs from the newest one, then
    /// trim to the newest `backups_keep`.
    async fn backup(&self, state: &OwnerState) -> Result<()> {
        let dump = serde_json::to_string(state)?;
        let existing = self.backups().await?;
        if let Some(newest) = existing.first()
            && tokio::fs::read_to_string(newest).await.ok().as_deref() == Some(dump.as_str())
        {
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.backups_dir).await?;
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let path = self
            .backups_dir
            .join(format!("{BACKUP_PREFIX}{stamp}{BACKUP_SUFFIX}"));
        tokio::fs::write(&path, &dump).await?;
        info!(path = %path.display(), "owner state backup written");

        let all = self.backups().await?;
        let mut removed = 0;
        for old in all.iter().skip(self.backups_keep) {
            match tokio::fs::remove_file(old).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %old.display(), error = %e, "could not remove old backup"),
            }
        }
        if removed > 0 {
            info!(removed, keep = self.backups_keep, "rotated owner state backups");
        }
        Ok(())
    }

    pub async fn load(&self) -> Result<OwnerState> {
        let _guard = self.lock.lock().await;
        self.load_unlocked().await
    }

    pub async fn save(&self, state: &OwnerState) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.save_unlocked(state).await
    }

    /// Only an explicit `allowed = true` grants access.
    pub async fn is_allowed(&self, owner: i64) -> Result<bool> {
        Ok(self.load().await?.get(owner).is_some_and(|o| o.allowed))
    }

    /// Create the owner if unknown, refreshing its names when given.
    pub async fn ensure_owner(&self, owner: i64, username: &str, first_name: &str) -> Result<OwnerRecord> {
        let _guard = self.lock.lock().await;
        let mut state = self.load_unlocked().await?;
        let record = state
            .owners
            .entry(owner.to_string())
            .or_insert_with(|| OwnerRecord::new(username, first_name));
        if !username.is_empty() {
            record.username = username.to_string();
        }
        if !first_name.is_empty() {
            record.first_name = first_name.to_string();
        }
        let record = record.clone();
        self.save_unlocked(&state).await?;
        Ok(record)
    }

    pub async fn set_allowed(&self, owner: i64, allowed: bool) -> Result<OwnerRecord> {
        let _guard = self.lock.lock().await;
        let mut state = self.load_unlocked().await?;
        let record = state
            .owners
            .entry(owner.to_string())
            .or_insert_with(|| OwnerRecord::new("", ""));
        record.allowed = allowed;
        let record = record.clone();
        self.save_unlocked(&state).await?;
        info!(owner, allowed, "owner access updated");
        Ok(record)
    }
}
