//! Identity-scoped snapshot persistence.
//!
//! Snapshots are versioned JSON documents, one file per (kind, identity)
//! pair. Loading is infallible by design: absence, unreadable payloads and
//! schema-version drift all come back as the empty default, because the
//! in-memory state stays authoritative for the session either way.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::debug;

use cropwatch_core::Reading;

use crate::error::Result;
use crate::identity::CacheScope;

const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    Latest,
    History,
}

impl SnapshotKind {
    fn as_str(self) -> &'static str {
        match self {
            SnapshotKind::Latest => "latest",
            SnapshotKind::History => "history",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotDocument<T> {
    version: u32,
    data: T,
}

/// Per-identity snapshot store for the latest map and the history buffer.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    base_dir: PathBuf,
}

impl SnapshotStore {
    /// Store rooted at the platform-local data directory.
    pub fn open_default() -> Self {
        Self::open(default_base_dir())
    }

    /// Store rooted at an explicit directory.
    pub fn open(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Latest-by-sensor snapshot for an identity, or empty.
    pub fn load_latest(&self, scope: CacheScope) -> HashMap<String, Reading> {
        self.load_document(SnapshotKind::Latest, scope)
            .unwrap_or_default()
    }

    /// History snapshot for an identity, or empty.
    pub fn load_history(&self, scope: CacheScope) -> Vec<Reading> {
        self.load_document(SnapshotKind::History, scope)
            .unwrap_or_default()
    }

    pub fn save_latest(&self, scope: CacheScope, latest: &HashMap<String, Reading>) -> Result<()> {
        self.write_document(SnapshotKind::Latest, scope, latest)
    }

    /// Persist the history buffer, keeping only the most recent
    /// `HISTORY_SNAPSHOT_CAP` entries.
    pub fn save_history(&self, scope: CacheScope, history: &[Reading]) -> Result<()> {
        let start = history.len().saturating_sub(HISTORY_SNAPSHOT_CAP);
        self.write_document(SnapshotKind::History, scope, &history[start..])
    }

    fn snapshot_path(&self, kind: SnapshotKind, scope: CacheScope) -> PathBuf {
        self.base_dir
            .join(format!("{}_{}.json", kind.as_str(), scope.key()))
    }

    fn load_document<T>(&self, kind: SnapshotKind, scope: CacheScope) -> Option<T>
    where
        T: DeserializeOwned,
    {
        let path = self.snapshot_path(kind, scope);
        let raw = fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<SnapshotDocument<T>>(&raw) {
            Ok(document) if document.version == SNAPSHOT_SCHEMA_VERSION => Some(document.data),
            Ok(document) => {
                debug!(
                    "discarding {} snapshot with schema version {}",
                    kind.as_str(),
                    document.version
                );
                None
            }
            Err(error) => {
                debug!("discarding unreadable {} snapshot: {}", kind.as_str(), error);
                None
            }
        }
    }

    fn write_document<T>(&self, kind: SnapshotKind, scope: CacheScope, data: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        fs::create_dir_all(&self.base_dir)?;
        let encoded = serde_json::to_string_pretty(&SnapshotDocument {
            version: SNAPSHOT_SCHEMA_VERSION,
            data,
        })?;
        fs::write(self.snapshot_path(kind, scope), encoded)?;
        Ok(())
    }
}

/// Upper bound on persisted history entries per identity.
pub const HISTORY_SNAPSHOT_CAP: usize = 500;

fn default_base_dir() -> PathBuf {
    if let Some(mut data_dir) = dirs::data_local_dir() {
        data_dir.push("cropwatch");
        return data_dir;
    }

    if let Some(mut home_dir) = dirs::home_dir() {
        home_dir.push(".cropwatch");
        return home_dir;
    }

    PathBuf::from(".cropwatch")
}
