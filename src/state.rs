//! State Management - durable replica state files
//!
//! Three small text files at the mirror root carry everything a restart
//! needs:
//! - `status`: the last serial fully and successfully applied
//! - `generation`: schema tag for the on-disk layout; a mismatch with the
//!   compiled-in value forces a full resync rather than trusting stale
//!   structure
//! - `todo`: the in-progress run (target serial + projects still pending),
//!   rewritten atomically as projects complete so a crash resumes instead
//!   of recomputing the delta
//!
//! All reads and writes go through the storage contract; the files are
//! always rewritten whole, never patched.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::layout::Layout;
use crate::storage::Storage;

/// Compiled-in layout generation. Bump when the on-disk tree changes shape
/// incompatibly; replicas with a different tag resync from serial 0.
pub const CURRENT_GENERATION: u32 = 5;

/// Durable record of an in-progress run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TodoList {
    pub target_serial: u64,
    /// Projects not yet completed, keyed by raw name, valued by the serial
    /// each should be synced at.
    pub pending: BTreeMap<String, u64>,
}

impl TodoList {
    /// Parse the todo file format: first line target serial, then one
    /// `name serial` pair per line. Any malformed line poisons the whole
    /// document - a broken todo is worth less than a recomputed delta.
    pub fn parse(text: &str) -> Option<Self> {
        let mut lines = text.lines();
        let target_serial = lines.next()?.trim().parse().ok()?;
        let mut pending = BTreeMap::new();
        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (name, serial) = line.rsplit_once(' ')?;
            pending.insert(name.trim().to_string(), serial.trim().parse().ok()?);
        }
        Some(TodoList {
            target_serial,
            pending,
        })
    }

    pub fn render(&self) -> String {
        let mut out = format!("{}\n", self.target_serial);
        for (name, serial) in &self.pending {
            out.push_str(&format!("{name} {serial}\n"));
        }
        out
    }
}

/// Handle on the replica's durable state files.
#[derive(Clone)]
pub struct ReplicaState {
    storage: Arc<dyn Storage>,
    layout: Layout,
}

impl ReplicaState {
    pub fn new(storage: Arc<dyn Storage>, layout: Layout) -> Self {
        ReplicaState { storage, layout }
    }

    /// Last fully applied serial; 0 when the replica has never synced.
    pub async fn load_serial(&self) -> Result<u64> {
        let path = self.layout.status_path();
        match self.storage.read(&path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes)
                .trim()
                .parse()
                .with_context(|| format!("malformed status file at {}", path.display())),
            Err(_) => Ok(0),
        }
    }

    pub async fn write_serial(&self, serial: u64) -> Result<()> {
        self.storage
            .write_atomic(&self.layout.status_path(), format!("{serial}\n").as_bytes())
            .await
            .context("failed to write status file")?;
        Ok(())
    }

    /// Validate the on-disk generation, resetting the replica to first-run
    /// state on mismatch. Returns whether a reset happened.
    pub async fn ensure_generation(&self) -> Result<bool> {
        let path = self.layout.generation_path();
        let found: Option<u32> = match self.storage.read(&path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).trim().parse().ok(),
            Err(_) => None,
        };

        if found == Some(CURRENT_GENERATION) {
            return Ok(false);
        }

        if let Some(found) = found {
            info!(
                "generation {} != expected {}, forcing full resync",
                found, CURRENT_GENERATION
            );
        } else {
            info!("no valid generation marker, treating replica as fresh");
        }

        // First-run state: no serial, no pending run.
        if self.storage.exists(&self.layout.status_path()).await {
            self.storage
                .delete(&self.layout.status_path())
                .await
                .context("failed to remove stale status file")?;
        }
        self.clear_todo().await?;
        self.storage
            .write_atomic(&path, format!("{CURRENT_GENERATION}\n").as_bytes())
            .await
            .context("failed to write generation file")?;
        Ok(true)
    }

    /// Load the pending run record, if one survives from a previous
    /// (crashed or errored) run. Malformed content is discarded.
    pub async fn load_todo(&self) -> Result<Option<TodoList>> {
        let path = self.layout.todo_path();
        let Ok(bytes) = self.storage.read(&path).await else {
            return Ok(None);
        };
        match TodoList::parse(&String::from_utf8_lossy(&bytes)) {
            Some(todo) => Ok(Some(todo)),
            None => {
                warn!("discarding malformed todo file at {}", path.display());
                self.storage
                    .delete(&path)
                    .await
                    .context("failed to remove malformed todo file")?;
                Ok(None)
            }
        }
    }

    pub async fn write_todo(&self, todo: &TodoList) -> Result<()> {
        self.storage
            .write_atomic(&self.layout.todo_path(), todo.render().as_bytes())
            .await
            .context("failed to write todo file")?;
        Ok(())
    }

    pub async fn clear_todo(&self) -> Result<()> {
        let path = self.layout.todo_path();
        if self.storage.exists(&path).await {
            self.storage
                .delete(&path)
                .await
                .context("failed to remove todo file")?;
        }
        Ok(())
    }

    /// Stamp the end of a finalized run.
    pub async fn touch_last_modified(&self) -> Result<()> {
        let stamp = format!("{}\n", Utc::now().to_rfc3339());
        self.storage
            .write_atomic(&self.layout.last_modified_path(), stamp.as_bytes())
            .await
            .context("failed to write last-modified marker")?;
        Ok(())
    }
}
