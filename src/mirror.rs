//! Mirror Synchronization Engine - orchestrates one replication run
//!
//! Decides what needs syncing (resume record, full listing, or changelog
//! delta), runs the package state machine under bounded concurrency, and
//! finalizes durably: the replica's serial only advances when every
//! selected project completed without error. Interrupts and stop-on-error
//! stop new work while in-flight projects drain cleanly.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::filters::{build_pipeline, FilterPipeline};
use crate::layout::Layout;
use crate::package::{Package, PackageOutcome, PackageSyncer};
use crate::simple::{SimpleFormat, SimpleRenderer};
use crate::state::{ReplicaState, TodoList};
use crate::storage::{acquire_lock, create_storage, Storage};
use crate::upstream::UpstreamClient;
use crate::version::normalize;

/// Results from a complete mirror run
#[derive(Debug, Clone, Default)]
pub struct MirrorSummary {
    pub target_serial: u64,
    pub total_projects: usize,
    pub synced: usize,
    pub filtered: usize,
    pub deleted: usize,
    pub failed: usize,
    pub duration: Duration,
    pub finalized: bool,
}

// Mutable run bookkeeping shared by the workers.
struct RunState {
    todo: TodoList,
    changed: bool,
    synced: usize,
    filtered: usize,
    deleted: usize,
    failed: usize,
}

/// The main engine that drives incremental replication
pub struct MirrorEngine {
    config: Arc<Config>,
    storage: Arc<dyn Storage>,
    layout: Layout,
    state: ReplicaState,
    upstream: UpstreamClient,
    filters: Arc<FilterPipeline>,
    syncer: Arc<PackageSyncer>,
    cancel: Arc<AtomicBool>,
}

impl MirrorEngine {
    /// Create a new engine with the given configuration
    pub fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let storage = create_storage(&config.storage.backend)
            .context("Failed to create storage backend")?;
        let layout = Layout::new(config.mirror_root(), config.mirror.hash_index);
        let state = ReplicaState::new(storage.clone(), layout.clone());
        let upstream = UpstreamClient::new(&config)?;
        let filters = Arc::new(build_pipeline(&config).context("Failed to build filter pipeline")?);
        let syncer = Arc::new(PackageSyncer::new(
            config.clone(),
            storage.clone(),
            filters.clone(),
            upstream.clone(),
        )?);

        Ok(Self {
            config,
            storage,
            layout,
            state,
            upstream,
            filters,
            syncer,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag an external interrupt: no new work starts, in-flight project
    /// runs finish, the durable serial stays put.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Run a complete sync operation
    pub async fn run(&self) -> Result<MirrorSummary> {
        let start = Instant::now();

        acquire_lock(
            self.storage.as_ref(),
            &self.layout.lock_path(),
            self.config.lock_timeout(),
        )
        .await
        .context("another process owns the mirror directory")?;

        let result = self.run_locked(start).await;

        if let Err(err) = self.storage.unlock(&self.layout.lock_path()).await {
            warn!("failed to release mirror lock: {}", err);
        }
        result
    }

    async fn run_locked(&self, start: Instant) -> Result<MirrorSummary> {
        if self.state.ensure_generation().await? {
            info!("replica was reset, next sync starts from serial 0");
        }
        let synced_serial = self.state.load_serial().await?;
        info!("starting sync from serial {}", synced_serial);

        let (target_serial, pending) = self.determine_work(synced_serial).await?;

        if pending.is_empty() {
            info!("nothing to sync, finalizing at serial {}", target_serial);
            if target_serial > synced_serial {
                self.state.write_serial(target_serial).await?;
                self.state.touch_last_modified().await?;
            }
            self.state.clear_todo().await?;
            return Ok(MirrorSummary {
                target_serial,
                duration: start.elapsed(),
                finalized: true,
                ..Default::default()
            });
        }

        // Project filters run before any fetch; rejected projects are
        // dropped from this run entirely.
        let work: Vec<Package> = pending
            .iter()
            .filter(|(name, _)| self.filters.admits_project(&normalize(name)))
            .map(|(name, serial)| Package::new(name.clone(), *serial))
            .collect();
        let project_filtered = pending.len() - work.len();
        if project_filtered > 0 {
            info!("{} projects dropped by project filters", project_filtered);
        }

        let todo = TodoList {
            target_serial,
            pending: work.iter().map(|p| (p.raw_name.clone(), p.serial)).collect(),
        };
        self.state.write_todo(&todo).await?;

        info!(
            "syncing {} projects to serial {} with {} workers",
            work.len(),
            target_serial,
            self.config.workers()
        );

        let run = Arc::new(Mutex::new(RunState {
            todo,
            changed: false,
            synced: 0,
            filtered: 0,
            deleted: 0,
            failed: 0,
        }));

        self.run_workers(&work, &run).await;

        let (summary_counts, changed) = {
            let run = run.lock().await;
            (
                (run.synced, run.filtered, run.deleted, run.failed),
                run.changed,
            )
        };
        let (synced, filtered, deleted, failed) = summary_counts;
        let cancelled = self.cancel.load(Ordering::SeqCst);

        // The public index only needs a refresh when some project changed.
        if changed {
            self.regenerate_global_index(target_serial)
                .await
                .context("Failed to regenerate global index")?;
        }

        let finalized = failed == 0 && !cancelled;
        if finalized {
            self.state.write_serial(target_serial).await?;
            self.state.clear_todo().await?;
            self.state.touch_last_modified().await?;
            info!("sync finalized at serial {}", target_serial);
        } else if cancelled {
            warn!("sync interrupted, serial stays at {}", synced_serial);
        } else {
            warn!(
                "{} projects failed, serial stays at {} and the todo list is kept",
                failed, synced_serial
            );
        }

        Ok(MirrorSummary {
            target_serial,
            total_projects: work.len(),
            synced,
            filtered: filtered + project_filtered,
            deleted,
            failed,
            duration: start.elapsed(),
            finalized,
        })
    }

    /// Determine the work set: resume an in-progress run verbatim, walk the
    /// full listing on a fresh replica, or collapse the changelog delta.
    async fn determine_work(
        &self,
        synced_serial: u64,
    ) -> Result<(u64, BTreeMap<String, u64>)> {
        if let Some(todo) = self.state.load_todo().await? {
            info!(
                "resuming interrupted run: {} projects pending to serial {}",
                todo.pending.len(),
                todo.target_serial
            );
            return Ok((todo.target_serial, todo.pending));
        }

        if synced_serial == 0 {
            info!("fresh replica, requesting full project listing");
            let projects = self
                .upstream
                .list_projects()
                .await
                .context("Failed to list upstream projects")?;
            let target = projects.values().copied().max().unwrap_or(0);
            return Ok((target, projects));
        }

        let events = self
            .upstream
            .changelog_since(synced_serial)
            .await
            .context("Failed to fetch upstream changelog")?;

        let mut pending: BTreeMap<String, u64> = BTreeMap::new();
        let mut target = synced_serial;
        for (name, serial) in events {
            target = target.max(serial);
            let entry = pending.entry(name).or_insert(serial);
            *entry = (*entry).max(serial);
        }
        debug!(
            "changelog collapsed to {} projects, target serial {}",
            pending.len(),
            target
        );
        Ok((target, pending))
    }

    /// Fan the work out to a bounded pool. Workers are logical: each future
    /// runs one project under a semaphore permit, so at most `workers()`
    /// projects are in flight.
    async fn run_workers(&self, work: &[Package], run: &Arc<Mutex<RunState>>) {
        let semaphore = Arc::new(Semaphore::new(self.config.workers()));
        let stop_on_error = self.config.mirror.stop_on_error;

        let mut futures = FuturesUnordered::new();
        for package in work {
            let semaphore = semaphore.clone();
            let syncer = self.syncer.clone();
            let run = run.clone();
            let cancel = self.cancel.clone();
            let state = self.state.clone();
            let package = package.clone();

            futures.push(async move {
                let _permit = semaphore.acquire().await.expect("Semaphore closed");

                // Queued work is abandoned on cancellation; it stays in the
                // todo list for the next run.
                if cancel.load(Ordering::SeqCst) {
                    return;
                }

                let outcome = syncer.sync(&package).await;

                let mut run = run.lock().await;
                match outcome {
                    Ok(outcome) => {
                        match outcome {
                            PackageOutcome::Synced { changed } => {
                                run.synced += 1;
                                run.changed |= changed;
                            }
                            PackageOutcome::Filtered => run.filtered += 1,
                            PackageOutcome::Deleted => {
                                run.deleted += 1;
                                run.changed = true;
                            }
                        }
                        // Commit: this project no longer needs resuming.
                        run.todo.pending.remove(&package.raw_name);
                        if let Err(err) = state.write_todo(&run.todo).await {
                            error!("failed to rewrite todo list: {}", err);
                            run.failed += 1;
                        }
                    }
                    Err(err) => {
                        error!(
                            "sync failed for {} at serial {}: {}",
                            package.raw_name, package.serial, err
                        );
                        run.failed += 1;
                        if stop_on_error {
                            warn!("stop_on_error set, no new work will start");
                            cancel.store(true, Ordering::SeqCst);
                        }
                    }
                }
            });
        }

        while futures.next().await.is_some() {}
    }

    /// Enumerate the known project directories and rewrite the top-level
    /// listing in both formats.
    async fn regenerate_global_index(&self, target_serial: u64) -> Result<()> {
        let names = self.enumerate_simple_dirs().await?;
        debug!("global index lists {} projects", names.len());

        let format = SimpleFormat::parse(&self.config.mirror.simple_format)
            .unwrap_or(SimpleFormat::All);
        let algo = self
            .config
            .hash_algo()
            .context("unknown digest configured")?;
        let renderer = SimpleRenderer::new(
            self.layout.clone(),
            algo,
            self.config.mirror.root_uri.clone(),
        );

        if format.wants_html() {
            let html = renderer.render_index_html(&names);
            self.storage
                .write_if_changed(&self.layout.global_index_html(), html.as_bytes())
                .await?;
        }
        if format.wants_json() {
            let json = renderer.render_index_json(&names, target_serial);
            self.storage
                .write_if_changed(&self.layout.global_index_json(), json.as_bytes())
                .await?;
        }
        Ok(())
    }

    async fn enumerate_simple_dirs(&self) -> Result<Vec<String>> {
        let simple_root = self.layout.simple_root();
        let mut names = Vec::new();

        let top = match self.storage.list_dir(&simple_root).await {
            Ok(entries) => entries,
            Err(_) => return Ok(names),
        };

        for entry in top {
            if !self.storage.is_dir(&entry).await {
                continue;
            }
            if self.config.mirror.hash_index {
                // One level of single-character buckets.
                for project in self.storage.list_dir(&entry).await.unwrap_or_default() {
                    if self.storage.is_dir(&project).await {
                        if let Some(name) = project.file_name() {
                            names.push(name.to_string_lossy().to_string());
                        }
                    }
                }
            } else if let Some(name) = entry.file_name() {
                names.push(name.to_string_lossy().to_string());
            }
        }

        names.sort();
        names.dedup();
        Ok(names)
    }
}
