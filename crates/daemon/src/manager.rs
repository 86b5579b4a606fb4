//! Manager façade over the state core.
//!
//! Owns the store, planner, metrics, and shutdown signalling, and exposes
//! the operations the CLI and embedders use: discovery, a synchronous
//! processing tick, the monitoring loop, status/health, maintenance, and
//! graceful close.

use crate::adapters::audio::FfprobeAudioProbe;
use crate::adapters::convert::FfmpegConverter;
use crate::adapters::integrity::FfmpegIntegrityChecker;
use crate::clock::{Clock, StatSource, SystemClock, SystemStatSource};
use crate::discovery::{scan_directory, DiscoverOptions};
use crate::metrics::{collect_system_gauges, names, new_shared_metrics, SharedMetrics};
use crate::model::{FileEntry, ProcessedStatus, NEVER_TS};
use crate::planner::{Planner, PlannerError, TickReport, Workers};
use crate::startup::{run_startup_checks, StartupError};
use crate::store::{StateStore, StoreError, StoreStats};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stereod_config::Config;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Error type for manager operations
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Store could not be opened or written
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Planner failure
    #[error("planner error: {0}")]
    Planner(#[from] PlannerError),

    /// Startup check failed
    #[error("startup check failed: {0}")]
    Startup(#[from] StartupError),
}

/// Outcome of one discovery pass.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub files_added: u64,
    pub files_existing: u64,
}

/// Snapshot of the system for `status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub timestamp: i64,
    pub totals: StoreStats,
    pub db_size_bytes: u64,
    pub earliest_next_check_at: Option<i64>,
    pub cycles_run: u64,
}

/// Health verdict with any detected issues.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub issues: Vec<String>,
}

/// Outcome of one maintenance pass.
#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceReport {
    pub files_removed: u64,
    pub groups_removed: u64,
    pub vacuumed: bool,
    pub db_size_bytes: u64,
}

/// Files in error-ish states beyond this count flag the health check.
const ERROR_HEALTH_THRESHOLD: u64 = 5;

pub struct Manager {
    config: Arc<Config>,
    store: Arc<StateStore>,
    planner: Arc<Planner>,
    metrics: SharedMetrics,
    clock: Arc<dyn Clock>,
    shutdown_tx: watch::Sender<bool>,
    monitoring: AtomicBool,
}

impl Manager {
    /// Open the state core with the system clock and the ffmpeg-backed
    /// reference adapters. A store that cannot be opened (or whose schema
    /// is newer than this build) is a fatal error.
    pub fn open(config: Config) -> Result<Self, ManagerError> {
        let workers = Workers {
            stats: Arc::new(SystemStatSource),
            integrity: Arc::new(FfmpegIntegrityChecker::new(
                config.audio.ffprobe_path.clone(),
                config.audio.ffmpeg_path.clone(),
            )),
            audio: Arc::new(FfprobeAudioProbe::new(config.audio.ffprobe_path.clone())),
            converter: Arc::new(FfmpegConverter::new(config.audio.ffmpeg_path.clone())),
        };
        Self::with_workers(config, Arc::new(SystemClock), workers)
    }

    /// Open with injected clock and workers. Used by tests and embedders
    /// that bring their own adapters.
    pub fn with_workers(
        config: Config,
        clock: Arc<dyn Clock>,
        workers: Workers,
    ) -> Result<Self, ManagerError> {
        let config = Arc::new(config);
        let store = Arc::new(StateStore::open(
            &config.storage.db_path,
            config.effective_lease_ttl_sec(),
        )?);
        let metrics = new_shared_metrics();

        let planner = Planner::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            workers,
            Arc::clone(&metrics),
            Arc::clone(&config),
        );

        let (shutdown_tx, _) = watch::channel(false);

        info!(db = %config.storage.db_path.display(), "manager initialized");
        Ok(Self {
            config,
            store,
            planner,
            metrics,
            clock,
            shutdown_tx,
            monitoring: AtomicBool::new(false),
        })
    }

    pub fn metrics(&self) -> SharedMetrics {
        Arc::clone(&self.metrics)
    }

    pub fn store(&self) -> Arc<StateStore> {
        Arc::clone(&self.store)
    }

    // ── Operations ───────────────────────────────────────────────

    /// Walks `dir` and registers every tracked file. New paths become
    /// immediately-due entries; already-known paths only get their
    /// observation time refreshed. Wakes the planner when anything was
    /// found.
    pub fn discover_directory(
        &self,
        dir: &Path,
        options: &DiscoverOptions,
    ) -> Result<DiscoveryReport, ManagerError> {
        let now = self.clock.now();
        let candidates = scan_directory(dir, options, &self.config.audio.video_extensions);
        let mut report = DiscoveryReport::default();

        for candidate in candidates {
            match self.store.get_file(&candidate.path)? {
                Some(_) => {
                    self.store.touch_size_observed(&candidate.path, now)?;
                    report.files_existing += 1;
                }
                None => {
                    let mut entry =
                        FileEntry::new_discovered(&candidate.path, candidate.size_bytes, now);

                    // A second live path claiming the same group role is a
                    // duplicate and never enters the pipeline
                    let clash = self
                        .store
                        .files_in_group(&entry.group_id)?
                        .into_iter()
                        .any(|f| {
                            f.role == entry.role
                                && f.path != entry.path
                                && !matches!(
                                    f.processed,
                                    ProcessedStatus::Ignored | ProcessedStatus::Duplicate
                                )
                        });
                    if clash {
                        entry.processed = ProcessedStatus::Duplicate;
                        entry.next_check_at = NEVER_TS;
                        entry.last_error = Some("duplicate of an already tracked file".to_string());
                        warn!(path = %entry.path.display(), "duplicate group member ignored");
                    }

                    self.store.upsert_file(&entry)?;
                    self.store.sync_group(
                        &entry.group_id,
                        now,
                        self.config.groups.delete_original,
                    )?;
                    report.files_added += 1;
                }
            }
        }

        self.metrics.inc_by(names::FILES_DISCOVERED, report.files_added);
        self.metrics.inc_by(names::FILES_EXISTING, report.files_existing);

        if report.files_added > 0 {
            self.planner.wake();
        }

        info!(
            dir = %dir.display(),
            added = report.files_added,
            existing = report.files_existing,
            "discovery pass done"
        );
        Ok(report)
    }

    /// Runs one planner tick synchronously and returns what it did.
    pub async fn process_pending(&self) -> Result<TickReport, ManagerError> {
        Ok(self.planner.tick().await?)
    }

    /// Runs the planner until `close` is called (or the shutdown signal
    /// flips). Performs startup checks first, then serves the metrics
    /// endpoint and the periodic maintenance cadence alongside the loop.
    pub async fn start_monitoring(&self) -> Result<(), ManagerError> {
        run_startup_checks(&self.config)?;
        self.monitoring.store(true, Ordering::SeqCst);

        let mut server_handle = None;
        if self.config.metrics.enabled && self.config.metrics.http_port > 0 {
            let metrics = Arc::clone(&self.metrics);
            let port = self.config.metrics.http_port;
            server_handle = Some(tokio::spawn(async move {
                if let Err(e) = crate::metrics_server::run_metrics_server(metrics, port).await {
                    warn!(error = %e, "metrics server stopped");
                }
            }));
        }

        let maintenance_handle = {
            let store = Arc::clone(&self.store);
            let metrics = Arc::clone(&self.metrics);
            let clock = Arc::clone(&self.clock);
            let config = Arc::clone(&self.config);
            let mut shutdown_rx = self.shutdown_tx.subscribe();

            tokio::spawn(async move {
                let interval = Duration::from_secs(config.planner.maintenance_interval_sec);
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = shutdown_rx.changed() => break,
                    }
                    collect_system_gauges(&metrics);
                    match store.gc(
                        clock.now(),
                        config.storage.keep_processed_days,
                        config.storage.max_entries,
                    ) {
                        Ok(report) => {
                            metrics.inc_by(names::ENTRIES_PRUNED, report.files_removed);
                        }
                        Err(e) => {
                            metrics.inc(names::STORE_ERRORS);
                            warn!(error = %e, "maintenance gc failed");
                        }
                    }
                }
            })
        };

        let shutdown_rx = self.shutdown_tx.subscribe();
        Arc::clone(&self.planner).run(shutdown_rx).await;

        maintenance_handle.abort();
        if let Some(handle) = server_handle {
            handle.abort();
        }
        self.monitoring.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Runs GC and compaction now.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport, ManagerError> {
        let now = self.clock.now();
        let gc = self.store.gc(
            now,
            self.config.storage.keep_processed_days,
            self.config.storage.max_entries,
        )?;
        self.metrics.inc_by(names::ENTRIES_PRUNED, gc.files_removed);

        let vacuumed = gc.files_removed > 100;
        if vacuumed {
            self.store.vacuum()?;
        }

        Ok(MaintenanceReport {
            files_removed: gc.files_removed,
            groups_removed: gc.groups_removed,
            vacuumed,
            db_size_bytes: self.store.db_size_bytes()?,
        })
    }

    /// Drops all persisted state.
    pub fn reset_store(&self) -> Result<(), ManagerError> {
        self.store.reset()?;
        Ok(())
    }

    // ── Introspection ────────────────────────────────────────────

    pub fn get_status(&self) -> Result<StatusReport, ManagerError> {
        let now = self.clock.now();
        Ok(StatusReport {
            timestamp: now,
            totals: self.store.stats(now)?,
            db_size_bytes: self.store.db_size_bytes()?,
            earliest_next_check_at: self.store.earliest_next_check()?,
            cycles_run: self.metrics.counter(names::CYCLES_RUN),
        })
    }

    pub fn get_health(&self) -> Result<HealthReport, ManagerError> {
        let now = self.clock.now();
        let mut issues = Vec::new();

        let stuck = self.store.stuck_lease_count(now)?;
        if stuck > 0 {
            issues.push(format!("{} leases expired without being cleared", stuck));
        }

        let stats = self.store.stats(now)?;
        let error_files = stats.integrity.get("error").copied().unwrap_or(0)
            + stats.processed.get("convert_failed").copied().unwrap_or(0);
        if error_files > ERROR_HEALTH_THRESHOLD {
            issues.push(format!("{} files stuck in error states", error_files));
        }

        Ok(HealthReport {
            healthy: issues.is_empty(),
            issues,
        })
    }

    /// Graceful shutdown: signal the loop, give running handlers the
    /// configured grace period, then drop any leases still held.
    pub async fn close(&self) -> Result<(), ManagerError> {
        debug!("shutdown requested");
        let _ = self.shutdown_tx.send(true);

        if self.monitoring.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(self.config.planner.shutdown_grace_sec)).await;
        }

        let released = self.store.release_own_leases()?;
        if released > 0 {
            info!(released, "dropped leases on shutdown");
        }
        info!("manager closed");
        Ok(())
    }
}
