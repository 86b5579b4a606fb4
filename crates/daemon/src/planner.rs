//! The single driver loop.
//!
//! Each tick picks a leased batch of due records, dispatches every record to
//! at most one adapter call under a bounded semaphore, feeds the result
//! through the machine, and persists the decision. When nothing is due the
//! loop sleeps until the earliest scheduled wake-up or a discovery signal;
//! there is no polling over idle records.

use crate::adapters::{AudioProbe, Converter, ConvertPolicy, IntegrityChecker, IntegrityMode};
use crate::clock::{Clock, StatSource};
use crate::machine::{self, Action, Event, GroupMutation, MachineError};
use crate::metrics::{names, SharedMetrics};
use crate::model::{FileEntry, FileRole, GroupState};
use crate::store::{StateStore, StoreError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stereod_config::Config;
use thiserror::Error;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Error type for planner operations.
#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("transition error: {0}")]
    Machine(#[from] MachineError),

    #[error("task error: {0}")]
    Task(String),
}

/// External workers the planner drives, one call per record per tick.
pub struct Workers {
    pub stats: Arc<dyn StatSource>,
    pub integrity: Arc<dyn IntegrityChecker>,
    pub audio: Arc<dyn AudioProbe>,
    pub converter: Arc<dyn Converter>,
}

/// What one tick did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    /// Records picked from the due queue.
    pub picked: u64,
    /// Handler outcomes by label.
    pub per_outcome: BTreeMap<String, u64>,
}

/// Derive the in-flight handler cap: explicit config value, otherwise
/// bounded by the CPU count with a ceiling of 4.
pub fn derive_parallelism(cfg: &Config) -> usize {
    if cfg.planner.parallelism > 0 {
        cfg.planner.parallelism as usize
    } else {
        num_cpus::get().min(4).max(1)
    }
}

pub struct Planner {
    store: Arc<StateStore>,
    clock: Arc<dyn Clock>,
    workers: Workers,
    metrics: SharedMetrics,
    config: Arc<Config>,
    wake: Notify,
    semaphore: Arc<Semaphore>,
}

impl Planner {
    pub fn new(
        store: Arc<StateStore>,
        clock: Arc<dyn Clock>,
        workers: Workers,
        metrics: SharedMetrics,
        config: Arc<Config>,
    ) -> Arc<Self> {
        let parallelism = derive_parallelism(&config);
        Arc::new(Self {
            store,
            clock,
            workers,
            metrics,
            config,
            wake: Notify::new(),
            semaphore: Arc::new(Semaphore::new(parallelism)),
        })
    }

    /// Signal that new work exists (called by discovery).
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// One planner cycle: pick the due batch, run handlers, persist.
    pub async fn tick(self: &Arc<Self>) -> Result<TickReport, PlannerError> {
        let tick_started = Instant::now();
        let now = self.clock.now();

        let batch = self.store.pick_due(now, self.config.planner.batch_size)?;
        self.metrics.inc(names::CYCLES_RUN);
        self.metrics.inc_by(names::DUE_PICKED, batch.len() as u64);

        let mut report = TickReport {
            picked: batch.len() as u64,
            ..Default::default()
        };

        if batch.is_empty() {
            self.metrics
                .observe_ms(names::TICK_MS, tick_started.elapsed().as_secs_f64() * 1000.0);
            return Ok(report);
        }

        debug!(picked = batch.len(), "processing due batch");

        let mut tasks = JoinSet::new();
        for entry in batch {
            let planner = Arc::clone(self);
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| PlannerError::Task(e.to_string()))?;

            tasks.spawn(async move {
                let started = Instant::now();
                let result = planner.handle_entry(entry).await;
                drop(permit);
                (result, started.elapsed())
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((Ok(outcome), elapsed)) => {
                    self.metrics
                        .observe_ms(names::HANDLER_MS, elapsed.as_secs_f64() * 1000.0);
                    *report.per_outcome.entry(outcome.to_string()).or_insert(0) += 1;
                }
                Ok((Err(e), _)) => {
                    self.metrics.inc(names::HANDLER_ERRORS);
                    warn!(error = %e, "handler failed");
                }
                Err(e) => {
                    self.metrics.inc(names::HANDLER_ERRORS);
                    error!(error = %e, "handler task panicked or was cancelled");
                }
            }
        }

        self.metrics
            .observe_ms(names::TICK_MS, tick_started.elapsed().as_secs_f64() * 1000.0);
        Ok(report)
    }

    /// Handles one leased record: at most one adapter call, then a machine
    /// step, then one transactional write.
    async fn handle_entry(self: &Arc<Self>, entry: FileEntry) -> Result<&'static str, PlannerError> {
        let now = self.clock.now();

        let action = match machine::next_action(&entry) {
            Some(action) => action,
            None => {
                self.store.release_lease(&entry.path)?;
                return Ok("noop");
            }
        };

        match action {
            Action::SampleSize => {
                let stat = self.workers.stats.stat(&entry.path);
                let event = machine::classify_stat(&entry, stat, now, &self.config);
                self.finish(&entry, event, now).await
            }

            Action::RunIntegrity => {
                // Push the wake-up past the check deadline first: if we
                // crash mid-check the record stays PENDING and becomes
                // reclaimable once the lease expires
                let timeout = self.config.integrity.timeout_sec;
                self.store
                    .reschedule_for_timeout(&entry.path, now + timeout as i64, now)?;

                let checker = Arc::clone(&self.workers.integrity);
                let path = entry.path.clone();
                let mode = IntegrityMode::parse(&self.config.integrity.mode)
                    .unwrap_or(IntegrityMode::Quick);
                let deadline = Duration::from_secs(timeout);

                let report =
                    tokio::task::spawn_blocking(move || checker.check(&path, mode, deadline))
                        .await
                        .map_err(|e| PlannerError::Task(e.to_string()))?;

                let event = Event::IntegrityVerdict {
                    verdict: report.verdict,
                    score: report.score,
                    retry_after: report.retry_after,
                    detail: report.detail,
                };
                self.finish(&entry, event, self.clock.now()).await
            }

            Action::ProbeAudio => {
                let probe = Arc::clone(&self.workers.audio);
                let path = entry.path.clone();
                let deadline = Duration::from_secs(self.config.audio.probe_timeout_sec);

                let result = tokio::task::spawn_blocking(move || probe.probe(&path, deadline))
                    .await
                    .map_err(|e| PlannerError::Task(e.to_string()))?;

                let event = match result {
                    Ok(tracks) => Event::AudioProbeVerdict { tracks },
                    Err(e) => Event::AudioProbeFailed {
                        detail: e.to_string(),
                    },
                };
                self.finish(&entry, event, self.clock.now()).await
            }

            Action::Convert => {
                let converter = Arc::clone(&self.workers.converter);
                let path = entry.path.clone();
                let policy = ConvertPolicy {
                    codec: self.config.audio.codec.clone(),
                    bitrate: self.config.audio.bitrate.clone(),
                };
                let deadline = Duration::from_secs(self.config.audio.convert_timeout_sec);

                let report =
                    tokio::task::spawn_blocking(move || converter.convert(&path, &policy, deadline))
                        .await
                        .map_err(|e| PlannerError::Task(e.to_string()))?;

                let event = Event::ConversionVerdict {
                    outcome: report.outcome,
                    detail: report.detail,
                };
                self.finish(&entry, event, self.clock.now()).await
            }

            Action::SyncGroup => {
                self.store.sync_group(
                    &entry.group_id,
                    now,
                    self.config.groups.delete_original,
                )?;
                self.store.release_lease(&entry.path)?;
                Ok("group_synced")
            }
        }
    }

    /// Runs the machine step and persists its decision. An illegal
    /// transition is never written: the record is deferred by the maximum
    /// backoff and the violation surfaced through metrics and health.
    async fn finish(
        self: &Arc<Self>,
        entry: &FileEntry,
        event: Event,
        now: i64,
    ) -> Result<&'static str, PlannerError> {
        let decision = match machine::step(entry, event, now, &self.config) {
            Ok(decision) => decision,
            Err(e) => {
                error!(path = %entry.path.display(), error = %e, "refusing to persist decision");
                self.metrics.inc(names::HANDLER_ERRORS);
                self.store.defer(
                    &entry.path,
                    now + self.config.integrity.backoff_max_sec as i64,
                    now,
                )?;
                return Err(e.into());
            }
        };

        self.store.apply(&entry.path, &decision, now)?;
        self.record_outcome(decision.outcome);

        if let Some(mutation) = decision.group {
            self.apply_group_mutation(entry, mutation, now)?;
        }

        Ok(decision.outcome)
    }

    fn apply_group_mutation(
        &self,
        entry: &FileEntry,
        mutation: GroupMutation,
        now: i64,
    ) -> Result<(), PlannerError> {
        if let GroupMutation::RegisterCompanion { companion_path } = &mutation {
            if self.store.get_file(companion_path)?.is_none() {
                let size = self
                    .workers
                    .stats
                    .stat(companion_path)
                    .map(|s| s.size_bytes)
                    .unwrap_or(0);
                let mut companion = FileEntry::new_discovered(companion_path, size, now);
                // The companion joins the original's group whatever its
                // name normalizes to
                companion.group_id = entry.group_id.clone();
                companion.role = FileRole::StereoCompanion;
                self.store.upsert_file(&companion)?;
                info!(companion = %companion_path.display(), "tracking produced companion");
                self.wake.notify_one();
            }
        }

        let group = self.store.sync_group(
            &entry.group_id,
            now,
            self.config.groups.delete_original,
        )?;

        if let Some(group) = group {
            if group.state == GroupState::Processed && group.finished_at == Some(now) {
                self.metrics.inc(names::GROUPS_PROCESSED);
            }
        }

        Ok(())
    }

    fn record_outcome(&self, outcome: &'static str) {
        self.metrics.inc_labeled("outcome", outcome);
        match outcome {
            "integrity_complete" => self.metrics.inc(names::INTEGRITY_PASS),
            "integrity_incomplete" | "integrity_exhausted" => {
                self.metrics.inc(names::INTEGRITY_FAIL)
            }
            "integrity_error" => self.metrics.inc(names::INTEGRITY_ERROR),
            "skipped_has_en2" => self.metrics.inc(names::SKIPPED_EN2),
            "needs_conversion" => self.metrics.inc(names::READY_FOR_CONVERSION),
            "no_suitable_audio" => self.metrics.inc(names::NO_SUITABLE_AUDIO),
            "converted" => self.metrics.inc(names::CONVERSIONS_DONE),
            "convert_failed" | "convert_exhausted" => self.metrics.inc(names::CONVERSIONS_FAILED),
            _ => {}
        }
        if matches!(
            outcome,
            "integrity_incomplete" | "integrity_error" | "convert_failed" | "stat_error"
                | "probe_failed"
        ) {
            self.metrics.inc(names::BACKOFF_APPLIED);
        }
    }

    /// How long to sleep when a tick found nothing: until the earliest
    /// scheduled wake-up, clamped to the configured bounds.
    fn idle_delay(&self, now: i64) -> Duration {
        let min = self.config.planner.min_sleep_sec;
        let max = self.config.planner.max_sleep_sec;

        let secs = match self.store.earliest_next_check() {
            Ok(Some(earliest)) if earliest > now => (earliest - now) as u64,
            Ok(Some(_)) => min,
            Ok(None) => max,
            Err(e) => {
                warn!(error = %e, "failed to read earliest wake-up");
                min
            }
        };

        Duration::from_secs(secs.clamp(min, max))
    }

    /// Runs ticks until the shutdown signal flips. Sleeps are interruptible
    /// by discovery wake-ups.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("planner loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let picked = match self.tick().await {
                Ok(report) => report.picked,
                Err(e) => {
                    error!(error = %e, "tick failed");
                    self.metrics.inc(names::STORE_ERRORS);
                    0
                }
            };

            // More work may already be due; only sleep on an idle tick
            if picked > 0 {
                continue;
            }

            let delay = self.idle_delay(self.clock.now());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.wake.notified() => {
                    debug!("woken by discovery");
                }
                _ = shutdown.changed() => {}
            }
        }

        info!("planner loop stopped");
    }
}
