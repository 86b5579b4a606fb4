//! Pure transition logic over `(entry, event) -> decision`.
//!
//! Nothing in this module performs I/O. The planner asks `next_action` what
//! a due record needs, runs the single adapter call, maps the result to an
//! `Event`, and persists the returned `Decision`. Illegal transitions are
//! rejected here so the store never sees them.

use crate::adapters::{
    has_english_stereo, has_english_surround, AudioTrack, ConversionOutcome, IntegrityVerdict,
};
use crate::clock::{FileStat, StatError};
use crate::model::{FileEntry, IntegrityStatus, ProcessedStatus, NEVER_TS};
use std::path::PathBuf;
use stereod_config::Config;
use thiserror::Error;

/// Error type for transition evaluation.
#[derive(Debug, Error)]
pub enum MachineError {
    /// The decision would move a status along an edge the model forbids.
    #[error("illegal transition for {path}: {field} {from} -> {to}")]
    IllegalTransition {
        path: String,
        field: &'static str,
        from: String,
        to: String,
    },

    /// The event does not apply to the entry's current state.
    #[error("unexpected event {event} for {path} in state {integrity}/{processed}")]
    UnexpectedEvent {
        path: String,
        event: &'static str,
        integrity: IntegrityStatus,
        processed: ProcessedStatus,
    },
}

/// The single adapter call a due record needs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Stat the file and feed the observation back.
    SampleSize,
    /// Run the integrity checker.
    RunIntegrity,
    /// Run the audio-track probe.
    ProbeAudio,
    /// Run the converter.
    Convert,
    /// Recompute group membership and completion.
    SyncGroup,
}

/// An observation fed into the machine.
#[derive(Debug, Clone)]
pub enum Event {
    /// The planner sampled the file size.
    SizeSampled { size: u64 },
    /// The stat call failed; `missing` means the path is definitively gone.
    StatFailed { missing: bool, detail: String },
    /// The size has held unchanged for the full stability window.
    StableTimeoutElapsed,
    /// The integrity checker returned.
    IntegrityVerdict {
        verdict: IntegrityVerdict,
        score: Option<f64>,
        retry_after: Option<u64>,
        detail: Option<String>,
    },
    /// The audio probe returned a track list.
    AudioProbeVerdict { tracks: Vec<AudioTrack> },
    /// The audio probe failed transiently.
    AudioProbeFailed { detail: String },
    /// The converter returned.
    ConversionVerdict {
        outcome: ConversionOutcome,
        detail: Option<String>,
    },
}

impl Event {
    fn name(&self) -> &'static str {
        match self {
            Event::SizeSampled { .. } => "size_sampled",
            Event::StatFailed { .. } => "stat_failed",
            Event::StableTimeoutElapsed => "stable_timeout_elapsed",
            Event::IntegrityVerdict { .. } => "integrity_verdict",
            Event::AudioProbeVerdict { .. } => "audio_probe_verdict",
            Event::AudioProbeFailed { .. } => "audio_probe_failed",
            Event::ConversionVerdict { .. } => "conversion_verdict",
        }
    }
}

/// Group-level side effect requested by a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupMutation {
    /// Create the group if needed and mark conversion underway.
    EnsureConversionPending,
    /// Record the produced companion and track it as a new member.
    RegisterCompanion { companion_path: PathBuf },
    /// Conversion exhausted its retries; the group cannot complete.
    ConversionExhausted,
    /// Membership or member status changed; recompute completion.
    Touch,
}

/// The full write-back for one entry after one event.
#[derive(Debug, Clone)]
pub struct Decision {
    pub integrity: IntegrityStatus,
    pub processed: ProcessedStatus,
    pub size_bytes: u64,
    pub size_observed_at: i64,
    pub stable_since: Option<i64>,
    pub integrity_score: Option<f64>,
    pub integrity_attempts: u32,
    pub convert_attempts: u32,
    pub has_en2: Option<bool>,
    pub next_check_at: i64,
    pub backoff_sec: u64,
    pub last_error: Option<String>,
    pub group: Option<GroupMutation>,
    /// Outcome label for metrics and the per-tick report.
    pub outcome: &'static str,
}

impl Decision {
    fn carry(entry: &FileEntry) -> Self {
        Self {
            integrity: entry.integrity,
            processed: entry.processed,
            size_bytes: entry.size_bytes,
            size_observed_at: entry.size_observed_at,
            stable_since: entry.stable_since,
            integrity_score: entry.integrity_score,
            integrity_attempts: entry.integrity_attempts,
            convert_attempts: entry.convert_attempts,
            has_en2: entry.has_en2,
            next_check_at: entry.next_check_at,
            backoff_sec: entry.backoff_sec,
            last_error: entry.last_error.clone(),
            group: None,
            outcome: "noop",
        }
    }
}

/// Picks the adapter call a due record needs, or `None` when the record has
/// nothing to do (terminal, or waiting on a group).
pub fn next_action(entry: &FileEntry) -> Option<Action> {
    if entry.is_terminal() {
        return None;
    }

    match entry.integrity {
        IntegrityStatus::Pending => Some(Action::RunIntegrity),
        IntegrityStatus::Unknown | IntegrityStatus::Incomplete | IntegrityStatus::Error => {
            Some(Action::SampleSize)
        }
        IntegrityStatus::Complete => match entry.processed {
            ProcessedStatus::New => Some(Action::ProbeAudio),
            ProcessedStatus::GroupPendingPair | ProcessedStatus::ConvertFailed => {
                Some(Action::Convert)
            }
            ProcessedStatus::Converted | ProcessedStatus::SkippedHasEn2 => Some(Action::SyncGroup),
            _ => None,
        },
    }
}

/// Maps a stat result onto the right event for this entry: an unchanged
/// size whose stability window has fully elapsed becomes the stability
/// timeout, anything else is a plain size sample or a stat failure.
pub fn classify_stat(
    entry: &FileEntry,
    stat: Result<FileStat, StatError>,
    now: i64,
    cfg: &Config,
) -> Event {
    match stat {
        Ok(observed) => {
            let unchanged = observed.size_bytes == entry.size_bytes;
            let window_elapsed = entry.is_stable(now, cfg.stability.stable_wait_sec);
            let wants_integrity = matches!(
                entry.integrity,
                IntegrityStatus::Unknown | IntegrityStatus::Incomplete | IntegrityStatus::Error
            );
            if unchanged && window_elapsed && wants_integrity {
                Event::StableTimeoutElapsed
            } else {
                Event::SizeSampled {
                    size: observed.size_bytes,
                }
            }
        }
        Err(StatError::NotFound) => Event::StatFailed {
            missing: true,
            detail: "file not found".to_string(),
        },
        Err(StatError::Io(detail)) => Event::StatFailed {
            missing: false,
            detail,
        },
    }
}

/// Applies one event to one entry, producing the decision to persist.
pub fn step(
    entry: &FileEntry,
    event: Event,
    now: i64,
    cfg: &Config,
) -> Result<Decision, MachineError> {
    let mut d = Decision::carry(entry);
    let event_name = event.name();

    match event {
        Event::SizeSampled { size } => {
            d.size_observed_at = now;
            if size != entry.size_bytes {
                // The file is still being written: everything observed so
                // far is stale, start over from scratch
                d.size_bytes = size;
                d.stable_since = None;
                d.integrity = IntegrityStatus::Unknown;
                d.integrity_score = None;
                d.integrity_attempts = 0;
                d.convert_attempts = 0;
                d.processed = ProcessedStatus::New;
                d.has_en2 = None;
                d.backoff_sec = cfg.integrity.backoff_step_sec;
                d.last_error = None;
                d.next_check_at = now + cfg.stability.size_poll_sec as i64;
                d.outcome = "size_changed";
            } else {
                match entry.stable_since {
                    None => {
                        d.stable_since = Some(now);
                        d.next_check_at = now + cfg.stability.stable_wait_sec as i64;
                        d.outcome = "stability_armed";
                    }
                    Some(since) => {
                        // Not yet stable long enough: defer to the exact
                        // moment the window closes
                        d.next_check_at = since + cfg.stability.stable_wait_sec as i64;
                        if d.next_check_at <= now {
                            d.next_check_at = now + 1;
                        }
                        d.outcome = "stability_deferred";
                    }
                }
            }
        }

        Event::StatFailed { missing, detail } => {
            if missing {
                // The path is gone for good (deleted or renamed away);
                // park the record and let GC collect it later
                d.processed = ProcessedStatus::Ignored;
                d.next_check_at = NEVER_TS;
                d.last_error = Some(format!("file missing: {}", detail));
                d.group = Some(GroupMutation::Touch);
                d.outcome = "missing_ignored";
            } else {
                let wait = entry.backoff_sec.max(cfg.integrity.backoff_step_sec);
                d.next_check_at = now + wait as i64;
                d.backoff_sec = (wait * 2).min(cfg.integrity.backoff_max_sec);
                d.last_error = Some(format!("stat failed: {}", detail));
                d.outcome = "stat_error";
            }
        }

        Event::StableTimeoutElapsed => {
            if !matches!(
                entry.integrity,
                IntegrityStatus::Unknown | IntegrityStatus::Incomplete | IntegrityStatus::Error
            ) {
                return Err(MachineError::UnexpectedEvent {
                    path: entry.path.display().to_string(),
                    event: event_name,
                    integrity: entry.integrity,
                    processed: entry.processed,
                });
            }
            d.integrity = IntegrityStatus::Pending;
            d.next_check_at = now;
            d.outcome = "integrity_scheduled";
        }

        Event::IntegrityVerdict {
            verdict,
            score,
            retry_after,
            detail,
        } => {
            if entry.integrity != IntegrityStatus::Pending {
                return Err(MachineError::UnexpectedEvent {
                    path: entry.path.display().to_string(),
                    event: event_name,
                    integrity: entry.integrity,
                    processed: entry.processed,
                });
            }

            d.integrity_attempts = entry.integrity_attempts + 1;

            match verdict {
                IntegrityVerdict::Complete => {
                    d.integrity = IntegrityStatus::Complete;
                    d.integrity_score = score;
                    d.backoff_sec = cfg.integrity.backoff_step_sec;
                    d.last_error = None;
                    d.next_check_at = now;
                    d.outcome = "integrity_complete";
                }
                IntegrityVerdict::Incomplete | IntegrityVerdict::Error => {
                    let status = if verdict == IntegrityVerdict::Incomplete {
                        IntegrityStatus::Incomplete
                    } else {
                        IntegrityStatus::Error
                    };
                    d.integrity = status;
                    d.integrity_score = score;
                    d.last_error = Some(detail.unwrap_or_else(|| format!("integrity {}", status)));

                    if d.integrity_attempts >= cfg.integrity.max_attempts {
                        // Retry budget exhausted: stop scheduling this file
                        d.processed = ProcessedStatus::Ignored;
                        d.next_check_at = NEVER_TS;
                        d.group = Some(GroupMutation::Touch);
                        d.outcome = "integrity_exhausted";
                    } else {
                        let wait = retry_after
                            .unwrap_or_else(|| entry.backoff_sec.max(cfg.integrity.backoff_step_sec));
                        d.next_check_at = now + wait as i64;
                        d.backoff_sec = (wait * 2).min(cfg.integrity.backoff_max_sec);
                        d.outcome = if verdict == IntegrityVerdict::Incomplete {
                            "integrity_incomplete"
                        } else {
                            "integrity_error"
                        };
                    }
                }
            }
        }

        Event::AudioProbeVerdict { tracks } => {
            if entry.integrity != IntegrityStatus::Complete
                || entry.processed != ProcessedStatus::New
            {
                return Err(MachineError::UnexpectedEvent {
                    path: entry.path.display().to_string(),
                    event: event_name,
                    integrity: entry.integrity,
                    processed: entry.processed,
                });
            }

            if has_english_stereo(&tracks) {
                d.processed = ProcessedStatus::SkippedHasEn2;
                d.has_en2 = Some(true);
                d.next_check_at = NEVER_TS;
                d.last_error = None;
                d.group = Some(GroupMutation::Touch);
                d.outcome = "skipped_has_en2";
            } else if has_english_surround(&tracks) {
                d.processed = ProcessedStatus::GroupPendingPair;
                d.has_en2 = Some(false);
                d.next_check_at = now;
                d.group = Some(GroupMutation::EnsureConversionPending);
                d.outcome = "needs_conversion";
            } else {
                d.processed = ProcessedStatus::Ignored;
                d.has_en2 = Some(false);
                d.next_check_at = NEVER_TS;
                d.last_error = Some("no usable English multichannel track".to_string());
                d.group = Some(GroupMutation::Touch);
                d.outcome = "no_suitable_audio";
            }
        }

        Event::AudioProbeFailed { detail } => {
            let wait = entry.backoff_sec.max(cfg.integrity.backoff_step_sec);
            d.next_check_at = now + wait as i64;
            d.backoff_sec = (wait * 2).min(cfg.integrity.backoff_max_sec);
            d.last_error = Some(format!("audio probe failed: {}", detail));
            d.outcome = "probe_failed";
        }

        Event::ConversionVerdict { outcome, detail } => {
            if !matches!(
                entry.processed,
                ProcessedStatus::GroupPendingPair | ProcessedStatus::ConvertFailed
            ) {
                return Err(MachineError::UnexpectedEvent {
                    path: entry.path.display().to_string(),
                    event: event_name,
                    integrity: entry.integrity,
                    processed: entry.processed,
                });
            }

            match outcome {
                ConversionOutcome::Converted(companion_path) => {
                    d.processed = ProcessedStatus::Converted;
                    d.backoff_sec = cfg.integrity.backoff_step_sec;
                    d.last_error = None;
                    d.next_check_at = NEVER_TS;
                    d.group = Some(GroupMutation::RegisterCompanion { companion_path });
                    d.outcome = "converted";
                }
                ConversionOutcome::Failed => {
                    d.convert_attempts = entry.convert_attempts + 1;
                    d.processed = ProcessedStatus::ConvertFailed;
                    d.last_error =
                        Some(detail.unwrap_or_else(|| "conversion failed".to_string()));

                    if d.convert_attempts >= cfg.integrity.max_attempts {
                        d.next_check_at = NEVER_TS;
                        d.group = Some(GroupMutation::ConversionExhausted);
                        d.outcome = "convert_exhausted";
                    } else {
                        let wait = entry.backoff_sec.max(cfg.integrity.backoff_step_sec);
                        d.next_check_at = now + wait as i64;
                        d.backoff_sec = (wait * 2).min(cfg.integrity.backoff_max_sec);
                        d.outcome = "convert_failed";
                    }
                }
            }
        }
    }

    if !entry.integrity.can_transition_to(d.integrity) {
        return Err(MachineError::IllegalTransition {
            path: entry.path.display().to_string(),
            field: "integrity",
            from: entry.integrity.to_string(),
            to: d.integrity.to_string(),
        });
    }
    if !entry.processed.can_transition_to(d.processed) {
        return Err(MachineError::IllegalTransition {
            path: entry.path.display().to_string(),
            field: "processed",
            from: entry.processed.to_string(),
            to: d.processed.to_string(),
        });
    }

    Ok(d)
}
