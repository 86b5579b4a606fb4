//! Scripted adapter fakes for deterministic tests.
//!
//! Each fake pops pre-loaded results in order and counts its calls, so
//! tests can assert exactly when the planner reached out.

use super::{
    AdapterError, AudioProbe, AudioTrack, ConversionOutcome, ConversionReport, ConvertPolicy,
    Converter, IntegrityChecker, IntegrityMode, IntegrityReport,
};
use crate::adapters::convert::companion_path;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub fn en_stereo_track() -> AudioTrack {
    AudioTrack {
        language: "eng".to_string(),
        channels: 2,
        is_default: false,
        title: None,
    }
}

pub fn en_surround_track() -> AudioTrack {
    AudioTrack {
        language: "eng".to_string(),
        channels: 6,
        is_default: true,
        title: None,
    }
}

pub fn und_track(channels: u32) -> AudioTrack {
    AudioTrack {
        language: "und".to_string(),
        channels,
        is_default: false,
        title: None,
    }
}

/// Integrity checker that replays scripted reports; defaults to `Complete`
/// once the script runs out.
#[derive(Default)]
pub struct ScriptedIntegrity {
    script: Mutex<VecDeque<IntegrityReport>>,
    pub calls: AtomicU32,
}

impl ScriptedIntegrity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, report: IntegrityReport) {
        self.script.lock().unwrap().push_back(report);
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl IntegrityChecker for ScriptedIntegrity {
    fn check(&self, _path: &Path, _mode: IntegrityMode, _deadline: Duration) -> IntegrityReport {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| IntegrityReport::complete(1.0))
    }
}

/// Audio probe that replays scripted track lists; defaults to an English
/// stereo track once the script runs out.
#[derive(Default)]
pub struct ScriptedProbe {
    script: Mutex<VecDeque<Result<Vec<AudioTrack>, String>>>,
    pub calls: AtomicU32,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, tracks: Vec<AudioTrack>) {
        self.script.lock().unwrap().push_back(Ok(tracks));
    }

    pub fn push_error(&self, detail: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(detail.to_string()));
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AudioProbe for ScriptedProbe {
    fn probe(&self, _path: &Path, _deadline: Duration) -> Result<Vec<AudioTrack>, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().unwrap().pop_front() {
            Some(Ok(tracks)) => Ok(tracks),
            Some(Err(detail)) => Err(AdapterError::ToolFailed(detail)),
            None => Ok(vec![en_stereo_track()]),
        }
    }
}

/// Converter that replays scripted reports; defaults to success with the
/// standard companion path once the script runs out.
#[derive(Default)]
pub struct ScriptedConverter {
    script: Mutex<VecDeque<ConversionReport>>,
    pub calls: AtomicU32,
}

impl ScriptedConverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_failure(&self, detail: &str) {
        self.script.lock().unwrap().push_back(ConversionReport {
            outcome: ConversionOutcome::Failed,
            detail: Some(detail.to_string()),
        });
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Converter for ScriptedConverter {
    fn convert(
        &self,
        path: &Path,
        _policy: &ConvertPolicy,
        _deadline: Duration,
    ) -> ConversionReport {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ConversionReport {
                outcome: ConversionOutcome::Converted(companion_path(path)),
                detail: None,
            })
    }
}
