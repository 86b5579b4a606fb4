//! Adapter contracts between the state core and the external tools that do
//! the actual media work.
//!
//! The core never interprets media itself: it consumes verdicts. Every
//! adapter is a capability trait so tests can substitute scripted fakes.
//! Reference implementations shell out to ffprobe/ffmpeg; calls are
//! synchronous and the planner runs them on the blocking pool. Adapters must
//! be idempotent at the path level: the planner may re-invoke them after a
//! crash or timeout.

pub mod audio;
pub mod convert;
pub mod integrity;

#[cfg(test)]
pub mod fake;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Error type for adapter calls.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The external tool could not be started or produced no usable output.
    #[error("tool failed: {0}")]
    ToolFailed(String),

    /// The call exceeded its deadline.
    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// Output parsing failed.
    #[error("failed to parse tool output: {0}")]
    ParseError(String),

    /// IO error launching the tool.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Integrity check depth, passed through from configuration. Any escalation
/// policy between modes is the adapter's concern, not the core's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityMode {
    /// Container and stream headers only.
    Quick,
    /// Decode end-to-end.
    Full,
    /// Adapter chooses.
    Auto,
}

impl IntegrityMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "quick" => Some(Self::Quick),
            "full" => Some(Self::Full),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }
}

/// Verdict of an integrity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityVerdict {
    /// The file decodes cleanly end to end.
    Complete,
    /// The file is truncated or damaged.
    Incomplete,
    /// The check itself failed.
    Error,
}

/// Full result of an integrity check.
#[derive(Debug, Clone)]
pub struct IntegrityReport {
    pub verdict: IntegrityVerdict,
    /// 0..1 readability share, when the checker can estimate one.
    pub score: Option<f64>,
    /// Checker-suggested wait before retrying, in seconds.
    pub retry_after: Option<u64>,
    pub detail: Option<String>,
}

impl IntegrityReport {
    pub fn complete(score: f64) -> Self {
        Self {
            verdict: IntegrityVerdict::Complete,
            score: Some(score),
            retry_after: None,
            detail: None,
        }
    }

    pub fn incomplete(detail: impl Into<String>) -> Self {
        Self {
            verdict: IntegrityVerdict::Incomplete,
            score: None,
            retry_after: None,
            detail: Some(detail.into()),
        }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            verdict: IntegrityVerdict::Error,
            score: None,
            retry_after: None,
            detail: Some(detail.into()),
        }
    }
}

/// One audio track as reported by the probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioTrack {
    /// Language tag, lowercased ("eng", "und", ...).
    pub language: String,
    pub channels: u32,
    pub is_default: bool,
    /// Track title when tagged; English is sometimes only named here.
    pub title: Option<String>,
}

impl AudioTrack {
    /// English by language tag or by title.
    pub fn is_english(&self) -> bool {
        matches!(self.language.as_str(), "eng" | "en" | "english")
            || self
                .title
                .as_deref()
                .map(|t| {
                    let t = t.to_lowercase();
                    t.contains("eng") || t.contains("english")
                })
                .unwrap_or(false)
    }
}

/// Whether a track set already carries an English 2.0 track.
pub fn has_english_stereo(tracks: &[AudioTrack]) -> bool {
    tracks.iter().any(|t| t.channels == 2 && t.is_english())
}

/// Whether a track set carries an English multichannel source to downmix.
pub fn has_english_surround(tracks: &[AudioTrack]) -> bool {
    tracks.iter().any(|t| t.channels > 2 && t.is_english())
}

/// Outcome of a conversion call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionOutcome {
    /// The stereo companion was produced at the given path.
    Converted(PathBuf),
    Failed,
}

/// Full result of a conversion call.
#[derive(Debug, Clone)]
pub struct ConversionReport {
    pub outcome: ConversionOutcome,
    pub detail: Option<String>,
}

/// Conversion parameters snapshotted from configuration.
#[derive(Debug, Clone)]
pub struct ConvertPolicy {
    pub codec: String,
    pub bitrate: String,
}

/// Decode-probe capability.
pub trait IntegrityChecker: Send + Sync {
    /// Check one path. Must be idempotent per path and safe to call
    /// concurrently on different paths. Failures are reported as an
    /// `Error` verdict, never panics.
    fn check(&self, path: &Path, mode: IntegrityMode, deadline: Duration) -> IntegrityReport;
}

/// Audio-track inspection capability. Read-only.
pub trait AudioProbe: Send + Sync {
    fn probe(&self, path: &Path, deadline: Duration) -> Result<Vec<AudioTrack>, AdapterError>;
}

/// Stereo-companion production capability.
pub trait Converter: Send + Sync {
    /// Produce the companion for `path`. Must tolerate re-invocation on the
    /// same input.
    fn convert(&self, path: &Path, policy: &ConvertPolicy, deadline: Duration) -> ConversionReport;
}

/// Runs a command with a hard deadline, returning `None` on timeout.
/// The child is killed and reaped when the deadline fires.
pub(crate) fn run_with_timeout(
    mut cmd: Command,
    deadline: Duration,
) -> std::io::Result<Option<Output>> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = cmd.spawn()?;
    let start = Instant::now();

    loop {
        if let Some(status) = child.try_wait()? {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            if let Some(mut out) = child.stdout.take() {
                out.read_to_end(&mut stdout)?;
            }
            if let Some(mut err) = child.stderr.take() {
                err.read_to_end(&mut stderr)?;
            }
            return Ok(Some(Output {
                status,
                stdout,
                stderr,
            }));
        }

        if start.elapsed() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }

        std::thread::sleep(Duration::from_millis(50));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(language: &str, channels: u32, title: Option<&str>) -> AudioTrack {
        AudioTrack {
            language: language.to_string(),
            channels,
            is_default: false,
            title: title.map(String::from),
        }
    }

    #[test]
    fn test_english_detection_by_language_tag() {
        assert!(track("eng", 2, None).is_english());
        assert!(track("en", 6, None).is_english());
        assert!(track("english", 2, None).is_english());
        assert!(!track("und", 2, None).is_english());
        assert!(!track("rus", 2, None).is_english());
    }

    #[test]
    fn test_english_detection_by_title() {
        assert!(track("und", 2, Some("English Stereo")).is_english());
        assert!(track("und", 6, Some("ENG 5.1")).is_english());
        assert!(!track("und", 2, Some("Commentary")).is_english());
    }

    #[test]
    fn test_has_english_stereo() {
        let tracks = vec![track("rus", 6, None), track("eng", 2, None)];
        assert!(has_english_stereo(&tracks));

        let tracks = vec![track("eng", 6, None)];
        assert!(!has_english_stereo(&tracks));

        assert!(!has_english_stereo(&[]));
    }

    #[test]
    fn test_has_english_surround() {
        let tracks = vec![track("eng", 6, None), track("eng", 2, None)];
        assert!(has_english_surround(&tracks));

        // Stereo-only English is not a downmix source
        let tracks = vec![track("eng", 2, None)];
        assert!(!has_english_surround(&tracks));

        // Surround in another language does not qualify
        let tracks = vec![track("fra", 8, None)];
        assert!(!has_english_surround(&tracks));
    }

    #[test]
    fn test_integrity_mode_parse() {
        assert_eq!(IntegrityMode::parse("quick"), Some(IntegrityMode::Quick));
        assert_eq!(IntegrityMode::parse("full"), Some(IntegrityMode::Full));
        assert_eq!(IntegrityMode::parse("auto"), Some(IntegrityMode::Auto));
        assert_eq!(IntegrityMode::parse("deep"), None);
    }

    #[test]
    fn test_run_with_timeout_finishes_fast_command() {
        let cmd = Command::new("true");
        let out = run_with_timeout(cmd, Duration::from_secs(5)).unwrap();
        assert!(out.is_some());
    }

    #[test]
    fn test_run_with_timeout_kills_slow_command() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let start = Instant::now();
        let out = run_with_timeout(cmd, Duration::from_millis(200)).unwrap();
        assert!(out.is_none());
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
