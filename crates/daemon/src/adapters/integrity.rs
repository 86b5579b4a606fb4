//! ffmpeg-backed integrity checker.
//!
//! Quick mode asks ffprobe for container duration and stream layout, which
//! catches truncated downloads without touching most of the file. Full mode
//! decodes end to end with `ffmpeg -v error -i <path> -f null -` and treats
//! any reported decode error as damage.

use super::{run_with_timeout, IntegrityChecker, IntegrityMode, IntegrityReport};
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tracing::debug;

/// Integrity checker shelling out to ffprobe/ffmpeg.
#[derive(Debug, Clone)]
pub struct FfmpegIntegrityChecker {
    ffprobe_path: String,
    ffmpeg_path: String,
}

mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
    }
}

impl FfmpegIntegrityChecker {
    pub fn new(ffprobe_path: impl Into<String>, ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    /// Container-level check: the file must parse, report a finite duration,
    /// and contain at least one video stream.
    fn quick_check(&self, path: &Path, deadline: Duration) -> IntegrityReport {
        let mut cmd = Command::new(&self.ffprobe_path);
        cmd.args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ])
        .arg(path);

        let output = match run_with_timeout(cmd, deadline) {
            Ok(Some(out)) => out,
            Ok(None) => {
                return IntegrityReport::error(format!(
                    "ffprobe exceeded {}s deadline",
                    deadline.as_secs()
                ))
            }
            Err(e) => return IntegrityReport::error(format!("ffprobe launch failed: {}", e)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // An unparseable container is the classic truncated-download shape
            return IntegrityReport::incomplete(format!(
                "container unreadable: {}",
                stderr.trim()
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let parsed: ffprobe_json::FfprobeOutput = match serde_json::from_str(&stdout) {
            Ok(p) => p,
            Err(e) => return IntegrityReport::error(format!("ffprobe output unparseable: {}", e)),
        };

        let duration = parsed
            .format
            .and_then(|f| f.duration)
            .and_then(|d| d.parse::<f64>().ok());

        let has_video = parsed
            .streams
            .unwrap_or_default()
            .iter()
            .any(|s| s.codec_type.as_deref() == Some("video"));

        match (duration, has_video) {
            (Some(d), true) if d > 0.0 => IntegrityReport::complete(1.0),
            (Some(_), true) => IntegrityReport::incomplete("zero duration"),
            (None, _) => IntegrityReport::incomplete("no duration in container"),
            (_, false) => IntegrityReport::incomplete("no video streams"),
        }
    }

    /// Decode-everything check. Any decoder error line fails the file.
    fn full_check(&self, path: &Path, deadline: Duration) -> IntegrityReport {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(["-v", "error", "-i"])
            .arg(path)
            .args(["-f", "null", "-"]);

        let output = match run_with_timeout(cmd, deadline) {
            Ok(Some(out)) => out,
            Ok(None) => {
                return IntegrityReport::error(format!(
                    "ffmpeg decode exceeded {}s deadline",
                    deadline.as_secs()
                ))
            }
            Err(e) => return IntegrityReport::error(format!("ffmpeg launch failed: {}", e)),
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        let decode_errors = stderr.lines().filter(|l| !l.trim().is_empty()).count();

        if output.status.success() && decode_errors == 0 {
            IntegrityReport::complete(1.0)
        } else if output.status.success() {
            // Decoded to the end but with damaged regions
            let score = 1.0 / (1.0 + decode_errors as f64);
            debug!(errors = decode_errors, path = %path.display(), "decode completed with errors");
            IntegrityReport {
                verdict: super::IntegrityVerdict::Incomplete,
                score: Some(score),
                retry_after: None,
                detail: Some(format!("{} decode errors", decode_errors)),
            }
        } else {
            IntegrityReport::incomplete(format!(
                "decode aborted: {}",
                stderr.lines().next().unwrap_or("unknown error")
            ))
        }
    }
}

impl IntegrityChecker for FfmpegIntegrityChecker {
    fn check(&self, path: &Path, mode: IntegrityMode, deadline: Duration) -> IntegrityReport {
        match mode {
            // Auto maps to the cheap check; escalation policy lives here,
            // not in the core
            IntegrityMode::Quick | IntegrityMode::Auto => self.quick_check(path, deadline),
            IntegrityMode::Full => self.full_check(path, deadline),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::IntegrityVerdict;

    #[test]
    fn test_missing_binary_reports_error_verdict() {
        let checker = FfmpegIntegrityChecker::new(
            "/nonexistent/ffprobe-binary",
            "/nonexistent/ffmpeg-binary",
        );
        let report = checker.check(
            Path::new("/tmp/whatever.mkv"),
            IntegrityMode::Quick,
            Duration::from_secs(5),
        );
        assert_eq!(report.verdict, IntegrityVerdict::Error);
        assert!(report.detail.is_some());
    }

    #[test]
    fn test_full_mode_missing_binary_reports_error_verdict() {
        let checker = FfmpegIntegrityChecker::new(
            "/nonexistent/ffprobe-binary",
            "/nonexistent/ffmpeg-binary",
        );
        let report = checker.check(
            Path::new("/tmp/whatever.mkv"),
            IntegrityMode::Full,
            Duration::from_secs(5),
        );
        assert_eq!(report.verdict, IntegrityVerdict::Error);
    }
}
