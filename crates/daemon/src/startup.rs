//! Preflight checks run before monitoring starts.
//!
//! Verifies the external tools the adapters shell out to are actually
//! runnable, so a misconfigured host fails at startup instead of parking
//! every file in an error state.

use std::process::Command;
use stereod_config::Config;
use thiserror::Error;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("ffprobe not available: {0}")]
    FfprobeUnavailable(String),

    #[error("ffmpeg not available: {0}")]
    FfmpegUnavailable(String),
}

/// Check that a binary answers `-version` successfully.
fn check_tool(binary: &str) -> Result<(), String> {
    let output = Command::new(binary)
        .arg("-version")
        .output()
        .map_err(|e| format!("{} -version failed; is it in PATH? Error: {}", binary, e))?;

    if !output.status.success() {
        return Err(format!("{} -version exited with {}", binary, output.status));
    }

    Ok(())
}

/// Check if ffprobe is available by running `ffprobe -version`.
pub fn check_ffprobe_available(ffprobe_path: &str) -> Result<(), StartupError> {
    check_tool(ffprobe_path).map_err(StartupError::FfprobeUnavailable)
}

/// Check if ffmpeg is available by running `ffmpeg -version`.
pub fn check_ffmpeg_available(ffmpeg_path: &str) -> Result<(), StartupError> {
    check_tool(ffmpeg_path).map_err(StartupError::FfmpegUnavailable)
}

/// Run all startup checks in order: ffprobe, ffmpeg.
pub fn run_startup_checks(config: &Config) -> Result<(), StartupError> {
    check_ffprobe_available(&config.audio.ffprobe_path)?;
    check_ffmpeg_available(&config.audio.ffmpeg_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_ffprobe_fails() {
        let err = check_ffprobe_available("/definitely/not/a/real/ffprobe").unwrap_err();
        assert!(matches!(err, StartupError::FfprobeUnavailable(_)));
        assert!(err.to_string().contains("ffprobe"));
    }

    #[test]
    fn test_missing_ffmpeg_fails() {
        let err = check_ffmpeg_available("/definitely/not/a/real/ffmpeg").unwrap_err();
        assert!(matches!(err, StartupError::FfmpegUnavailable(_)));
    }

    #[test]
    fn test_run_startup_checks_surfaces_first_failure() {
        let mut config = Config::default();
        config.audio.ffprobe_path = "/definitely/not/a/real/ffprobe".to_string();

        let err = run_startup_checks(&config).unwrap_err();
        assert!(matches!(err, StartupError::FfprobeUnavailable(_)));
    }
}
