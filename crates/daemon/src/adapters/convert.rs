//! ffmpeg-backed stereo companion converter.
//!
//! Builds `<stem>.stereo.<ext>` next to the original: video and subtitles
//! are stream-copied, the first English multichannel audio track is
//! downmixed to two channels with the configured codec and bitrate.

use super::{run_with_timeout, ConversionOutcome, ConversionReport, ConvertPolicy, Converter};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, warn};

/// Constructs the companion path for a given original.
///
/// `/media/movie.mkv` -> `/media/movie.stereo.mkv`. A path without an
/// extension gets a bare `.stereo` suffix.
pub fn companion_path(original: &Path) -> PathBuf {
    let stem = original
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();

    let name = match original.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}.stereo.{}", stem, ext),
        None => format!("{}.stereo", stem),
    };

    original.with_file_name(name)
}

/// Converter shelling out to ffmpeg.
#[derive(Debug, Clone)]
pub struct FfmpegConverter {
    ffmpeg_path: String,
}

impl FfmpegConverter {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }
}

/// Build the downmix command for one input/output pair.
///
/// `-y` makes re-invocation after a timeout or crash overwrite the partial
/// companion instead of failing, which keeps the call idempotent per path.
pub fn build_convert_command(
    ffmpeg_path: &str,
    input: &Path,
    output: &Path,
    policy: &ConvertPolicy,
) -> Command {
    let mut cmd = Command::new(ffmpeg_path);

    cmd.arg("-y");
    cmd.args(["-v", "error"]);
    cmd.arg("-i").arg(input);

    // Keep video and subtitles untouched
    cmd.args(["-map", "0:v", "-map", "0:a:0", "-map", "0:s?"]);
    cmd.args(["-c:v", "copy", "-c:s", "copy"]);

    // Stereo downmix of the selected audio track
    cmd.args(["-ac", "2"]);
    cmd.arg("-c:a").arg(&policy.codec);
    cmd.arg("-b:a").arg(&policy.bitrate);
    cmd.args(["-metadata:s:a:0", "title=English Stereo"]);

    cmd.arg(output);
    cmd
}

impl Converter for FfmpegConverter {
    fn convert(&self, path: &Path, policy: &ConvertPolicy, deadline: Duration) -> ConversionReport {
        let output_path = companion_path(path);
        let cmd = build_convert_command(&self.ffmpeg_path, path, &output_path, policy);

        debug!(input = %path.display(), output = %output_path.display(), "starting stereo downmix");

        let output = match run_with_timeout(cmd, deadline) {
            Ok(Some(out)) => out,
            Ok(None) => {
                warn!(input = %path.display(), "conversion exceeded deadline, killed");
                // Remove the partial companion so a retry starts clean
                let _ = std::fs::remove_file(&output_path);
                return ConversionReport {
                    outcome: ConversionOutcome::Failed,
                    detail: Some(format!("deadline of {}s exceeded", deadline.as_secs())),
                };
            }
            Err(e) => {
                return ConversionReport {
                    outcome: ConversionOutcome::Failed,
                    detail: Some(format!("ffmpeg launch failed: {}", e)),
                }
            }
        };

        if output.status.success() {
            ConversionReport {
                outcome: ConversionOutcome::Converted(output_path),
                detail: None,
            }
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let _ = std::fs::remove_file(&output_path);
            ConversionReport {
                outcome: ConversionOutcome::Failed,
                detail: Some(format!(
                    "ffmpeg exited with status {}: {}",
                    output.status,
                    stderr.trim()
                )),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::ffi::OsStr;

    /// Helper to convert Command args to a Vec of strings for easier testing
    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2)
            .any(|pair| pair[0] == flag && pair[1] == value)
    }

    #[test]
    fn test_companion_path() {
        assert_eq!(
            companion_path(Path::new("/media/movies/film.mkv")),
            PathBuf::from("/media/movies/film.stereo.mkv")
        );
    }

    #[test]
    fn test_companion_path_with_dots_in_name() {
        assert_eq!(
            companion_path(Path::new("/media/film.2024.1080p.mkv")),
            PathBuf::from("/media/film.2024.1080p.stereo.mkv")
        );
    }

    #[test]
    fn test_companion_path_without_extension() {
        assert_eq!(
            companion_path(Path::new("/media/film")),
            PathBuf::from("/media/film.stereo")
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_convert_command_completeness(
            dir in "[a-zA-Z0-9_/-]{1,30}",
            name in "[a-zA-Z0-9_-]{1,20}",
            codec in prop_oneof![Just("aac"), Just("ac3"), Just("libopus")],
            bitrate in prop_oneof![Just("128k"), Just("192k"), Just("256k")],
        ) {
            let input = PathBuf::from(format!("/{}/{}.mkv", dir, name));
            let output = companion_path(&input);
            let policy = ConvertPolicy {
                codec: codec.to_string(),
                bitrate: bitrate.to_string(),
            };

            let cmd = build_convert_command("ffmpeg", &input, &output, &policy);
            let args = get_command_args(&cmd);

            prop_assert_eq!(cmd.get_program(), OsStr::new("ffmpeg"));

            // Overwrite flag keeps retries idempotent
            prop_assert!(args.iter().any(|a| a == "-y"));

            prop_assert!(has_flag_with_value(&args, "-i", input.to_str().unwrap()));
            prop_assert!(has_flag_with_value(&args, "-c:v", "copy"));
            prop_assert!(has_flag_with_value(&args, "-ac", "2"));
            prop_assert!(has_flag_with_value(&args, "-c:a", codec));
            prop_assert!(has_flag_with_value(&args, "-b:a", bitrate));

            // Output path is the last argument and carries the .stereo infix
            let last = args.last().unwrap();
            prop_assert!(last.contains(".stereo."));
        }

        #[test]
        fn prop_companion_path_same_directory(
            dir in "[a-zA-Z0-9_/-]{1,30}",
            name in "[a-zA-Z0-9_-]{1,20}",
            ext in prop_oneof![Just("mkv"), Just("mp4"), Just("avi")],
        ) {
            let original = PathBuf::from(format!("/{}/{}.{}", dir, name, ext));
            let companion = companion_path(&original);

            prop_assert_eq!(companion.parent(), original.parent());
            let fname = companion.file_name().unwrap().to_str().unwrap();
            prop_assert_eq!(fname, format!("{}.stereo.{}", name, ext));
        }
    }
}
