//! ffprobe-backed audio track probe.
//!
//! Runs `ffprobe -print_format json -show_streams -select_streams a` and
//! maps the stream list into track descriptors.

use super::{run_with_timeout, AdapterError, AudioProbe, AudioTrack};
use std::path::Path;
use std::process::Command;
use std::time::Duration;

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub channels: Option<u32>,
        pub tags: Option<HashMap<String, String>>,
        pub disposition: Option<Disposition>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Disposition {
        pub default: Option<u8>,
    }
}

/// Audio probe shelling out to ffprobe.
#[derive(Debug, Clone)]
pub struct FfprobeAudioProbe {
    ffprobe_path: String,
}

impl FfprobeAudioProbe {
    pub fn new(ffprobe_path: impl Into<String>) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
        }
    }
}

impl AudioProbe for FfprobeAudioProbe {
    fn probe(&self, path: &Path, deadline: Duration) -> Result<Vec<AudioTrack>, AdapterError> {
        let mut cmd = Command::new(&self.ffprobe_path);
        cmd.args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_streams",
            "-select_streams",
            "a",
        ])
        .arg(path);

        let output = run_with_timeout(cmd, deadline)?
            .ok_or(AdapterError::DeadlineExceeded(deadline))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AdapterError::ToolFailed(format!(
                "ffprobe exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_audio_streams(&stdout)
    }
}

/// Parses ffprobe JSON output into audio track descriptors.
pub fn parse_audio_streams(json_str: &str) -> Result<Vec<AudioTrack>, AdapterError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| AdapterError::ParseError(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let mut tracks = Vec::with_capacity(streams.len());

    for stream in streams {
        let tags = stream.tags.unwrap_or_default();
        let language = tags
            .get("language")
            .map(|l| l.to_lowercase())
            .unwrap_or_else(|| "und".to_string());
        let title = tags.get("title").cloned();
        let is_default = stream
            .disposition
            .and_then(|d| d.default)
            .map(|d| d != 0)
            .unwrap_or(false);

        tracks.push(AudioTrack {
            language,
            channels: stream.channels.unwrap_or(0),
            is_default,
            title,
        });
    }

    Ok(tracks)
}
