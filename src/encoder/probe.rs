//! Container inspection with ffprobe

use super::types::EncodingError;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

/// Streams and duration of a finished container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerInfo {
    pub video_streams: usize,
    pub audio_streams: usize,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub duration: Duration,
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

fn parse_probe(json: &str) -> Result<ContainerInfo, EncodingError> {
    let probe: ProbeOutput = serde_json::from_str(json)
        .map_err(|e| EncodingError::ConfigurationFailed(format!("invalid ffprobe output: {}", e)))?;

    let codec_of = |kind: &str| {
        probe
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some(kind))
            .and_then(|s| s.codec_name.clone())
    };
    let count_of = |kind: &str| {
        probe
            .streams
            .iter()
            .filter(|s| s.codec_type.as_deref() == Some(kind))
            .count()
    };

    let seconds = probe
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0)
        .unwrap_or(0.0);

    Ok(ContainerInfo {
        video_streams: count_of("video"),
        audio_streams: count_of("audio"),
        video_codec: codec_of("video"),
        audio_codec: codec_of("audio"),
        duration: Duration::from_secs_f64(seconds),
    })
}

/// Inspect a container with `ffprobe`
pub async fn probe_output(path: &Path) -> Result<ContainerInfo, EncodingError> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-show_entries",
            "stream=codec_type,codec_name:format=duration",
            "-of",
            "json",
        ])
        .arg(path)
        .output()
        .await
        .map_err(|e| EncodingError::ConfigurationFailed(format!("Failed to run ffprobe: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(EncodingError::ConfigurationFailed(format!(
            "ffprobe failed: {}",
            stderr.trim()
        )));
    }

    parse_probe(&String::from_utf8_lossy(&output.stdout))
}
