//! Media probing via external ffmpeg/ffprobe commands
//!
//! The actual frame extraction stays behind the commands; this module is
//! plumbing plus failure classification.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::traits::MediaProbe;

/// How a probe failure should be treated by the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeErrorKind {
    /// Worth retrying: file busy, process hiccup, resource pressure
    Transient,

    /// Retrying cannot help: file missing, corrupt container
    Permanent,
}

/// Probe failure with retry classification
#[derive(Debug, Clone)]
pub struct ProbeError {
    pub kind: ProbeErrorKind,
    pub message: String,
}

impl ProbeError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self {
            kind: ProbeErrorKind::Transient,
            message: msg.into(),
        }
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self {
            kind: ProbeErrorKind::Permanent,
            message: msg.into(),
        }
    }
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ProbeError {}

/// Technical metadata extracted from a source file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaInfo {
    pub duration_s: f64,
    pub width: u32,
    pub height: u32,
    pub codec: String,
    pub bitrate: u64,
}

/// Thumbnail generation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThumbnailSpec {
    /// Output width in pixels; height keeps aspect
    pub width: u32,

    /// Position in the file to grab, as a fraction of duration
    pub at_fraction: f64,
}

impl Default for ThumbnailSpec {
    fn default() -> Self {
        Self {
            width: 640,
            at_fraction: 0.2,
        }
    }
}

/// Sprite-sheet generation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpritesSpec {
    pub columns: u32,
    pub rows: u32,

    /// Seconds between captured frames
    pub interval_s: u32,

    /// Width of each tile in pixels
    pub tile_width: u32,
}

impl Default for SpritesSpec {
    fn default() -> Self {
        Self {
            columns: 9,
            rows: 9,
            interval_s: 10,
            tile_width: 160,
        }
    }
}

/// `MediaProbe` implementation shelling out to ffprobe/ffmpeg
pub struct FfmpegProbe {
    artifacts_dir: PathBuf,
    ffprobe_bin: String,
    ffmpeg_bin: String,
}

impl FfmpegProbe {
    pub fn new(artifacts_dir: impl Into<PathBuf>) -> Self {
        Self {
            artifacts_dir: artifacts_dir.into(),
            ffprobe_bin: "ffprobe".to_string(),
            ffmpeg_bin: "ffmpeg".to_string(),
        }
    }

    /// Override the binary names (tests, exotic installs)
    pub fn with_binaries(mut self, ffprobe: impl Into<String>, ffmpeg: impl Into<String>) -> Self {
        self.ffprobe_bin = ffprobe.into();
        self.ffmpeg_bin = ffmpeg.into();
        self
    }

    fn check_source(path: &Path) -> std::result::Result<(), ProbeError> {
        if !path.exists() {
            return Err(ProbeError::permanent(format!(
                "source file missing: {}",
                path.display()
            )));
        }
        Ok(())
    }

    async fn run(cmd: &mut Command, what: &str) -> std::result::Result<Vec<u8>, ProbeError> {
        let output = cmd
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ProbeError::transient(format!("failed to spawn {}: {}", what, e)))?;

        if output.status.success() {
            return Ok(output.stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(classify_tool_failure(what, &stderr))
    }

    fn artifact_path(&self, subdir: &str, path: &Path, ext: &str) -> PathBuf {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".to_string());
        self.artifacts_dir.join(subdir).join(format!("{}.{}", stem, ext))
    }

    async fn ensure_parent(path: &Path) -> std::result::Result<(), ProbeError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProbeError::transient(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        Ok(())
    }
}

/// Decide retryability from the tool's stderr. Corrupt or unreadable
/// containers are permanent; anything else is assumed transient.
fn classify_tool_failure(what: &str, stderr: &str) -> ProbeError {
    const PERMANENT_MARKERS: [&str; 4] = [
        "No such file or directory",
        "Invalid data found",
        "moov atom not found",
        "Permission denied",
    ];

    let message = format!(
        "{} failed: {}",
        what,
        stderr.lines().last().unwrap_or("unknown error")
    );

    if PERMANENT_MARKERS.iter().any(|m| stderr.contains(m)) {
        ProbeError::permanent(message)
    } else {
        ProbeError::transient(message)
    }
}

#[async_trait::async_trait]
impl MediaProbe for FfmpegProbe {
    async fn metadata(&self, path: &Path) -> std::result::Result<MediaInfo, ProbeError> {
        Self::check_source(path)?;

        let mut cmd = Command::new(&self.ffprobe_bin);
        cmd.arg("-v")
            .arg("error")
            .arg("-select_streams")
            .arg("v:0")
            .arg("-show_entries")
            .arg("stream=width,height,codec_name,bit_rate:format=duration,bit_rate")
            .arg("-of")
            .arg("json")
            .arg(path);

        let stdout = Self::run(&mut cmd, "ffprobe").await?;
        let parsed: serde_json::Value = serde_json::from_slice(&stdout)
            .map_err(|e| ProbeError::permanent(format!("unreadable ffprobe output: {}", e)))?;

        let stream = parsed["streams"].get(0).cloned().unwrap_or_default();
        let format = &parsed["format"];

        let info = MediaInfo {
            duration_s: format["duration"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0),
            width: stream["width"].as_u64().unwrap_or(0) as u32,
            height: stream["height"].as_u64().unwrap_or(0) as u32,
            codec: stream["codec_name"].as_str().unwrap_or("unknown").to_string(),
            bitrate: format["bit_rate"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
        };

        debug!(
            "Probed metadata: path={}, codec={}, duration={}s",
            path.display(),
            info.codec,
            info.duration_s
        );

        Ok(info)
    }

    async fn thumbnail(
        &self,
        path: &Path,
        spec: &ThumbnailSpec,
    ) -> std::result::Result<PathBuf, ProbeError> {
        Self::check_source(path)?;

        let info = self.metadata(path).await?;
        let seek = (info.duration_s * spec.at_fraction).max(0.0);
        let out = self.artifact_path("thumbnails", path, "jpg");
        Self::ensure_parent(&out).await?;

        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.arg("-y")
            .arg("-v")
            .arg("error")
            .arg("-ss")
            .arg(format!("{:.3}", seek))
            .arg("-i")
            .arg(path)
            .arg("-frames:v")
            .arg("1")
            .arg("-vf")
            .arg(format!("scale={}:-2", spec.width))
            .arg(&out);

        Self::run(&mut cmd, "ffmpeg").await?;
        Ok(out)
    }

    async fn sprites(
        &self,
        path: &Path,
        spec: &SpritesSpec,
    ) -> std::result::Result<PathBuf, ProbeError> {
        Self::check_source(path)?;

        let out = self.artifact_path("sprites", path, "jpg");
        Self::ensure_parent(&out).await?;

        let tile = format!("tile={}x{}", spec.columns, spec.rows);
        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.arg("-y")
            .arg("-v")
            .arg("error")
            .arg("-i")
            .arg(path)
            .arg("-vf")
            .arg(format!(
                "fps=1/{},scale={}:-2,{}",
                spec.interval_s.max(1),
                spec.tile_width,
                tile
            ))
            .arg("-frames:v")
            .arg("1")
            .arg(&out);

        Self::run(&mut cmd, "ffmpeg").await?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_markers() {
        let err = classify_tool_failure("ffmpeg", "x.mp4: Invalid data found when processing input");
        assert_eq!(err.kind, ProbeErrorKind::Permanent);

        let err = classify_tool_failure("ffmpeg", "Resource temporarily unavailable");
        assert_eq!(err.kind, ProbeErrorKind::Transient);
    }

    #[test]
    fn test_missing_source_is_permanent() {
        let err = FfmpegProbe::check_source(Path::new("/definitely/not/here.mp4")).unwrap_err();
        assert_eq!(err.kind, ProbeErrorKind::Permanent);
    }

    #[test]
    fn test_artifact_path_uses_stem() {
        let probe = FfmpegProbe::new("/tmp/artifacts");
        let out = probe.artifact_path("thumbnails", Path::new("/media/clip.mp4"), "jpg");
        assert_eq!(out, PathBuf::from("/tmp/artifacts/thumbnails/clip.jpg"));
    }
}
