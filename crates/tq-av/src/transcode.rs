//! Conversion of uploads to streaming-friendly H.264/AAC MP4.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tq_core::config::TranscoderConfig;
use tq_core::Error;

use crate::command::ToolCommand;
use crate::probe::probe_duration;
use crate::progress::ProgressParser;
use crate::tools::ToolRegistry;

/// Callback receiving whole-percent progress (0..=100) during a conversion.
pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

/// Result of a successful conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeOutput {
    pub output_path: PathBuf,
    /// Duration of the converted file, when it could be determined.
    pub duration_secs: Option<f64>,
}

/// Converts a media file into the streaming format.
///
/// Implementations must remove any partial output they wrote before
/// returning an error.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn convert(
        &self,
        input: &Path,
        output: &Path,
        on_progress: ProgressFn,
    ) -> tq_core::Result<TranscodeOutput>;
}

/// Remove a file, treating "already gone" as success.
pub async fn remove_if_exists(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// FfmpegTranscoder
// ---------------------------------------------------------------------------

/// [`Transcoder`] that shells out to ffmpeg, using ffprobe for durations.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    tools: ToolRegistry,
    settings: TranscoderConfig,
    timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(tools: ToolRegistry, settings: TranscoderConfig) -> Self {
        Self {
            tools,
            settings,
            timeout: Duration::from_secs(2 * 60 * 60),
        }
    }

    /// Hard limit on a single ffmpeg run; the process is killed afterwards.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn settings(&self) -> &TranscoderConfig {
        &self.settings
    }

    /// Assemble the ffmpeg invocation for `input -> output`.
    pub fn build_command(&self, ffmpeg: &Path, input: &Path, output: &Path) -> ToolCommand {
        let s = &self.settings;
        let mut cmd = ToolCommand::new(ffmpeg.to_path_buf());
        cmd.timeout(self.timeout);
        cmd.args(["-y", "-hide_banner", "-nostats", "-progress", "pipe:2"]);
        cmd.arg("-i");
        cmd.arg(input.to_string_lossy().as_ref());
        cmd.args(["-c:v", s.video_codec.as_str()]);
        cmd.args(["-preset", s.preset.as_str()]);
        cmd.args(["-crf".to_string(), s.crf.to_string()]);
        cmd.args(["-pix_fmt", s.pixel_format.as_str()]);
        cmd.args(["-c:a", s.audio_codec.as_str()]);
        if s.faststart {
            cmd.args(["-movflags", "+faststart"]);
        }
        cmd.args(["-f", "mp4"]);
        cmd.arg(output.to_string_lossy().as_ref());
        cmd
    }

    async fn duration_of(&self, path: &Path) -> Option<f64> {
        match probe_duration(&self.tools, path).await {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(path = %path.display(), "Could not probe duration: {e}");
                None
            }
        }
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn convert(
        &self,
        input: &Path,
        output: &Path,
        on_progress: ProgressFn,
    ) -> tq_core::Result<TranscodeOutput> {
        let ffmpeg = self.tools.require("ffmpeg")?.path.clone();

        if !tokio::fs::try_exists(input).await.unwrap_or(false) {
            return Err(Error::missing_input(input));
        }
        if let Some(dir) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }

        // Progress needs the source duration; without it the encode still runs.
        let source_duration = self.duration_of(input).await;
        let mut parser = ProgressParser::new(source_duration);

        tracing::info!(
            input = %input.display(),
            output = %output.display(),
            codec = %self.settings.video_codec,
            crf = self.settings.crf,
            preset = %self.settings.preset,
            "Starting ffmpeg conversion"
        );

        let cmd = self.build_command(&ffmpeg, input, output);
        let result = cmd
            .execute_with_stderr_lines(|line| {
                if let Some(pct) = parser.feed(line) {
                    on_progress(pct);
                }
            })
            .await;

        if let Err(e) = result {
            if let Err(rm) = remove_if_exists(output).await {
                tracing::warn!(output = %output.display(), "Failed to remove partial output: {rm}");
            }
            return Err(e);
        }

        let duration_secs = match self.duration_of(output).await {
            Some(d) => Some(d),
            None => source_duration,
        };

        Ok(TranscodeOutput {
            output_path: output.to_path_buf(),
            duration_secs,
        })
    }
}
