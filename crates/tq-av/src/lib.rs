//! # tq-av
//!
//! Audio/video processing and external tool management for the conversion
//! queue.
//!
//! This crate provides:
//!
//! - **Tool discovery** ([`ToolRegistry`]) -- find and cache paths to ffmpeg
//!   and ffprobe.
//! - **Command execution** ([`ToolCommand`]) -- async builder with timeout
//!   support and line-by-line stderr streaming.
//! - **Progress parsing** ([`ProgressParser`]) -- turns ffmpeg `-progress`
//!   output into whole percentages.
//! - **Probing** ([`probe_duration`]) -- container duration via ffprobe.
//! - **Transcoding** ([`Transcoder`], [`FfmpegTranscoder`]) -- conversion to
//!   streaming-friendly H.264/AAC MP4.
//! - **Format policy** ([`requires_conversion`]).

pub mod command;
pub mod formats;
pub mod probe;
pub mod progress;
pub mod tools;
pub mod transcode;

// ---- Re-exports for convenience ----

pub use command::{ToolCommand, ToolOutput};
pub use formats::requires_conversion;
pub use probe::probe_duration;
pub use progress::ProgressParser;
pub use tools::{ToolConfig, ToolInfo, ToolRegistry};
pub use transcode::{remove_if_exists, FfmpegTranscoder, ProgressFn, TranscodeOutput, Transcoder};
