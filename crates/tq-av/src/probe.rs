//! Container duration lookup via ffprobe.

use std::path::Path;

use serde::Deserialize;

use crate::command::ToolCommand;
use crate::tools::ToolRegistry;

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

/// Extract `format.duration` from ffprobe's JSON output.
pub fn parse_duration(json: &str) -> tq_core::Result<Option<f64>> {
    let out: FfprobeOutput = serde_json::from_str(json)
        .map_err(|e| tq_core::Error::tool("ffprobe", format!("JSON parse error: {e}")))?;

    Ok(out
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0))
}

/// Probe the duration of a media file in seconds.
///
/// Returns `Ok(None)` when ffprobe runs but the container reports no
/// duration.
pub async fn probe_duration(tools: &ToolRegistry, path: &Path) -> tq_core::Result<Option<f64>> {
    let ffprobe = tools.require("ffprobe")?;

    let mut cmd = ToolCommand::new(ffprobe.path.clone());
    cmd.args(["-v", "quiet", "-print_format", "json", "-show_format"]);
    cmd.arg(path.to_string_lossy().as_ref());

    let output = cmd.execute().await?;
    parse_duration(&output.stdout)
}
