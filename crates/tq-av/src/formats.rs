//! Which uploads need transcoding before browsers can stream them.

/// Container formats browsers cannot play natively, matched against both the
/// file extension and the MIME type.
const FORMATS_REQUIRING_CONVERSION: &[&str] = &["avi", "mkv", "x-msvideo", "x-matroska"];

/// Whether an upload with this MIME type and extension must be converted.
///
/// The extension may carry a leading dot. A MIME type matches when it
/// contains any of the listed format names (`video/x-matroska`, `video/avi`).
pub fn requires_conversion(mime_type: &str, extension: &str) -> bool {
    let ext = extension.trim_start_matches('.').to_ascii_lowercase();
    if FORMATS_REQUIRING_CONVERSION.contains(&ext.as_str()) {
        return true;
    }

    let mime = mime_type.to_ascii_lowercase();
    FORMATS_REQUIRING_CONVERSION
        .iter()
        .any(|format| mime.contains(format))
}
