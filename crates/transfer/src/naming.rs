//! Stored-name derivation and validation.

use percent_encoding::percent_decode_str;

use crate::error::TransferError;
use crate::types::SourceDescriptor;

/// Longest accepted name, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Validates a name for storage.
///
/// Rejects:
/// - Empty names and the `.` / `..` entries
/// - Path separators (`/` and `\`)
/// - Control characters
/// - Names longer than [`MAX_NAME_LEN`] bytes
pub fn validate_name(name: &str) -> Result<(), TransferError> {
    if name.is_empty() {
        return Err(TransferError::SinkRejected("empty name".into()));
    }
    if name == "." || name == ".." {
        return Err(TransferError::SinkRejected(format!(
            "reserved name not allowed: {name}"
        )));
    }
    if name.contains(['/', '\\']) {
        return Err(TransferError::SinkRejected(format!(
            "path separator not allowed: {name}"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(TransferError::SinkRejected(
            "control characters not allowed in name".into(),
        ));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(TransferError::SinkRejected(format!(
            "name longer than {MAX_NAME_LEN} bytes"
        )));
    }
    Ok(())
}

/// Returns the last non-empty path segment of `url`, percent-decoded.
pub fn name_from_url(url: &str) -> Option<String> {
    let without_fragment = url.split('#').next().unwrap_or(url);
    let without_query = without_fragment
        .split('?')
        .next()
        .unwrap_or(without_fragment);
    let path = match without_query.split_once("://") {
        Some((_, rest)) => rest.split_once('/').map(|(_, p)| p).unwrap_or(""),
        None => without_query,
    };
    let segment = path.rsplit('/').find(|s| !s.is_empty())?;
    let decoded = percent_decode_str(segment).decode_utf8_lossy().trim().to_string();
    if decoded.is_empty() || validate_name(&decoded).is_err() {
        return None;
    }
    Some(decoded)
}

/// Extracts the file name from a `Content-Disposition` header value.
///
/// Prefers the RFC 5987 `filename*=` form over plain `filename=`.
pub fn name_from_content_disposition(value: &str) -> Option<String> {
    let mut plain = None;
    for param in value.split(';').map(str::trim) {
        let Some((key, raw)) = param.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let raw = raw.trim();
        if key == "filename*" {
            // charset'lang'percent-encoded
            let encoded = raw.splitn(3, '\'').nth(2).unwrap_or(raw);
            let decoded = percent_decode_str(encoded.trim_matches('"'))
                .decode_utf8_lossy()
                .to_string();
            if validate_name(&decoded).is_ok() {
                return Some(decoded);
            }
        } else if key == "filename" {
            let name = raw.trim_matches('"').to_string();
            if validate_name(&name).is_ok() {
                plain = Some(name);
            }
        }
    }
    plain
}

/// Picks the stored name for a transfer.
///
/// Order: explicit override, name suggested by the source, last URL segment,
/// then `file-<first 8 chars of transfer id>`. Only an explicit override is
/// validated strictly; derived candidates that fail validation are skipped.
pub fn resolve_name(
    desired: Option<&str>,
    suggested: Option<&str>,
    source: &SourceDescriptor,
    transfer_id: &str,
) -> Result<String, TransferError> {
    if let Some(name) = desired {
        let name = name.trim();
        validate_name(name)?;
        return Ok(name.to_string());
    }

    if let Some(name) = suggested
        && validate_name(name).is_ok()
    {
        return Ok(name.to_string());
    }

    let from_source = match source {
        SourceDescriptor::Url(url) => name_from_url(url),
        SourceDescriptor::Handle(handle) => name_from_url(handle),
    };
    if let Some(name) = from_source {
        return Ok(name);
    }

    let short: String = transfer_id.chars().take(8).collect();
    Ok(format!("file-{short}"))
}

/// Returns the `n`-th alternative for `name`: `report (2).pdf`.
pub fn numbered_name(name: &str, n: u32) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem} ({n}).{ext}"),
        _ => format!("{name} ({n})"),
    }
}
