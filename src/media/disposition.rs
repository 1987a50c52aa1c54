//! Content-Disposition filename handling
//!
//! The worker names artifacts through `Content-Disposition` (RFC 6266 with
//! RFC 5987 `filename*` for non-ASCII names); the download route sends the
//! same header back to clients.

use std::path::Path;

/// Filename used when the worker response carries no usable name
pub const DEFAULT_FILENAME: &str = "video_download.mp4";

/// Extract a filename from a `Content-Disposition` header value.
///
/// Prefers `filename*=UTF-8''...`, then `filename=...`, returning only the
/// final path component. Returns `None` if no usable name is present.
pub fn parse_filename(header: &str) -> Option<String> {
    let params = split_params(header);

    let extended = params
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("filename*"))
        .and_then(|(_, value)| decode_extended(value));

    let name = extended.or_else(|| {
        params
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("filename"))
            .map(|(_, value)| value.clone())
    });

    name.as_deref()
        .and_then(base_name)
        .filter(|n| !n.is_empty())
}

/// Like [`parse_filename`] but falls back to [`DEFAULT_FILENAME`].
pub fn filename_or_default(header: Option<&str>) -> String {
    header
        .and_then(parse_filename)
        .unwrap_or_else(|| DEFAULT_FILENAME.to_string())
}

/// Build an `attachment` header for `filename`.
///
/// Plain ASCII names are quoted; anything with non-ASCII, control
/// characters, quotes, separators or whitespace is sent percent-encoded as
/// `filename*=UTF-8''...`. The result is always a valid header value.
pub fn build_header(filename: &str) -> String {
    let needs_encoding = filename.chars().any(|c| {
        !c.is_ascii()
            || c.is_ascii_control()
            || matches!(c, '"' | '\\' | ';' | ',')
            || c.is_whitespace()
    });

    if needs_encoding {
        format!(
            "attachment; filename*=UTF-8''{}",
            urlencoding::encode(filename)
        )
    } else {
        format!("attachment; filename=\"{}\"", filename)
    }
}

/// Split `attachment; a=b; c="d"` into `(name, unquoted value)` pairs.
fn split_params(header: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = header;

    // Skip the disposition type.
    match rest.find(';') {
        Some(idx) => rest = &rest[idx + 1..],
        None => return params,
    }

    loop {
        rest = rest.trim_start_matches(|c: char| c == ';' || c.is_whitespace());
        if rest.is_empty() {
            break;
        }
        let Some(eq) = rest.find('=') else { break };
        let name = rest[..eq].trim().to_string();
        rest = rest[eq + 1..].trim_start();

        let value = if let Some(quoted) = rest.strip_prefix('"') {
            let mut value = String::new();
            let mut chars = quoted.char_indices();
            let mut end = quoted.len();
            while let Some((i, c)) = chars.next() {
                match c {
                    '\\' => {
                        if let Some((_, escaped)) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => {
                        end = i + 1;
                        break;
                    }
                    _ => value.push(c),
                }
            }
            rest = &quoted[end.min(quoted.len())..];
            value
        } else {
            let end = rest.find(';').unwrap_or(rest.len());
            let value = rest[..end].trim().to_string();
            rest = &rest[end..];
            value
        };

        params.push((name, value));
    }

    params
}

/// Decode an RFC 5987 `charset'lang'pct-encoded` value. Only UTF-8 is accepted.
fn decode_extended(value: &str) -> Option<String> {
    let mut parts = value.splitn(3, '\'');
    let charset = parts.next()?;
    let _lang = parts.next()?;
    let encoded = parts.next()?;
    if !charset.eq_ignore_ascii_case("utf-8") {
        return None;
    }
    urlencoding::decode(encoded).ok().map(|s| s.into_owned())
}

fn base_name(name: &str) -> Option<String> {
    let normalized = name.replace('\\', "/");
    Path::new(&normalized)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
}
