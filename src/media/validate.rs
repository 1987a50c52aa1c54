//! Request validation helpers: domain allow-list, format ids, filenames.

use url::Url;

/// Maximum accepted format id length
pub const MAX_FORMAT_ID_LEN: usize = 50;

/// Maximum filename length (in characters) kept on disk
pub const MAX_FILENAME_CHARS: usize = 200;

/// Default domains accepted for extraction
pub const DEFAULT_ALLOWED_DOMAINS: &[&str] = &[
    "youtube.com",
    "youtu.be",
    "vimeo.com",
    "facebook.com",
    "m.facebook.com",
    "fb.watch",
    "tiktok.com",
    "instagram.com",
    "twitter.com",
    "x.com",
];

/// Check `video_url` against the allow-list.
///
/// The host is lower-cased with a leading `www.` removed, then accepted when
/// it equals, is a subdomain of, or contains one of the allowed domains.
pub fn is_allowed_url(video_url: &str, allowed_domains: &[String]) -> bool {
    let Ok(parsed) = Url::parse(video_url) else {
        return false;
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let host = host.to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);

    allowed_domains
        .iter()
        .map(|d| d.trim().to_lowercase())
        .filter(|d| !d.is_empty())
        .any(|domain| {
            host == domain || host.ends_with(&format!(".{}", domain)) || host.contains(&domain)
        })
}

/// Format ids are opaque worker tokens; only their length is checked.
pub fn is_valid_format_id(format_id: &str) -> bool {
    !format_id.is_empty() && format_id.len() <= MAX_FORMAT_ID_LEN
}

/// Replace characters that are unsafe in filenames, and control characters, with `_`.
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            other => other,
        })
        .collect()
}

/// Truncate to at most `max_chars` characters, keeping the extension when it fits.
pub fn truncate_filename(filename: &str, max_chars: usize) -> String {
    let char_count = filename.chars().count();
    if char_count <= max_chars {
        return filename.to_string();
    }

    let Some(dot) = filename.rfind('.') else {
        return filename.chars().take(max_chars).collect();
    };

    let ext = &filename[dot..];
    let ext_chars = ext.chars().count();
    if ext_chars >= max_chars {
        return filename.chars().take(max_chars).collect();
    }

    let base: String = filename.chars().take(max_chars - ext_chars).collect();
    format!("{}{}", base, ext)
}
