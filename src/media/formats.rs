//! Worker metadata parsing and quality classification.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Quality bucket presented to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Quality {
    Audio,
    /// 360p and below
    FD,
    /// 480p
    SD,
    /// 720p
    HD,
    /// 1080p and above
    FHD,
    Unknown,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Audio => "Audio",
            Quality::FD => "FD",
            Quality::SD => "SD",
            Quality::HD => "HD",
            Quality::FHD => "FHD",
            Quality::Unknown => "Unknown",
        }
    }

    /// Every category that can be enabled through configuration.
    pub fn selectable() -> [Quality; 5] {
        [
            Quality::Audio,
            Quality::FD,
            Quality::SD,
            Quality::HD,
            Quality::FHD,
        ]
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Audio" => Ok(Quality::Audio),
            "FD" => Ok(Quality::FD),
            "SD" => Ok(Quality::SD),
            "HD" => Ok(Quality::HD),
            "FHD" => Ok(Quality::FHD),
            other => Err(format!("unknown quality category '{}'", other)),
        }
    }
}

/// Parse a comma-separated category list, ignoring unknown entries.
///
/// An empty or entirely invalid list enables every category.
pub fn parse_quality_categories(raw: &str) -> HashSet<Quality> {
    let parsed: HashSet<Quality> = raw
        .split(',')
        .filter_map(|s| s.parse::<Quality>().ok())
        .collect();
    if parsed.is_empty() {
        Quality::selectable().into_iter().collect()
    } else {
        parsed
    }
}

/// Raw metadata as returned by the worker's `/api/info` endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMetadata {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub formats: Vec<Value>,
}

/// A downloadable format offered to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormatOption {
    pub format_id: String,
    pub format: String,
    #[serde(rename = "ext")]
    pub extension: String,
    pub resolution: String,
    pub video_codec: String,
    pub audio_codec: String,
    pub file_size: u64,
    pub fps: u32,
    pub quality: Quality,
    pub official_name: String,
}

/// Client-facing video metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoInfo {
    pub url: String,
    pub title: String,
    pub duration: u64,
    pub thumbnail_url: String,
    pub uploader: String,
    pub formats: Vec<FormatOption>,
}

impl VideoInfo {
    /// Build client metadata, keeping only formats in `enabled` categories.
    pub fn from_raw(raw: RawMetadata, enabled: &HashSet<Quality>) -> Self {
        let formats = raw
            .formats
            .iter()
            .filter_map(parse_format)
            .filter(|f| enabled.contains(&f.quality))
            .collect();

        VideoInfo {
            url: raw.url,
            title: raw.title,
            duration: raw.duration.map(|d| d.max(0.0) as u64).unwrap_or(0),
            thumbnail_url: raw.thumbnail.unwrap_or_default(),
            uploader: raw.uploader.unwrap_or_default(),
            formats,
        }
    }
}

/// Convert one raw worker format. Formats without an extension are skipped.
pub fn parse_format(raw: &Value) -> Option<FormatOption> {
    let str_field = |key: &str| {
        raw.get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };

    let extension = str_field("ext");
    if extension.is_empty() {
        return None;
    }

    let mut format = FormatOption {
        format_id: str_field("format_id"),
        format: str_field("format"),
        extension,
        resolution: str_field("resolution"),
        video_codec: str_field("vcodec"),
        audio_codec: str_field("acodec"),
        file_size: raw
            .get("filesize")
            .and_then(|v| v.as_f64())
            .map(|v| v.max(0.0) as u64)
            .unwrap_or(0),
        fps: raw
            .get("fps")
            .and_then(|v| v.as_f64())
            .map(|v| v.max(0.0) as u32)
            .unwrap_or(0),
        quality: Quality::Unknown,
        official_name: String::new(),
    };

    format.quality = classify(&format.video_codec, &format.resolution);
    format.official_name = official_name(&format);
    Some(format)
}

/// Map codec + resolution to a quality bucket.
pub fn classify(video_codec: &str, resolution: &str) -> Quality {
    if video_codec.is_empty() || video_codec == "none" {
        return Quality::Audio;
    }

    match resolution {
        "1920x1080" | "1920x1072" | "2560x1440" | "3840x2160" => Quality::FHD,
        "1280x720" | "1280x714" => Quality::HD,
        "854x476" | "854x480" | "640x480" => Quality::SD,
        "640x360" | "640x356" | "640x358" | "426x240" | "426x238" => Quality::FD,
        "256x144" | "256x142" | "348x196" | "360x240" | "432x240" | "480x270" | "512x288" => {
            Quality::FD
        }
        other => classify_by_height(other),
    }
}

fn classify_by_height(resolution: &str) -> Quality {
    let Some((_, height)) = resolution.split_once('x') else {
        return Quality::Unknown;
    };
    let digits: String = height.chars().take_while(|c| c.is_ascii_digit()).collect();
    let height: u32 = digits.parse().unwrap_or(0);

    match height {
        h if h >= 1080 => Quality::FHD,
        h if h >= 720 => Quality::HD,
        h if h >= 480 => Quality::SD,
        _ => Quality::FD,
    }
}

fn official_name(format: &FormatOption) -> String {
    if format.quality == Quality::Audio {
        format!("{} - {}", format.quality, format.audio_codec)
    } else {
        format!(
            "{} ({}) - {} + {}",
            format.quality, format.resolution, format.video_codec, format.audio_codec
        )
    }
}
