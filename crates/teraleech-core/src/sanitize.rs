use crate::MediaKind;
use std::path::Path;

pub const MAX_FILENAME_CHARS: usize = 200;

const FORBIDDEN: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
const VIDEO_EXTENSIONS: [&str; 5] = ["mp4", "mkv", "mov", "avi", "webm"];
const AUDIO_EXTENSIONS: [&str; 5] = ["mp3", "ogg", "wav", "flac", "m4a"];

/// Safe local filename for the `index`-th (zero based) file of a transfer.
pub fn sanitize_filename(raw: &str, url: &str, index: usize) -> String {
    let mut name: String = raw
        .chars()
        .map(|c| {
            if FORBIDDEN.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .take(MAX_FILENAME_CHARS)
        .collect();

    if !name.is_empty() && !name.contains('.') {
        if let Some(ext) = extension_from_url(url) {
            let keep = MAX_FILENAME_CHARS - ext.chars().count();
            name = name.chars().take(keep).collect();
            name.push_str(&ext);
        }
    }

    if name.trim().trim_matches('.').is_empty() {
        return format!("file_{}", index + 1);
    }
    name
}

/// Extension (with the dot) of the URL path, when 2..=6 chars long.
fn extension_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.last()?.to_string();
    let dot = last.rfind('.')?;
    if dot == 0 {
        return None;
    }
    let ext = &last[dot..];
    (2..=6).contains(&ext.chars().count()).then(|| ext.to_string())
}

pub fn media_kind_for(filename: &str) -> MediaKind {
    let ext = Path::new(filename)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        MediaKind::Video
    } else if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
        MediaKind::Audio
    } else {
        MediaKind::Document
    }
}

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
