//! Typed response parsers
//!
//! Each parser declares one JSON shape returned by a resolver API. The chain
//! tries them in order; the first parser that recognizes the body wins.

use crate::{FileDescriptor, ResolvedContent};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::OnceLock;

pub trait ResponseParser: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` means the body does not have this parser's shape.
    fn parse(&self, body: &Value) -> Option<ResolvedContent>;
}

/// `{"response": [{"url": .., "title": .., "size": ..}]}`
pub struct ResponseListParser;

#[derive(Debug, Deserialize)]
struct ResponseList {
    response: Vec<ResponseItem>,
}

#[derive(Debug, Deserialize)]
struct ResponseItem {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    size: Option<Value>,
}

impl ResponseParser for ResponseListParser {
    fn name(&self) -> &'static str {
        "response_list"
    }

    fn parse(&self, body: &Value) -> Option<ResolvedContent> {
        let list: ResponseList = serde_json::from_value(body.clone()).ok()?;
        let is_folder = list.response.len() > 1;

        let title = list
            .response
            .first()
            .and_then(|item| item.title.clone())
            .unwrap_or_else(|| {
                if is_folder {
                    "Terabox Folder".to_string()
                } else {
                    "Terabox File".to_string()
                }
            });

        let contents: Vec<FileDescriptor> = list
            .response
            .into_iter()
            .enumerate()
            .filter_map(|(idx, item)| {
                let url = item.url.filter(|u| !u.trim().is_empty())?;
                Some(FileDescriptor {
                    url,
                    filename: item.title.unwrap_or_else(|| format!("file_{}", idx + 1)),
                    size: item.size.as_ref().and_then(parse_size),
                })
            })
            .collect();

        Some(ResolvedContent::new(title, is_folder, contents))
    }
}

/// `{"direct_link": .., "file_name": .., "file_size_bytes" | "size": ..}`
pub struct DirectLinkParser;

#[derive(Debug, Deserialize)]
struct DirectLink {
    direct_link: String,
    file_name: String,
    #[serde(default)]
    file_size_bytes: Option<Value>,
    #[serde(default)]
    size: Option<Value>,
}

impl ResponseParser for DirectLinkParser {
    fn name(&self) -> &'static str {
        "direct_link"
    }

    fn parse(&self, body: &Value) -> Option<ResolvedContent> {
        let shape: DirectLink = serde_json::from_value(body.clone()).ok()?;
        if shape.direct_link.trim().is_empty() || shape.file_name.trim().is_empty() {
            return None;
        }
        let size = shape
            .file_size_bytes
            .as_ref()
            .or(shape.size.as_ref())
            .and_then(parse_size);
        let descriptor = FileDescriptor {
            url: shape.direct_link,
            filename: shape.file_name.clone(),
            size,
        };
        Some(ResolvedContent::new(shape.file_name, false, vec![descriptor]))
    }
}

/// `{"download_link" | "dlink": .., "file_name" | "filename": .., "size": ..}`
pub struct DownloadLinkParser;

#[derive(Debug, Deserialize)]
struct DownloadLink {
    #[serde(alias = "dlink")]
    download_link: String,
    #[serde(default, alias = "filename")]
    file_name: Option<String>,
    #[serde(default)]
    size: Option<Value>,
}

impl ResponseParser for DownloadLinkParser {
    fn name(&self) -> &'static str {
        "download_link"
    }

    fn parse(&self, body: &Value) -> Option<ResolvedContent> {
        let shape: DownloadLink = serde_json::from_value(body.clone()).ok()?;
        if shape.download_link.trim().is_empty() {
            return None;
        }
        let filename = shape
            .file_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "file_1".to_string());
        let descriptor = FileDescriptor {
            url: shape.download_link,
            filename: filename.clone(),
            size: shape.size.as_ref().and_then(parse_size),
        };
        Some(ResolvedContent::new(filename, false, vec![descriptor]))
    }
}

pub fn default_chain() -> Vec<Box<dyn ResponseParser>> {
    vec![
        Box::new(ResponseListParser),
        Box::new(DirectLinkParser),
        Box::new(DownloadLinkParser),
    ]
}

/// Runs the chain, returning the name of the matching parser with its result.
pub fn parse_with_chain(
    chain: &[Box<dyn ResponseParser>],
    body: &Value,
) -> Option<(&'static str, ResolvedContent)> {
    chain
        .iter()
        .find_map(|parser| parser.parse(body).map(|content| (parser.name(), content)))
}

fn size_regex() -> &'static Regex {
    static SIZE: OnceLock<Regex> = OnceLock::new();
    SIZE.get_or_init(|| {
        Regex::new(r"(?i)^\s*([0-9]+(?:\.[0-9]+)?)\s*([a-z]*)\s*$")
            .expect("size pattern should compile")
    })
}

/// Byte count from a JSON number or a string such as `"1.5 GB"`.
/// Unrecognized units yield `None` instead of a guessed value.
pub fn parse_size(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => parse_size_str(s),
        _ => None,
    }
}

pub fn parse_size_str(raw: &str) -> Option<u64> {
    let caps = size_regex().captures(raw)?;
    let number: f64 = caps.get(1)?.as_str().parse().ok()?;
    let multiplier: u64 = match caps.get(2).map(|m| m.as_str().to_ascii_uppercase()).as_deref() {
        None | Some("") | Some("B") | Some("BYTES") => 1,
        Some("K") | Some("KB") | Some("KIB") => 1 << 10,
        Some("M") | Some("MB") | Some("MIB") => 1 << 20,
        Some("G") | Some("GB") | Some("GIB") => 1 << 30,
        Some("T") | Some("TB") | Some("TIB") => 1 << 40,
        _ => return None,
    };
    Some((number * multiplier as f64).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn response_list_keeps_items_with_url() {
        let body = json!({
            "response": [
                {"url": "https://cdn.example/a.mp4", "title": "a.mp4", "size": "10 MB"},
                {"title": "missing-url"},
                {"url": "https://cdn.example/c.mp3"}
            ]
        });
        let content = ResponseListParser.parse(&body).expect("recognized");
        assert!(content.is_folder);
        assert_eq!(content.title, "a.mp4");
        assert_eq!(content.contents.len(), 2);
        assert_eq!(content.contents[0].size, Some(10 * 1024 * 1024));
        assert_eq!(content.contents[1].filename, "file_3");
        assert_eq!(content.total_size, None);
    }

    #[test]
    fn direct_link_prefers_byte_count_field() {
        let body = json!({
            "direct_link": "https://cdn.example/x.mkv",
            "file_name": "x.mkv",
            "file_size_bytes": "2048",
            "size": "9 GB"
        });
        let content = DirectLinkParser.parse(&body).expect("recognized");
        assert_eq!(content.title, "x.mkv");
        assert_eq!(content.total_size, Some(2048));
    }

    #[test]
    fn download_link_accepts_aliases() {
        let body = json!({"dlink": "https://cdn.example/y.zip", "filename": "y.zip", "size": 77});
        let content = DownloadLinkParser.parse(&body).expect("recognized");
        assert_eq!(content.contents[0].url, "https://cdn.example/y.zip");
        assert_eq!(content.contents[0].filename, "y.zip");
        assert_eq!(content.contents[0].size, Some(77));
    }

    #[test]
    fn chain_reports_first_matching_parser() {
        let chain = default_chain();
        let body = json!({"download_link": "https://cdn.example/z.bin"});
        let (name, _) = parse_with_chain(&chain, &body).expect("matched");
        assert_eq!(name, "download_link");

        assert!(parse_with_chain(&chain, &json!({"status": "error"})).is_none());
    }

    #[test]
    fn unknown_size_units_are_not_guessed() {
        assert_eq!(parse_size_str("1.5 GB"), Some(1_610_612_736));
        assert_eq!(parse_size_str("512"), Some(512));
        assert_eq!(parse_size_str("3 parsecs"), None);
        assert_eq!(parse_size_str("about a gig"), None);
        assert_eq!(parse_size(&json!(-5)), None);
        assert_eq!(parse_size(&json!(null)), None);
    }
}
