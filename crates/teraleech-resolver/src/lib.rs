//! Teraleech Link Resolver
//!
//! Share-link detection and resolution of Terabox share links into direct
//! download URLs through third-party resolver APIs

pub mod parsers;

use parsers::{default_chain, parse_with_chain, ResponseParser};
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;
use teraleech_config::ResolverConfig;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub url: String,
    pub filename: String,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedContent {
    pub title: String,
    pub is_folder: bool,
    /// Known only when every file reports its size.
    pub total_size: Option<u64>,
    pub contents: Vec<FileDescriptor>,
}

impl ResolvedContent {
    pub fn new(title: impl Into<String>, is_folder: bool, contents: Vec<FileDescriptor>) -> Self {
        let total_size = contents
            .iter()
            .map(|file| file.size)
            .sum::<Option<u64>>();
        Self {
            title: title.into(),
            is_folder,
            total_size,
            contents,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("not a supported share link: {0}")]
    InvalidLink(String),

    #[error("resolver {api} request failed: {message}")]
    Request { api: String, message: String },

    #[error("resolver {api} returned HTTP {status}")]
    Status { api: String, status: u16 },

    #[error("resolver {api} returned invalid JSON: {message}")]
    Decode { api: String, message: String },

    #[error("resolver {api} response shape not recognized")]
    Unrecognized { api: String },

    #[error("resolver returned no downloadable files")]
    EmptyContents,

    #[error("no resolver API configured")]
    NoApi,
}

/// Blocking by contract; async callers run it on a blocking thread.
pub trait LinkResolver: Send + Sync {
    fn resolve(&self, url: &str) -> Result<ResolvedContent, ResolveError>;
}

fn share_link_regex() -> &'static Regex {
    static LINK: OnceLock<Regex> = OnceLock::new();
    LINK.get_or_init(|| {
        Regex::new(
            r"(?i)https?://(?:www\.)?(?:[a-z0-9-]+\.)?(?:terabox|freeterabox|teraboxapp|1024tera|nephobox|mirrobox|4funbox|momerybox|gibibox|goaibox|terasharelink|1024terabox|teraboxshare|terafileshare|teraboxlink)\.(?:com|app|link|me|xyz|cloud|fun|online|store|shop|top|org|net|info|vip|pro|live|site|tech)\S+",
        )
        .expect("share link pattern should compile")
    })
}

fn share_code_regex() -> &'static Regex {
    static CODE: OnceLock<Regex> = OnceLock::new();
    CODE.get_or_init(|| {
        Regex::new(r"(?i)/s/(\w+)|surl=(\w+)").expect("share code pattern should compile")
    })
}

/// First share link found anywhere in `text`.
pub fn extract_share_link(text: &str) -> Option<String> {
    share_link_regex()
        .find(text)
        .map(|m| m.as_str().to_string())
}

pub fn is_share_link(text: &str) -> bool {
    share_link_regex().is_match(text)
}

pub struct HttpLinkResolver {
    client: Client,
    api_templates: Vec<String>,
    chain: Vec<Box<dyn ResponseParser>>,
}

impl HttpLinkResolver {
    pub fn new(config: &ResolverConfig) -> Result<Self, ResolveError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/plain, */*"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));
        if let Ok(agent) = HeaderValue::from_str(&config.user_agent) {
            headers.insert(USER_AGENT, agent);
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ResolveError::Request {
                api: "client".to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            api_templates: config.api_templates.clone(),
            chain: default_chain(),
        })
    }

    fn api_name(template: &str) -> String {
        url::Url::parse(&template.replace("{}", ""))
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| template.to_string())
    }

    fn query_api(&self, template: &str, share_url: &str) -> Result<ResolvedContent, ResolveError> {
        let api = Self::api_name(template);
        let encoded: String = url::form_urlencoded::byte_serialize(share_url.as_bytes()).collect();
        let request_url = template.replacen("{}", &encoded, 1);

        let response = self
            .client
            .get(&request_url)
            .send()
            .map_err(|e| ResolveError::Request {
                api: api.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ResolveError::Status {
                api,
                status: status.as_u16(),
            });
        }

        let body: serde_json::Value = response.json().map_err(|e| ResolveError::Decode {
            api: api.clone(),
            message: e.to_string(),
        })?;

        self.interpret(&api, &body)
    }

    fn interpret(
        &self,
        api: &str,
        body: &serde_json::Value,
    ) -> Result<ResolvedContent, ResolveError> {
        match parse_with_chain(&self.chain, body) {
            Some((parser, content)) => {
                info!(
                    api,
                    parser,
                    files = content.contents.len(),
                    "Resolved share link"
                );
                if content.contents.is_empty() {
                    return Err(ResolveError::EmptyContents);
                }
                Ok(content)
            }
            None => {
                let preview: String = body.to_string().chars().take(300).collect();
                warn!(api, "Unrecognized resolver response: {}", preview);
                Err(ResolveError::Unrecognized {
                    api: api.to_string(),
                })
            }
        }
    }
}

impl LinkResolver for HttpLinkResolver {
    fn resolve(&self, url: &str) -> Result<ResolvedContent, ResolveError> {
        if !is_share_link(url) {
            return Err(ResolveError::InvalidLink(url.to_string()));
        }
        if !share_code_regex().is_match(url) {
            warn!("URL {} has no /s/ or surl= share code, trying anyway", url);
        }

        let mut last_error = ResolveError::NoApi;
        for template in &self.api_templates {
            match self.query_api(template, url) {
                Ok(content) => return Ok(content),
                Err(err) => {
                    warn!("Resolver API failed: {}", err);
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }
}
