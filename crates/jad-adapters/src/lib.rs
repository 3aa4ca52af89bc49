//! Source collaborator contract + generic config-driven sources.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use jad_core::{raw_title, Text};
use reqwest::StatusCode;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use url::Url;

pub use jad_core::RawPosting;

pub const CRATE_NAME: &str = "jad-adapters";

#[derive(Debug, Clone, Error)]
pub enum SourceFetchError {
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request to {url} failed: {reason}")]
    Request { url: String, reason: String },
    #[error("unexpected payload from {location}: {reason}")]
    Payload { location: String, reason: String },
    #[error("reading {path}: {reason}")]
    Io { path: String, reason: String },
    #[error("source timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid source configuration: {0}")]
    Config(String),
}

/// One named origin of raw postings (listing page, search API, fixture file).
#[async_trait]
pub trait JobSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Materialize the full result list for this run.
    async fn fetch(&self) -> Result<Vec<RawPosting>, SourceFetchError>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    HtmlListing,
    JsonApi,
    Fixture,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchConfig {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub exclude_title_keywords: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HtmlSelectors {
    pub card: String,
    pub title: String,
    pub link: String,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub posted_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub kind: SourceKind,
    #[serde(default)]
    pub listing_urls: Vec<String>,
    #[serde(default)]
    pub selectors: Option<HtmlSelectors>,
    #[serde(default)]
    pub items_pointer: Option<String>,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    #[serde(default)]
    pub search: SearchConfig,
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: SourceRegistry = serde_yaml::from_str(text).context("parsing source registry")?;
        let mut seen = std::collections::HashSet::new();
        for source in &registry.sources {
            let id = source.source_id.as_str();
            if id.is_empty() || id.trim() != id {
                anyhow::bail!("source_id {id:?} must be non-empty without surrounding whitespace");
            }
            if !seen.insert(id) {
                anyhow::bail!("duplicate source_id {} in registry", source.source_id);
            }
        }
        Ok(registry)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

/// Expand `{keyword}` / `{location}` placeholders, one URL per configured keyword.
pub fn expand_listing_urls(templates: &[String], search: &SearchConfig) -> Vec<String> {
    let location = url_encode(search.location.as_deref().unwrap_or_default().trim());
    let mut urls: Vec<String> = Vec::new();
    for template in templates {
        let with_location = template.replace("{location}", &location);
        let expanded = if with_location.contains("{keyword}") {
            search
                .keywords
                .iter()
                .map(|keyword| with_location.replace("{keyword}", &url_encode(keyword.trim())))
                .collect::<Vec<_>>()
        } else {
            vec![with_location]
        };
        for url in expanded {
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
    }
    urls
}

fn url_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn is_excluded(raw: &RawPosting, exclude_title_keywords: &[String]) -> bool {
    let Text::Known(title) = raw_title(raw) else {
        return false;
    };
    let title = title.to_lowercase();
    exclude_title_keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .any(|k| !k.is_empty() && title.contains(&k))
}

fn apply_title_exclusions(source_id: &str, raws: Vec<RawPosting>, exclude: &[String]) -> Vec<RawPosting> {
    if exclude.is_empty() {
        return raws;
    }
    let before = raws.len();
    let kept = raws
        .into_iter()
        .filter(|raw| !is_excluded(raw, exclude))
        .collect::<Vec<_>>();
    if kept.len() != before {
        debug!(source_id, dropped = before - kept.len(), "excluded postings by title keyword");
    }
    kept
}

/// A networked source that would fetch nothing is a configuration error, not
/// an empty result.
fn listing_urls_for(config: &SourceConfig, search: &SearchConfig) -> Result<Vec<String>> {
    let urls = expand_listing_urls(&config.listing_urls, search);
    if urls.is_empty() {
        anyhow::bail!(
            "source {} has no listing URLs to fetch (check listing_urls and search.keywords)",
            config.source_id
        );
    }
    Ok(urls)
}

/// Instantiate every enabled source in the registry.
pub fn build_sources(
    registry: &SourceRegistry,
    workspace_root: &Path,
    http: Arc<HttpFetcher>,
) -> Result<Vec<Arc<dyn JobSource>>> {
    let exclude = registry.search.exclude_title_keywords.clone();
    registry
        .enabled()
        .map(|config| -> Result<Arc<dyn JobSource>> {
            let source: Arc<dyn JobSource> = match config.kind {
                SourceKind::Fixture => {
                    let path = config
                        .path
                        .as_ref()
                        .with_context(|| format!("fixture source {} has no path", config.source_id))?;
                    Arc::new(FixtureSource {
                        source_id: config.source_id.clone(),
                        path: workspace_root.join(path),
                        exclude: exclude.clone(),
                    })
                }
                SourceKind::JsonApi => Arc::new(JsonApiSource {
                    source_id: config.source_id.clone(),
                    urls: listing_urls_for(config, &registry.search)?,
                    items_pointer: config.items_pointer.clone().unwrap_or_default(),
                    http: http.clone(),
                    exclude: exclude.clone(),
                }),
                SourceKind::HtmlListing => {
                    let selectors = config.selectors.clone().with_context(|| {
                        format!("html_listing source {} has no selectors", config.source_id)
                    })?;
                    Arc::new(HtmlListingSource {
                        source_id: config.source_id.clone(),
                        urls: listing_urls_for(config, &registry.search)?,
                        selectors,
                        http: http.clone(),
                        exclude: exclude.clone(),
                    })
                }
            };
            Ok(source)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Fixed list of raw postings; useful for replays and tests.
#[derive(Debug, Clone)]
pub struct StaticSource {
    source_id: String,
    postings: Vec<RawPosting>,
}

impl StaticSource {
    pub fn new(source_id: impl Into<String>, postings: Vec<RawPosting>) -> Self {
        Self {
            source_id: source_id.into(),
            postings,
        }
    }
}

#[async_trait]
impl JobSource for StaticSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(&self) -> Result<Vec<RawPosting>, SourceFetchError> {
        Ok(self.postings.clone())
    }
}

/// JSON file holding either an array of records or `{ "postings": [...] }`.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    source_id: String,
    path: PathBuf,
    exclude: Vec<String>,
}

impl FixtureSource {
    pub fn new(source_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
            exclude: Vec::new(),
        }
    }
}

#[async_trait]
impl JobSource for FixtureSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(&self) -> Result<Vec<RawPosting>, SourceFetchError> {
        let location = self.path.display().to_string();
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|err| SourceFetchError::Io {
                path: location.clone(),
                reason: err.to_string(),
            })?;
        let value: JsonValue = serde_json::from_str(&text).map_err(|err| SourceFetchError::Payload {
            location: location.clone(),
            reason: err.to_string(),
        })?;
        let pointer = if value.is_array() { "" } else { "/postings" };
        let raws = records_at_pointer(&value, pointer, &location)?;
        Ok(apply_title_exclusions(&self.source_id, raws, &self.exclude))
    }
}

/// Search API answering JSON; results sit at `items_pointer` (RFC 6901).
pub struct JsonApiSource {
    source_id: String,
    urls: Vec<String>,
    items_pointer: String,
    http: Arc<HttpFetcher>,
    exclude: Vec<String>,
}

#[async_trait]
impl JobSource for JsonApiSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(&self) -> Result<Vec<RawPosting>, SourceFetchError> {
        let mut raws = Vec::new();
        for url in &self.urls {
            let body = self.http.fetch_text(&self.source_id, url).await?;
            let value: JsonValue = serde_json::from_str(&body).map_err(|err| SourceFetchError::Payload {
                location: url.clone(),
                reason: err.to_string(),
            })?;
            raws.extend(records_at_pointer(&value, &self.items_pointer, url)?);
        }
        Ok(apply_title_exclusions(&self.source_id, raws, &self.exclude))
    }
}

/// Server-rendered listing page scraped with CSS selectors.
pub struct HtmlListingSource {
    source_id: String,
    urls: Vec<String>,
    selectors: HtmlSelectors,
    http: Arc<HttpFetcher>,
    exclude: Vec<String>,
}

#[async_trait]
impl JobSource for HtmlListingSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(&self) -> Result<Vec<RawPosting>, SourceFetchError> {
        let mut raws = Vec::new();
        for url in &self.urls {
            let body = self.http.fetch_text(&self.source_id, url).await?;
            let page = parse_listing_html(&body, url, &self.selectors)?;
            debug!(source_id = %self.source_id, url = %url, cards = page.len(), "parsed listing page");
            raws.extend(page);
        }
        Ok(apply_title_exclusions(&self.source_id, raws, &self.exclude))
    }
}

/// Records in the array at `pointer`; non-object items become empty records so
/// the pipeline counts them as malformed instead of silently losing them.
pub fn records_at_pointer(
    value: &JsonValue,
    pointer: &str,
    location: &str,
) -> Result<Vec<RawPosting>, SourceFetchError> {
    let items = value
        .pointer(pointer)
        .and_then(JsonValue::as_array)
        .ok_or_else(|| SourceFetchError::Payload {
            location: location.to_string(),
            reason: format!("no array at pointer {pointer:?}"),
        })?;
    Ok(items
        .iter()
        .map(|item| item.as_object().cloned().unwrap_or_default())
        .collect())
}

fn parse_selector(selector: &str) -> Result<Selector, SourceFetchError> {
    Selector::parse(selector)
        .map_err(|e| SourceFetchError::Config(format!("bad selector {selector:?}: {e}")))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn first_text(card: ElementRef<'_>, selector: &Selector) -> Option<String> {
    card.select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

/// Extract one raw record per `card` match. Relative links resolve against `page_url`.
pub fn parse_listing_html(
    html: &str,
    page_url: &str,
    selectors: &HtmlSelectors,
) -> Result<Vec<RawPosting>, SourceFetchError> {
    let card_sel = parse_selector(&selectors.card)?;
    let title_sel = parse_selector(&selectors.title)?;
    let link_sel = parse_selector(&selectors.link)?;
    let optional = |s: &Option<String>| s.as_deref().map(parse_selector).transpose();
    let company_sel = optional(&selectors.company)?;
    let location_sel = optional(&selectors.location)?;
    let posted_sel = optional(&selectors.posted_at)?;

    let base = Url::parse(page_url).ok();
    let document = Html::parse_document(html);
    let mut out = Vec::new();

    for card in document.select(&card_sel) {
        let mut raw = RawPosting::new();
        if let Some(title) = first_text(card, &title_sel) {
            raw.insert("title".into(), JsonValue::String(title));
        }
        for (key, sel) in [("company", &company_sel), ("location", &location_sel)] {
            if let Some(value) = sel.as_ref().and_then(|sel| first_text(card, sel)) {
                raw.insert(key.into(), JsonValue::String(value));
            }
        }
        if let Some(sel) = &posted_sel {
            let posted = card.select(sel).next().and_then(|n| {
                n.value()
                    .attr("datetime")
                    .and_then(|v| text_or_none(v.to_string()))
                    .or_else(|| text_or_none(n.text().collect::<String>()))
            });
            if let Some(posted) = posted {
                raw.insert("posted_at".into(), JsonValue::String(posted));
            }
        }

        let href = card
            .select(&link_sel)
            .next()
            .and_then(|n| n.value().attr("href"))
            .or_else(|| card.value().attr("href"));
        if let Some(href) = href.and_then(|h| text_or_none(h.to_string())) {
            let resolved = base
                .as_ref()
                .and_then(|b| b.join(&href).ok())
                .map(|u| u.to_string())
                .unwrap_or(href);
            raw.insert("url".into(), JsonValue::String(resolved));
        }

        if !raw.is_empty() {
            out.push(raw);
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            per_source_concurrency: 2,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Shared HTTP client with global and per-source concurrency caps.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

fn request_error(url: &str, err: &reqwest::Error) -> SourceFetchError {
    SourceFetchError::Request {
        url: url.to_string(),
        reason: err.to_string(),
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch_text(&self, source_id: &str, url: &str) -> Result<String, SourceFetchError> {
        let closed = |_| SourceFetchError::Request {
            url: url.to_string(),
            reason: "http client is shut down".to_string(),
        };
        let _global = self.global_limit.acquire().await.map_err(closed)?;
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.map_err(closed)?;

        self.fetch_with_retries(url)
            .instrument(info_span!("http_fetch", source_id, url))
            .await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<String, SourceFetchError> {
        let mut attempt = 0;
        loop {
            let reason = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp.text().await.map_err(|err| request_error(url, &err));
                    }
                    if classify_status(status) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(SourceFetchError::HttpStatus {
                            status: status.as_u16(),
                            url: url.to_string(),
                        });
                    }
                    format!("status {status}")
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(request_error(url, &err));
                    }
                    err.to_string()
                }
            };

            let delay = self.backoff.delay_for_attempt(attempt);
            warn!(attempt, ?delay, %reason, "retrying fetch");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
