//! Upstream sources: the fetch seam, the providers and the collector that merges them.

use crate::error::SourceError;
use crate::extract;
use crate::geo;
use crate::utils::{self, Fetched};

use async_trait::async_trait;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

static RESULT_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[A-Za-z0-9\-._~:/?#\[\]@!$&'()*+,;=%]+"#).unwrap());

/// A normalized proxy record, as produced by every provider before filtering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyEntry {
    pub ip: String,
    pub port: u16,
    pub protocol: String,
    pub country: String,
}

impl ProxyEntry {
    /// Create an entry, lowercasing protocol and country.
    pub fn new(ip: &str, port: u16, protocol: &str, country: &str) -> Self {
        Self {
            ip: ip.trim().to_string(),
            port,
            protocol: protocol.trim().to_lowercase(),
            country: country.trim().to_lowercase(),
        }
    }

    /// The `scheme://ip:port` form used for dedup and probing.
    pub fn to_link(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.ip, self.port)
    }

    /// Normalize one JSON object into an entry.
    ///
    /// The address is taken from `ip`, then `host`, then `address`; the port
    /// may be a number or a numeric string. Returns `None` when the object is
    /// not a proxy record.
    pub fn from_json(item: &Value) -> Option<Self> {
        let object = item.as_object()?;

        let ip = ["ip", "host", "address"]
            .iter()
            .filter_map(|key| object.get(*key).and_then(Value::as_str))
            .find(|value| !value.trim().is_empty())?;

        let port = match object.get("port")? {
            Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
            Value::String(s) => s.trim().parse::<u16>().ok(),
            _ => None,
        }
        .filter(|p| *p != 0)?;

        let protocol = object
            .get("protocol")
            .and_then(Value::as_str)
            .or_else(|| {
                object
                    .get("protocols")
                    .and_then(Value::as_array)
                    .and_then(|list| list.first())
                    .and_then(Value::as_str)
            })
            .unwrap_or("http");
        let country = object
            .get("country")
            .and_then(Value::as_str)
            .unwrap_or("unknown");

        Some(Self::new(ip, port, protocol, country))
    }
}

/// Normalize a JSON API body into entries.
///
/// The list is read from `data`, then `proxies`, then the object itself; a
/// top-level array is used as is. Items that are not proxy records are dropped.
pub fn parse_json_proxies(data: &Value) -> Vec<ProxyEntry> {
    let items: Vec<&Value> = match data {
        Value::Object(map) => match map.get("data").or_else(|| map.get("proxies")) {
            Some(Value::Array(list)) => list.iter().collect(),
            Some(other) => vec![other],
            None => vec![data],
        },
        Value::Array(list) => list.iter().collect(),
        _ => Vec::new(),
    };

    items.into_iter().filter_map(ProxyEntry::from_json).collect()
}

/// Keep regional entries and format them as links.
pub fn filter_regional(entries: &[ProxyEntry]) -> Vec<String> {
    entries
        .iter()
        .filter(|entry| geo::is_regional(&entry.country, &entry.ip))
        .map(ProxyEntry::to_link)
        .collect()
}

/// Retrieves the raw body behind a source URL.
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Fetch `url`, giving up after `timeout`.
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<Fetched, SourceError>;
}

/// [`Fetch`] over a shared reqwest client.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Create a fetcher with a browser-like user agent.
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<Fetched, SourceError> {
        utils::fetch_url(&self.client, url, timeout).await
    }
}

/// How a provider's calls are rate limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Bulk raw files on a code host.
    Repository,
    /// JSON/text API or search endpoint.
    Api,
}

/// A source of candidate links.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short label used in logs and as record provenance.
    fn name(&self) -> String;

    /// Rate limit class of this provider.
    fn kind(&self) -> ProviderKind;

    /// Fetch and parse this provider's candidates.
    async fn fetch(&self, fetcher: &dyn Fetch) -> Result<Vec<String>, SourceError>;
}

/// What a repository file contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoContent {
    /// Plain `ip:port` lists, geo-filtered.
    ProxyList,
    /// Share links (possibly a base64 subscription), run through the extractor.
    ShareLinks,
}

/// A raw file in a GitHub repository.
#[derive(Debug, Clone)]
pub struct RepoFileProvider {
    pub repo: String,
    pub branch: String,
    pub path: String,
    pub content: RepoContent,
    pub timeout: Duration,
}

impl RepoFileProvider {
    /// `proxy.txt` on `master`, read as a plain proxy list.
    pub fn proxy_list(repo: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            branch: "master".to_string(),
            path: "proxy.txt".to_string(),
            content: RepoContent::ProxyList,
            timeout: Duration::from_secs(10),
        }
    }

    /// A file of share links.
    pub fn share_links(
        repo: impl Into<String>,
        branch: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            repo: repo.into(),
            branch: branch.into(),
            path: path.into(),
            content: RepoContent::ShareLinks,
            timeout: Duration::from_secs(10),
        }
    }

    /// The raw-content URL of the file.
    pub fn raw_url(&self) -> String {
        format!(
            "https://raw.githubusercontent.com/{}/{}/{}",
            self.repo, self.branch, self.path
        )
    }
}

#[async_trait]
impl Provider for RepoFileProvider {
    fn name(&self) -> String {
        self.repo.clone()
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Repository
    }

    async fn fetch(&self, fetcher: &dyn Fetch) -> Result<Vec<String>, SourceError> {
        let fetched = fetcher.fetch(&self.raw_url(), self.timeout).await?;
        Ok(match self.content {
            RepoContent::ProxyList => filter_regional(&utils::parse_proxy_list(&fetched.body)),
            RepoContent::ShareLinks => extract::extract(&fetched.body),
        })
    }
}

/// A JSON or plain-text proxy API.
#[derive(Debug, Clone)]
pub struct JsonApiProvider {
    pub url: String,
    pub timeout: Duration,
}

impl JsonApiProvider {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(15),
        }
    }
}

#[async_trait]
impl Provider for JsonApiProvider {
    fn name(&self) -> String {
        self.url.clone()
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Api
    }

    async fn fetch(&self, fetcher: &dyn Fetch) -> Result<Vec<String>, SourceError> {
        let fetched = fetcher.fetch(&self.url, self.timeout).await?;

        let entries = if fetched.content_type.to_ascii_lowercase().contains("json") {
            let data: Value = serde_json::from_str(&fetched.body)
                .map_err(|e| SourceError::Json(self.url.clone(), e))?;
            parse_json_proxies(&data)
        } else {
            utils::parse_proxy_list(&fetched.body)
        };

        Ok(filter_regional(&entries))
    }
}

/// A search endpoint whose results point at pages holding share links.
///
/// The search body is scanned for result URLs, each result is fetched in turn
/// and run through the link extractor. A failing result page is skipped.
#[derive(Debug, Clone)]
pub struct PlatformSearchProvider {
    pub search_url: String,
    pub max_results: usize,
    pub timeout: Duration,
}

impl PlatformSearchProvider {
    pub fn new(search_url: impl Into<String>) -> Self {
        Self {
            search_url: search_url.into(),
            max_results: 20,
            timeout: Duration::from_secs(10),
        }
    }

    /// Build one provider per keyword from a template containing `{keyword}`.
    pub fn for_keywords(template: &str, keywords: &[&str]) -> Vec<Self> {
        keywords
            .iter()
            .map(|keyword| {
                let encoded: String = url::form_urlencoded::byte_serialize(keyword.as_bytes()).collect();
                Self::new(template.replace("{keyword}", &encoded))
            })
            .collect()
    }
}

#[async_trait]
impl Provider for PlatformSearchProvider {
    fn name(&self) -> String {
        format!("platform:{}", self.search_url)
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Api
    }

    async fn fetch(&self, fetcher: &dyn Fetch) -> Result<Vec<String>, SourceError> {
        let listing = fetcher.fetch(&self.search_url, self.timeout).await?;

        let mut seen = HashSet::new();
        let results: Vec<&str> = RESULT_URL
            .find_iter(&listing.body)
            .map(|m| m.as_str())
            .filter(|url| *url != self.search_url && seen.insert(*url))
            .take(self.max_results)
            .collect();
        debug!("{} result urls from {}", results.len(), self.search_url);

        let mut links = Vec::new();
        for url in results {
            match fetcher.fetch(url, self.timeout).await {
                Ok(page) => links.extend(extract::extract(&page.body)),
                Err(e) => warn!("Skipping search result {}: {}", url, e),
            }
        }

        Ok(links)
    }
}

/// Queries providers one at a time and merges their candidates.
pub struct SourceCollector {
    providers: Vec<Box<dyn Provider>>,
    fetcher: Arc<dyn Fetch>,
    repository_delay: Duration,
    api_delay: Duration,
}

impl SourceCollector {
    /// Create a collector over an explicit provider list.
    pub fn new(providers: Vec<Box<dyn Provider>>, fetcher: Arc<dyn Fetch>) -> Self {
        Self {
            providers,
            fetcher,
            repository_delay: Duration::from_secs(1),
            api_delay: Duration::from_secs(2),
        }
    }

    /// Set the pause after each repository and API call.
    pub fn with_delays(mut self, repository: Duration, api: Duration) -> Self {
        self.repository_delay = repository;
        self.api_delay = api;
        self
    }

    /// The default regional proxy sources.
    pub fn default_providers() -> Vec<Box<dyn Provider>> {
        let repos = [
            "fate0/proxylist",
            "clowmound/ProxyList",
            "TheSpeedX/PROXY-List",
            "Python3WebSpider/ProxyPool",
            "ouyangc/ProxyPoolNew",
        ];
        let apis = [
            "https://proxylist.geonode.com/api/proxy-list?limit=50&country=CN",
            "https://raw.githubusercontent.com/fate0/proxylist/master/proxy.list",
        ];

        let mut providers: Vec<Box<dyn Provider>> = Vec::new();
        for repo in repos {
            providers.push(Box::new(RepoFileProvider::proxy_list(repo)));
        }
        for api in apis {
            providers.push(Box::new(JsonApiProvider::new(api)));
        }
        providers
    }

    /// Run one provider, turning any failure into an empty contribution.
    pub async fn collect_from(&self, provider: &dyn Provider) -> Vec<String> {
        let name = provider.name();
        let candidates = match provider.fetch(self.fetcher.as_ref()).await {
            Ok(candidates) => {
                info!("Fetched {} candidates from {}", candidates.len(), name);
                candidates
            }
            Err(e) => {
                warn!("Failed to collect from {}: {}", name, e);
                Vec::new()
            }
        };

        let delay = match provider.kind() {
            ProviderKind::Repository => self.repository_delay,
            ProviderKind::Api => self.api_delay,
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        candidates
    }

    /// Collect from every provider and deduplicate. Order is not preserved.
    pub async fn collect_all(&self) -> Vec<String> {
        info!("Collecting from {} providers", self.providers.len());

        let mut unique = HashSet::new();
        for provider in &self.providers {
            unique.extend(self.collect_from(provider.as_ref()).await);
        }

        info!("Collected {} unique candidates", unique.len());
        unique.into_iter().collect()
    }
}
