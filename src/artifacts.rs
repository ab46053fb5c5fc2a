//! On-disk artifacts of a harvest run, and the reader other programs use.
//!
//! Line files hold one link per line. The JSON documents accept both the
//! `working_proxies` and the older `proxies` field name on read.

use crate::error::{ArtifactError, NoProxyAvailable};
use crate::probe::ProbeStatistics;
use crate::store::ProxyRecord;

use base64::{engine::general_purpose::STANDARD, Engine};
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const RAW_FILE: &str = "raw_china_proxies.txt";
pub const WORKING_FILE: &str = "working_china_proxies.txt";
pub const CONVERTED_FILE: &str = "converted_china_proxies.txt";
pub const SUMMARY_FILE: &str = "china_proxies_stats.json";
pub const CONFIG_FILE: &str = "china_proxy_config.json";

/// Collection counters of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionStats {
    pub total_collected: usize,
    pub tested: usize,
    pub working: usize,
    pub success_rate: f64,
}

/// Conversion counters of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionStats {
    pub original_working: usize,
    pub converted: usize,
    pub target_protocols: Vec<String>,
}

/// The `stats` object shared by the summary and config documents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunStats {
    pub collection: CollectionStats,
    pub conversion: ConversionStats,
    pub test_stats: ProbeStatistics,
    /// Where older config files kept the converted links.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub converted_proxies: Vec<String>,
}

/// `china_proxies_stats.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub total_collected: usize,
    #[serde(default)]
    pub stats: RunStats,
    #[serde(alias = "working_proxies")]
    pub proxies: Vec<String>,
}

/// `china_proxy_config.json`, the document consumers read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactConfig {
    #[serde(default)]
    pub timestamp: String,
    #[serde(alias = "proxies")]
    pub working_proxies: Vec<String>,
    #[serde(default)]
    pub converted_proxies: Vec<String>,
    #[serde(default)]
    pub stats: RunStats,
}

/// Writes run artifacts into one directory.
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    dir: PathBuf,
}

impl ArtifactWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `links` one per line into `name`, returning the file path.
    pub fn write_lines(&self, name: &str, links: &[String]) -> Result<PathBuf, ArtifactError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(name);
        fs::write(&path, render_lines(links.iter().map(String::as_str)))?;
        debug!("Wrote {} links to {}", links.len(), path.display());
        Ok(path)
    }

    pub fn write_raw(&self, links: &[String]) -> Result<PathBuf, ArtifactError> {
        self.write_lines(RAW_FILE, links)
    }

    pub fn write_working(&self, links: &[String]) -> Result<PathBuf, ArtifactError> {
        self.write_lines(WORKING_FILE, links)
    }

    pub fn write_converted(&self, links: &[String]) -> Result<PathBuf, ArtifactError> {
        self.write_lines(CONVERTED_FILE, links)
    }

    pub fn write_summary(&self, summary: &RunSummary) -> Result<PathBuf, ArtifactError> {
        self.write_json(SUMMARY_FILE, summary)
    }

    pub fn write_config(&self, config: &ArtifactConfig) -> Result<PathBuf, ArtifactError> {
        self.write_json(CONFIG_FILE, config)
    }

    fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<PathBuf, ArtifactError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(name);
        fs::write(&path, serde_json::to_string_pretty(value)?)?;
        Ok(path)
    }
}

/// Trimmed, newline-terminated lines; links spanning lines are dropped.
fn render_lines<'a>(links: impl Iterator<Item = &'a str>) -> String {
    let mut out = String::new();
    for link in links.map(str::trim) {
        if link.is_empty() || link.contains(['\n', '\r']) {
            continue;
        }
        out.push_str(link);
        out.push('\n');
    }
    out
}

/// Write a subscription file of the newest `limit` records, newest first.
///
/// When `base64_path` is given, the whole file is also written there
/// base64-encoded. Returns the number of links written.
pub fn export_subscription(
    records: &[ProxyRecord],
    path: &Path,
    base64_path: Option<&Path>,
    limit: Option<usize>,
) -> Result<usize, ArtifactError> {
    let mut ordered: Vec<&ProxyRecord> = records.iter().collect();
    ordered.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    if let Some(limit) = limit {
        ordered.truncate(limit);
    }

    let content = render_lines(ordered.iter().map(|r| r.link.as_str()));
    let written = content.lines().count();

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, &content)?;

    if let Some(base64_path) = base64_path {
        if let Some(parent) = base64_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(base64_path, STANDARD.encode(content.as_bytes()))?;
    }

    info!("Exported {} links to {}", written, path.display());
    Ok(written)
}

/// Which line file to pick from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    /// Plain proxies that passed probing.
    Working,
    /// Share links synthesized from them.
    Converted,
}

/// A proxy ready to hand to an HTTP client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpointConfig {
    pub http: String,
    pub https: String,
    pub host: String,
    pub port: u16,
}

impl ProxyEndpointConfig {
    /// `None` unless `url` has a host and a port, explicit or implied by the scheme.
    pub fn from_url(url: &str) -> Option<Self> {
        let parsed = Url::parse(url).ok()?;
        let host = parsed.host_str()?.trim_matches(['[', ']']).to_string();
        let port = parsed.port_or_known_default()?;
        Some(Self {
            http: url.to_string(),
            https: url.to_string(),
            host,
            port,
        })
    }
}

/// What [`ArtifactReader::stats`] reports.
#[derive(Debug, Clone, PartialEq)]
pub enum StatsSnapshot {
    Unavailable,
    Available {
        timestamp: String,
        working_count: usize,
        converted_count: usize,
        stats: RunStats,
    },
}

/// Reads the artifacts of the last run from one directory.
#[derive(Debug, Clone)]
pub struct ArtifactReader {
    dir: PathBuf,
}

impl ArtifactReader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Load the config document, `None` when there is none.
    pub fn load_config(&self) -> Result<Option<ArtifactConfig>, ArtifactError> {
        let Some(value) = self.read_json(CONFIG_FILE)? else {
            return Ok(None);
        };
        if value.get("working_proxies").is_none() && value.get("proxies").is_none() {
            return Err(ArtifactError::Layout(self.dir.join(CONFIG_FILE).display().to_string()));
        }

        let mut config: ArtifactConfig = serde_json::from_value(value)?;
        if config.converted_proxies.is_empty() {
            config.converted_proxies = std::mem::take(&mut config.stats.converted_proxies);
        }
        Ok(Some(config))
    }

    /// Load the summary document, `None` when there is none.
    pub fn load_summary(&self) -> Result<Option<RunSummary>, ArtifactError> {
        match self.read_json(SUMMARY_FILE)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn load_working(&self) -> Result<Vec<String>, ArtifactError> {
        self.read_lines(WORKING_FILE)
    }

    pub fn load_converted(&self) -> Result<Vec<String>, ArtifactError> {
        self.read_lines(CONVERTED_FILE)
    }

    /// A random entry of the chosen line file.
    pub fn random_proxy(&self, kind: ProxyKind) -> Result<Option<String>, ArtifactError> {
        let mut proxies = match kind {
            ProxyKind::Working => self.load_working()?,
            ProxyKind::Converted => self.load_converted()?,
        };
        if proxies.is_empty() {
            return Ok(None);
        }
        let idx = rand::rng().random_range(0..proxies.len());
        Ok(Some(proxies.swap_remove(idx)))
    }

    /// A random working proxy from the config document.
    pub fn proxy_for_testing(&self) -> Result<Option<ProxyEndpointConfig>, ArtifactError> {
        let Some(config) = self.load_config()? else {
            return Ok(None);
        };
        if config.working_proxies.is_empty() {
            return Ok(None);
        }
        let idx = rand::rng().random_range(0..config.working_proxies.len());
        Ok(ProxyEndpointConfig::from_url(&config.working_proxies[idx]))
    }

    /// Try up to `max_attempts` distinct random working proxies against
    /// `test_url` and return the first that answers with a success status.
    pub async fn working_proxy_for_validation(
        &self,
        test_url: &str,
        timeout: Duration,
        max_attempts: usize,
    ) -> Result<ProxyEndpointConfig, NoProxyAvailable> {
        let mut candidates = match self.load_config() {
            Ok(Some(config)) => config.working_proxies,
            Ok(None) => return Err(NoProxyAvailable),
            Err(e) => {
                warn!("Failed to load proxy config: {}", e);
                return Err(NoProxyAvailable);
            }
        };
        candidates.shuffle(&mut rand::rng());

        for candidate in candidates.iter().take(max_attempts) {
            let Some(endpoint) = ProxyEndpointConfig::from_url(candidate) else {
                continue;
            };
            if check_proxy(&endpoint.http, test_url, timeout).await {
                info!("Found usable proxy {}", candidate);
                return Ok(endpoint);
            }
        }

        warn!("No usable proxy among {} attempts", max_attempts.min(candidates.len()));
        Err(NoProxyAvailable)
    }

    /// Whether the config lists at least one working proxy.
    pub fn is_available(&self) -> bool {
        matches!(self.load_config(), Ok(Some(config)) if !config.working_proxies.is_empty())
    }

    pub fn stats(&self) -> StatsSnapshot {
        match self.load_config() {
            Ok(Some(config)) => StatsSnapshot::Available {
                timestamp: config.timestamp,
                working_count: config.working_proxies.len(),
                converted_count: config.converted_proxies.len(),
                stats: config.stats,
            },
            _ => StatsSnapshot::Unavailable,
        }
    }

    fn read_json(&self, name: &str) -> Result<Option<Value>, ArtifactError> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn read_lines(&self, name: &str) -> Result<Vec<String>, ArtifactError> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(Vec::new());
        }
        Ok(fs::read_to_string(path)?
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }
}

async fn check_proxy(proxy_url: &str, test_url: &str, timeout: Duration) -> bool {
    let client = match reqwest::Proxy::all(proxy_url)
        .and_then(|proxy| Client::builder().proxy(proxy).timeout(timeout).build())
    {
        Ok(client) => client,
        Err(e) => {
            debug!("Cannot use {} as a proxy: {}", proxy_url, e);
            return false;
        }
    };
    match client.get(test_url).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(e) => {
            debug!("Proxy {} failed validation: {}", proxy_url, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn line_files_round_trip() {
        let tmp = TempDir::new().unwrap();
        let writer = ArtifactWriter::new(tmp.path().join("nested"));
        writer
            .write_working(&strings(&["http://1.2.3.4:80", "  ", "bad\nlink", " socks5://5.6.7.8:1080 "]))
            .unwrap();

        let reader = ArtifactReader::new(tmp.path().join("nested"));
        assert_eq!(
            reader.load_working().unwrap(),
            strings(&["http://1.2.3.4:80", "socks5://5.6.7.8:1080"])
        );
        assert!(reader.load_converted().unwrap().is_empty());
        assert_eq!(reader.random_proxy(ProxyKind::Converted).unwrap(), None);
        assert!(reader
            .random_proxy(ProxyKind::Working)
            .unwrap()
            .is_some_and(|p| p.ends_with(":80") || p.ends_with(":1080")));
    }

    #[test]
    fn config_accepts_both_layouts() {
        let tmp = TempDir::new().unwrap();
        let reader = ArtifactReader::new(tmp.path());
        assert_eq!(reader.load_config().unwrap(), None);
        assert_eq!(reader.stats(), StatsSnapshot::Unavailable);

        fs::write(
            tmp.path().join(CONFIG_FILE),
            r#"{"timestamp": "2025-01-01T00:00:00", "total_collected": 3,
                "proxies": ["http://1.2.3.4:8080"],
                "stats": {"converted_proxies": ["vmess://QUJD"],
                          "collection": {"total_collected": 3, "tested": 3, "working": 1, "success_rate": 0.3333}}}"#,
        )
        .unwrap();
        let config = reader.load_config().unwrap().unwrap();
        assert_eq!(config.working_proxies, strings(&["http://1.2.3.4:8080"]));
        assert_eq!(config.converted_proxies, strings(&["vmess://QUJD"]));
        assert_eq!(config.stats.collection.tested, 3);

        let writer = ArtifactWriter::new(tmp.path());
        writer
            .write_config(&ArtifactConfig {
                timestamp: "now".to_string(),
                working_proxies: strings(&["http://5.6.7.8:3128"]),
                converted_proxies: strings(&["ss://x@5.6.7.8:3128#n"]),
                stats: RunStats::default(),
            })
            .unwrap();
        let config = reader.load_config().unwrap().unwrap();
        assert_eq!(config.working_proxies, strings(&["http://5.6.7.8:3128"]));
        assert_eq!(config.converted_proxies, strings(&["ss://x@5.6.7.8:3128#n"]));
        assert!(reader.is_available());
        assert!(matches!(
            reader.stats(),
            StatsSnapshot::Available { working_count: 1, converted_count: 1, .. }
        ));
    }

    #[test]
    fn unrecognized_config_is_a_layout_error() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(CONFIG_FILE), r#"{"stats": {}}"#).unwrap();
        let reader = ArtifactReader::new(tmp.path());
        assert!(matches!(reader.load_config(), Err(ArtifactError::Layout(_))));
        assert!(!reader.is_available());
    }

    #[test]
    fn summary_accepts_working_proxies_name() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join(SUMMARY_FILE),
            r#"{"timestamp": "t", "total_collected": 2, "working_proxies": ["http://1.1.1.1:80"]}"#,
        )
        .unwrap();
        let summary = ArtifactReader::new(tmp.path()).load_summary().unwrap().unwrap();
        assert_eq!(summary.proxies, strings(&["http://1.1.1.1:80"]));
        assert_eq!(summary.total_collected, 2);
    }

    #[test]
    fn testing_proxy_needs_host_and_port() {
        assert_eq!(
            ProxyEndpointConfig::from_url("http://1.2.3.4:8080"),
            Some(ProxyEndpointConfig {
                http: "http://1.2.3.4:8080".to_string(),
                https: "http://1.2.3.4:8080".to_string(),
                host: "1.2.3.4".to_string(),
                port: 8080,
            })
        );
        assert_eq!(ProxyEndpointConfig::from_url("http://1.2.3.4").map(|c| c.port), Some(80));
        assert_eq!(ProxyEndpointConfig::from_url("socks5://1.2.3.4"), None);
        assert_eq!(ProxyEndpointConfig::from_url("1.2.3.4:80"), None);
    }

    #[test]
    fn subscription_is_newest_first() {
        let tmp = TempDir::new().unwrap();
        let now = Utc::now();
        let mut old = ProxyRecord::new("trojan://a@h:1", "s");
        old.created_at = now - ChronoDuration::hours(2);
        let mut mid = ProxyRecord::new("vless://b@h:2", "s");
        mid.created_at = now - ChronoDuration::hours(1);
        let mut new = ProxyRecord::new("ss://c@h:3", "s");
        new.created_at = now;
        let mut broken = ProxyRecord::new("x", "s");
        broken.link = "ss://d@h:4\nss://e@h:5".to_string();
        broken.created_at = now + ChronoDuration::hours(1);

        let path = tmp.path().join("sub.txt");
        let b64 = tmp.path().join("sub_base64.txt");
        let written =
            export_subscription(&[old, new, broken, mid], &path, Some(&b64), Some(2)).unwrap();

        assert_eq!(written, 1);
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "ss://c@h:3\n");
        let decoded = STANDARD.decode(fs::read_to_string(&b64).unwrap()).unwrap();
        assert_eq!(decoded, content.as_bytes());
    }

    #[test]
    fn subscription_without_limit() {
        let tmp = TempDir::new().unwrap();
        let mut a = ProxyRecord::new("trojan://a@h:1", "s");
        a.created_at = Utc::now() - ChronoDuration::minutes(1);
        let b = ProxyRecord::new("trojan://b@h:2", "s");
        let path = tmp.path().join("out").join("sub.txt");

        assert_eq!(export_subscription(&[a, b], &path, None, None).unwrap(), 2);
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "trojan://b@h:2\ntrojan://a@h:1\n"
        );
    }

    async fn answering_proxy() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                        .await;
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn validation_finds_the_live_proxy() {
        let tmp = TempDir::new().unwrap();
        let dead = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let live = answering_proxy().await;
        ArtifactWriter::new(tmp.path())
            .write_config(&ArtifactConfig {
                timestamp: String::new(),
                working_proxies: vec![
                    format!("http://127.0.0.1:{}", dead),
                    format!("http://127.0.0.1:{}", live),
                ],
                converted_proxies: Vec::new(),
                stats: RunStats::default(),
            })
            .unwrap();
        let reader = ArtifactReader::new(tmp.path());

        let found = reader
            .working_proxy_for_validation("http://check.invalid/ip", Duration::from_secs(5), 2)
            .await
            .unwrap();
        assert_eq!(found.port, live);
    }

    #[tokio::test]
    async fn validation_without_config_fails() {
        let tmp = TempDir::new().unwrap();
        let reader = ArtifactReader::new(tmp.path());
        assert!(reader
            .working_proxy_for_validation("http://check.invalid/", Duration::from_secs(1), 3)
            .await
            .is_err());
    }
}
