//! Utility functions shared by the collector, prober and converter.

use crate::error::SourceError;
use crate::source::ProxyEntry;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use std::time::Duration;

const LENIENT: GeneralPurposeConfig = GeneralPurposeConfig::new()
    .with_decode_allow_trailing_bits(true)
    .with_decode_padding_mode(DecodePaddingMode::Indifferent);

static LENIENT_STANDARD: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, LENIENT);
static LENIENT_URL_SAFE: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, LENIENT);

static BARE_PROXY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}):(\d+)").unwrap());
static SCHEMED_PROXY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(http|https|socks4|socks5)://(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}):(\d+)")
        .unwrap()
});
static JSONISH_PROXY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)"ip":\s*"(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})".*?"port":\s*"?(\d+)"?"#)
        .unwrap()
});

/// Body of a successful fetch plus the `Content-Type` it was served with.
#[derive(Debug, Clone, Default)]
pub struct Fetched {
    pub body: String,
    pub content_type: String,
}

/// Fetch a URL, treating any non-2xx answer as an error.
pub(crate) async fn fetch_url(
    client: &Client,
    url: &str,
    timeout: Duration,
) -> Result<Fetched, SourceError> {
    let response = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| SourceError::Http(url.to_string(), e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(SourceError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let body = response
        .text()
        .await
        .map_err(|e| SourceError::Http(url.to_string(), e))?;

    Ok(Fetched { body, content_type })
}

/// Best-effort base64 decode that accepts missing padding and either alphabet.
///
/// Returns `None` unless the result is valid UTF-8.
pub(crate) fn decode_base64_lenient(input: &str) -> Option<String> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        return None;
    }
    let padded = format!("{}{}", cleaned, "=".repeat((4 - cleaned.len() % 4) % 4));

    let bytes = LENIENT_STANDARD
        .decode(&padded)
        .or_else(|_| LENIENT_URL_SAFE.decode(&padded))
        .ok()?;
    String::from_utf8(bytes).ok()
}

/// Parse the text content of a plain proxy list.
///
/// Three shapes are recognized, each contributing independently: bare
/// `ip:port`, `scheme://ip:port`, and JSON-ish `"ip": ..., "port": ...` pairs.
pub(crate) fn parse_proxy_list(content: &str) -> Vec<ProxyEntry> {
    let mut entries = Vec::new();

    for caps in BARE_PROXY.captures_iter(content) {
        if let Ok(port) = caps[2].parse::<u16>() {
            entries.push(ProxyEntry::new(&caps[1], port, "http", "unknown"));
        }
    }
    for caps in SCHEMED_PROXY.captures_iter(content) {
        if let Ok(port) = caps[3].parse::<u16>() {
            entries.push(ProxyEntry::new(&caps[2], port, &caps[1], "unknown"));
        }
    }
    for caps in JSONISH_PROXY.captures_iter(content) {
        if let Ok(port) = caps[2].parse::<u16>() {
            entries.push(ProxyEntry::new(&caps[1], port, "http", "unknown"));
        }
    }

    entries
}

/// Round to two decimals, as every latency and rate in reports is.
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
