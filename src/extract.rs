//! Pulls candidate proxy and tunnel links out of arbitrary text.

use crate::link::Scheme;
use crate::utils;

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

/// URI body characters: unreserved, reserved and percent.
const URI_BODY: &str = r"[a-zA-Z0-9\-._~:/?#\[\]@!$&'()*+,;=%]+";

/// One compiled pattern per scheme, in [`Scheme::ALL`] order.
static PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    Scheme::ALL
        .iter()
        .map(|scheme| {
            let body = match scheme {
                // vmess carries base64 JSON and nothing else
                Scheme::Vmess => r"[a-zA-Z0-9+/=]+",
                _ => URI_BODY,
            };
            // ASCII boundary: keeps `ss://` out of `vmess://` but still
            // matches right after CJK text
            Regex::new(&format!(r"(?-u:\b){}://{}", regex::escape(scheme.as_str()), body)).unwrap()
        })
        .collect()
});

/// Extract candidate links from `text`.
///
/// If the whitespace-stripped text decodes as base64 to UTF-8, the decoded
/// text is scanned as well. Matches are gathered scheme by scheme and
/// deduplicated keeping the first occurrence.
pub fn extract(text: &str) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let mut material = text.to_string();
    if let Some(decoded) = utils::decode_base64_lenient(text) {
        material.push('\n');
        material.push_str(&decoded);
    }

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for pattern in PATTERNS.iter() {
        for m in pattern.find_iter(&material) {
            let link = m.as_str();
            if seen.insert(link) {
                links.push(link.to_string());
            }
        }
    }
    links
}
