//! Candidate links and the endpoints parsed out of them.

use crate::error::ParseError;
use crate::utils;

use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use url::Url;

/// URI schemes recognized as proxy or tunnel links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Vmess,
    Vless,
    Shadowsocks,
    ShadowsocksR,
    Trojan,
    Socks,
    Socks5,
    Hysteria,
    Hysteria2,
    Tuic,
    WireGuard,
    Http,
    Https,
}

impl Scheme {
    /// All schemes, in the order the extractor scans for them.
    pub const ALL: [Scheme; 13] = [
        Scheme::Vmess,
        Scheme::Vless,
        Scheme::Shadowsocks,
        Scheme::ShadowsocksR,
        Scheme::Trojan,
        Scheme::Socks,
        Scheme::Socks5,
        Scheme::Hysteria,
        Scheme::Hysteria2,
        Scheme::Tuic,
        Scheme::WireGuard,
        Scheme::Http,
        Scheme::Https,
    ];

    /// The literal written before `://`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Vmess => "vmess",
            Scheme::Vless => "vless",
            Scheme::Shadowsocks => "ss",
            Scheme::ShadowsocksR => "ssr",
            Scheme::Trojan => "trojan",
            Scheme::Socks => "socks",
            Scheme::Socks5 => "socks5",
            Scheme::Hysteria => "hysteria",
            Scheme::Hysteria2 => "hy2",
            Scheme::Tuic => "tuic",
            Scheme::WireGuard => "wireguard",
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    /// Whether the link can be handed to an HTTP client as a forward proxy.
    pub fn is_forward_proxy(&self) -> bool {
        matches!(self, Scheme::Http | Scheme::Https | Scheme::Socks5)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        Scheme::ALL
            .iter()
            .copied()
            .find(|scheme| scheme.as_str() == lower)
            .ok_or(ParseError::UnknownScheme(lower))
    }
}

/// A link resolved to the host and port it points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEndpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Everything after `scheme://`, untouched.
    pub payload: String,
}

impl ParsedEndpoint {
    /// `host:port`, with IPv6 hosts bracketed.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Split `scheme://rest` and recognize the scheme.
pub fn split_scheme(link: &str) -> Result<(Scheme, &str), ParseError> {
    let (scheme, rest) = link.split_once("://").ok_or(ParseError::MissingScheme)?;
    Ok((scheme.parse()?, rest))
}

/// Resolve a candidate link to its endpoint.
///
/// vmess links carry a base64 JSON object whose `add` (or `host`) and `port`
/// fields name the server; every other scheme is read as a URI authority.
pub fn parse_endpoint(link: &str) -> Result<ParsedEndpoint, ParseError> {
    let link = link.trim();
    let (scheme, payload) = split_scheme(link)?;

    let (host, port) = match scheme {
        Scheme::Vmess => vmess_host_port(payload)?,
        _ => uri_host_port(link)?,
    };

    Ok(ParsedEndpoint {
        scheme,
        host,
        port,
        payload: payload.to_string(),
    })
}

/// Whether the authority of `link` spells out a port, as in `http://host:80`.
pub fn has_explicit_port(link: &str) -> bool {
    let Some((_, rest)) = link.trim().split_once("://") else {
        return false;
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, hp)| hp);
    match host_port.rsplit_once(':') {
        Some((_, port)) => !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

fn vmess_host_port(payload: &str) -> Result<(String, u16), ParseError> {
    let decoded = utils::decode_base64_lenient(payload).ok_or(ParseError::InvalidBase64)?;
    let json: Value =
        serde_json::from_str(&decoded).map_err(|e| ParseError::InvalidJson(e.to_string()))?;
    if !json.is_object() {
        return Err(ParseError::InvalidJson("not an object".to_string()));
    }

    let host = ["add", "host"]
        .iter()
        .filter_map(|key| json[*key].as_str())
        .find(|value| !value.is_empty())
        .ok_or(ParseError::MissingHost)?;

    // Port is written as a string by most generators, as a number by some.
    let port = match &json["port"] {
        Value::String(s) => s.trim().parse::<u16>().ok(),
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        _ => None,
    }
    .filter(|p| *p != 0)
    .ok_or(ParseError::MissingPort)?;

    Ok((host.to_string(), port))
}

fn uri_host_port(link: &str) -> Result<(String, u16), ParseError> {
    let url = Url::parse(link).map_err(|e| ParseError::InvalidUri(e.to_string()))?;
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or(ParseError::MissingHost)?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = url
        .port_or_known_default()
        .filter(|p| *p != 0)
        .ok_or(ParseError::MissingPort)?;
    Ok((host, port))
}
