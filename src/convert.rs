//! Synthesizes tunnel share links from plain HTTP/SOCKS proxies.
//!
//! The origin is a bare forward proxy, so the credentials in the generated
//! links are random placeholders; the links exist for format compatibility
//! with subscription consumers.

use crate::error::ConfigError;
use crate::link::{self, ParsedEndpoint, Scheme};

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE},
    Engine,
};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

const SS_CIPHER: &str = "aes-256-gcm";

/// Protocols a proxy can be converted into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetProtocol {
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
}

impl TargetProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetProtocol::Vmess => "vmess",
            TargetProtocol::Vless => "vless",
            TargetProtocol::Trojan => "trojan",
            TargetProtocol::Shadowsocks => "ss",
        }
    }
}

impl fmt::Display for TargetProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetProtocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vmess" => Ok(TargetProtocol::Vmess),
            "vless" => Ok(TargetProtocol::Vless),
            "trojan" => Ok(TargetProtocol::Trojan),
            "ss" | "shadowsocks" => Ok(TargetProtocol::Shadowsocks),
            other => Err(ConfigError::UnknownProtocol(other.to_string())),
        }
    }
}

/// The JSON object carried by a vmess link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmessConfig {
    pub v: String,
    pub ps: String,
    pub add: String,
    pub port: String,
    pub id: String,
    pub aid: String,
    pub scy: String,
    pub net: String,
    #[serde(rename = "type")]
    pub header_type: String,
    pub host: String,
    pub path: String,
    pub tls: String,
}

impl VmessConfig {
    fn websocket(endpoint: &ParsedEndpoint, name: &str) -> Self {
        Self {
            v: "2".to_string(),
            ps: name.to_string(),
            add: endpoint.host.clone(),
            port: endpoint.port.to_string(),
            id: Uuid::new_v4().to_string(),
            aid: "0".to_string(),
            scy: "auto".to_string(),
            net: "ws".to_string(),
            header_type: "none".to_string(),
            host: String::new(),
            path: "/".to_string(),
            tls: "tls".to_string(),
        }
    }

    /// Decode the payload of a `vmess://` link.
    pub fn from_link(link: &str) -> Option<Self> {
        let payload = link.strip_prefix("vmess://")?;
        let bytes = STANDARD.decode(payload).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

/// The links generated for one source proxy.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversion {
    /// The proxy the links were generated from.
    pub original: String,
    /// One link per requested protocol, in request order.
    pub links: Vec<(TargetProtocol, String)>,
}

/// Balancer view over converted vmess links.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalancerConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub proxies: Vec<BalancerEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalancerEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub server: String,
    pub port: u16,
    pub uuid: String,
    #[serde(rename = "alterId")]
    pub alter_id: u32,
    pub cipher: String,
    pub tls: bool,
    #[serde(rename = "skip-cert-verify")]
    pub skip_cert_verify: bool,
    pub network: String,
    #[serde(rename = "ws-opts")]
    pub ws_opts: WsOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WsOptions {
    pub path: String,
    pub headers: WsHeaders,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WsHeaders {
    #[serde(rename = "Host")]
    pub host: String,
}

impl BalancerEntry {
    fn from_vmess(config: &VmessConfig) -> Option<Self> {
        Some(Self {
            name: config.ps.clone(),
            kind: "vmess".to_string(),
            server: config.add.clone(),
            port: config.port.parse().ok()?,
            uuid: config.id.clone(),
            alter_id: config.aid.parse().ok()?,
            cipher: config.scy.clone(),
            tls: config.tls == "tls",
            skip_cert_verify: true,
            network: config.net.clone(),
            ws_opts: WsOptions {
                path: config.path.clone(),
                headers: WsHeaders {
                    host: config.host.clone(),
                },
            },
        })
    }
}

/// Converts plain proxies into share links.
#[derive(Debug, Clone)]
pub struct ProtocolConverter {
    name_prefix: String,
}

impl Default for ProtocolConverter {
    fn default() -> Self {
        Self::new("china-proxy")
    }
}

impl ProtocolConverter {
    /// Create a converter whose display names start with `name_prefix`.
    pub fn new(name_prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: name_prefix.into(),
        }
    }

    /// Base display name for the `index`-th proxy of a batch.
    pub fn display_name(&self, host: &str, index: usize) -> String {
        format!("{}-{}-{}", self.name_prefix, host, index)
    }

    /// Build one share link for `endpoint`, labelled `name`.
    pub fn link(&self, protocol: TargetProtocol, endpoint: &ParsedEndpoint, name: &str) -> String {
        let address = endpoint.address();
        match protocol {
            TargetProtocol::Vmess => {
                let config = VmessConfig::websocket(endpoint, name);
                // serializing a struct of strings cannot fail
                let json = serde_json::to_string(&config).unwrap_or_default();
                format!("vmess://{}", STANDARD.encode(json))
            }
            TargetProtocol::Vless => format!(
                "vless://{}@{}?type=ws&path=/&host=&tls=tls#{}",
                Uuid::new_v4(),
                address,
                name
            ),
            TargetProtocol::Trojan => format!(
                "trojan://{}@{}?type=ws&path=/&sni={}#{}",
                Uuid::new_v4(),
                address,
                endpoint.host,
                name
            ),
            TargetProtocol::Shadowsocks => {
                let password: String = Uuid::new_v4().simple().to_string().chars().take(16).collect();
                // url-safe alphabet keeps `/` out of the authority
                let userinfo = URL_SAFE.encode(format!("{}:{}", SS_CIPHER, password));
                format!("ss://{}@{}#{}", userinfo, address, name)
            }
        }
    }

    /// Generate one link per protocol for a single endpoint.
    ///
    /// `index` is the caller's sequence number and keeps names unique within
    /// a batch.
    pub fn convert(
        &self,
        endpoint: &ParsedEndpoint,
        protocols: &[TargetProtocol],
        index: usize,
    ) -> Vec<(TargetProtocol, String)> {
        let base = self.display_name(&endpoint.host, index);
        protocols
            .iter()
            .map(|protocol| {
                let name = format!("{}-{}", base, protocol);
                (*protocol, self.link(*protocol, endpoint, &name))
            })
            .collect()
    }

    /// Convert every parsable proxy, keeping the per-proxy grouping.
    ///
    /// Proxies without an explicit port are skipped rather than assumed to
    /// listen on their scheme's default port.
    pub fn convert_batch_detailed(
        &self,
        proxies: &[String],
        protocols: &[TargetProtocol],
    ) -> Vec<Conversion> {
        let mut conversions = Vec::with_capacity(proxies.len());
        for (i, proxy) in proxies.iter().enumerate() {
            let endpoint = match link::parse_endpoint(proxy) {
                Ok(endpoint) if endpoint.scheme == Scheme::Vmess || link::has_explicit_port(proxy) => {
                    endpoint
                }
                Ok(_) => {
                    debug!("Skipping conversion of {}: no explicit port", proxy);
                    continue;
                }
                Err(e) => {
                    debug!("Skipping conversion of {}: {}", proxy, e);
                    continue;
                }
            };
            conversions.push(Conversion {
                original: proxy.clone(),
                links: self.convert(&endpoint, protocols, i + 1),
            });
        }
        conversions
    }

    /// Convert every parsable proxy and concatenate the links in input order.
    pub fn convert_batch(&self, proxies: &[String], protocols: &[TargetProtocol]) -> Vec<String> {
        self.convert_batch_detailed(proxies, protocols)
            .into_iter()
            .flat_map(|conversion| conversion.links.into_iter().map(|(_, link)| link))
            .collect()
    }

    /// Balancer configuration over the links generated for `protocol`.
    ///
    /// Only vmess links carry enough structure to expand; other protocols
    /// produce an empty proxy list.
    pub fn balancer_config(&self, proxies: &[String], protocol: TargetProtocol) -> BalancerConfig {
        let mut entries = Vec::new();
        if protocol == TargetProtocol::Vmess {
            for link in self.convert_batch(proxies, &[protocol]) {
                match VmessConfig::from_link(&link).as_ref().and_then(BalancerEntry::from_vmess) {
                    Some(entry) => entries.push(entry),
                    None => warn!("Could not expand generated link {}", link),
                }
            }
        }

        BalancerConfig {
            kind: "selector".to_string(),
            name: "China-Proxies-Balancer".to_string(),
            proxies: entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::parse_endpoint;
    use serde_json::Value;

    fn endpoint(host: &str, port: u16) -> ParsedEndpoint {
        ParsedEndpoint {
            scheme: Scheme::Http,
            host: host.to_string(),
            port,
            payload: format!("{}:{}", host, port),
        }
    }

    #[test]
    fn vmess_payload_is_compact_json() {
        let converter = ProtocolConverter::default();
        let links = converter.convert(&endpoint("1.2.3.4", 8080), &[TargetProtocol::Vmess], 1);
        let link = &links[0].1;
        assert!(link.starts_with("vmess://"));

        let decoded = String::from_utf8(STANDARD.decode(&link["vmess://".len()..]).unwrap()).unwrap();
        assert!(decoded.contains(r#""add":"1.2.3.4""#));
        assert!(decoded.contains(r#""port":"8080""#));
        let json: Value = serde_json::from_str(&decoded).unwrap();
        assert_eq!(json["net"], "ws");
        assert_eq!(json["scy"], "auto");
        assert_eq!(json["tls"], "tls");
        assert_eq!(json["path"], "/");
        assert_eq!(json["ps"], "china-proxy-1.2.3.4-1-vmess");
        assert!(Uuid::parse_str(json["id"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn generated_links_point_back_at_the_proxy() {
        let converter = ProtocolConverter::new("n");
        let all = [
            TargetProtocol::Vmess,
            TargetProtocol::Vless,
            TargetProtocol::Trojan,
            TargetProtocol::Shadowsocks,
        ];
        for (_, link) in converter.convert(&endpoint("5.6.7.8", 3128), &all, 2) {
            let parsed = parse_endpoint(&link).unwrap();
            assert_eq!(parsed.host, "5.6.7.8", "{}", link);
            assert_eq!(parsed.port, 3128, "{}", link);
        }
    }

    #[test]
    fn uri_shapes() {
        let converter = ProtocolConverter::new("n");
        let ep = endpoint("5.6.7.8", 3128);

        let vless = converter.link(TargetProtocol::Vless, &ep, "x");
        assert!(vless.starts_with("vless://"));
        assert!(vless.ends_with("@5.6.7.8:3128?type=ws&path=/&host=&tls=tls#x"));

        let trojan = converter.link(TargetProtocol::Trojan, &ep, "y");
        assert!(trojan.ends_with("@5.6.7.8:3128?type=ws&path=/&sni=5.6.7.8#y"));

        let ss = converter.link(TargetProtocol::Shadowsocks, &ep, "z");
        let userinfo = ss.trim_start_matches("ss://").split('@').next().unwrap();
        let decoded = String::from_utf8(URL_SAFE.decode(userinfo).unwrap()).unwrap();
        let (cipher, password) = decoded.split_once(':').unwrap();
        assert_eq!(cipher, "aes-256-gcm");
        assert_eq!(password.len(), 16);
        assert!(ss.ends_with("@5.6.7.8:3128#z"));
    }

    #[test]
    fn credentials_are_fresh() {
        let converter = ProtocolConverter::default();
        let ep = endpoint("5.6.7.8", 3128);
        assert_ne!(
            converter.link(TargetProtocol::Vless, &ep, "a"),
            converter.link(TargetProtocol::Vless, &ep, "a")
        );
    }

    #[test]
    fn batch_skips_unparsable_and_keeps_order() {
        let converter = ProtocolConverter::new("p");
        let proxies = vec![
            "http://1.1.1.1:80".to_string(),
            "garbage".to_string(),
            "http://2.2.2.2:81".to_string(),
        ];
        let protocols = [TargetProtocol::Shadowsocks, TargetProtocol::Vless];

        let links = converter.convert_batch(&proxies, &protocols);
        assert_eq!(links.len(), 4);
        assert!(links[0].starts_with("ss://") && links[0].ends_with("#p-1.1.1.1-1-ss"));
        assert!(links[1].starts_with("vless://") && links[1].ends_with("#p-1.1.1.1-1-vless"));
        assert!(links[2].ends_with("#p-2.2.2.2-3-ss"));
        assert!(links[3].ends_with("#p-2.2.2.2-3-vless"));

        let detailed = converter.convert_batch_detailed(&proxies, &protocols);
        assert_eq!(detailed.len(), 2);
        assert_eq!(detailed[1].original, "http://2.2.2.2:81");
    }

    #[test]
    fn batch_skips_proxies_without_explicit_port() {
        let converter = ProtocolConverter::new("p");
        let proxies = vec!["http://1.2.3.4".to_string(), "http://5.6.7.8:80".to_string()];

        let detailed = converter.convert_batch_detailed(&proxies, &[TargetProtocol::Vmess]);
        assert_eq!(detailed.len(), 1);
        assert_eq!(detailed[0].original, "http://5.6.7.8:80");

        let config = VmessConfig::from_link(&detailed[0].links[0].1).unwrap();
        assert_eq!(config.add, "5.6.7.8");
        assert_eq!(config.port, "80");
    }

    #[test]
    fn names_unique_for_repeated_hosts() {
        let converter = ProtocolConverter::default();
        let proxies = vec!["http://1.1.1.1:80".to_string(), "http://1.1.1.1:81".to_string()];
        let links = converter.convert_batch(&proxies, &[TargetProtocol::Trojan]);
        let names: Vec<&str> = links.iter().filter_map(|l| l.rsplit('#').next()).collect();
        assert_ne!(names[0], names[1]);
    }

    #[test]
    fn protocol_names() {
        assert_eq!("shadowsocks".parse::<TargetProtocol>().unwrap(), TargetProtocol::Shadowsocks);
        assert_eq!("VMESS".parse::<TargetProtocol>().unwrap(), TargetProtocol::Vmess);
        assert!("gopher".parse::<TargetProtocol>().is_err());
    }

    #[test]
    fn balancer_expands_vmess() {
        let converter = ProtocolConverter::default();
        let proxies = vec!["http://1.1.1.1:80".to_string(), "bad".to_string()];

        let config = converter.balancer_config(&proxies, TargetProtocol::Vmess);
        assert_eq!(config.kind, "selector");
        assert_eq!(config.proxies.len(), 1);
        let entry = &config.proxies[0];
        assert_eq!(entry.server, "1.1.1.1");
        assert_eq!(entry.port, 80);
        assert!(entry.tls);
        assert_eq!(entry.network, "ws");

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["proxies"][0]["ws-opts"]["path"], "/");
        assert_eq!(json["proxies"][0]["alterId"], 0);

        let other = converter.balancer_config(&proxies, TargetProtocol::Trojan);
        assert!(other.proxies.is_empty());
    }
}
