//! Configuration for probing and for a full harvest run.

use crate::convert::TargetProtocol;
use crate::error::ConfigError;

use std::path::PathBuf;
use std::time::Duration;

/// A named URL fetched through a candidate proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckTarget {
    pub name: String,
    pub url: String,
}

impl CheckTarget {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }

    /// Domestic, international, search engine and code host targets.
    pub fn defaults() -> Vec<CheckTarget> {
        vec![
            CheckTarget::new("domestic", "http://httpbin.org/ip"),
            CheckTarget::new("international", "https://www.google.com"),
            CheckTarget::new("baidu", "https://www.baidu.com"),
            CheckTarget::new("github", "https://api.github.com"),
        ]
    }
}

/// Settings for the liveness prober.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Timeout for the TCP connect and for each application check.
    pub timeout: Duration,
    /// Number of probes in flight at once.
    pub concurrency: usize,
    /// Targets fetched through the candidate once TCP succeeds.
    pub check_targets: Vec<CheckTarget>,
    /// Successful checks needed for a "working" verdict.
    pub min_successful_checks: usize,
}

impl ProbeConfig {
    /// Probe with the given timeout and worker count, using the default check targets.
    pub fn new(timeout: Duration, concurrency: usize) -> Self {
        Self {
            timeout,
            concurrency: concurrency.max(1),
            check_targets: CheckTarget::defaults(),
            min_successful_checks: 1,
        }
    }

    /// Replace the check targets. An empty list makes probing TCP-only.
    pub fn with_check_targets(mut self, targets: Vec<CheckTarget>) -> Self {
        self.check_targets = targets;
        self
    }

    /// Set the number of successful checks needed for a "working" verdict.
    pub fn with_min_successful_checks(mut self, min: usize) -> Self {
        self.min_successful_checks = min;
        self
    }

    /// Names of the configured checks, in order.
    pub fn check_names(&self) -> Vec<String> {
        self.check_targets.iter().map(|t| t.name.clone()).collect()
    }
}

/// Configuration for a full harvest run.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    /// Prober settings.
    pub probe: ProbeConfig,
    /// Maximum number of collected candidates tested per run.
    pub max_test_count: usize,
    /// Protocols synthesized from each working proxy, in output order.
    pub target_protocols: Vec<TargetProtocol>,
    /// Pause after each repository fetch.
    pub repository_delay: Duration,
    /// Pause after each API fetch.
    pub api_delay: Duration,
    /// Directory receiving the run artifacts.
    pub data_dir: PathBuf,
    /// Prefix of generated display names.
    pub name_prefix: String,
}

impl HarvestConfig {
    /// Create a new configuration builder.
    pub fn builder() -> HarvestConfigBuilder {
        HarvestConfigBuilder::new()
    }
}

/// Builder for `HarvestConfig`.
#[derive(Debug, Clone)]
pub struct HarvestConfigBuilder {
    probe_timeout: Option<Duration>,
    concurrency: Option<usize>,
    check_targets: Option<Vec<CheckTarget>>,
    min_successful_checks: Option<usize>,
    max_test_count: Option<usize>,
    target_protocols: Option<Vec<TargetProtocol>>,
    repository_delay: Option<Duration>,
    api_delay: Option<Duration>,
    data_dir: Option<PathBuf>,
    name_prefix: Option<String>,
}

impl HarvestConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            probe_timeout: None,
            concurrency: None,
            check_targets: None,
            min_successful_checks: None,
            max_test_count: None,
            target_protocols: None,
            repository_delay: None,
            api_delay: None,
            data_dir: None,
            name_prefix: None,
        }
    }

    /// Set the probe timeout.
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = Some(timeout);
        self
    }

    /// Set the number of concurrent probes.
    pub fn concurrency(mut self, workers: usize) -> Self {
        self.concurrency = Some(workers);
        self
    }

    /// Set the application-level check targets.
    pub fn check_targets(mut self, targets: Vec<CheckTarget>) -> Self {
        self.check_targets = Some(targets);
        self
    }

    /// Set the successful checks needed for a "working" verdict.
    pub fn min_successful_checks(mut self, min: usize) -> Self {
        self.min_successful_checks = Some(min);
        self
    }

    /// Set the maximum number of candidates tested per run.
    pub fn max_test_count(mut self, count: usize) -> Self {
        self.max_test_count = Some(count);
        self
    }

    /// Set the conversion targets. Duplicates are dropped, first one wins.
    pub fn target_protocols(mut self, protocols: Vec<TargetProtocol>) -> Self {
        let mut unique = Vec::with_capacity(protocols.len());
        for protocol in protocols {
            if !unique.contains(&protocol) {
                unique.push(protocol);
            }
        }
        self.target_protocols = Some(unique);
        self
    }

    /// Set the pauses after repository and API fetches.
    pub fn delays(mut self, repository: Duration, api: Duration) -> Self {
        self.repository_delay = Some(repository);
        self.api_delay = Some(api);
        self
    }

    /// Set the artifact directory.
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Set the display name prefix of converted links.
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }

    /// Overlay `MAX_WORKERS`, `PROXY_TEST_TIMEOUT` (seconds), `MAX_TEST_COUNT`
    /// and `CHINA_PROXY_PROTOCOLS` (comma separated) from the environment.
    pub fn from_env(self) -> Result<Self, ConfigError> {
        self.overlay(|key| std::env::var(key).ok())
    }

    fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(value) = lookup("MAX_WORKERS") {
            self.concurrency = Some(parse_number("MAX_WORKERS", &value)?);
        }
        if let Some(value) = lookup("PROXY_TEST_TIMEOUT") {
            let secs = parse_number("PROXY_TEST_TIMEOUT", &value)?;
            self.probe_timeout = Some(Duration::from_secs(secs as u64));
        }
        if let Some(value) = lookup("MAX_TEST_COUNT") {
            self.max_test_count = Some(parse_number("MAX_TEST_COUNT", &value)?);
        }
        if let Some(value) = lookup("CHINA_PROXY_PROTOCOLS") {
            let protocols = value
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| p.parse::<TargetProtocol>())
                .collect::<Result<Vec<_>, _>>()?;
            self = self.target_protocols(protocols);
        }
        Ok(self)
    }

    /// Build the configuration.
    pub fn build(self) -> HarvestConfig {
        let mut probe = ProbeConfig::new(
            self.probe_timeout.unwrap_or(Duration::from_secs(10)),
            self.concurrency.unwrap_or(10),
        )
        .with_min_successful_checks(self.min_successful_checks.unwrap_or(1));
        if let Some(targets) = self.check_targets {
            probe = probe.with_check_targets(targets);
        }

        HarvestConfig {
            probe,
            max_test_count: self.max_test_count.unwrap_or(50),
            target_protocols: self.target_protocols.unwrap_or_else(|| {
                vec![TargetProtocol::Vmess, TargetProtocol::Vless, TargetProtocol::Shadowsocks]
            }),
            repository_delay: self.repository_delay.unwrap_or(Duration::from_secs(1)),
            api_delay: self.api_delay.unwrap_or(Duration::from_secs(2)),
            data_dir: self.data_dir.unwrap_or_else(|| PathBuf::from("data/china_proxies")),
            name_prefix: self.name_prefix.unwrap_or_else(|| "china-proxy".to_string()),
        }
    }
}

impl Default for HarvestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_number(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn builder_defaults() {
        let config = HarvestConfig::builder().build();
        assert_eq!(config.probe.timeout, Duration::from_secs(10));
        assert_eq!(config.probe.concurrency, 10);
        assert_eq!(config.probe.min_successful_checks, 1);
        assert_eq!(config.probe.check_targets.len(), 4);
        assert_eq!(config.max_test_count, 50);
        assert_eq!(
            config.target_protocols,
            vec![TargetProtocol::Vmess, TargetProtocol::Vless, TargetProtocol::Shadowsocks]
        );
        assert_eq!(config.name_prefix, "china-proxy");
    }

    #[test]
    fn protocols_are_an_ordered_set() {
        let config = HarvestConfig::builder()
            .target_protocols(vec![
                TargetProtocol::Trojan,
                TargetProtocol::Vmess,
                TargetProtocol::Trojan,
            ])
            .build();
        assert_eq!(config.target_protocols, vec![TargetProtocol::Trojan, TargetProtocol::Vmess]);
    }

    #[test]
    fn environment_overlay() {
        let env: HashMap<&str, &str> = [
            ("MAX_WORKERS", "4"),
            ("PROXY_TEST_TIMEOUT", "3"),
            ("MAX_TEST_COUNT", "7"),
            ("CHINA_PROXY_PROTOCOLS", "ss, trojan"),
        ]
        .into_iter()
        .collect();

        let config = HarvestConfig::builder()
            .overlay(|key| env.get(key).map(|v| v.to_string()))
            .unwrap()
            .build();
        assert_eq!(config.probe.concurrency, 4);
        assert_eq!(config.probe.timeout, Duration::from_secs(3));
        assert_eq!(config.max_test_count, 7);
        assert_eq!(
            config.target_protocols,
            vec![TargetProtocol::Shadowsocks, TargetProtocol::Trojan]
        );
    }

    #[test]
    fn malformed_environment_is_rejected() {
        let result = HarvestConfig::builder()
            .overlay(|key| (key == "MAX_WORKERS").then(|| "many".to_string()));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));

        let result = HarvestConfig::builder()
            .overlay(|key| (key == "CHINA_PROXY_PROTOCOLS").then(|| "vmess,gopher".to_string()));
        assert!(matches!(result, Err(ConfigError::UnknownProtocol(_))));
    }

    #[test]
    fn zero_concurrency_is_clamped() {
        assert_eq!(ProbeConfig::new(Duration::from_secs(1), 0).concurrency, 1);
    }
}
