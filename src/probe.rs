//! Liveness probing of candidate links.

use crate::config::{CheckTarget, ProbeConfig};
use crate::error::ProbeError;
use crate::link::{self, ParsedEndpoint};
use crate::utils::round2;

use futures::{future, stream, StreamExt};
use log::{debug, info};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Outcome of one named application-level check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub name: String,
    pub success: bool,
    /// Status or error text of a failed check.
    pub detail: Option<String>,
}

/// Result of probing a single candidate.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    /// The candidate as given.
    pub link: String,
    /// The endpoint, when the link could be parsed.
    pub endpoint: Option<ParsedEndpoint>,
    /// Whether the TCP connect succeeded.
    pub reachable: bool,
    /// TCP connect time in milliseconds.
    pub latency_ms: Option<f64>,
    /// Application-level checks, empty when none ran.
    pub checks: Vec<CheckOutcome>,
    /// Whether application-level checks were attempted at all.
    pub checks_run: bool,
    pub error: Option<ProbeError>,
}

impl ProbeResult {
    fn failed(link: &str, endpoint: Option<ParsedEndpoint>, error: ProbeError) -> Self {
        Self {
            link: link.to_string(),
            endpoint,
            reachable: false,
            latency_ms: None,
            checks: Vec::new(),
            checks_run: false,
            error: Some(error),
        }
    }

    /// Number of checks that succeeded.
    pub fn successful_checks(&self) -> usize {
        self.checks.iter().filter(|c| c.success).count()
    }

    /// Reachable, and at least `min_checks` checks passed when checks ran.
    ///
    /// Links that cannot act as a forward proxy are judged on TCP alone.
    pub fn is_working(&self, min_checks: usize) -> bool {
        self.reachable
            && self.error.is_none()
            && (!self.checks_run || self.successful_checks() >= min_checks)
    }
}

/// Success count and rate of one named check across a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckStat {
    pub success: usize,
    pub rate: f64,
}

/// Aggregate statistics of a probe batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeStatistics {
    pub total_proxies: usize,
    pub connected_proxies: usize,
    pub working_proxies: usize,
    pub connection_rate: f64,
    pub working_rate: f64,
    /// Mean TCP connect time of reachable candidates, in milliseconds.
    pub avg_response_time: f64,
    pub test_stats: BTreeMap<String, CheckStat>,
    /// Wall time of the batch, in seconds.
    #[serde(default)]
    pub test_duration: f64,
}

/// Order-independent accumulator behind [`ProbeStatistics`].
///
/// Latencies are summed in hundredths of a millisecond so that `record` and
/// `merge` commute exactly.
#[derive(Debug, Clone, Default)]
pub struct StatsAccumulator {
    total: usize,
    connected: usize,
    working: usize,
    latency_hundredths: u64,
    latency_samples: usize,
    check_success: BTreeMap<String, usize>,
    min_checks: usize,
}

impl StatsAccumulator {
    /// Start an empty accumulator reporting on `check_names`.
    pub fn new(check_names: &[String], min_checks: usize) -> Self {
        Self {
            check_success: check_names.iter().map(|n| (n.clone(), 0)).collect(),
            min_checks,
            ..Self::default()
        }
    }

    /// Fold one result in.
    pub fn record(&mut self, result: &ProbeResult) {
        self.total += 1;
        if result.reachable {
            self.connected += 1;
        }
        if result.is_working(self.min_checks) {
            self.working += 1;
        }
        if let Some(latency) = result.latency_ms {
            self.latency_hundredths += (latency * 100.0).round() as u64;
            self.latency_samples += 1;
        }
        for check in result.checks.iter().filter(|c| c.success) {
            *self.check_success.entry(check.name.clone()).or_insert(0) += 1;
        }
    }

    /// Combine two partial accumulations.
    pub fn merge(mut self, other: StatsAccumulator) -> Self {
        self.total += other.total;
        self.connected += other.connected;
        self.working += other.working;
        self.latency_hundredths += other.latency_hundredths;
        self.latency_samples += other.latency_samples;
        for (name, count) in other.check_success {
            *self.check_success.entry(name).or_insert(0) += count;
        }
        self
    }

    /// Produce the final statistics.
    pub fn finish(self, duration: Duration) -> ProbeStatistics {
        let rate = |count: usize| {
            if self.total == 0 {
                0.0
            } else {
                count as f64 / self.total as f64
            }
        };
        let avg_response_time = if self.latency_samples == 0 {
            0.0
        } else {
            round2(self.latency_hundredths as f64 / 100.0 / self.latency_samples as f64)
        };

        ProbeStatistics {
            total_proxies: self.total,
            connected_proxies: self.connected,
            working_proxies: self.working,
            connection_rate: rate(self.connected),
            working_rate: rate(self.working),
            avg_response_time,
            test_stats: self
                .check_success
                .iter()
                .map(|(name, success)| {
                    (
                        name.clone(),
                        CheckStat {
                            success: *success,
                            rate: rate(*success),
                        },
                    )
                })
                .collect(),
            test_duration: round2(duration.as_secs_f64()),
        }
    }
}

/// Everything a batch produced.
#[derive(Debug, Clone)]
pub struct BatchReport {
    /// Links judged working, in completion order.
    pub working: Vec<String>,
    pub stats: ProbeStatistics,
    /// Per-candidate results, in completion order.
    pub results: Vec<ProbeResult>,
}

/// Probe one candidate.
///
/// Never fails: parse errors, connect failures, timeouts and cancellation
/// are all reported on the returned result.
pub async fn probe_one(link: &str, config: &ProbeConfig, cancel: &CancellationToken) -> ProbeResult {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => ProbeResult::failed(link, None, ProbeError::Cancelled),
        result = probe_uncancelled(link, config) => result,
    }
}

async fn probe_uncancelled(link: &str, config: &ProbeConfig) -> ProbeResult {
    let endpoint = match link::parse_endpoint(link) {
        Ok(endpoint) => endpoint,
        Err(e) => return ProbeResult::failed(link, None, ProbeError::Unparsable(e)),
    };

    let start = Instant::now();
    let connect = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
    match tokio::time::timeout(config.timeout, connect).await {
        Ok(Ok(_stream)) => {}
        Ok(Err(e)) => {
            return ProbeResult::failed(link, Some(endpoint), ProbeError::Connect(e.to_string()))
        }
        Err(_) => return ProbeResult::failed(link, Some(endpoint), ProbeError::Timeout),
    }
    let latency_ms = round2(start.elapsed().as_secs_f64() * 1000.0);

    let checks_run = endpoint.scheme.is_forward_proxy() && !config.check_targets.is_empty();
    let checks = if checks_run {
        run_checks(link, config).await
    } else {
        Vec::new()
    };

    ProbeResult {
        link: link.to_string(),
        endpoint: Some(endpoint),
        reachable: true,
        latency_ms: Some(latency_ms),
        checks,
        checks_run,
        error: None,
    }
}

/// Fetch every check target through `proxy_url`, all at once.
async fn run_checks(proxy_url: &str, config: &ProbeConfig) -> Vec<CheckOutcome> {
    let client = match reqwest::Proxy::all(proxy_url)
        .and_then(|proxy| Client::builder().proxy(proxy).timeout(config.timeout).build())
    {
        Ok(client) => client,
        Err(e) => {
            let detail = e.to_string();
            return config
                .check_targets
                .iter()
                .map(|target| CheckOutcome {
                    name: target.name.clone(),
                    success: false,
                    detail: Some(detail.clone()),
                })
                .collect();
        }
    };

    future::join_all(config.check_targets.iter().map(|target| check(&client, target))).await
}

async fn check(client: &Client, target: &CheckTarget) -> CheckOutcome {
    let (success, detail) = match client.get(&target.url).send().await {
        Ok(resp) if resp.status().is_success() => (true, None),
        Ok(resp) => (false, Some(format!("HTTP {}", resp.status().as_u16()))),
        Err(e) => (false, Some(e.to_string())),
    };
    CheckOutcome {
        name: target.name.clone(),
        success,
        detail,
    }
}

/// Probe a batch with at most `config.concurrency` probes in flight.
pub async fn probe_batch(links: &[String], config: &ProbeConfig) -> BatchReport {
    probe_batch_with_cancel(links, config, CancellationToken::new()).await
}

/// Like [`probe_batch`], but abandons outstanding probes once `cancel` fires.
///
/// Every link still gets exactly one result; abandoned ones carry
/// [`ProbeError::Cancelled`].
pub async fn probe_batch_with_cancel(
    links: &[String],
    config: &ProbeConfig,
    cancel: CancellationToken,
) -> BatchReport {
    info!(
        "Probing {} candidates with {} workers, timeout {:?}",
        links.len(),
        config.concurrency,
        config.timeout
    );
    let started = Instant::now();
    let shared = Arc::new(config.clone());
    let mut stats = StatsAccumulator::new(&config.check_names(), config.min_successful_checks);
    let mut working = Vec::new();
    let mut results = Vec::with_capacity(links.len());

    let mut probes = stream::iter(links.iter().cloned())
        .map(|link| {
            let config = Arc::clone(&shared);
            let cancel = cancel.clone();
            async move {
                let task_link = link.clone();
                let task = tokio::spawn(async move { probe_one(&task_link, &config, &cancel).await });
                match task.await {
                    Ok(result) => result,
                    Err(e) => ProbeResult::failed(&link, None, ProbeError::Task(e.to_string())),
                }
            }
        })
        .buffer_unordered(config.concurrency.max(1));

    while let Some(result) = probes.next().await {
        match &result.error {
            Some(e) => debug!("{} failed: {}", result.link, e),
            None => debug!(
                "{} reachable in {:?}ms, {}/{} checks passed",
                result.link,
                result.latency_ms,
                result.successful_checks(),
                result.checks.len()
            ),
        }
        stats.record(&result);
        if result.is_working(config.min_successful_checks) {
            working.push(result.link.clone());
        }
        results.push(result);
    }

    let stats = stats.finish(started.elapsed());
    info!(
        "Probe finished: {}/{} connected, {} working, avg {}ms in {}s",
        stats.connected_proxies,
        stats.total_proxies,
        stats.working_proxies,
        stats.avg_response_time,
        stats.test_duration
    );

    BatchReport {
        working,
        stats,
        results,
    }
}
