//! One full harvest run: collect, probe, convert, store and write artifacts.

use crate::artifacts::{
    ArtifactConfig, ArtifactReader, ArtifactWriter, CollectionStats, ConversionStats, RunStats,
    RunSummary,
};
use crate::config::HarvestConfig;
use crate::convert::ProtocolConverter;
use crate::error::ArtifactError;
use crate::probe::{self, ProbeStatistics};
use crate::source::{HttpFetcher, SourceCollector};
use crate::store::{self, IngestReport, LinkStore, MemoryStore};

use chrono::Utc;
use log::{info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How a run ended.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// No source answered and there was no earlier working list to fall back on.
    NothingCollected,
    Completed(RunReport),
}

/// What a completed run did.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub collected: usize,
    /// Whether the candidates came from the previous run's working list.
    pub used_fallback: bool,
    pub tested: usize,
    pub working: Vec<String>,
    pub converted: Vec<String>,
    pub probe_stats: ProbeStatistics,
    pub stored_working: IngestReport,
    pub stored_converted: IngestReport,
    pub summary: RunSummary,
    pub duration: Duration,
}

/// Drives a harvest run against a collector and a store.
pub struct Harvester {
    config: HarvestConfig,
    collector: SourceCollector,
    store: Arc<dyn LinkStore>,
    converter: ProtocolConverter,
}

impl Harvester {
    pub fn new(config: HarvestConfig, collector: SourceCollector, store: Arc<dyn LinkStore>) -> Self {
        let converter = ProtocolConverter::new(config.name_prefix.clone());
        Self {
            config,
            collector,
            store,
            converter,
        }
    }

    /// A harvester over the default providers, HTTP fetching and an in-memory store.
    pub fn from_config(config: HarvestConfig) -> Result<Self, reqwest::Error> {
        let collector = SourceCollector::new(
            SourceCollector::default_providers(),
            Arc::new(HttpFetcher::new()?),
        )
        .with_delays(config.repository_delay, config.api_delay);
        Ok(Self::new(config, collector, Arc::new(MemoryStore::new())))
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LinkStore> {
        &self.store
    }

    /// Run once.
    ///
    /// Source, probe, conversion and store failures are absorbed into the
    /// report; only artifact I/O errors are returned.
    pub async fn run(&self) -> Result<RunOutcome, ArtifactError> {
        let started = Instant::now();
        let writer = ArtifactWriter::new(&self.config.data_dir);

        info!("Step 1: collecting candidates");
        let mut candidates = self.collector.collect_all().await;
        let mut used_fallback = false;
        if candidates.is_empty() {
            let previous = ArtifactReader::new(&self.config.data_dir)
                .load_working()
                .unwrap_or_else(|e| {
                    warn!("Failed to read previous working list: {}", e);
                    Vec::new()
                });
            if previous.is_empty() {
                warn!("Nothing collected and no previous working list");
                return Ok(RunOutcome::NothingCollected);
            }
            info!("No source answered, retesting {} previous proxies", previous.len());
            candidates = previous;
            used_fallback = true;
        }
        let collected = candidates.len();
        writer.write_raw(&candidates)?;

        info!("Step 2: probing");
        candidates.truncate(self.config.max_test_count);
        let tested = candidates.len();
        let batch = probe::probe_batch(&candidates, &self.config.probe).await;
        let working = batch.working;
        info!("{}/{} candidates working", working.len(), tested);

        info!("Step 3: converting");
        let converted = if working.is_empty() {
            warn!("No working proxies, skipping conversion");
            Vec::new()
        } else {
            self.converter
                .convert_batch(&working, &self.config.target_protocols)
        };
        info!("{} working proxies -> {} share links", working.len(), converted.len());

        info!("Step 4: storing");
        let stored_working = store::ingest_verified(self.store.as_ref(), &working, "harvest").await;
        let stored_converted =
            store::ingest_verified(self.store.as_ref(), &converted, "harvest-converted").await;

        info!("Step 5: writing artifacts");
        if !working.is_empty() {
            writer.write_working(&working)?;
        }
        if !converted.is_empty() {
            writer.write_converted(&converted)?;
        }

        let stats = RunStats {
            collection: CollectionStats {
                total_collected: collected,
                tested,
                working: working.len(),
                success_rate: if tested == 0 {
                    0.0
                } else {
                    working.len() as f64 / tested as f64
                },
            },
            conversion: ConversionStats {
                original_working: working.len(),
                converted: converted.len(),
                target_protocols: self
                    .config
                    .target_protocols
                    .iter()
                    .map(|p| p.as_str().to_string())
                    .collect(),
            },
            test_stats: batch.stats.clone(),
            converted_proxies: Vec::new(),
        };
        let timestamp = Utc::now().to_rfc3339();
        let summary = RunSummary {
            timestamp: timestamp.clone(),
            total_collected: collected,
            stats: stats.clone(),
            proxies: working.clone(),
        };
        writer.write_summary(&summary)?;
        writer.write_config(&ArtifactConfig {
            timestamp,
            working_proxies: working.clone(),
            converted_proxies: converted.clone(),
            stats,
        })?;

        let duration = started.elapsed();
        info!(
            "Run finished in {:.2}s: {} collected, {} tested, {} working, {} converted",
            duration.as_secs_f64(),
            collected,
            tested,
            working.len(),
            converted.len()
        );

        Ok(RunOutcome::Completed(RunReport {
            collected,
            used_fallback,
            tested,
            working,
            converted,
            probe_stats: batch.stats,
            stored_working,
            stored_converted,
            summary,
            duration,
        }))
    }
}
