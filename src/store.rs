//! Content-hash keyed persistence of verified links.

use crate::config::ProbeConfig;
use crate::error::StoreError;
use crate::probe;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use md5::{Digest, Md5};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Stable uniqueness key of a link: md5 hex over the UTF-8 bytes of the trimmed link.
pub fn content_hash(link: &str) -> String {
    format!("{:x}", Md5::digest(link.trim().as_bytes()))
}

/// A persisted link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub id: String,
    /// Scheme of the link, or `unknown`.
    pub protocol: String,
    pub link: String,
    pub content_hash: String,
    /// Where the link was first seen.
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProxyRecord {
    /// A fresh record for `link`, stamped now.
    pub fn new(link: &str, source: &str) -> Self {
        let link = link.trim();
        let protocol = link
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .filter(|scheme| !scheme.is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            protocol,
            link: link.to_string(),
            content_hash: content_hash(link),
            source: source.to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Result of a successful upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// The hash was already known; its `updated_at` was bumped.
    Duplicate,
}

/// Storage keyed by [`content_hash`].
///
/// Implementations must enforce hash uniqueness themselves and report a
/// conflicting insert as [`UpsertOutcome::Duplicate`].
#[async_trait]
pub trait LinkStore: Send + Sync {
    /// Whether a record with this hash exists.
    async fn exists(&self, content_hash: &str) -> Result<bool, StoreError>;

    /// Insert `record`, or bump the existing record with the same hash.
    async fn upsert(&self, record: ProxyRecord) -> Result<UpsertOutcome, StoreError>;

    /// Every stored record, in no particular order.
    async fn all(&self) -> Result<Vec<ProxyRecord>, StoreError>;
}

/// In-process [`LinkStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, ProxyRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Look up a record by hash.
    pub fn get(&self, content_hash: &str) -> Option<ProxyRecord> {
        self.records.read().get(content_hash).cloned()
    }
}

#[async_trait]
impl LinkStore for MemoryStore {
    async fn exists(&self, content_hash: &str) -> Result<bool, StoreError> {
        Ok(self.records.read().contains_key(content_hash))
    }

    async fn upsert(&self, record: ProxyRecord) -> Result<UpsertOutcome, StoreError> {
        let mut records = self.records.write();
        match records.get_mut(&record.content_hash) {
            Some(existing) => {
                existing.updated_at = record.updated_at.max(existing.updated_at);
                Ok(UpsertOutcome::Duplicate)
            }
            None => {
                records.insert(record.content_hash.clone(), record);
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn all(&self) -> Result<Vec<ProxyRecord>, StoreError> {
        Ok(self.records.read().values().cloned().collect())
    }
}

/// Counts of one ingestion pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub total: usize,
    pub saved: usize,
    pub skipped_existing: usize,
    pub skipped_dead: usize,
    pub failed: usize,
}

/// Probe the unknown links and store the survivors.
///
/// Already-known links are re-observed without probing. Dead or unparsable
/// links are skipped; a failing write only counts against its own link.
pub async fn ingest(
    store: &dyn LinkStore,
    links: &[String],
    source: &str,
    probe_config: &ProbeConfig,
) -> IngestReport {
    let mut report = IngestReport {
        total: links.len(),
        ..IngestReport::default()
    };

    let fresh = partition_known(store, links, source, &mut report).await;
    if fresh.is_empty() {
        return report;
    }

    let batch = probe::probe_batch(&fresh, probe_config).await;
    let alive: HashSet<&str> = batch.working.iter().map(String::as_str).collect();
    for link in &fresh {
        if alive.contains(link.as_str()) {
            save(store, link, source, &mut report).await;
        } else {
            report.skipped_dead += 1;
        }
    }

    info!(
        "Ingested {} links from {}: {} saved, {} existing, {} dead, {} failed",
        report.total, source, report.saved, report.skipped_existing, report.skipped_dead, report.failed
    );
    report
}

/// Store links that were verified elsewhere, without probing.
pub async fn ingest_verified(store: &dyn LinkStore, links: &[String], source: &str) -> IngestReport {
    let mut report = IngestReport {
        total: links.len(),
        ..IngestReport::default()
    };

    for link in partition_known(store, links, source, &mut report).await {
        save(store, &link, source, &mut report).await;
    }

    info!(
        "Stored {} verified links from {}: {} saved, {} existing, {} failed",
        report.total, source, report.saved, report.skipped_existing, report.failed
    );
    report
}

/// Re-observe known links and return the unseen ones, once each.
async fn partition_known(
    store: &dyn LinkStore,
    links: &[String],
    source: &str,
    report: &mut IngestReport,
) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut fresh = Vec::new();

    for link in links {
        let record = ProxyRecord::new(link, source);
        if !seen.insert(record.content_hash.clone()) {
            report.skipped_existing += 1;
            continue;
        }
        match store.exists(&record.content_hash).await {
            Ok(true) => match store.upsert(record).await {
                Ok(_) => report.skipped_existing += 1,
                Err(e) => {
                    warn!("Failed to refresh {}: {}", link, e);
                    report.failed += 1;
                }
            },
            Ok(false) => fresh.push(record.link),
            Err(e) => {
                warn!("Failed to look up {}: {}", link, e);
                report.failed += 1;
            }
        }
    }
    fresh
}

async fn save(store: &dyn LinkStore, link: &str, source: &str, report: &mut IngestReport) {
    match store.upsert(ProxyRecord::new(link, source)).await {
        Ok(UpsertOutcome::Inserted) => report.saved += 1,
        Ok(UpsertOutcome::Duplicate) => report.skipped_existing += 1,
        Err(e) => {
            warn!("Failed to save {}: {}", link, e);
            report.failed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// Fails every write for one link.
    struct FlakyStore {
        inner: MemoryStore,
        poisoned: String,
    }

    #[async_trait]
    impl LinkStore for FlakyStore {
        async fn exists(&self, content_hash: &str) -> Result<bool, StoreError> {
            self.inner.exists(content_hash).await
        }

        async fn upsert(&self, record: ProxyRecord) -> Result<UpsertOutcome, StoreError> {
            if record.link == self.poisoned {
                return Err(StoreError::Write {
                    hash: record.content_hash,
                    reason: "disk full".to_string(),
                });
            }
            self.inner.upsert(record).await
        }

        async fn all(&self) -> Result<Vec<ProxyRecord>, StoreError> {
            self.inner.all().await
        }
    }

    fn links(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn hash_is_stable_md5_of_trimmed_link() {
        assert_eq!(content_hash(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(content_hash("vmess://QUJD"), content_hash("  vmess://QUJD\n"));
        assert_ne!(content_hash("vmess://QUJD"), content_hash("vmess://QUJE"));
    }

    #[test]
    fn record_protocol() {
        assert_eq!(ProxyRecord::new("Trojan://pw@h:1", "s").protocol, "trojan");
        assert_eq!(ProxyRecord::new("garbage", "s").protocol, "unknown");
    }

    #[test]
    fn duplicates_bump_updated_at() {
        let store = MemoryStore::new();
        let first = ProxyRecord::new("ss://a@h:1", "repo");
        let hash = first.content_hash.clone();
        assert_eq!(
            tokio_test::block_on(store.upsert(first.clone())).unwrap(),
            UpsertOutcome::Inserted
        );

        let mut again = ProxyRecord::new("ss://a@h:1", "other");
        again.updated_at = first.updated_at + chrono::Duration::seconds(5);
        assert_eq!(
            tokio_test::block_on(store.upsert(again.clone())).unwrap(),
            UpsertOutcome::Duplicate
        );

        let stored = store.get(&hash).unwrap();
        assert_eq!(stored.id, first.id);
        assert_eq!(stored.source, "repo");
        assert_eq!(stored.updated_at, again.updated_at);
    }

    #[tokio::test]
    async fn repeated_submissions_keep_one_record() {
        let store = MemoryStore::new();
        let batch = links(&["vless://id@h:1#a", "vless://id@h:1#a", " vless://id@h:1#a"]);

        let first = ingest_verified(&store, &batch, "run-1").await;
        let second = ingest_verified(&store, &batch, "run-2").await;

        assert_eq!(store.len(), 1);
        assert_eq!(first.saved, 1);
        assert_eq!(first.skipped_existing, 2);
        assert_eq!(second.saved, 0);
        assert_eq!(second.skipped_existing, 3);
    }

    #[tokio::test]
    async fn failed_write_does_not_abort_batch() {
        let store = FlakyStore {
            inner: MemoryStore::new(),
            poisoned: "trojan://b@h:2".to_string(),
        };
        let batch = links(&["trojan://a@h:1", "trojan://b@h:2", "trojan://c@h:3"]);

        let report = ingest_verified(&store, &batch, "test").await;

        assert_eq!(
            report,
            IngestReport {
                total: 3,
                saved: 2,
                skipped_existing: 0,
                skipped_dead: 0,
                failed: 1
            }
        );
        assert!(store.inner.get(&content_hash("trojan://a@h:1")).is_some());
        assert!(store.inner.get(&content_hash("trojan://c@h:3")).is_some());
    }

    #[tokio::test]
    async fn failed_refresh_counts_as_failed() {
        let store = FlakyStore {
            inner: MemoryStore::new(),
            poisoned: "trojan://b@h:2".to_string(),
        };
        store
            .inner
            .upsert(ProxyRecord::new("trojan://b@h:2", "earlier"))
            .await
            .unwrap();
        let batch = links(&["trojan://a@h:1", "trojan://b@h:2"]);

        let report = ingest_verified(&store, &batch, "test").await;

        assert_eq!(report.saved, 1);
        assert_eq!(report.skipped_existing, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(store.inner.len(), 2);
    }

    #[tokio::test]
    async fn ingest_skips_dead_links() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let closed = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let store = MemoryStore::new();
        store
            .upsert(ProxyRecord::new("hy2://pw@10.0.0.1:443#known", "earlier"))
            .await
            .unwrap();
        let batch = vec![
            format!("trojan://pw@127.0.0.1:{}#up", open),
            format!("trojan://pw@127.0.0.1:{}#down", closed),
            "vmess://QUJD".to_string(),
            "hy2://pw@10.0.0.1:443#known".to_string(),
        ];
        let config = ProbeConfig::new(Duration::from_secs(2), 2);

        let report = ingest(&store, &batch, "test", &config).await;

        assert_eq!(report.total, 4);
        assert_eq!(report.saved, 1);
        assert_eq!(report.skipped_dead, 2);
        assert_eq!(report.skipped_existing, 1);
        assert_eq!(store.len(), 2);
        drop(listener);
    }
}
