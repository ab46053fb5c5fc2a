//! # proxy-link-pool
//!
//! Collects proxy endpoints and tunnel share links from public sources,
//! verifies them and republishes the survivors.
//!
//! Links are pulled out of arbitrary text by the extractor, merged across
//! pluggable providers by the collector, checked by a bounded-concurrency
//! prober, turned into synthetic vmess/vless/trojan/shadowsocks links by the
//! converter and kept unique by content hash in a [`LinkStore`].

pub mod artifacts;
pub mod config;
pub mod convert;
pub mod error;
pub mod extract;
pub mod geo;
pub mod harvester;
pub mod link;
pub mod probe;
pub mod source;
pub mod store;
mod utils;

pub use artifacts::{export_subscription, ArtifactReader, ArtifactWriter, ProxyKind};
pub use config::{CheckTarget, HarvestConfig, HarvestConfigBuilder, ProbeConfig};
pub use convert::{ProtocolConverter, TargetProtocol};
pub use error::{NoProxyAvailable, ParseError, ProbeError, SourceError, StoreError};
pub use extract::extract;
pub use harvester::{Harvester, RunOutcome, RunReport};
pub use link::{parse_endpoint, ParsedEndpoint, Scheme};
pub use probe::{probe_batch, probe_batch_with_cancel, probe_one, ProbeResult, ProbeStatistics};
pub use source::{
    Fetch, HttpFetcher, JsonApiProvider, PlatformSearchProvider, Provider, RepoFileProvider,
    SourceCollector,
};
pub use store::{content_hash, ingest, ingest_verified, LinkStore, MemoryStore, ProxyRecord};
pub use utils::Fetched;
