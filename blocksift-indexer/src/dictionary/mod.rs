//! Dictionary acceleration.
//!
//! A dictionary is an external, pre-indexed filter service: given the
//! address/topic/selector conditions of the active data sources, it returns
//! only the heights (v1) or full payloads (v2) of matching blocks, letting
//! historical catch-up skip irrelevant blocks in bulk.
//!
//! Two protocol versions hide behind one capability set:
//!
//! - [`v1`] - GraphQL over POST, heights only
//! - [`v2`] - JSON-RPC `subql_filterBlocks`, complete block payloads
//!
//! For each configured endpoint the service tries v2 first and falls back to
//! v1; v2 endpoints are preferred in scheduling order. The dictionary is an
//! accelerator, never a requirement: every failure path degrades to dense
//! RPC fetching for the cycle.

pub mod query;
pub mod v1;
pub mod v2;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chain_api::types::FetchedBlock;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::types::DataSourceMap;
use query::QueriesMap;

// ═══════════════════════════════════════════════════════════════════════════════
// SHARED TYPES
// ═══════════════════════════════════════════════════════════════════════════════

/// Dictionary protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DictionaryVersion {
    /// GraphQL endpoint returning matching heights.
    V1,
    /// JSON-RPC endpoint returning complete block payloads.
    V2,
}

/// Dictionary self-description.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DictionaryMetadata {
    /// Greatest height the dictionary has indexed.
    #[serde(default)]
    pub last_processed_height: u64,
    /// Genesis hash of the chain the dictionary indexed.
    #[serde(default)]
    pub genesis_hash: Option<String>,
    /// Chain id of the chain the dictionary indexed.
    #[serde(default)]
    pub chain: Option<String>,
    /// First height the dictionary has data for.
    #[serde(default)]
    pub start_height: u64,
}

impl DictionaryMetadata {
    /// Whether this dictionary indexed the chain we are indexing.
    #[must_use]
    pub fn matches_chain(&self, genesis_hash: &str, chain_id: u64) -> bool {
        if let Some(genesis) = &self.genesis_hash {
            return genesis.eq_ignore_ascii_case(genesis_hash);
        }
        if let Some(chain) = &self.chain {
            return chain == &chain_id.to_string();
        }
        false
    }
}

/// One dictionary answer.
#[derive(Debug, Clone, Default)]
pub struct DictionaryResponse {
    /// Heights of matching blocks, ascending.
    pub batch_blocks: Vec<u64>,
    /// Greatest height this answer covers: every matching block at or below
    /// it is in `batch_blocks`, so the cursor may advance past it.
    pub last_buffered_height: u64,
    /// Full payloads keyed by height (v2 only; empty for v1).
    pub payloads: HashMap<u64, FetchedBlock>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// DICTIONARY CAPABILITY SET
// ═══════════════════════════════════════════════════════════════════════════════

/// The capability set both protocol versions implement.
#[async_trait]
pub trait Dictionary: Send + Sync {
    /// Protocol version.
    fn version(&self) -> DictionaryVersion;

    /// Endpoint URL.
    fn endpoint(&self) -> &str;

    /// Fetch and cache the dictionary's metadata.
    ///
    /// # Errors
    ///
    /// Returns an error when the endpoint is unreachable or does not speak
    /// this protocol version (used for version negotiation).
    async fn init_metadata(&self) -> Result<DictionaryMetadata>;

    /// Most recently observed metadata.
    fn metadata(&self) -> Option<DictionaryMetadata>;

    /// Replace the per-range condition sets.
    fn update_queries_map(&self, queries: QueriesMap);

    /// Matching blocks in `[start, end]`, at most `limit` of them.
    ///
    /// # Errors
    ///
    /// Any error here means "fall back to dense fetching for this cycle".
    async fn get_data(&self, start: u64, end: u64, limit: usize) -> Result<DictionaryResponse>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// FETCHER-FACING PORT
// ═══════════════════════════════════════════════════════════════════════════════

/// What the fetch service needs from dictionary acceleration.
#[async_trait]
pub trait DictionarySource: Send + Sync {
    /// Whether a usable dictionary covers ranges starting at `start`.
    fn usable(&self, start: u64) -> bool;

    /// First height the current dictionary has data for.
    fn start_height(&self) -> u64;

    /// Rebuild the condition sets after the active data sources changed.
    ///
    /// # Errors
    ///
    /// Returns an error when a filter cannot be projected into conditions.
    fn update_queries_map(&self, map: &DataSourceMap) -> Result<()>;

    /// Query matching heights; `None` means "fall back for this cycle".
    async fn scrape(
        &self,
        start: u64,
        end: u64,
        limit: usize,
        finalized: u64,
    ) -> Option<DictionaryResponse>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// DICTIONARY SERVICE
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration of the dictionary service.
#[derive(Debug, Clone)]
pub struct DictionaryServiceConfig {
    /// Per-query timeout; elapsed queries are logged and treated as misses.
    pub timeout: Duration,
    /// Genesis hash of the chain being indexed.
    pub genesis_hash: String,
    /// Chain id of the chain being indexed.
    pub chain_id: u64,
    /// Ceiling on distinct addresses per condition set.
    pub query_address_limit: usize,
}

/// Owns the configured dictionaries and schedules between them.
pub struct DictionaryService {
    /// Negotiated dictionaries, v2 endpoints first.
    dictionaries: Vec<Arc<dyn Dictionary>>,
    /// Index of the dictionary currently scheduled.
    current: AtomicUsize,
    /// Query timeout.
    timeout: Duration,
    /// Ceiling on distinct addresses per condition set.
    address_limit: usize,
}

impl std::fmt::Debug for DictionaryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DictionaryService")
            .field("dictionaries", &self.dictionaries.len())
            .field("current", &self.current.load(Ordering::Relaxed))
            .finish()
    }
}

impl DictionaryService {
    /// Negotiate a dictionary for every endpoint.
    ///
    /// Per endpoint: try v2, fall back to v1, skip the endpoint when both
    /// fail or the dictionary indexed a different chain. An empty result is
    /// fine; the service just never accelerates.
    #[instrument(skip_all, fields(endpoints = endpoints.len()))]
    pub async fn connect(endpoints: &[String], config: &DictionaryServiceConfig) -> Self {
        let mut v2s: Vec<Arc<dyn Dictionary>> = Vec::new();
        let mut v1s: Vec<Arc<dyn Dictionary>> = Vec::new();

        for endpoint in endpoints {
            match Self::negotiate(endpoint, config).await {
                Some(dictionary) => match dictionary.version() {
                    DictionaryVersion::V2 => v2s.push(dictionary),
                    DictionaryVersion::V1 => v1s.push(dictionary),
                },
                None => warn!(endpoint = %endpoint, "no usable dictionary at endpoint"),
            }
        }

        // v2 endpoints are preferred in scheduling order.
        v2s.extend(v1s);

        info!(dictionaries = v2s.len(), "dictionary service ready");

        Self {
            dictionaries: v2s,
            current: AtomicUsize::new(0),
            timeout: config.timeout,
            address_limit: config.query_address_limit,
        }
    }

    /// Service with no dictionaries; every query falls back.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            dictionaries: Vec::new(),
            current: AtomicUsize::new(0),
            timeout: Duration::from_secs(30),
            address_limit: query::DEFAULT_QUERY_ADDRESS_LIMIT,
        }
    }

    async fn negotiate(
        endpoint: &str,
        config: &DictionaryServiceConfig,
    ) -> Option<Arc<dyn Dictionary>> {
        match v2::V2Dictionary::create(endpoint, config.timeout).await {
            Ok(dictionary) => {
                if Self::accept(&dictionary, config) {
                    debug!(endpoint, "negotiated dictionary v2");
                    return Some(Arc::new(dictionary));
                }
                return None;
            }
            Err(e) => debug!(endpoint, error = %e, "v2 negotiation failed, trying v1"),
        }

        match v1::V1Dictionary::create(endpoint, config.timeout).await {
            Ok(dictionary) => {
                if Self::accept(&dictionary, config) {
                    debug!(endpoint, "negotiated dictionary v1");
                    return Some(Arc::new(dictionary));
                }
                None
            }
            Err(e) => {
                debug!(endpoint, error = %e, "v1 negotiation failed");
                None
            }
        }
    }

    fn accept(dictionary: &impl Dictionary, config: &DictionaryServiceConfig) -> bool {
        let Some(metadata) = dictionary.metadata() else {
            return false;
        };
        if !metadata.matches_chain(&config.genesis_hash, config.chain_id) {
            warn!(
                endpoint = dictionary.endpoint(),
                ?metadata.genesis_hash,
                "dictionary indexed a different chain, skipping"
            );
            return false;
        }
        true
    }

    /// Number of negotiated dictionaries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.dictionaries.len()
    }

    /// Whether any dictionary was negotiated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dictionaries.is_empty()
    }

    /// Rebuild every dictionary's condition sets from the active data
    /// sources.
    ///
    /// # Errors
    ///
    /// Returns an error when a filter cannot be projected into conditions.
    pub fn update_queries_map(&self, map: &DataSourceMap) -> Result<()> {
        let queries = QueriesMap::with_address_limit(map, self.address_limit)?;
        for dictionary in &self.dictionaries {
            dictionary.update_queries_map(queries.clone());
        }
        Ok(())
    }

    fn current_dictionary(&self) -> Option<&Arc<dyn Dictionary>> {
        if self.dictionaries.is_empty() {
            return None;
        }
        let index = self.current.load(Ordering::Relaxed) % self.dictionaries.len();
        self.dictionaries.get(index)
    }

    fn rotate(&self) {
        if !self.dictionaries.is_empty() {
            self.current.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl DictionarySource for DictionaryService {
    fn usable(&self, start: u64) -> bool {
        let Some(dictionary) = self.current_dictionary() else {
            return false;
        };
        let Some(metadata) = dictionary.metadata() else {
            return false;
        };
        start >= metadata.start_height
    }

    fn start_height(&self) -> u64 {
        self.current_dictionary()
            .and_then(|d| d.metadata())
            .map_or(0, |m| m.start_height)
    }

    fn update_queries_map(&self, map: &DataSourceMap) -> Result<()> {
        Self::update_queries_map(self, map)
    }

    /// Query the scheduled dictionary, clamped and time-boxed.
    ///
    /// `queryEnd` is clamped to the dictionary's `lastProcessedHeight` and
    /// the chain's finalized height. A timeout or error is logged, rotates
    /// scheduling to the next dictionary, and returns `None` so the caller
    /// falls back to dense fetching; the dictionary may have caught up by
    /// the next cycle.
    #[instrument(skip(self), fields(start, end, limit))]
    async fn scrape(
        &self,
        start: u64,
        end: u64,
        limit: usize,
        finalized: u64,
    ) -> Option<DictionaryResponse> {
        let dictionary = self.current_dictionary()?;
        let metadata = dictionary.metadata()?;

        let clamped_end = end.min(metadata.last_processed_height).min(finalized);
        if clamped_end < start {
            debug!(
                start,
                last_processed = metadata.last_processed_height,
                "dictionary behind requested range"
            );
            return None;
        }

        match tokio::time::timeout(self.timeout, dictionary.get_data(start, clamped_end, limit))
            .await
        {
            Ok(Ok(response)) => Some(response),
            Ok(Err(e)) => {
                warn!(
                    endpoint = dictionary.endpoint(),
                    error = %e,
                    "dictionary query failed, falling back for this cycle"
                );
                self.rotate();
                None
            }
            Err(_elapsed) => {
                warn!(
                    endpoint = dictionary.endpoint(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "dictionary query timed out, falling back for this cycle"
                );
                self.rotate();
                None
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
