//! Dictionary protocol v2: JSON-RPC `subql_filterBlocks`.
//!
//! v2 endpoints answer with complete block payloads, so matching blocks
//! skip the full-node fetch entirely: the dispatcher hands the payload
//! straight to the workers.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chain_api::types::{EthBlock, FetchedBlock, LogRecord};
use eth_rpc::{ClientConfig, RequestOptions, RpcClient};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::dictionary::query::QueriesMap;
use crate::dictionary::{Dictionary, DictionaryMetadata, DictionaryResponse, DictionaryVersion};
use crate::error::{IndexerError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// WIRE TYPES
// ═══════════════════════════════════════════════════════════════════════════════

/// A block as carried in a `subql_filterBlocks` response: wire-shaped block
/// plus its logs.
#[derive(Debug, Clone, Deserialize)]
struct RawFilteredBlock {
    #[serde(flatten)]
    block: EthBlock,
    #[serde(default)]
    logs: Vec<LogRecord>,
}

/// `subql_filterBlocks` result envelope.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilterBlocksResult {
    #[serde(default)]
    blocks: Vec<RawFilteredBlock>,
    /// `[start, end]` of the range this answer covers.
    block_range: [u64; 2],
}

// ═══════════════════════════════════════════════════════════════════════════════
// V2 DICTIONARY
// ═══════════════════════════════════════════════════════════════════════════════

/// JSON-RPC dictionary client.
#[derive(Debug)]
pub struct V2Dictionary {
    /// JSON-RPC client for the dictionary endpoint.
    client: RpcClient,
    /// Endpoint URL.
    endpoint: String,
    /// Cached metadata.
    metadata: RwLock<Option<DictionaryMetadata>>,
    /// Condition sets per height range.
    queries: RwLock<QueriesMap>,
}

impl V2Dictionary {
    /// Connect and probe the endpoint.
    ///
    /// Probing calls the metadata method; endpoints that do not implement it
    /// fail here, which is what drives the fall-back to v1.
    ///
    /// # Errors
    ///
    /// Returns an error when the endpoint is unreachable or does not speak
    /// protocol v2.
    pub async fn create(endpoint: &str, timeout: Duration) -> Result<Self> {
        let config = ClientConfig::default().with_timeout(timeout.max(Duration::from_secs(1)));
        let client = RpcClient::with_config(endpoint, config)
            .map_err(|e| IndexerError::DictionaryUnavailable(e.to_string()))?;

        let dictionary = Self {
            client,
            endpoint: endpoint.to_string(),
            metadata: RwLock::new(None),
            queries: RwLock::new(QueriesMap::default()),
        };

        dictionary.init_metadata().await?;
        Ok(dictionary)
    }

    async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        self.client
            .call_with_options(method, params, &RequestOptions::default())
            .await
            .map_err(|e| {
                if e.is_method_not_supported() {
                    IndexerError::DictionaryUnavailable(format!(
                        "{method} not supported by {}",
                        self.endpoint
                    ))
                } else {
                    IndexerError::DictionaryUnavailable(e.to_string())
                }
            })
    }
}

#[async_trait]
impl Dictionary for V2Dictionary {
    fn version(&self) -> DictionaryVersion {
        DictionaryVersion::V2
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn init_metadata(&self) -> Result<DictionaryMetadata> {
        let value = self.call("subql_getMetadata", serde_json::json!([])).await?;
        let metadata: DictionaryMetadata = serde_json::from_value(value)
            .map_err(|e| IndexerError::DictionaryMalformed(format!("metadata: {e}")))?;
        *self.metadata.write() = Some(metadata.clone());
        Ok(metadata)
    }

    fn metadata(&self) -> Option<DictionaryMetadata> {
        self.metadata.read().clone()
    }

    fn update_queries_map(&self, queries: QueriesMap) {
        *self.queries.write() = queries;
    }

    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn get_data(&self, start: u64, end: u64, limit: usize) -> Result<DictionaryResponse> {
        let entry = {
            let queries = self.queries.read();
            queries.entry_for(start).cloned()
        };
        let entry = entry.filter(|e| !e.is_empty()).ok_or_else(|| {
            IndexerError::DictionaryUnavailable("no conditions for this range".into())
        })?;

        let params = serde_json::json!([{
            "fromBlock": format!("0x{start:x}"),
            "toBlock": format!("0x{end:x}"),
            "limit": limit,
            "blockFilter": entry,
            "fieldSelection": {
                "blocks": true,
                "transactions": true,
                "logs": true,
            },
        }]);

        let value = self.call("subql_filterBlocks", params).await?;
        let result: FilterBlocksResult = serde_json::from_value(value)
            .map_err(|e| IndexerError::DictionaryMalformed(format!("filterBlocks: {e}")))?;

        let mut payloads: HashMap<u64, FetchedBlock> = HashMap::with_capacity(result.blocks.len());
        let mut batch_blocks: Vec<u64> = Vec::with_capacity(result.blocks.len());

        for raw in result.blocks {
            let height = raw.block.header.number;
            if height < start || height > end {
                return Err(IndexerError::DictionaryMalformed(format!(
                    "block {height} outside requested range [{start}, {end}]"
                )));
            }
            batch_blocks.push(height);
            payloads.insert(
                height,
                FetchedBlock {
                    header: raw.block.header,
                    transactions: raw.block.transactions.into_full(),
                    logs: raw.logs,
                },
            );
        }

        batch_blocks.sort_unstable();
        batch_blocks.dedup();

        let last_buffered_height = result.block_range[1].clamp(start, end);

        debug!(
            matched = batch_blocks.len(),
            last_buffered_height, "dictionary v2 answered"
        );

        Ok(DictionaryResponse {
            batch_blocks,
            last_buffered_height,
            payloads,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
