//! Dictionary protocol v1: GraphQL over POST.
//!
//! One request carries the `_metadata` block plus one filtered entity set
//! per condition group; every group returns `{ nodes: [{ blockHeight }] }`
//! and the heights are merged, sorted, and deduplicated.
//!
//! # Capability detection
//!
//! Newer servers support `distinct: BLOCK_HEIGHT` and a `startHeight`
//! metadata field. On an unknown-argument error naming either feature, the
//! client disables it for the session and retries, so old servers remain
//! usable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, instrument, warn};

use crate::dictionary::query::{DictionaryQueryEntry, LogCondition, QueriesMap, RecipientCondition, TxCondition};
use crate::dictionary::{Dictionary, DictionaryMetadata, DictionaryResponse, DictionaryVersion};
use crate::error::{IndexerError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// V1 DICTIONARY
// ═══════════════════════════════════════════════════════════════════════════════

/// GraphQL dictionary client.
#[derive(Debug)]
pub struct V1Dictionary {
    /// HTTP client with the configured query timeout.
    client: reqwest::Client,
    /// GraphQL endpoint URL.
    endpoint: String,
    /// Cached metadata; refreshed by every data query.
    metadata: RwLock<Option<DictionaryMetadata>>,
    /// Condition sets per height range.
    queries: RwLock<QueriesMap>,
    /// Whether `distinct` is still believed supported.
    supports_distinct: AtomicBool,
    /// Whether the `startHeight` metadata field is still believed supported.
    supports_start_height: AtomicBool,
}

impl V1Dictionary {
    /// Connect and probe the endpoint's metadata.
    ///
    /// # Errors
    ///
    /// Returns an error when the endpoint is unreachable or does not answer
    /// the metadata query.
    pub async fn create(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                IndexerError::DictionaryUnavailable(format!("failed to build HTTP client: {e}"))
            })?;

        let dictionary = Self {
            client,
            endpoint: endpoint.to_string(),
            metadata: RwLock::new(None),
            queries: RwLock::new(QueriesMap::default()),
            supports_distinct: AtomicBool::new(true),
            supports_start_height: AtomicBool::new(true),
        };

        dictionary.init_metadata().await?;
        Ok(dictionary)
    }

    async fn post(&self, query: &str) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({"query": query}))
            .send()
            .await
            .map_err(|e| IndexerError::DictionaryUnavailable(e.to_string()))?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| IndexerError::DictionaryMalformed(e.to_string()))?;
        Ok(body)
    }

    /// Messages of GraphQL errors in a response body, if any.
    fn error_messages(body: &serde_json::Value) -> Vec<String> {
        body.get("errors")
            .and_then(serde_json::Value::as_array)
            .map(|errors| {
                errors
                    .iter()
                    .filter_map(|e| e.get("message").and_then(serde_json::Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Disable capabilities named by unknown-argument errors.
    ///
    /// Returns `true` when anything was disabled (so the caller retries).
    fn downgrade_capabilities(&self, messages: &[String]) -> bool {
        let mut downgraded = false;
        for message in messages {
            let unknown = message.contains("Unknown argument")
                || message.contains("Cannot query field")
                || message.contains("Unknown field");
            if !unknown {
                continue;
            }
            if message.contains("distinct") && self.supports_distinct.load(Ordering::Relaxed) {
                warn!(endpoint = %self.endpoint, "dictionary does not support distinct, disabling");
                self.supports_distinct.store(false, Ordering::Relaxed);
                downgraded = true;
            }
            if message.contains("startHeight") && self.supports_start_height.load(Ordering::Relaxed)
            {
                warn!(endpoint = %self.endpoint, "dictionary does not support startHeight, disabling");
                self.supports_start_height.store(false, Ordering::Relaxed);
                downgraded = true;
            }
        }
        downgraded
    }

    fn metadata_selection(&self) -> &'static str {
        if self.supports_start_height.load(Ordering::Relaxed) {
            "_metadata { lastProcessedHeight genesisHash startHeight }"
        } else {
            "_metadata { lastProcessedHeight genesisHash }"
        }
    }

    fn parse_metadata(body: &serde_json::Value) -> Result<DictionaryMetadata> {
        let metadata = body
            .get("data")
            .and_then(|d| d.get("_metadata"))
            .ok_or_else(|| {
                IndexerError::DictionaryMalformed("response without _metadata".into())
            })?;
        Ok(serde_json::from_value(metadata.clone())?)
    }

    /// Build the full GraphQL document for one data query.
    fn build_query(
        &self,
        entry: &DictionaryQueryEntry,
        start: u64,
        end: u64,
        limit: usize,
    ) -> String {
        let distinct = if self.supports_distinct.load(Ordering::Relaxed) {
            ", distinct: BLOCK_HEIGHT"
        } else {
            ""
        };

        let mut groups = Vec::new();
        for (index, condition) in entry.logs.iter().enumerate() {
            groups.push(format!(
                "l{index}: evmLogs(filter: {{{}}}, orderBy: BLOCK_HEIGHT_ASC, first: {limit}{distinct}) {{ nodes {{ blockHeight }} }}",
                log_filter(condition, start, end)
            ));
        }
        for (index, condition) in entry.transactions.iter().enumerate() {
            groups.push(format!(
                "t{index}: evmTransactions(filter: {{{}}}, orderBy: BLOCK_HEIGHT_ASC, first: {limit}{distinct}) {{ nodes {{ blockHeight }} }}",
                tx_filter(condition, start, end)
            ));
        }

        format!(
            "query {{ {} {} }}",
            self.metadata_selection(),
            groups.join(" ")
        )
    }

    /// Merge every group's heights, sorted and deduplicated.
    fn collect_heights(body: &serde_json::Value) -> Result<Vec<u64>> {
        let data = body
            .get("data")
            .and_then(serde_json::Value::as_object)
            .ok_or_else(|| IndexerError::DictionaryMalformed("response without data".into()))?;

        let mut heights: Vec<u64> = Vec::new();
        for (key, group) in data {
            if key == "_metadata" {
                continue;
            }
            let nodes = group
                .get("nodes")
                .and_then(serde_json::Value::as_array)
                .ok_or_else(|| {
                    IndexerError::DictionaryMalformed(format!("group {key} without nodes"))
                })?;
            for node in nodes {
                let height = node
                    .get("blockHeight")
                    .map(parse_height)
                    .transpose()?
                    .ok_or_else(|| {
                        IndexerError::DictionaryMalformed(format!(
                            "node without blockHeight in {key}"
                        ))
                    })?;
                heights.push(height);
            }
        }

        heights.sort_unstable();
        heights.dedup();
        Ok(heights)
    }
}

#[async_trait]
impl Dictionary for V1Dictionary {
    fn version(&self) -> DictionaryVersion {
        DictionaryVersion::V1
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn init_metadata(&self) -> Result<DictionaryMetadata> {
        // Up to one retry after a capability downgrade.
        for _ in 0..2 {
            let query = format!("query {{ {} }}", self.metadata_selection());
            let body = self.post(&query).await?;

            let errors = Self::error_messages(&body);
            if !errors.is_empty() {
                if self.downgrade_capabilities(&errors) {
                    continue;
                }
                return Err(IndexerError::DictionaryMalformed(errors.join("; ")));
            }

            let metadata = Self::parse_metadata(&body)?;
            *self.metadata.write() = Some(metadata.clone());
            return Ok(metadata);
        }

        Err(IndexerError::DictionaryUnavailable(
            "metadata query kept failing after downgrades".into(),
        ))
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

        // Up to one retry after a capability downgrade.
        for _ in 0..2 {
            let query = self.build_query(&entry, start, end, limit);
            let body = self.post(&query).await?;

            let errors = Self::error_messages(&body);
            if !errors.is_empty() {
                if self.downgrade_capabilities(&errors) {
                    continue;
                }
                return Err(IndexerError::DictionaryMalformed(errors.join("; ")));
            }

            // Every data response refreshes the cached metadata.
            let metadata = Self::parse_metadata(&body)?;
            *self.metadata.write() = Some(metadata.clone());

            let mut heights = Self::collect_heights(&body)?;
            heights.retain(|&h| h >= start && h <= end);

            let last_buffered_height = if heights.len() >= limit {
                heights.truncate(limit);
                heights.last().copied().unwrap_or(end)
            } else {
                // Everything up to `end` is covered.
                end
            };

            debug!(
                matched = heights.len(),
                last_buffered_height, "dictionary v1 answered"
            );

            return Ok(DictionaryResponse {
                batch_blocks: heights,
                last_buffered_height,
                payloads: std::collections::HashMap::new(),
            });
        }

        Err(IndexerError::DictionaryUnavailable(
            "data query kept failing after downgrades".into(),
        ))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// GRAPHQL RENDERING
// ═══════════════════════════════════════════════════════════════════════════════

fn parse_height(value: &serde_json::Value) -> Result<u64> {
    if let Some(height) = value.as_u64() {
        return Ok(height);
    }
    // BigFloat columns serialize as strings.
    value
        .as_str()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| IndexerError::DictionaryMalformed(format!("unparseable height {value}")))
}

fn range_filter(start: u64, end: u64) -> String {
    format!(
        "blockHeight: {{ greaterThanOrEqualTo: \"{start}\", lessThanOrEqualTo: \"{end}\" }}"
    )
}

fn string_list(values: &[String]) -> String {
    let quoted: Vec<String> = values.iter().map(|v| format!("\"{v}\"")).collect();
    format!("[{}]", quoted.join(", "))
}

fn topic_clause(slot: usize, values: &[String]) -> String {
    if values.is_empty() {
        // "!null": the slot must be present, any value.
        format!("topics{slot}: {{ isNull: false }}")
    } else {
        format!("topics{slot}: {{ in: {} }}", string_list(values))
    }
}

fn log_filter(condition: &LogCondition, start: u64, end: u64) -> String {
    let mut clauses = vec![range_filter(start, end)];
    if let Some(address) = &condition.address {
        clauses.push(format!("address: {{ in: {} }}", string_list(address)));
    }
    for (slot, topics) in [
        (0, &condition.topics0),
        (1, &condition.topics1),
        (2, &condition.topics2),
        (3, &condition.topics3),
    ] {
        if let Some(values) = topics {
            clauses.push(topic_clause(slot, values));
        }
    }
    clauses.join(", ")
}

fn tx_filter(condition: &TxCondition, start: u64, end: u64) -> String {
    let mut clauses = vec![range_filter(start, end)];
    if let Some(from) = &condition.from {
        clauses.push(format!("from: {{ in: {} }}", string_list(from)));
    }
    match &condition.to {
        Some(RecipientCondition::ContractCreation) => {
            clauses.push("to: { isNull: true }".into());
        }
        Some(RecipientCondition::Addresses(addresses)) => {
            clauses.push(format!("to: {{ in: {} }}", string_list(addresses)));
        }
        None => {}
    }
    if let Some(function) = &condition.function {
        clauses.push(format!("func: {{ in: {} }}", string_list(function)));
    }
    clauses.join(", ")
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_string_contains, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::types::{
        DataSource, DataSourceOptions, EventFilter, Handler, HandlerSpec, Mapping,
        build_data_source_map,
    };

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn metadata_body() -> serde_json::Value {
        serde_json::json!({
            "data": {
                "_metadata": {
                    "lastProcessedHeight": 5000,
                    "genesisHash": "0xgenesis",
                    "startHeight": 1
                }
            }
        })
    }

    fn transfer_queries() -> QueriesMap {
        let ds = DataSource {
            kind: "ethereum/Runtime".into(),
            start_block: 1,
            end_block: None,
            options: DataSourceOptions::default(),
            mapping: Mapping {
                handlers: vec![Handler {
                    handler: "handleTransfer".into(),
                    spec: HandlerSpec::Event {
                        filter: Some(EventFilter {
                            topics: vec![Some("Transfer(address,address,uint256)".into())],
                        }),
                    },
                }],
            },
        };
        QueriesMap::from_height_map(&build_data_source_map(&[ds])).expect("queries")
    }

    #[tokio::test]
    async fn create_caches_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(metadata_body()))
            .mount(&server)
            .await;

        let dictionary = V1Dictionary::create(&server.uri(), TIMEOUT)
            .await
            .expect("create");

        let metadata = dictionary.metadata().expect("metadata");
        assert_eq!(metadata.last_processed_height, 5000);
        assert_eq!(metadata.start_height, 1);
        assert_eq!(metadata.genesis_hash.as_deref(), Some("0xgenesis"));
    }

    #[tokio::test]
    async fn start_height_capability_downgrades() {
        use std::sync::Arc;
        use std::sync::atomic::AtomicU32;
        use wiremock::{Request, Respond};

        struct OldServer {
            calls: Arc<AtomicU32>,
        }

        impl Respond for OldServer {
            fn respond(&self, request: &Request) -> ResponseTemplate {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let query = String::from_utf8_lossy(&request.body);
                if query.contains("startHeight") {
                    ResponseTemplate::new(200).set_body_json(serde_json::json!({
                        "errors": [{"message": "Cannot query field \"startHeight\" on type \"_Metadata\""}]
                    }))
                } else {
                    ResponseTemplate::new(200).set_body_json(serde_json::json!({
                        "data": {"_metadata": {"lastProcessedHeight": 100, "genesisHash": "0xg"}}
                    }))
                }
            }
        }

        let server = MockServer::start().await;
        let calls = Arc::new(AtomicU32::new(0));
        Mock::given(method("POST"))
            .respond_with(OldServer {
                calls: calls.clone(),
            })
            .mount(&server)
            .await;

        let dictionary = V1Dictionary::create(&server.uri(), TIMEOUT)
            .await
            .expect("create");

        // Probe failed once, retried without the field.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!dictionary.supports_start_height.load(Ordering::Relaxed));
        assert_eq!(
            dictionary.metadata().expect("metadata").start_height,
            0,
            "old servers default startHeight to 0"
        );
    }

    #[tokio::test]
    async fn get_data_merges_and_bounds_heights() {
        let server = MockServer::start().await;

        // Metadata probe at create time.
        Mock::given(method("POST"))
            .and(body_string_contains("_metadata"))
            .and(body_string_contains("evmLogs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {
                    "_metadata": {
                        "lastProcessedHeight": 5000,
                        "genesisHash": "0xgenesis",
                        "startHeight": 1
                    },
                    "l0": {"nodes": [
                        {"blockHeight": "2"},
                        {"blockHeight": 4},
                        {"blockHeight": "6"},
                        {"blockHeight": 6},
                        {"blockHeight": "9999"}
                    ]}
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(metadata_body()))
            .mount(&server)
            .await;

        let dictionary = V1Dictionary::create(&server.uri(), TIMEOUT)
            .await
            .expect("create");
        dictionary.update_queries_map(transfer_queries());

        let response = dictionary.get_data(1, 1000, 10).await.expect("data");

        // Deduplicated, sorted, bounded to [start, end].
        assert_eq!(response.batch_blocks, vec![2, 4, 6]);
        // Fewer matches than the limit: the whole range is covered.
        assert_eq!(response.last_buffered_height, 1000);
        assert!(response.payloads.is_empty());
    }

    #[tokio::test]
    async fn get_data_truncates_at_limit() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(body_string_contains("evmLogs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {
                    "_metadata": {
                        "lastProcessedHeight": 5000,
                        "genesisHash": "0xgenesis",
                        "startHeight": 1
                    },
                    "l0": {"nodes": [
                        {"blockHeight": 10},
                        {"blockHeight": 20},
                        {"blockHeight": 30},
                        {"blockHeight": 40}
                    ]}
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(metadata_body()))
            .mount(&server)
            .await;

        let dictionary = V1Dictionary::create(&server.uri(), TIMEOUT)
            .await
            .expect("create");
        dictionary.update_queries_map(transfer_queries());

        let response = dictionary.get_data(1, 1000, 3).await.expect("data");

        assert_eq!(response.batch_blocks, vec![10, 20, 30]);
        // Truncated: covered only up to the last returned height.
        assert_eq!(response.last_buffered_height, 30);
    }

    #[tokio::test]
    async fn get_data_without_conditions_is_unusable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(metadata_body()))
            .mount(&server)
            .await;

        let dictionary = V1Dictionary::create(&server.uri(), TIMEOUT)
            .await
            .expect("create");

        // No queries map installed.
        let result = dictionary.get_data(1, 1000, 10).await;
        assert!(matches!(
            result,
            Err(IndexerError::DictionaryUnavailable(_))
        ));
    }

    #[test]
    fn graphql_rendering_includes_conditions() {
        let condition = LogCondition {
            address: Some(vec!["0xabc".into()]),
            topics0: Some(vec!["0xddf2".into()]),
            topics1: Some(vec![]),
            topics2: None,
            topics3: None,
        };

        let rendered = log_filter(&condition, 5, 10);
        assert!(rendered.contains("greaterThanOrEqualTo: \"5\""));
        assert!(rendered.contains("address: { in: [\"0xabc\"] }"));
        assert!(rendered.contains("topics0: { in: [\"0xddf2\"] }"));
        assert!(rendered.contains("topics1: { isNull: false }"));
        assert!(!rendered.contains("topics2"));
    }

    #[test]
    fn tx_rendering_handles_contract_creation() {
        let condition = TxCondition {
            from: None,
            to: Some(RecipientCondition::ContractCreation),
            function: Some(vec!["0xa9059cbb".into()]),
        };

        let rendered = tx_filter(&condition, 1, 2);
        assert!(rendered.contains("to: { isNull: true }"));
        assert!(rendered.contains("func: { in: [\"0xa9059cbb\"] }"));
    }
}
