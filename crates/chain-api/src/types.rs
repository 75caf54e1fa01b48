//! Structured records for Ethereum blocks, transactions, logs, and receipts.
//!
//! These types are the crate's view of the JSON-RPC wire format:
//!
//! - [`BlockHeader`] - identity and parent linkage, immutable once parsed
//! - [`EthBlock`] - wire-shaped block (header + transaction bodies or hashes)
//! - [`FetchedBlock`] - a fully assembled block: header + transactions + logs
//! - [`LogRecord`] / [`TransactionRecord`] / [`TransactionReceipt`]
//!
//! # Ownership
//!
//! A fetched block owns its transactions and its logs. A log references its
//! transaction *logically*, by `(transaction_hash, log_index)`; there is no
//! reciprocal strong ownership between the two, so the graph stays acyclic.
//!
//! Receipts are not part of the block payload. Each transaction carries a
//! one-shot memoized slot that the chain API fills on first access.

use std::sync::Arc;

use alloy::primitives::{Address, B256, Bloom, Bytes, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

// ═══════════════════════════════════════════════════════════════════════════════
// HEX QUANTITY ENCODING
// ═══════════════════════════════════════════════════════════════════════════════

/// Serde adapter for Ethereum hex quantities ("0x1b4" ↔ 436).
pub(crate) mod quantity {
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{value:x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(de::Error::custom)
    }

    pub(crate) fn parse(raw: &str) -> Result<u64, String> {
        let stripped = raw.strip_prefix("0x").unwrap_or(raw);
        u64::from_str_radix(stripped, 16).map_err(|e| format!("invalid hex quantity {raw:?}: {e}"))
    }
}

/// Serde adapter for optional hex quantities (absent or null ↔ `None`).
pub(crate) mod quantity_opt {
    use serde::{Deserialize, Deserializer, Serializer, de};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_str(&format!("0x{v:x}")),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<u64>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        raw.map(|s| super::quantity::parse(&s).map_err(de::Error::custom))
            .transpose()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CHAIN IDENTITY
// ═══════════════════════════════════════════════════════════════════════════════

/// Identity of the chain behind an endpoint.
///
/// Captured once per connection at join time; every endpoint in a pool must
/// report the same identity as the first-joined one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainIdentity {
    /// EIP-155 chain id (`eth_chainId`).
    pub chain_id: u64,
    /// Hash of block 0.
    pub genesis_hash: B256,
    /// Client/runtime name as reported by `web3_clientVersion`, or "unknown"
    /// when the endpoint does not expose it.
    pub runtime_chain: String,
}

impl ChainIdentity {
    /// Whether the runtime chain is actually known.
    ///
    /// Endpoints that reject `web3_clientVersion` report "unknown"; identity
    /// comparison skips the field in that case.
    #[must_use]
    pub fn runtime_known(&self) -> bool {
        self.runtime_chain != "unknown"
    }
}

/// A block designator: by height or by hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRef {
    /// Block at the given height on the canonical chain.
    Height(u64),
    /// Block with the given hash, canonical or not.
    Hash(B256),
}

impl From<u64> for BlockRef {
    fn from(height: u64) -> Self {
        Self::Height(height)
    }
}

impl From<B256> for BlockRef {
    fn from(hash: B256) -> Self {
        Self::Hash(hash)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BLOCK HEADER
// ═══════════════════════════════════════════════════════════════════════════════

/// Block identity and parent linkage plus the Ethereum-specific fields the
/// indexer exposes to handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    /// Block height.
    #[serde(with = "quantity")]
    pub number: u64,
    /// Block hash.
    pub hash: B256,
    /// Hash of the parent block.
    pub parent_hash: B256,
    /// Unix timestamp of the block.
    #[serde(with = "quantity")]
    pub timestamp: u64,
    /// State trie root after executing this block.
    pub state_root: B256,
    /// Bloom filter over the block's logs.
    pub logs_bloom: Bloom,
    /// Gas limit of the block.
    #[serde(with = "quantity")]
    pub gas_limit: u64,
    /// Total gas used by the block.
    #[serde(with = "quantity")]
    pub gas_used: u64,
    /// EIP-1559 base fee (absent on pre-London chains).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_fee_per_gas: Option<U256>,
}

impl BlockHeader {
    /// Block timestamp as a UTC datetime.
    ///
    /// Returns `None` only for timestamps outside chrono's representable
    /// range, which no real chain produces.
    #[must_use]
    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        // Block timestamps fit i64 until far beyond any chain's lifetime
        #[allow(clippy::cast_possible_wrap)]
        DateTime::<Utc>::from_timestamp(self.timestamp as i64, 0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WIRE-SHAPED BLOCK
// ═══════════════════════════════════════════════════════════════════════════════

/// A block exactly as `eth_getBlockByNumber` returns it.
#[derive(Debug, Clone, Deserialize)]
pub struct EthBlock {
    /// Header fields, inline on the wire.
    #[serde(flatten)]
    pub header: BlockHeader,
    /// Transactions: full bodies when requested, hashes otherwise.
    #[serde(default)]
    pub transactions: BlockTransactions,
}

/// Transaction list shape inside a wire block.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BlockTransactions {
    /// Hashes only (`eth_getBlockByNumber(_, false)`).
    Hashes(Vec<B256>),
    /// Full bodies (`eth_getBlockByNumber(_, true)`).
    Full(Vec<TransactionRecord>),
}

impl Default for BlockTransactions {
    fn default() -> Self {
        Self::Hashes(Vec::new())
    }
}

impl BlockTransactions {
    /// Full transaction bodies, or an empty list for the hashes shape.
    #[must_use]
    pub fn into_full(self) -> Vec<TransactionRecord> {
        match self {
            Self::Hashes(_) => Vec::new(),
            Self::Full(transactions) => transactions,
        }
    }

    /// Number of transactions in either shape.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Hashes(hashes) => hashes.len(),
            Self::Full(transactions) => transactions.len(),
        }
    }

    /// Whether the block has no transactions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSACTIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// A transaction as carried inside a block, plus a memoized receipt slot.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    /// Transaction hash.
    pub hash: B256,
    /// Sender address.
    pub from: Address,
    /// Recipient address; `None` for contract creation.
    pub to: Option<Address>,
    /// Call data.
    #[serde(default)]
    pub input: Bytes,
    /// Transferred value in wei.
    #[serde(default)]
    pub value: U256,
    /// Sender nonce.
    #[serde(with = "quantity")]
    pub nonce: u64,
    /// Gas limit of the transaction.
    #[serde(with = "quantity")]
    pub gas: u64,
    /// Legacy gas price, when present.
    #[serde(default)]
    pub gas_price: Option<U256>,
    /// Containing block height.
    #[serde(default, with = "quantity_opt")]
    pub block_number: Option<u64>,
    /// Index within the containing block.
    #[serde(default, with = "quantity_opt")]
    pub transaction_index: Option<u64>,
    /// One-shot receipt memo, filled by the chain API on first access.
    #[serde(skip)]
    receipt: Arc<OnceCell<TransactionReceipt>>,
}

impl TransactionRecord {
    /// 4-byte function selector, when the call data carries one.
    #[must_use]
    pub fn selector(&self) -> Option<[u8; 4]> {
        self.input.get(..4).and_then(|s| s.try_into().ok())
    }

    /// Whether this transaction creates a contract (no recipient).
    #[must_use]
    pub const fn is_contract_creation(&self) -> bool {
        self.to.is_none()
    }

    /// Resolve the receipt, fetching it at most once per transaction.
    ///
    /// The memo is shared across clones of the record, so a handler and the
    /// dispatcher looking at the same transaction pay for one fetch total.
    ///
    /// # Errors
    ///
    /// Returns the fetch error; a failed fetch leaves the memo empty so a
    /// later call can retry.
    pub async fn receipt<F, Fut>(&self, fetch: F) -> crate::error::Result<&TransactionReceipt>
    where
        F: FnOnce(B256) -> Fut,
        Fut: Future<Output = crate::error::Result<TransactionReceipt>>,
    {
        let hash = self.hash;
        self.receipt.get_or_try_init(|| fetch(hash)).await
    }

    /// Receipt memo contents, if already resolved.
    #[must_use]
    pub fn cached_receipt(&self) -> Option<&TransactionReceipt> {
        self.receipt.get()
    }
}

/// Execution receipt of a transaction.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    /// Transaction hash.
    pub transaction_hash: B256,
    /// Containing block height.
    #[serde(with = "quantity")]
    pub block_number: u64,
    /// Containing block hash.
    pub block_hash: B256,
    /// Post-Byzantium status flag (1 success, 0 revert).
    #[serde(default, with = "quantity_opt")]
    pub status: Option<u64>,
    /// Gas used by this transaction.
    #[serde(with = "quantity")]
    pub gas_used: u64,
    /// Cumulative gas used in the block up to this transaction.
    #[serde(with = "quantity")]
    pub cumulative_gas_used: u64,
    /// Created contract address, for creation transactions.
    #[serde(default)]
    pub contract_address: Option<Address>,
    /// Logs emitted by this transaction.
    #[serde(default)]
    pub logs: Vec<LogRecord>,
}

impl TransactionReceipt {
    /// Whether the transaction executed successfully.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == Some(1)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LOGS
// ═══════════════════════════════════════════════════════════════════════════════

/// An event log as returned by `eth_getLogs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    /// Emitting contract.
    pub address: Address,
    /// Indexed topics; `topics[0]` is the event signature hash.
    #[serde(default)]
    pub topics: Vec<B256>,
    /// Unindexed data.
    #[serde(default)]
    pub data: Bytes,
    /// Containing block height.
    #[serde(default, with = "quantity_opt")]
    pub block_number: Option<u64>,
    /// Containing block hash.
    #[serde(default)]
    pub block_hash: Option<B256>,
    /// Hash of the emitting transaction.
    #[serde(default)]
    pub transaction_hash: Option<B256>,
    /// Index of the emitting transaction in the block.
    #[serde(default, with = "quantity_opt")]
    pub transaction_index: Option<u64>,
    /// Index of this log in the block.
    #[serde(default, with = "quantity_opt")]
    pub log_index: Option<u64>,
    /// True when the log was removed by a reorg.
    #[serde(default)]
    pub removed: bool,
}

impl LogRecord {
    /// Logical back-reference to the emitting transaction.
    ///
    /// `(transaction hash, log index)`: an index, not ownership.
    #[must_use]
    pub fn transaction_ref(&self) -> Option<(B256, u64)> {
        Some((self.transaction_hash?, self.log_index?))
    }

    /// Event signature topic, when present.
    #[must_use]
    pub fn topic0(&self) -> Option<&B256> {
        self.topics.first()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FETCHED BLOCK
// ═══════════════════════════════════════════════════════════════════════════════

/// A fully assembled block: header, transaction bodies, and logs.
///
/// This is what the dispatcher hands to handler workers.
#[derive(Debug, Clone)]
pub struct FetchedBlock {
    /// Block header.
    pub header: BlockHeader,
    /// Full transaction list.
    pub transactions: Vec<TransactionRecord>,
    /// Full log list for the block.
    pub logs: Vec<LogRecord>,
}

impl FetchedBlock {
    /// Block height.
    #[must_use]
    pub const fn height(&self) -> u64 {
        self.header.number
    }

    /// Block hash.
    #[must_use]
    pub const fn hash(&self) -> B256 {
        self.header.hash
    }

    /// Parent block hash.
    #[must_use]
    pub const fn parent_hash(&self) -> B256 {
        self.header.parent_hash
    }

    /// Logs emitted by the given transaction.
    pub fn logs_for_transaction(&self, hash: B256) -> impl Iterator<Item = &LogRecord> {
        self.logs
            .iter()
            .filter(move |log| log.transaction_hash == Some(hash))
    }

    /// Resolve a log's transaction through its logical back-reference.
    #[must_use]
    pub fn transaction_for_log(&self, log: &LogRecord) -> Option<&TransactionRecord> {
        let hash = log.transaction_hash?;
        self.transactions.iter().find(|tx| tx.hash == hash)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn header_json() -> serde_json::Value {
        serde_json::json!({
            "number": "0x1b4",
            "hash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "parentHash": "0x2222222222222222222222222222222222222222222222222222222222222222",
            "timestamp": "0x64b5f000",
            "stateRoot": "0x3333333333333333333333333333333333333333333333333333333333333333",
            "logsBloom": format!("0x{}", "00".repeat(256)),
            "gasLimit": "0x1c9c380",
            "gasUsed": "0x5208",
            "baseFeePerGas": "0x7"
        })
    }

    #[test]
    fn header_deserializes_hex_quantities() {
        let header: BlockHeader = serde_json::from_value(header_json()).expect("parse");
        assert_eq!(header.number, 436);
        assert_eq!(header.gas_used, 21_000);
        assert_eq!(header.base_fee_per_gas, Some(U256::from(7)));
    }

    #[test]
    fn header_round_trips() {
        let header: BlockHeader = serde_json::from_value(header_json()).expect("parse");
        let encoded = serde_json::to_value(&header).expect("encode");
        let decoded: BlockHeader = serde_json::from_value(encoded).expect("decode");
        assert_eq!(header, decoded);
    }

    #[test]
    fn header_without_base_fee() {
        let mut json = header_json();
        json.as_object_mut()
            .expect("object")
            .remove("baseFeePerGas");
        let header: BlockHeader = serde_json::from_value(json).expect("parse");
        assert!(header.base_fee_per_gas.is_none());
    }

    #[test]
    fn block_with_hash_transactions() {
        let mut json = header_json();
        json.as_object_mut().expect("object").insert(
            "transactions".into(),
            serde_json::json!([
                "0x4444444444444444444444444444444444444444444444444444444444444444"
            ]),
        );
        let block: EthBlock = serde_json::from_value(json).expect("parse");
        assert!(matches!(block.transactions, BlockTransactions::Hashes(ref h) if h.len() == 1));
        assert!(block.transactions.into_full().is_empty());
    }

    #[test]
    fn transaction_selector_and_creation() {
        let json = serde_json::json!({
            "hash": "0x4444444444444444444444444444444444444444444444444444444444444444",
            "from": "0x1234567890123456789012345678901234567890",
            "to": null,
            "input": "0xa9059cbb0000",
            "nonce": "0x1",
            "gas": "0x5208"
        });
        let tx: TransactionRecord = serde_json::from_value(json).expect("parse");
        assert!(tx.is_contract_creation());
        assert_eq!(tx.selector(), Some([0xa9, 0x05, 0x9c, 0xbb]));
    }

    #[tokio::test]
    async fn receipt_is_memoized() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let tx: TransactionRecord = serde_json::from_value(serde_json::json!({
            "hash": "0x4444444444444444444444444444444444444444444444444444444444444444",
            "from": "0x1234567890123456789012345678901234567890",
            "to": "0x1234567890123456789012345678901234567890",
            "input": "0x",
            "nonce": "0x0",
            "gas": "0x5208"
        }))
        .expect("parse");

        let fetches = AtomicU32::new(0);
        let make_receipt = |hash: B256| TransactionReceipt {
            transaction_hash: hash,
            block_number: 1,
            block_hash: B256::ZERO,
            status: Some(1),
            gas_used: 21_000,
            cumulative_gas_used: 21_000,
            contract_address: None,
            logs: vec![],
        };

        for _ in 0..3 {
            let receipt = tx
                .receipt(|hash| {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    let receipt = make_receipt(hash);
                    async move { Ok(receipt) }
                })
                .await
                .expect("receipt");
            assert!(receipt.is_success());
        }

        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert!(tx.cached_receipt().is_some());
    }

    #[test]
    fn log_transaction_ref_requires_both_fields() {
        let log = LogRecord {
            address: Address::ZERO,
            topics: vec![],
            data: Bytes::new(),
            block_number: Some(5),
            block_hash: None,
            transaction_hash: Some(B256::from([0x44; 32])),
            transaction_index: Some(0),
            log_index: Some(2),
            removed: false,
        };
        assert_eq!(log.transaction_ref(), Some((B256::from([0x44; 32]), 2)));

        let orphan = LogRecord {
            transaction_hash: None,
            ..log
        };
        assert_eq!(orphan.transaction_ref(), None);
    }

    #[test]
    fn fetched_block_resolves_log_backref() {
        let tx: TransactionRecord = serde_json::from_value(serde_json::json!({
            "hash": "0x4444444444444444444444444444444444444444444444444444444444444444",
            "from": "0x1234567890123456789012345678901234567890",
            "to": "0x1234567890123456789012345678901234567890",
            "input": "0x",
            "nonce": "0x0",
            "gas": "0x5208"
        }))
        .expect("parse");
        let tx_hash = tx.hash;

        let header: BlockHeader = serde_json::from_value(header_json()).expect("parse");
        let block = FetchedBlock {
            header,
            transactions: vec![tx],
            logs: vec![LogRecord {
                address: Address::ZERO,
                topics: vec![],
                data: Bytes::new(),
                block_number: Some(436),
                block_hash: None,
                transaction_hash: Some(tx_hash),
                transaction_index: Some(0),
                log_index: Some(0),
                removed: false,
            }],
        };

        let log = block.logs.first().expect("log");
        let resolved = block.transaction_for_log(log).expect("transaction");
        assert_eq!(resolved.hash, tx_hash);
        assert_eq!(block.logs_for_transaction(tx_hash).count(), 1);
    }
}
