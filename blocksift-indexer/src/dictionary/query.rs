//! Dictionary query construction.
//!
//! Projects every handler filter of every active data source into the
//! address/topic/selector condition sets a dictionary understands.
//!
//! # Construction rules
//!
//! - Event filters contribute a log condition per handler: topic slots hash
//!   to `topics0..topics3`; the literal `"!null"` means "present with any
//!   value" and encodes as an empty array; `null` slots are skipped.
//! - Call filters contribute a transaction condition: `function` hashes to
//!   the 4-byte selector, `options.address` supplies `to` (an explicit
//!   `filter.to` conflicting with it is ignored with a warning), and
//!   `to: null` matches contract creation.
//! - A Block handler without a modulo filter needs every block, so the
//!   whole entry collapses to empty, and the dictionary cannot accelerate.
//! - Addresses, topics, and selectors are lowercased; duplicate conditions
//!   within one entry are dropped.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::warn;

use crate::error::Result;
use crate::types::{BlockHeightMap, DataSource, EventFilter, HandlerSpec};

// ═══════════════════════════════════════════════════════════════════════════════
// CONDITIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// One log condition group.
///
/// Absent fields do not filter; an empty `topicsN` array means "slot present
/// with any value".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogCondition {
    /// Emitting contract addresses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<Vec<String>>,
    /// Topic slot 0 (event signature hashes).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topics0: Option<Vec<String>>,
    /// Topic slot 1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topics1: Option<Vec<String>>,
    /// Topic slot 2.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topics2: Option<Vec<String>>,
    /// Topic slot 3.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topics3: Option<Vec<String>>,
}

/// Recipient condition of a transaction filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipientCondition {
    /// Match contract-creation transactions (no recipient).
    ContractCreation,
    /// Match any of these recipient addresses.
    Addresses(Vec<String>),
}

impl Serialize for RecipientCondition {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::ContractCreation => serializer.serialize_none(),
            Self::Addresses(addresses) => addresses.serialize(serializer),
        }
    }
}

/// One transaction condition group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TxCondition {
    /// Sender addresses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Vec<String>>,
    /// Recipient condition; serialized as `null` for contract creation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<RecipientCondition>,
    /// 4-byte function selectors, `0x`-prefixed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<Vec<String>>,
}

/// The full condition set for one height range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DictionaryQueryEntry {
    /// Log condition groups (OR-ed).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<LogCondition>,
    /// Transaction condition groups (OR-ed).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub transactions: Vec<TxCondition>,
}

impl DictionaryQueryEntry {
    /// An entry with no conditions cannot accelerate anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.logs.is_empty() && self.transactions.is_empty()
    }

    /// Distinct addresses referenced across all conditions.
    #[must_use]
    pub fn address_count(&self) -> usize {
        let log_addresses = self
            .logs
            .iter()
            .filter_map(|c| c.address.as_ref())
            .map(Vec::len)
            .sum::<usize>();
        let tx_addresses = self
            .transactions
            .iter()
            .map(|c| {
                let from = c.from.as_ref().map_or(0, Vec::len);
                let to = match &c.to {
                    Some(RecipientCondition::Addresses(addresses)) => addresses.len(),
                    _ => 0,
                };
                from + to
            })
            .sum::<usize>();
        log_addresses + tx_addresses
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENTRY CONSTRUCTION
// ═══════════════════════════════════════════════════════════════════════════════

/// Build the condition set for one active data-source set.
///
/// Returns an empty entry when any data source carries a full-block handler;
/// the caller treats that as "dictionary unusable for this range".
///
/// # Errors
///
/// Returns an error when a filter carries an unhashable signature.
pub fn build_query_entry(data_sources: &[DataSource]) -> Result<DictionaryQueryEntry> {
    let mut entry = DictionaryQueryEntry::default();

    for ds in data_sources {
        if ds.has_full_block_handler() {
            // Every block must be delivered anyway.
            return Ok(DictionaryQueryEntry::default());
        }

        let ds_address = ds.options.address.as_deref().map(str::to_lowercase);

        for handler in &ds.mapping.handlers {
            match &handler.spec {
                HandlerSpec::Block { .. } => {
                    // Modulo-only; overlaid by the fetch service, not the
                    // dictionary.
                }
                HandlerSpec::Event { filter } => {
                    let condition =
                        event_condition(ds_address.clone(), filter.as_ref())?;
                    push_unique(&mut entry.logs, condition);
                }
                HandlerSpec::Call { filter } => {
                    let mut condition = TxCondition::default();
                    let filter = filter.clone().unwrap_or_default();

                    if let Some(from) = &filter.from {
                        condition.from = Some(vec![from.to_lowercase()]);
                    }

                    condition.to = match (filter.to, &ds_address) {
                        (Some(explicit), Some(address)) => {
                            warn!(
                                handler = %handler.handler,
                                ?explicit,
                                address = %address,
                                "call filter `to` conflicts with data source address, ignoring filter"
                            );
                            Some(RecipientCondition::Addresses(vec![address.clone()]))
                        }
                        (Some(None), None) => Some(RecipientCondition::ContractCreation),
                        (Some(Some(to)), None) => {
                            Some(RecipientCondition::Addresses(vec![to.to_lowercase()]))
                        }
                        (None, Some(address)) => {
                            Some(RecipientCondition::Addresses(vec![address.clone()]))
                        }
                        (None, None) => None,
                    };

                    if let Some(function) = &filter.function {
                        let selector = chain_api::abi::function_selector(function)?;
                        condition.function =
                            Some(vec![format!("0x{}", hex::encode(selector))]);
                    }

                    push_unique(&mut entry.transactions, condition);
                }
            }
        }
    }

    Ok(entry)
}

/// Project one event filter into a log condition.
fn event_condition(
    address: Option<String>,
    filter: Option<&EventFilter>,
) -> Result<LogCondition> {
    let mut condition = LogCondition {
        address: address.map(|a| vec![a]),
        ..LogCondition::default()
    };

    let Some(filter) = filter else {
        return Ok(condition);
    };

    for (slot, topic) in filter.topics.iter().enumerate().take(4) {
        let value = match topic {
            // Skipped slot.
            None => continue,
            // Present with any value: encode as an empty set.
            Some(t) if t == "!null" => Vec::new(),
            Some(signature) => {
                let hash = chain_api::abi::event_topic(signature)?;
                vec![format!("{hash}").to_lowercase()]
            }
        };

        match slot {
            0 => condition.topics0 = Some(value),
            1 => condition.topics1 = Some(value),
            2 => condition.topics2 = Some(value),
            _ => condition.topics3 = Some(value),
        }
    }

    Ok(condition)
}

fn push_unique<T: PartialEq>(conditions: &mut Vec<T>, condition: T) {
    if !conditions.contains(&condition) {
        conditions.push(condition);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// QUERIES MAP
// ═══════════════════════════════════════════════════════════════════════════════

/// Default ceiling on distinct addresses in one condition set; past it, a
/// query would be slower than dense fetching and the range is left
/// unaccelerated.
pub const DEFAULT_QUERY_ADDRESS_LIMIT: usize = 1_000;

/// Per-height-range condition sets, rebuilt whenever the active data-source
/// set changes.
#[derive(Debug, Clone, Default)]
pub struct QueriesMap {
    entries: BTreeMap<u64, DictionaryQueryEntry>,
}

impl QueriesMap {
    /// Build from the active-data-source height map with the default
    /// address limit.
    ///
    /// # Errors
    ///
    /// Returns an error when any range's filters cannot be projected.
    pub fn from_height_map(map: &BlockHeightMap<DataSource>) -> Result<Self> {
        Self::with_address_limit(map, DEFAULT_QUERY_ADDRESS_LIMIT)
    }

    /// Build with an explicit address limit.
    ///
    /// # Errors
    ///
    /// Returns an error when any range's filters cannot be projected.
    pub fn with_address_limit(
        map: &BlockHeightMap<DataSource>,
        address_limit: usize,
    ) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for (height, active) in map.change_points() {
            let entry = build_query_entry(active)?;
            let addresses = entry.address_count();
            if addresses > address_limit {
                warn!(
                    height,
                    addresses, address_limit,
                    "condition set exceeds address limit, range left unaccelerated"
                );
                entries.insert(height, DictionaryQueryEntry::default());
            } else {
                entries.insert(height, entry);
            }
        }
        Ok(Self { entries })
    }

    /// The condition set governing a height.
    #[must_use]
    pub fn entry_for(&self, height: u64) -> Option<&DictionaryQueryEntry> {
        self.entries
            .range(..=height)
            .next_back()
            .map(|(_, entry)| entry)
    }

    /// Whether the dictionary can accelerate the range starting at `height`:
    /// there is an entry and it carries at least one condition.
    #[must_use]
    pub fn usable_at(&self, height: u64) -> bool {
        self.entry_for(height).is_some_and(|entry| !entry.is_empty())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
