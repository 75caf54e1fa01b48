//! User-supplied data sources: handlers, filters, and activation ranges.
//!
//! A data source groups handlers (with their filters and ABI assets) active
//! from a start block and optionally until an end block. The set of active
//! data sources at a height drives both dictionary query construction and
//! handler dispatch.

use serde::{Deserialize, Serialize};
use serde_with::rust::double_option;

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLER KINDS & FILTERS
// ═══════════════════════════════════════════════════════════════════════════════

/// The three handler kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandlerKind {
    /// Runs for whole blocks (optionally every Nth block).
    Block,
    /// Runs for matching transactions.
    Call,
    /// Runs for matching logs.
    Event,
}

/// Filter for a Block handler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockFilter {
    /// Run only on every `modulo`-th block. Absent means every block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modulo: Option<u64>,
}

/// Filter for a Call handler.
///
/// The `to` field is tri-state: absent means "do not filter", an explicit
/// `null` matches contract-creation transactions (which have no recipient),
/// and an address matches that recipient.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFilter {
    /// Sender address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Recipient address, with explicit-null semantics (see type docs).
    #[serde(default, with = "double_option", skip_serializing_if = "Option::is_none")]
    pub to: Option<Option<String>>,
    /// Function signature or 4-byte selector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
}

/// Filter for an Event handler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    /// Topic slots 0..=3. Per slot: absent/`null` skips the slot, the
    /// literal `"!null"` requires the slot to be present with any value,
    /// anything else is an event signature or topic hash.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<Option<String>>,
}

/// A handler entry: kind-specific filter plus the mapping function name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum HandlerSpec {
    /// Block handler.
    Block {
        /// Optional modulo filter.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<BlockFilter>,
    },
    /// Call handler.
    Call {
        /// Optional transaction filter.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<CallFilter>,
    },
    /// Event handler.
    Event {
        /// Optional log filter.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<EventFilter>,
    },
}

impl HandlerSpec {
    /// The handler's kind.
    #[must_use]
    pub const fn kind(&self) -> HandlerKind {
        match self {
            Self::Block { .. } => HandlerKind::Block,
            Self::Call { .. } => HandlerKind::Call,
            Self::Event { .. } => HandlerKind::Event,
        }
    }
}

/// A named handler with its filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handler {
    /// Name of the mapping function to invoke.
    pub handler: String,
    /// Kind and filter.
    #[serde(flatten)]
    pub spec: HandlerSpec,
}

// ═══════════════════════════════════════════════════════════════════════════════
// DATA SOURCES
// ═══════════════════════════════════════════════════════════════════════════════

/// Contract-level options of a data source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceOptions {
    /// Name of the ABI asset to decode with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abi: Option<String>,
    /// Contract address this data source is scoped to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Handler mapping of a data source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    /// Handlers, dispatched in declaration order.
    #[serde(default)]
    pub handlers: Vec<Handler>,
}

/// A user-supplied data source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
    /// Data-source kind tag (e.g. `ethereum/Runtime`).
    #[serde(default)]
    pub kind: String,
    /// First block this data source is active at.
    pub start_block: u64,
    /// Last block (inclusive) this data source is active at, if bounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_block: Option<u64>,
    /// Contract options.
    #[serde(default)]
    pub options: DataSourceOptions,
    /// Handler mapping.
    pub mapping: Mapping,
}

impl DataSource {
    /// Whether this data source is active at the given height.
    #[must_use]
    pub fn active_at(&self, height: u64) -> bool {
        height >= self.start_block && self.end_block.is_none_or(|end| height <= end)
    }

    /// Modulo strides declared by this data source's Block handlers.
    #[must_use]
    pub fn modulos(&self) -> Vec<u64> {
        self.mapping
            .handlers
            .iter()
            .filter_map(|handler| match &handler.spec {
                HandlerSpec::Block {
                    filter: Some(filter),
                } => filter.modulo,
                _ => None,
            })
            .collect()
    }

    /// Whether this data source has a Block handler that must see *every*
    /// block (no modulo filter). Such a handler voids dictionary use.
    #[must_use]
    pub fn has_full_block_handler(&self) -> bool {
        self.mapping.handlers.iter().any(|handler| {
            matches!(
                &handler.spec,
                HandlerSpec::Block { filter: None }
                    | HandlerSpec::Block {
                        filter: Some(BlockFilter { modulo: None })
                    }
            )
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
