//! Process-wide ABI interface cache and decode helpers.
//!
//! Interfaces are cached once per ABI name for the lifetime of the process.
//! Two data sources sharing a name are assumed to share an ABI; the first
//! load wins and later loads of the same name are ignored, mismatches are
//! not detected.
//!
//! Also home to the signature-hashing helpers used when projecting handler
//! filters into topic/selector sets.

use std::sync::{Arc, LazyLock};

use alloy::dyn_abi::{DynSolValue, EventExt, JsonAbiExt};
use alloy::json_abi::JsonAbi;
use alloy::primitives::{B256, keccak256};
use dashmap::DashMap;
use tracing::trace;

use crate::error::{ChainApiError, Result};
use crate::types::{LogRecord, TransactionRecord};

// ═══════════════════════════════════════════════════════════════════════════════
// INTERFACE CACHE
// ═══════════════════════════════════════════════════════════════════════════════

/// Process-wide interface cache, keyed by ABI name.
static INTERFACE_CACHE: LazyLock<DashMap<String, Arc<JsonAbi>>> = LazyLock::new(DashMap::new);

/// Load (or fetch the cached) interface for an ABI name.
///
/// First load wins: if the name is already cached, `abi_json` is ignored.
///
/// # Errors
///
/// Returns [`ChainApiError::Abi`] when the JSON is not a valid ABI.
pub fn load_interface(name: &str, abi_json: &str) -> Result<Arc<JsonAbi>> {
    if let Some(existing) = INTERFACE_CACHE.get(name) {
        return Ok(Arc::clone(existing.value()));
    }

    let parsed: JsonAbi = serde_json::from_str(abi_json)
        .map_err(|e| ChainApiError::Abi(format!("invalid ABI {name:?}: {e}")))?;

    trace!(name, events = parsed.events().count(), "interface loaded");

    let entry = INTERFACE_CACHE
        .entry(name.to_string())
        .or_insert_with(|| Arc::new(parsed));
    Ok(Arc::clone(entry.value()))
}

/// Cached interface for an ABI name, if loaded.
#[must_use]
pub fn cached_interface(name: &str) -> Option<Arc<JsonAbi>> {
    INTERFACE_CACHE.get(name).map(|e| Arc::clone(e.value()))
}

// ═══════════════════════════════════════════════════════════════════════════════
// DECODING
// ═══════════════════════════════════════════════════════════════════════════════

/// A log decoded against an ABI event.
#[derive(Debug, Clone)]
pub struct DecodedLog {
    /// Event name.
    pub name: String,
    /// Indexed parameters, in declaration order.
    pub indexed: Vec<DynSolValue>,
    /// Unindexed parameters, in declaration order.
    pub body: Vec<DynSolValue>,
}

/// A transaction input decoded against an ABI function.
#[derive(Debug, Clone)]
pub struct DecodedCall {
    /// Function name.
    pub name: String,
    /// Decoded inputs, in declaration order.
    pub inputs: Vec<DynSolValue>,
}

/// Decode a log against the named ABI.
///
/// Returns `Ok(None)` when the ABI has no event matching the log's topic0:
/// the log simply is not from this contract interface.
///
/// # Errors
///
/// [`ChainApiError::Abi`] when the ABI is not loaded or the payload does not
/// decode against the matched event.
pub fn parse_log(log: &LogRecord, abi_name: &str) -> Result<Option<DecodedLog>> {
    let interface = cached_interface(abi_name)
        .ok_or_else(|| ChainApiError::Abi(format!("ABI {abi_name:?} not loaded")))?;

    let Some(topic0) = log.topic0() else {
        return Ok(None);
    };

    for event in interface.events() {
        if event.anonymous || &event.selector() != topic0 {
            continue;
        }

        let decoded = event
            .decode_log_parts(log.topics.iter().copied(), &log.data)
            .map_err(|e| {
                ChainApiError::Abi(format!("failed to decode {} log: {e}", event.name))
            })?;

        return Ok(Some(DecodedLog {
            name: event.name.clone(),
            indexed: decoded.indexed,
            body: decoded.body,
        }));
    }

    Ok(None)
}

/// Decode a transaction's input against the named ABI.
///
/// Returns `Ok(None)` for inputs without a matching function selector.
///
/// # Errors
///
/// [`ChainApiError::Abi`] when the ABI is not loaded or the input does not
/// decode against the matched function.
pub fn parse_transaction(
    transaction: &TransactionRecord,
    abi_name: &str,
) -> Result<Option<DecodedCall>> {
    let interface = cached_interface(abi_name)
        .ok_or_else(|| ChainApiError::Abi(format!("ABI {abi_name:?} not loaded")))?;

    let Some(selector) = transaction.selector() else {
        return Ok(None);
    };

    for function in interface.functions() {
        if function.selector() != selector {
            continue;
        }

        let inputs = function
            .abi_decode_input(&transaction.input[4..])
            .map_err(|e| {
                ChainApiError::Abi(format!("failed to decode {} call: {e}", function.name))
            })?;

        return Ok(Some(DecodedCall {
            name: function.name.clone(),
            inputs,
        }));
    }

    Ok(None)
}

// ═══════════════════════════════════════════════════════════════════════════════
// SIGNATURE HASHING
// ═══════════════════════════════════════════════════════════════════════════════

/// Topic hash for an event signature.
///
/// Accepts an already-hashed topic (`0x` + 64 hex digits, returned as-is),
/// a canonical signature (`Transfer(address,address,uint256)`), or a
/// human-readable one with parameter names and `indexed` markers.
///
/// # Errors
///
/// [`ChainApiError::Abi`] for strings that are neither.
pub fn event_topic(signature: &str) -> Result<B256> {
    let trimmed = signature.trim();

    if let Some(hex) = trimmed.strip_prefix("0x") {
        if hex.len() == 64 {
            return trimmed
                .parse()
                .map_err(|e| ChainApiError::Abi(format!("invalid topic hash {trimmed:?}: {e}")));
        }
    }

    let canonical = canonicalize_signature(trimmed, "event")?;
    Ok(keccak256(canonical.as_bytes()))
}

/// 4-byte selector for a function signature.
///
/// Accepts a ready selector (`0x` + 8 hex digits), a canonical signature, or
/// a human-readable one with a leading `function` keyword.
///
/// # Errors
///
/// [`ChainApiError::Abi`] for strings that are neither.
pub fn function_selector(signature: &str) -> Result<[u8; 4]> {
    let trimmed = signature.trim();

    if let Some(hex) = trimmed.strip_prefix("0x") {
        if hex.len() == 8 {
            let bytes = hex::decode(hex)
                .map_err(|e| ChainApiError::Abi(format!("invalid selector {trimmed:?}: {e}")))?;
            let mut out = [0u8; 4];
            out.copy_from_slice(&bytes);
            return Ok(out);
        }
    }

    let canonical = canonicalize_signature(trimmed, "function")?;
    let hash = keccak256(canonical.as_bytes());
    let mut out = [0u8; 4];
    out.copy_from_slice(&hash[..4]);
    Ok(out)
}

/// Reduce a human-readable signature to canonical form.
///
/// `Transfer(address indexed from, address to, uint256 value)` becomes
/// `Transfer(address,address,uint256)`. Tuple parameters are passed through
/// untouched; callers with exotic signatures should supply canonical form.
fn canonicalize_signature(signature: &str, keyword: &str) -> Result<String> {
    let stripped = signature
        .strip_prefix(keyword)
        .map_or(signature, str::trim_start);

    let open = stripped
        .find('(')
        .ok_or_else(|| ChainApiError::Abi(format!("signature without parameters: {signature:?}")))?;
    let close = stripped
        .rfind(')')
        .ok_or_else(|| ChainApiError::Abi(format!("unterminated signature: {signature:?}")))?;

    let name = stripped[..open].trim();
    let params = &stripped[open + 1..close];

    if name.is_empty() {
        return Err(ChainApiError::Abi(format!(
            "signature without a name: {signature:?}"
        )));
    }

    let types: Vec<&str> = if params.trim().is_empty() {
        Vec::new()
    } else {
        params
            .split(',')
            .map(|param| {
                param
                    .trim()
                    .split_whitespace()
                    .next()
                    .unwrap_or_default()
            })
            .collect()
    };

    Ok(format!("{name}({})", types.join(",")))
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
