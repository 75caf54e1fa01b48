//! Scripted fake Ethereum endpoint for wiremock-based tests.
//!
//! [`RpcScript`] answers the handful of JSON-RPC methods this crate uses,
//! for both single-object and array-shaped requests (the batched client
//! sends arrays even for one call).

use eth_rpc::ClientConfig;
use std::time::Duration;
use wiremock::{Request, Respond, ResponseTemplate};

/// Client config tuned so failing tests fail fast.
pub(crate) fn fast_client_config() -> ClientConfig {
    ClientConfig::default()
        .with_timeout(Duration::from_secs(5))
        .with_throttle_slot_interval(Duration::from_millis(1))
        .with_throttle_limit(3)
}

/// Deterministic hash for a scripted block height.
pub(crate) fn hash_for(height: u64) -> String {
    format!("0x{height:064x}")
}

/// A scripted Ethereum endpoint.
#[derive(Debug, Clone)]
pub(crate) struct RpcScript {
    chain_id: u64,
    head: u64,
    /// `None` rejects the `finalized` and `safe` tags (pre-merge endpoint).
    finalized: Option<u64>,
    /// `None` rejects `web3_clientVersion`.
    client_version: Option<String>,
}

impl RpcScript {
    /// Height the script reports as unknown (`result: null`).
    pub(crate) const MISSING_HEIGHT: u64 = 99_999_999;

    pub(crate) fn mainnet_like() -> Self {
        Self {
            chain_id: 1,
            head: 1_000,
            finalized: Some(990),
            client_version: Some("Geth/v1.13.0".into()),
        }
    }

    pub(crate) fn with_chain_id(mut self, chain_id: u64) -> Self {
        self.chain_id = chain_id;
        self
    }

    pub(crate) fn with_head(mut self, head: u64) -> Self {
        self.head = head;
        self
    }

    pub(crate) fn without_finalized_tag(mut self) -> Self {
        self.finalized = None;
        self
    }

    pub(crate) fn without_client_version(mut self) -> Self {
        self.client_version = None;
        self
    }

    fn block_json(&self, height: u64, full: bool) -> serde_json::Value {
        let parent = if height == 0 { hash_for(0) } else { hash_for(height - 1) };
        let transactions = if full {
            serde_json::json!([{
                "hash": format!("0x{:063x}1", height),
                "from": "0x1234567890123456789012345678901234567890",
                "to": "0xabcdefabcdefabcdefabcdefabcdefabcdefabcd",
                "input": "0xa9059cbb",
                "value": "0x0",
                "nonce": "0x1",
                "gas": "0x5208",
                "blockNumber": format!("0x{height:x}"),
                "transactionIndex": "0x0"
            }])
        } else {
            serde_json::json!([])
        };

        serde_json::json!({
            "number": format!("0x{height:x}"),
            "hash": hash_for(height),
            "parentHash": parent,
            "timestamp": format!("0x{:x}", 1_700_000_000u64 + height * 12),
            "stateRoot": hash_for(height),
            "logsBloom": format!("0x{}", "00".repeat(256)),
            "gasLimit": "0x1c9c380",
            "gasUsed": "0x5208",
            "baseFeePerGas": "0x7",
            "transactions": transactions
        })
    }

    fn respond_one(&self, request: &serde_json::Value) -> serde_json::Value {
        let id = request.get("id").cloned().unwrap_or(serde_json::json!(0));
        let method = request
            .get("method")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let params = request
            .get("params")
            .cloned()
            .unwrap_or(serde_json::json!([]));

        let ok = |result: serde_json::Value| {
            serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result})
        };
        let err = |code: i64, message: &str| {
            serde_json::json!({
                "jsonrpc": "2.0", "id": id,
                "error": {"code": code, "message": message}
            })
        };

        match method {
            "eth_chainId" => ok(serde_json::json!(format!("0x{:x}", self.chain_id))),
            "eth_blockNumber" => ok(serde_json::json!(format!("0x{:x}", self.head))),
            "web3_clientVersion" => self.client_version.as_ref().map_or_else(
                || err(-32601, "the method web3_clientVersion does not exist"),
                |version| ok(serde_json::json!(version)),
            ),
            "eth_getBlockByNumber" => {
                let tag = params
                    .get(0)
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default();
                let full = params
                    .get(1)
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);

                match tag {
                    "finalized" | "safe" => self.finalized.map_or_else(
                        || err(-32602, "invalid block tag"),
                        |f| ok(self.block_json(f, full)),
                    ),
                    "latest" => ok(self.block_json(self.head, full)),
                    hex => match u64::from_str_radix(hex.trim_start_matches("0x"), 16) {
                        Ok(height) if height == Self::MISSING_HEIGHT => {
                            ok(serde_json::Value::Null)
                        }
                        Ok(height) => ok(self.block_json(height, full)),
                        Err(_) => err(-32602, "invalid block number"),
                    },
                }
            }
            "eth_getBlockByHash" => {
                let hash = params
                    .get(0)
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default();
                match u64::from_str_radix(hash.trim_start_matches("0x"), 16) {
                    Ok(height) => ok(self.block_json(height, false)),
                    Err(_) => ok(serde_json::Value::Null),
                }
            }
            "eth_getLogs" => {
                let from = params
                    .get(0)
                    .and_then(|f| f.get("fromBlock"))
                    .and_then(serde_json::Value::as_str)
                    .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
                    .unwrap_or(0);
                ok(serde_json::json!([{
                    "address": "0xabcdefabcdefabcdefabcdefabcdefabcdefabcd",
                    "topics": [hash_for(0xdead)],
                    "data": "0x",
                    "blockNumber": format!("0x{from:x}"),
                    "blockHash": hash_for(from),
                    "transactionHash": format!("0x{:063x}1", from),
                    "transactionIndex": "0x0",
                    "logIndex": "0x0",
                    "removed": false
                }]))
            }
            "eth_getTransactionReceipt" => {
                let hash = params
                    .get(0)
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default();
                ok(serde_json::json!({
                    "transactionHash": hash,
                    "blockNumber": "0x64",
                    "blockHash": hash_for(100),
                    "status": "0x1",
                    "gasUsed": "0x5208",
                    "cumulativeGasUsed": "0x5208",
                    "contractAddress": null,
                    "logs": []
                }))
            }
            _ => err(-32601, "method not found"),
        }
    }
}

impl Respond for RpcScript {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: serde_json::Value =
            serde_json::from_slice(&request.body).expect("request body must be JSON");

        let response = if let Some(items) = body.as_array() {
            serde_json::Value::Array(items.iter().map(|item| self.respond_one(item)).collect())
        } else {
            self.respond_one(&body)
        };

        ResponseTemplate::new(200).set_body_json(response)
    }
}
