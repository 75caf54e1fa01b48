//! A single pooled endpoint: RPC client + chain identity + health flag.

use std::sync::atomic::{AtomicBool, Ordering};

use alloy::primitives::B256;
use eth_rpc::{ClientConfig, RpcClient};
use tracing::{debug, instrument};

use crate::error::{ChainApiError, Result};
use crate::types::{ChainIdentity, EthBlock, FetchedBlock, LogRecord};

// ═══════════════════════════════════════════════════════════════════════════════
// CONNECTION
// ═══════════════════════════════════════════════════════════════════════════════

/// One endpoint of the pool.
///
/// The connection exclusively owns its [`RpcClient`], which in turn owns its
/// HTTP transport; the pool exclusively owns the connection. Health is a flag
/// flipped by the pool on observed failures and restored by its reconnect
/// probe.
#[derive(Debug)]
pub struct Connection {
    /// Endpoint URL.
    endpoint: String,
    /// Batched RPC client for this endpoint.
    client: RpcClient,
    /// Chain identity captured at join time.
    identity: ChainIdentity,
    /// Health flag; unhealthy connections are skipped by the round-robin.
    healthy: AtomicBool,
}

impl Connection {
    /// Connect to an endpoint and capture its chain identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be built or the identity probe
    /// fails (endpoint unreachable or structurally broken).
    #[instrument(skip_all)]
    pub async fn connect(endpoint: impl Into<String>, config: ClientConfig) -> Result<Self> {
        let endpoint = endpoint.into();
        let client = RpcClient::with_config(endpoint.clone(), config)?;
        let identity = probe_identity(&client).await?;

        debug!(
            endpoint = %endpoint,
            chain_id = identity.chain_id,
            runtime = %identity.runtime_chain,
            "connected"
        );

        Ok(Self {
            endpoint,
            client,
            identity,
            healthy: AtomicBool::new(true),
        })
    }

    /// Endpoint URL.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Chain identity captured at join time.
    #[must_use]
    pub const fn identity(&self) -> &ChainIdentity {
        &self.identity
    }

    /// The underlying RPC client.
    #[must_use]
    pub const fn client(&self) -> &RpcClient {
        &self.client
    }

    /// Current health flag.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    /// Re-probe the endpoint; restores the health flag on success.
    ///
    /// # Errors
    ///
    /// Returns the probe error; the connection stays unhealthy.
    pub(crate) async fn reconnect(&self) -> Result<()> {
        let identity = probe_identity(&self.client).await?;
        if identity != self.identity {
            // The endpoint came back as a different chain; never rejoin it.
            return Err(ChainApiError::ChainMismatch {
                endpoint: self.endpoint.clone(),
                field: "chainId",
                expected: self.identity.chain_id.to_string(),
                got: identity.chain_id.to_string(),
            });
        }
        self.set_healthy(true);
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────────────────
    // BLOCK FETCHING
    // ───────────────────────────────────────────────────────────────────────────

    /// Fetch a fully assembled block: header + tx bodies + logs.
    ///
    /// Composes `eth_getBlockByNumber` (full bodies when `include_tx`) and
    /// `eth_getLogs` for the same height; both go out in the same coalescing
    /// window, so they usually share a wire request.
    ///
    /// # Errors
    ///
    /// Returns [`ChainApiError::MissingBlock`] when the height is beyond the
    /// endpoint's head, or the underlying RPC error.
    pub async fn fetch_block(&self, height: u64, include_tx: bool) -> Result<FetchedBlock> {
        let tag = format!("0x{height:x}");

        let block_call = self
            .client
            .call("eth_getBlockByNumber", serde_json::json!([tag, include_tx]));
        let logs_call = self.client.call(
            "eth_getLogs",
            serde_json::json!([{"fromBlock": format!("0x{height:x}"), "toBlock": format!("0x{height:x}")}]),
        );

        let (block_value, logs_value) = tokio::try_join!(block_call, logs_call)?;

        if block_value.is_null() {
            return Err(ChainApiError::MissingBlock(height));
        }

        let block: EthBlock = serde_json::from_value(block_value)?;
        let logs: Vec<LogRecord> = serde_json::from_value(logs_value)?;

        Ok(FetchedBlock {
            header: block.header,
            transactions: block.transactions.into_full(),
            logs,
        })
    }

    /// Fetch several blocks through the client's batch machinery.
    ///
    /// # Errors
    ///
    /// Fails as a whole on the first unfetchable height; the pool retries the
    /// entire list on the next endpoint.
    pub async fn fetch_blocks(&self, heights: &[u64], include_tx: bool) -> Result<Vec<FetchedBlock>> {
        let mut out = Vec::with_capacity(heights.len());
        for &height in heights {
            out.push(self.fetch_block(height, include_tx).await?);
        }
        Ok(out)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// IDENTITY PROBE
// ═══════════════════════════════════════════════════════════════════════════════

/// Capture `{chainId, genesisHash, runtimeChain}` from an endpoint.
async fn probe_identity(client: &RpcClient) -> Result<ChainIdentity> {
    let chain_id_hex: String = client
        .call_as("eth_chainId", serde_json::json!([]))
        .await?;
    let chain_id = parse_hex_u64(&chain_id_hex)?;

    let genesis: serde_json::Value = client
        .call("eth_getBlockByNumber", serde_json::json!(["0x0", false]))
        .await?;
    let genesis_hash: B256 = genesis
        .get("hash")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .ok_or_else(|| ChainApiError::InvalidResponse("genesis block without hash".into()))?;

    // Optional; plenty of providers disable web3_clientVersion.
    let runtime_chain = match client
        .call_as::<String>("web3_clientVersion", serde_json::json!([]))
        .await
    {
        Ok(version) => version
            .split('/')
            .next()
            .unwrap_or("unknown")
            .to_string(),
        Err(e) if e.is_method_not_supported() => "unknown".to_string(),
        Err(e) => return Err(e.into()),
    };

    Ok(ChainIdentity {
        chain_id,
        genesis_hash,
        runtime_chain,
    })
}

pub(crate) fn parse_hex_u64(raw: &str) -> Result<u64> {
    let stripped = raw.strip_prefix("0x").unwrap_or(raw);
    u64::from_str_radix(stripped, 16)
        .map_err(|e| ChainApiError::InvalidResponse(format!("invalid hex quantity {raw:?}: {e}")))
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer};

    use super::*;
    use crate::test_support::{RpcScript, fast_client_config};

    #[tokio::test]
    async fn connect_probes_identity() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(RpcScript::mainnet_like())
            .mount(&server)
            .await;

        let connection = Connection::connect(server.uri(), fast_client_config())
            .await
            .expect("connect");

        assert_eq!(connection.identity().chain_id, 1);
        assert!(connection.is_healthy());
        assert_eq!(connection.identity().runtime_chain, "Geth");
    }

    #[tokio::test]
    async fn connect_tolerates_missing_client_version() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(RpcScript::mainnet_like().without_client_version())
            .mount(&server)
            .await;

        let connection = Connection::connect(server.uri(), fast_client_config())
            .await
            .expect("connect");

        assert_eq!(connection.identity().runtime_chain, "unknown");
        assert!(!connection.identity().runtime_known());
    }

    #[tokio::test]
    async fn fetch_block_assembles_header_txs_logs() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(RpcScript::mainnet_like())
            .mount(&server)
            .await;

        let connection = Connection::connect(server.uri(), fast_client_config())
            .await
            .expect("connect");

        let block = connection.fetch_block(100, true).await.expect("fetch");
        assert_eq!(block.height(), 100);
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(block.logs.len(), 1);
    }

    #[tokio::test]
    async fn fetch_missing_block_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(RpcScript::mainnet_like())
            .mount(&server)
            .await;

        let connection = Connection::connect(server.uri(), fast_client_config())
            .await
            .expect("connect");

        let result = connection.fetch_block(RpcScript::MISSING_HEIGHT, true).await;
        assert!(matches!(result, Err(ChainApiError::MissingBlock(_))));
    }

    #[test]
    fn hex_parsing() {
        assert_eq!(parse_hex_u64("0x1").expect("parse"), 1);
        assert_eq!(parse_hex_u64("0xff").expect("parse"), 255);
        assert!(parse_hex_u64("0xzz").is_err());
    }
}
