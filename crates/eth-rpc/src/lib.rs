//! Batched Ethereum JSON-RPC client.
//!
//! This crate provides the lowest layer of chain access: a single-endpoint
//! JSON-RPC client that coalesces concurrent calls into array requests,
//! probes the endpoint's batch ceiling adaptively, and owns the retry /
//! backoff / rate-limit discipline.
//!
//! Higher layers (connection pooling, Ethereum semantics) live in the
//! `chain-api` crate.
//!
//! # Example
//!
//! ```ignore
//! use eth_rpc::{RpcClient, ClientConfig};
//! use std::time::Duration;
//!
//! let config = ClientConfig::default().with_timeout(Duration::from_secs(60));
//! let client = RpcClient::with_config("https://eth.example.org/rpc", config)?;
//!
//! let head: String = client.call_as("eth_blockNumber", serde_json::json!([])).await?;
//! ```

mod batch;
mod client;
mod config;
mod error;
mod transport;
mod types;

pub use client::RpcClient;
pub use config::ClientConfig;
pub use error::{Result, RpcError, RpcErrorDetail};
pub use types::{JsonRpcRequest, JsonRpcResponse, ProcessorVerdict, RequestOptions, ResponseProcessor};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
