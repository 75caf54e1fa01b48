//! Root wiring of the indexing core.
//!
//! [`IndexerService`] owns everything below it: the connection pool, the
//! chain API, the dictionary service, the unfinalized tracker, the
//! dispatcher, and the fetch driver. Construction verifies chain identity
//! (both across endpoints and against the metadata store), replays the
//! fork check for cold starts, and determines the resume height. Dropping
//! the service tears the whole tree down.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chain_api::{ChainApi, ConnectionPool};
use eth_rpc::ClientConfig;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::Settings;
use crate::dictionary::{DictionaryService, DictionaryServiceConfig};
use crate::error::{IndexerError, Result};
use crate::indexer::dispatcher::{BlockDispatcher, DispatcherConfig};
use crate::indexer::fetcher::{FetchConfig, FetchService};
use crate::indexer::unfinalized::UnfinalizedBlocks;
use crate::ports::{BlockConsumer, ChainSource, MetadataStore, keys};
use crate::types::{DataSource, build_data_source_map};

// ═══════════════════════════════════════════════════════════════════════════════
// INDEXER SERVICE
// ═══════════════════════════════════════════════════════════════════════════════

/// The assembled indexer.
pub struct IndexerService {
    fetch_handle: JoinHandle<Result<()>>,
    commit_handle: JoinHandle<Result<()>>,
    token: CancellationToken,
}

impl std::fmt::Debug for IndexerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexerService").finish_non_exhaustive()
    }
}

impl IndexerService {
    /// Connect, verify, replay, and start indexing.
    ///
    /// # Errors
    ///
    /// - [`chain_api::ChainApiError::ChainMismatch`] when endpoints disagree
    /// - [`IndexerError::Initialization`] when the store belongs to a
    ///   different chain
    /// - Any store or chain error during cold-start replay
    #[instrument(skip_all)]
    pub async fn start(
        settings: &Settings,
        data_sources: Vec<DataSource>,
        consumer: Arc<dyn BlockConsumer>,
        store: Arc<dyn MetadataStore>,
        token: CancellationToken,
    ) -> Result<Self> {
        // Endpoint pool; chain-identity mismatches are fatal here, before
        // any block is fetched.
        let client_config = ClientConfig::default()
            .with_timeout(Duration::from_millis(settings.network.request_timeout_ms));
        let pool =
            ConnectionPool::connect(settings.network.endpoints.clone(), client_config).await?;
        let identity = pool.identity().clone();
        let endpoint_count = pool.endpoint_count();
        let api = Arc::new(ChainApi::new(Arc::new(pool)));

        verify_store_identity(&*store, &identity).await?;

        // Dictionary negotiation (optional acceleration).
        let dictionary_config = DictionaryServiceConfig {
            timeout: Duration::from_millis(settings.network.dictionary_timeout_ms),
            genesis_hash: format!("{}", identity.genesis_hash),
            chain_id: identity.chain_id,
            query_address_limit: settings.indexer.query_address_limit,
        };
        let dictionary = Arc::new(
            DictionaryService::connect(&settings.network.dictionary, &dictionary_config).await,
        );

        let map = build_data_source_map(&data_sources);
        dictionary.update_queries_map(&map)?;
        let shared_map = Arc::new(RwLock::new(map));

        // Cold-start fork replay.
        let unfinalized = Arc::new(UnfinalizedBlocks::new(store.clone(), api.clone()));
        let finalized = ChainSource::finalized_header(&*api).await?;
        let finalized_height = finalized.number;
        let replay_rewind = unfinalized.init(finalized).await?;

        let start_height = resume_height(&*store, &data_sources, replay_rewind).await?;
        info!(
            start_height,
            finalized_height,
            chain_id = identity.chain_id,
            dictionaries = dictionary.len(),
            "indexer initialized"
        );

        // Dispatcher + workers.
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(BlockDispatcher::new(
            DispatcherConfig {
                batch_size: settings.indexer.batch_size,
                worker_count: endpoint_count * 2,
                worker_retries: settings.indexer.worker_retries,
            },
            api.clone(),
            consumer,
            store.clone(),
            unfinalized.clone(),
            shared_map.clone(),
            events_tx,
            token.child_token(),
        ));
        let commit_handle = dispatcher.start(start_height);

        // Fetch driver.
        let fetcher = FetchService::new(
            api,
            dictionary,
            dispatcher,
            unfinalized,
            data_sources,
            shared_map,
            events_rx,
            FetchConfig {
                batch_size: settings.indexer.batch_size,
                dictionary_query_size: settings.indexer.dictionary_query_size,
                bypass_blocks: settings.indexer.bypass_set()?,
                follow_unfinalized: settings.indexer.unfinalized_blocks,
            },
            start_height,
        );
        let fetch_handle = tokio::spawn(fetcher.run(token.child_token()));

        Ok(Self {
            fetch_handle,
            commit_handle,
            token,
        })
    }

    /// Run until shutdown or a fatal error.
    ///
    /// # Errors
    ///
    /// The first fatal error from the fetch driver or the commit loop.
    pub async fn wait(self) -> Result<()> {
        let Self {
            fetch_handle,
            commit_handle,
            token,
        } = self;

        let outcome = tokio::select! {
            fetch = fetch_handle => flatten_join("fetch service", fetch),
            commit = commit_handle => flatten_join("commit loop", commit),
        };

        // Either side stopping stops the other.
        token.cancel();

        if let Err(e) = &outcome {
            warn!(error = %e, "indexer stopping on error");
        }
        outcome
    }

    /// Request a graceful shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

fn flatten_join(
    component: &str,
    joined: std::result::Result<Result<()>, tokio::task::JoinError>,
) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(IndexerError::Initialization(format!(
            "{component} task failed: {e}"
        ))),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// INIT HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Check (and on first run, record) which chain this store indexes.
async fn verify_store_identity(
    store: &dyn MetadataStore,
    identity: &chain_api::types::ChainIdentity,
) -> Result<()> {
    let genesis = format!("{}", identity.genesis_hash);

    if let Some(stored) = store.read(keys::GENESIS_HASH).await? {
        if !stored.eq_ignore_ascii_case(&genesis) {
            return Err(IndexerError::Initialization(format!(
                "store indexed genesis {stored}, endpoints report {genesis}"
            )));
        }
        return Ok(());
    }

    let tx = store.begin().await?;
    store.upsert(keys::GENESIS_HASH, &genesis, tx).await?;
    store
        .upsert(keys::CHAIN, &identity.chain_id.to_string(), tx)
        .await?;
    store
        .upsert(keys::SPEC_NAME, &identity.runtime_chain, tx)
        .await?;
    store.commit(tx).await?;
    Ok(())
}

/// Where to resume: after the last committed height (clamped by a cold-start
/// rewind), or at the earliest data-source start on a fresh store.
async fn resume_height(
    store: &dyn MetadataStore,
    data_sources: &[DataSource],
    replay_rewind: Option<u64>,
) -> Result<u64> {
    let earliest = data_sources
        .iter()
        .map(|ds| ds.start_block)
        .min()
        .unwrap_or(1);

    let last_processed: Option<u64> = store
        .read(keys::LAST_PROCESSED)
        .await?
        .and_then(|raw| raw.parse().ok());

    let mut start = last_processed.map_or(earliest, |height| height + 1);
    if let Some(rewind) = replay_rewind {
        start = start.min(rewind + 1);
    }
    Ok(start)
}

/// Expand operator bypass entries (`7`, `"100-105"`) into a height set.
pub(crate) fn parse_bypass_blocks(entries: &[String]) -> Result<HashSet<u64>> {
    let mut blocks = HashSet::new();
    for entry in entries {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if let Some((low, high)) = entry.split_once('-') {
            let low: u64 = low.trim().parse().map_err(|_| {
                IndexerError::Config(format!("invalid bypass range start in {entry:?}"))
            })?;
            let high: u64 = high.trim().parse().map_err(|_| {
                IndexerError::Config(format!("invalid bypass range end in {entry:?}"))
            })?;
            if low > high {
                return Err(IndexerError::Config(format!(
                    "bypass range {entry:?} is reversed"
                )));
            }
            blocks.extend(low..=high);
        } else {
            let height: u64 = entry
                .parse()
                .map_err(|_| IndexerError::Config(format!("invalid bypass block {entry:?}")))?;
            blocks.insert(height);
        }
    }
    Ok(blocks)
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
