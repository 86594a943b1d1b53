//! Trace entrypoints.
//!
//! Every call takes an admission slot, checks the access window, replays and
//! then shapes the result. Faults inside a call are contained at the
//! entrypoint and reported as
//! [`TraceErrorCode::Internal`](crate::error::TraceErrorCode::Internal).

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use alloy::primitives::{BlockHash, TxHash};
use alloy::rpc::types::trace::geth::{GethDebugTracingCallOptions, GethDebugTracingOptions};
use alloy::rpc::types::{BlockId, BlockNumberOrTag, TransactionRequest};
use futures::FutureExt as _;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::admission::AdmissionController;
use crate::capture::{CaptureAccumulators, StateAccessResult};
use crate::config::TraceServiceConfig;
use crate::error::TraceError;
use crate::metrics::{ConnectionType, TraceMetrics};
use crate::panic_cache::PanicResultCache;
use crate::provider::{BlockRecord, BlockStore, ChainClient, ExecutionEngine, TransactionStore};
use crate::replay::{ReplayBoundary, ReplayEngine, TxTraceResult};
use crate::window::{self, AccessWindowParams};

pub const TRACE_TRANSACTION: &str = "debug_traceTransaction";
pub const TRACE_BLOCK_BY_NUMBER: &str = "debug_traceBlockByNumber";
pub const TRACE_BLOCK_BY_HASH: &str = "debug_traceBlockByHash";
pub const TRACE_CALL: &str = "debug_traceCall";
pub const TRACE_STATE_ACCESS: &str = "debug_traceStateAccess";

/// Collaborators a [`DebugApi`] is built from.
#[derive(Clone)]
pub struct TraceBackend {
    pub transactions: Arc<dyn TransactionStore>,
    pub blocks: Arc<dyn BlockStore>,
    pub chain: Arc<dyn ChainClient>,
    pub engine: Arc<dyn ExecutionEngine>,
    pub metrics: Arc<dyn TraceMetrics>,
}

impl TraceBackend {
    /// Backend whose stores and consensus client are one object.
    pub fn from_node<N>(
        node: Arc<N>,
        engine: Arc<dyn ExecutionEngine>,
        metrics: Arc<dyn TraceMetrics>,
    ) -> Self
    where
        N: TransactionStore + BlockStore + ChainClient + 'static,
    {
        Self {
            transactions: node.clone(),
            blocks: node.clone(),
            chain: node,
            engine,
            metrics,
        }
    }
}

pub struct DebugApi {
    replay: ReplayEngine,
    blocks: Arc<dyn BlockStore>,
    chain: Arc<dyn ChainClient>,
    metrics: Arc<dyn TraceMetrics>,
    admission: AdmissionController,
    panic_cache: Option<PanicResultCache>,
    max_lookback: i64,
    connection: ConnectionType,
}

impl DebugApi {
    pub fn new(
        backend: TraceBackend,
        config: &TraceServiceConfig,
        connection: ConnectionType,
    ) -> Self {
        Self {
            replay: ReplayEngine::new(
                backend.transactions,
                backend.blocks.clone(),
                backend.engine,
            ),
            blocks: backend.blocks,
            chain: backend.chain,
            metrics: backend.metrics,
            admission: AdmissionController::new(
                config.max_concurrent_trace_calls,
                config.trace_timeout,
            ),
            panic_cache: (config.panic_cache_size > 0).then(|| {
                PanicResultCache::new(config.panic_cache_size, config.panic_cache_ttl)
            }),
            max_lookback: config.max_trace_lookback_blocks,
            connection,
        }
    }

    /// Fresh snapshot of the servable height range.
    pub fn validation_window(&self) -> AccessWindowParams {
        AccessWindowParams::new(self.blocks.retained_range(), self.max_lookback)
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn panic_cache(&self) -> Option<&PanicResultCache> {
        self.panic_cache.as_ref()
    }

    pub async fn trace_transaction(
        &self,
        hash: TxHash,
        config: GethDebugTracingOptions,
    ) -> Result<Value, TraceError> {
        self.guarded(
            TRACE_TRANSACTION,
            Some(hash),
            self.admission.run(|cancel| async move {
                let located = self.replay.locate_transaction(hash).await?;
                self.check_height(located.block_number)?;
                // Window errors take precedence over a remembered panic.
                if self.panicked_recently(&hash) {
                    return Err(TraceError::internal(format!(
                        "tracing transaction {hash} panicked recently"
                    )));
                }
                let block = self.replay.fetch_block(located.block_hash).await?;
                located.verify_in(&block)?;
                self.replay
                    .trace_transaction_at(Arc::new(block), located.index, config, cancel)
                    .await
            }),
        )
        .await
    }

    pub async fn trace_block_by_number(
        &self,
        number: BlockNumberOrTag,
        config: GethDebugTracingOptions,
    ) -> Result<Vec<TxTraceResult>, TraceError> {
        self.guarded(
            TRACE_BLOCK_BY_NUMBER,
            None,
            self.admission.run(|cancel| async move {
                let params = self.validation_window();
                window::check_block_number(number, &params, &*self.metrics)?;
                let block = self.replay.fetch_block_by_number(number).await?;
                self.replay
                    .trace_block(Arc::new(block), config, cancel)
                    .await
            }),
        )
        .await
    }

    pub async fn trace_block_by_hash(
        &self,
        hash: BlockHash,
        config: GethDebugTracingOptions,
    ) -> Result<Vec<TxTraceResult>, TraceError> {
        self.guarded(
            TRACE_BLOCK_BY_HASH,
            None,
            self.admission.run(|cancel| async move {
                let params = self.validation_window();
                window::check_hash(hash, &*self.chain, &params, &*self.metrics).await?;
                let block = self.replay.fetch_block(hash).await?;
                self.replay
                    .trace_block(Arc::new(block), config, cancel)
                    .await
            }),
        )
        .await
    }

    /// Executes `call` on top of the state after block `block`.
    pub async fn trace_call(
        &self,
        call: TransactionRequest,
        block: BlockId,
        config: GethDebugTracingCallOptions,
    ) -> Result<Value, TraceError> {
        self.guarded(
            TRACE_CALL,
            None,
            self.admission.run(|cancel| async move {
                let params = self.validation_window();
                window::check_block_id(block, &*self.chain, &params, &*self.metrics).await?;
                let block = self.fetch_block_id(block).await?;
                self.replay
                    .trace_call(Arc::new(block), call, config, cancel)
                    .await
            }),
        )
        .await
    }

    /// Replays up to and including the transaction and returns everything it
    /// touched: the app state prestate delta, the consensus queries and the
    /// constructed receipts.
    pub async fn trace_state_access(&self, hash: TxHash) -> Result<StateAccessResult, TraceError> {
        self.guarded(
            TRACE_STATE_ACCESS,
            Some(hash),
            self.admission.run(|cancel| async move {
                let located = self.replay.locate_transaction(hash).await?;
                self.check_height(located.block_number)?;
                let block = self.replay.fetch_block(located.block_hash).await?;
                located.verify_in(&block)?;

                let replayed = self
                    .replay
                    .replay_up_to(
                        Arc::new(block),
                        located.index,
                        ReplayBoundary::Through,
                        CaptureAccumulators::new(),
                        cancel,
                    )
                    .await?;
                replayed.hooks.finalize()
            }),
        )
        .await
    }

    fn check_height(&self, block_number: u64) -> Result<(), TraceError> {
        window::check_height(block_number, &self.validation_window(), &*self.metrics)
    }

    fn panicked_recently(&self, hash: &TxHash) -> bool {
        self.panic_cache
            .as_ref()
            .and_then(|cache| cache.get(hash))
            .unwrap_or(false)
    }

    async fn fetch_block_id(&self, id: BlockId) -> Result<BlockRecord, TraceError> {
        match id {
            BlockId::Hash(hash) => self.replay.fetch_block(hash.block_hash).await,
            BlockId::Number(number) => self.replay.fetch_block_by_number(number).await,
        }
    }

    /// Runs one entrypoint with panics contained and the outcome recorded.
    async fn guarded<T, Fut>(
        &self,
        endpoint: &'static str,
        tx: Option<TxHash>,
        work: Fut,
    ) -> Result<T, TraceError>
    where
        Fut: Future<Output = Result<T, TraceError>>,
    {
        let started = Instant::now();
        let result = match AssertUnwindSafe(work).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let reason = panic_message(&*payload);
                error!(endpoint, tx = ?tx, "contained panic while tracing: {reason}");
                if let (Some(cache), Some(hash)) = (&self.panic_cache, tx) {
                    cache.set(hash, true);
                }
                Err(TraceError::internal(format!("trace panicked: {reason}")))
            }
        };

        let elapsed = started.elapsed();
        match &result {
            Ok(_) => info!(endpoint, ?elapsed, "served trace"),
            Err(e) => debug!(endpoint, ?elapsed, "trace failed: {e}"),
        }
        self.metrics
            .record_request(endpoint, self.connection, elapsed, result.is_ok());
        result
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Drops the entries of a block trace that carry an error.
///
/// Order is preserved and nothing is deduplicated, so applying it twice is
/// the same as applying it once.
pub fn exclude_failed(results: Vec<TxTraceResult>) -> Vec<TxTraceResult> {
    results
        .into_iter()
        .filter(|result| !result.is_failed())
        .collect()
}

/// Block traces with failed transactions filtered out.
#[derive(Clone)]
pub struct ExcludeFailedApi {
    inner: Arc<DebugApi>,
}

impl ExcludeFailedApi {
    pub fn new(inner: Arc<DebugApi>) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &Arc<DebugApi> {
        &self.inner
    }

    pub async fn trace_block_by_number_exclude_failed(
        &self,
        number: BlockNumberOrTag,
        config: GethDebugTracingOptions,
    ) -> Result<Vec<TxTraceResult>, TraceError> {
        self.inner
            .trace_block_by_number(number, config)
            .await
            .map(exclude_failed)
    }

    pub async fn trace_block_by_hash_exclude_failed(
        &self,
        hash: BlockHash,
        config: GethDebugTracingOptions,
    ) -> Result<Vec<TxTraceResult>, TraceError> {
        self.inner
            .trace_block_by_hash(hash, config)
            .await
            .map(exclude_failed)
    }
}
