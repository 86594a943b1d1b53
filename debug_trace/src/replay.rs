use std::sync::Arc;

use alloy::primitives::{BlockHash, TxHash};
use alloy::rpc::types::trace::geth::{GethDebugTracingCallOptions, GethDebugTracingOptions};
use alloy::rpc::types::{BlockNumberOrTag, TransactionRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::capture::{ExecutionHooks, NoCapture};
use crate::error::{TraceError, TraceErrorCode};
use crate::provider::{
    BlockRecord, BlockStore, ExecutionEngine, ExecutionState, TransactionRecord,
    TransactionStore, TxContext,
};

/// A transaction together with its position in the chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocatedTransaction {
    pub tx: TransactionRecord,
    pub block_hash: BlockHash,
    pub block_number: u64,
    pub index: usize,
}

impl LocatedTransaction {
    /// Checks that `block` really holds this transaction at the recorded
    /// index.
    pub fn verify_in(&self, block: &BlockRecord) -> Result<(), TraceError> {
        match block.transactions.get(self.index) {
            Some(tx) if tx.hash == self.tx.hash && block.number == self.block_number => Ok(()),
            _ => Err(TraceError::invalid_transaction(format!(
                "transaction {} is not at index {} of block #{}",
                self.tx.hash, self.index, block.number
            ))),
        }
    }
}

/// How much of a block prefix [`ReplayEngine::replay_up_to`] executes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplayBoundary {
    /// Transactions `[0, index)`: the state the target transaction saw.
    Before,
    /// Transactions `[0, index]`: the target transaction included.
    Through,
}

impl ReplayBoundary {
    fn end(self, index: usize) -> usize {
        match self {
            ReplayBoundary::Before => index,
            ReplayBoundary::Through => index + 1,
        }
    }
}

/// Per transaction entry of a block trace.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxTraceResult {
    #[serde(rename = "txHash")]
    pub tx_hash: TxHash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TxTraceResult {
    pub fn success(tx_hash: TxHash, result: Value) -> Self {
        Self {
            tx_hash,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(tx_hash: TxHash, error: impl Into<String>) -> Self {
        Self {
            tx_hash,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.as_deref().is_some_and(|it| !it.is_empty())
    }
}

/// State left behind by a replay, plus the hooks that observed it.
pub struct Replayed<H> {
    pub state: Box<dyn ExecutionState>,
    pub hooks: H,
}

impl<H: std::fmt::Debug> std::fmt::Debug for Replayed<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replayed")
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

/// Drives an [`ExecutionEngine`] over historical blocks.
///
/// Execution happens on the blocking pool. The cancellation token is checked
/// before every transaction; a panic inside the engine resumes on the
/// awaiting task so the entrypoint that owns the request can contain it.
#[derive(Clone)]
pub struct ReplayEngine {
    transactions: Arc<dyn TransactionStore>,
    blocks: Arc<dyn BlockStore>,
    engine: Arc<dyn ExecutionEngine>,
}

impl ReplayEngine {
    pub fn new(
        transactions: Arc<dyn TransactionStore>,
        blocks: Arc<dyn BlockStore>,
        engine: Arc<dyn ExecutionEngine>,
    ) -> Self {
        Self {
            transactions,
            blocks,
            engine,
        }
    }

    pub async fn locate_transaction(&self, hash: TxHash) -> Result<LocatedTransaction, TraceError> {
        let location = self
            .transactions
            .lookup_by_hash(hash)
            .await
            .map_err(|e| TraceError::tx_not_found(format!("{e:#}")))?
            .ok_or_else(|| TraceError::tx_not_found(format!("transaction {hash} not found")))?;

        let tx = match location.tx {
            Some(tx) if !tx.payload.is_empty() => tx,
            _ => {
                return Err(TraceError::invalid_transaction(format!(
                    "transaction {hash} has no payload"
                )))
            }
        };
        if location.block_number == 0 {
            return Err(TraceError::invalid_transaction(format!(
                "transaction {hash} has no block height"
            )));
        }

        Ok(LocatedTransaction {
            tx,
            block_hash: location.block_hash,
            block_number: location.block_number,
            index: location.index,
        })
    }

    pub async fn fetch_block(&self, hash: BlockHash) -> Result<BlockRecord, TraceError> {
        self.blocks
            .block_by_hash(hash)
            .await
            .map_err(|e| TraceError::block_hash_not_found(format!("{e:#}")))?
            .ok_or_else(|| TraceError::block_hash_not_found(format!("block {hash} not found")))
    }

    /// Fetches a block by number. Symbolic tags resolve to the latest
    /// retained height.
    pub async fn fetch_block_by_number(
        &self,
        number: BlockNumberOrTag,
    ) -> Result<BlockRecord, TraceError> {
        let height = match number {
            BlockNumberOrTag::Number(n) => n,
            BlockNumberOrTag::Earliest => 0,
            _ => self.blocks.retained_range().latest_height,
        };
        self.blocks
            .block_by_height(height)
            .await
            .map_err(|e| TraceError::block_hash_not_found(format!("{e:#}")))?
            .ok_or_else(|| TraceError::block_hash_not_found(format!("block #{height} not found")))
    }

    /// Re-executes a prefix of `block` under `hooks` and hands back the
    /// resulting state.
    pub async fn replay_up_to<H>(
        &self,
        block: Arc<BlockRecord>,
        index: usize,
        boundary: ReplayBoundary,
        mut hooks: H,
        cancel: CancellationToken,
    ) -> Result<Replayed<H>, TraceError>
    where
        H: ExecutionHooks + Send + 'static,
    {
        check_index(&block, index)?;
        let engine = self.engine.clone();
        run_blocking(move || {
            let state = replay_prefix(
                &*engine,
                &block,
                boundary.end(index),
                &mut hooks,
                &cancel,
            )?;
            Ok(Replayed { state, hooks })
        })
        .await
    }

    /// Traces every transaction of `block` on one state. A tracer failure
    /// is recorded on its entry and the replay continues.
    pub async fn trace_block(
        &self,
        block: Arc<BlockRecord>,
        config: GethDebugTracingOptions,
        cancel: CancellationToken,
    ) -> Result<Vec<TxTraceResult>, TraceError> {
        let engine = self.engine.clone();
        run_blocking(move || {
            let mut state = open_state(&*engine, &block)?;
            let mut results = Vec::with_capacity(block.transactions.len());
            for (index, tx) in block.transactions.iter().enumerate() {
                ensure_not_cancelled(&cancel)?;
                let ctx = TxContext {
                    block: &block,
                    tx,
                    index,
                    cancel: &cancel,
                };
                match state.trace(&ctx, &config) {
                    Ok(result) => results.push(TxTraceResult::success(tx.hash, result)),
                    Err(_) if cancel.is_cancelled() => return Err(cancelled()),
                    Err(e) => {
                        debug!(tx = %tx.hash, index, "tracer failed: {e:#}");
                        results.push(TxTraceResult::failure(tx.hash, format!("{e:#}")))
                    }
                }
            }
            Ok(results)
        })
        .await
    }

    /// Traces the transaction at `index`, on top of the state produced by
    /// the transactions before it.
    pub async fn trace_transaction_at(
        &self,
        block: Arc<BlockRecord>,
        index: usize,
        config: GethDebugTracingOptions,
        cancel: CancellationToken,
    ) -> Result<Value, TraceError> {
        check_index(&block, index)?;
        let engine = self.engine.clone();
        run_blocking(move || {
            let mut state = replay_prefix(&*engine, &block, index, &mut NoCapture, &cancel)?;
            ensure_not_cancelled(&cancel)?;
            let ctx = TxContext {
                block: &block,
                tx: &block.transactions[index],
                index,
                cancel: &cancel,
            };
            state
                .trace(&ctx, &config)
                .map_err(|e| engine_error(&cancel, "trace transaction", e))
        })
        .await
    }

    /// Runs `call` on top of the state after all of `block`.
    pub async fn trace_call(
        &self,
        block: Arc<BlockRecord>,
        call: TransactionRequest,
        config: GethDebugTracingCallOptions,
        cancel: CancellationToken,
    ) -> Result<Value, TraceError> {
        let engine = self.engine.clone();
        run_blocking(move || {
            let end = block.transactions.len();
            let mut state = replay_prefix(&*engine, &block, end, &mut NoCapture, &cancel)?;
            ensure_not_cancelled(&cancel)?;
            state
                .trace_call(&block, &call, &config, &cancel)
                .map_err(|e| engine_error(&cancel, "trace call", e))
        })
        .await
    }
}

fn check_index(block: &BlockRecord, index: usize) -> Result<(), TraceError> {
    if index < block.transactions.len() {
        Ok(())
    } else {
        Err(TraceError::invalid_transaction(format!(
            "index {index} out of range for block #{} with {} transactions",
            block.number,
            block.transactions.len()
        )))
    }
}

fn open_state(
    engine: &dyn ExecutionEngine,
    block: &BlockRecord,
) -> Result<Box<dyn ExecutionState>, TraceError> {
    engine.open_state(block).map_err(|e| {
        TraceError::internal(format!("failed to open state for block #{}: {e:#}", block.number))
    })
}

fn replay_prefix(
    engine: &dyn ExecutionEngine,
    block: &BlockRecord,
    end: usize,
    hooks: &mut dyn ExecutionHooks,
    cancel: &CancellationToken,
) -> Result<Box<dyn ExecutionState>, TraceError> {
    let mut state = open_state(engine, block)?;
    for (index, tx) in block.transactions.iter().enumerate().take(end) {
        ensure_not_cancelled(cancel)?;
        let ctx = TxContext {
            block,
            tx,
            index,
            cancel,
        };
        state
            .execute(&ctx, hooks)
            .map_err(|e| engine_error(cancel, "replay", e))?;
    }
    debug!(block = block.number, replayed = end, "replayed block prefix");
    Ok(state)
}

fn cancelled() -> TraceError {
    TraceError::new(TraceErrorCode::Timeout, "trace cancelled before completion")
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<(), TraceError> {
    if cancel.is_cancelled() {
        return Err(cancelled());
    }
    Ok(())
}

fn engine_error(cancel: &CancellationToken, what: &str, e: anyhow::Error) -> TraceError {
    if cancel.is_cancelled() {
        cancelled()
    } else {
        TraceError::internal(format!("{what} failed: {e:#}"))
    }
}

async fn run_blocking<T, F>(work: F) -> Result<T, TraceError>
where
    F: FnOnce() -> Result<T, TraceError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(TraceError::internal(format!("replay task failed: {e}"))),
    }
}
