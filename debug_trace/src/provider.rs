use std::sync::Arc;

use alloy::primitives::{BlockHash, Bytes, TxHash};
use alloy::rpc::types::trace::geth::{GethDebugTracingCallOptions, GethDebugTracingOptions};
use alloy::rpc::types::TransactionRequest;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::capture::ExecutionHooks;

const CACHE_SIZE: usize = 1024;

/// A transaction as stored by the node. The payload is opaque to the trace
/// service and only interpreted by the [`ExecutionEngine`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub hash: TxHash,
    pub payload: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub hash: BlockHash,
    pub number: u64,
    pub parent_hash: BlockHash,
    pub transactions: Vec<TransactionRecord>,
}

/// Where the receipt store places a transaction.
///
/// `tx` is `None` when the store has a receipt but lost the transaction body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionLocation {
    pub tx: Option<TransactionRecord>,
    pub block_hash: BlockHash,
    pub block_number: u64,
    pub index: usize,
}

/// Heights the state store can currently serve.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetainedRange {
    pub latest_height: u64,
    /// Zero when nothing has been pruned.
    pub earliest_retained: u64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn lookup_by_hash(&self, hash: TxHash) -> anyhow::Result<Option<TransactionLocation>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlockStore: Send + Sync {
    async fn block_by_hash(&self, hash: BlockHash) -> anyhow::Result<Option<BlockRecord>>;

    async fn block_by_height(&self, height: u64) -> anyhow::Result<Option<BlockRecord>>;

    /// Must read both bounds from one consistent view of the store.
    fn retained_range(&self) -> RetainedRange;
}

/// Consensus client used to map block hashes to heights.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn resolve_hash_to_height(&self, hash: BlockHash) -> anyhow::Result<Option<u64>>;
}

/// Deterministic re-execution of historical blocks.
#[cfg_attr(test, mockall::automock)]
pub trait ExecutionEngine: Send + Sync {
    /// Opens the state `block` was originally executed on top of.
    fn open_state(&self, block: &BlockRecord) -> anyhow::Result<Box<dyn ExecutionState>>;
}

/// Everything an engine needs to re-execute one transaction.
#[derive(Clone, Copy, Debug)]
pub struct TxContext<'a> {
    pub block: &'a BlockRecord,
    pub tx: &'a TransactionRecord,
    pub index: usize,
    /// Fired when the request's deadline expires. Long executions should
    /// poll it and bail out.
    pub cancel: &'a CancellationToken,
}

/// Mutable execution state produced by [`ExecutionEngine::open_state`].
///
/// Every method applies its transaction to the state, so calls must follow
/// block order.
pub trait ExecutionState: Send {
    /// Re-executes a transaction, reporting state touches, consensus queries
    /// and receipts to `hooks`. A transaction that reverted is not an error.
    fn execute(&mut self, ctx: &TxContext<'_>, hooks: &mut dyn ExecutionHooks)
        -> anyhow::Result<()>;

    /// Re-executes a transaction under the tracer selected by `config`.
    fn trace(
        &mut self,
        ctx: &TxContext<'_>,
        config: &GethDebugTracingOptions,
    ) -> anyhow::Result<serde_json::Value>;

    /// Runs a call on top of the current state without committing it.
    fn trace_call(
        &mut self,
        block: &BlockRecord,
        call: &TransactionRequest,
        config: &GethDebugTracingCallOptions,
        cancel: &CancellationToken,
    ) -> anyhow::Result<serde_json::Value>;
}

/// Wrapper around a [`BlockStore`] caching finalized blocks by number and
/// hash. The retained range is never cached.
pub struct CachedBlockStore<S> {
    inner: Arc<S>,
    blocks_by_number: Arc<Mutex<lru::LruCache<u64, BlockRecord>>>,
    blocks_by_hash: Arc<Mutex<lru::LruCache<BlockHash, u64>>>,
}

impl<S: BlockStore> CachedBlockStore<S> {
    pub fn new(inner: Arc<S>) -> Self {
        Self::with_capacity(inner, CACHE_SIZE)
    }

    pub fn with_capacity(inner: Arc<S>, capacity: usize) -> Self {
        let capacity = std::num::NonZeroUsize::new(capacity).unwrap_or(std::num::NonZeroUsize::MIN);
        Self {
            inner,
            blocks_by_number: Arc::new(Mutex::new(lru::LruCache::new(capacity))),
            blocks_by_hash: Arc::new(Mutex::new(lru::LruCache::new(capacity))),
        }
    }

    async fn remember(&self, block: &BlockRecord) {
        self.blocks_by_number
            .lock()
            .await
            .put(block.number, block.clone());
        self.blocks_by_hash
            .lock()
            .await
            .put(block.hash, block.number);
    }
}

#[async_trait]
impl<S: BlockStore> BlockStore for CachedBlockStore<S> {
    async fn block_by_hash(&self, hash: BlockHash) -> anyhow::Result<Option<BlockRecord>> {
        let block_num = self.blocks_by_hash.lock().await.get(&hash).copied();
        if let Some(block_num) = block_num {
            if let Some(block) = self.blocks_by_number.lock().await.get(&block_num).cloned() {
                return Ok(Some(block));
            }
        }

        let block = self.inner.block_by_hash(hash).await?;
        if let Some(block) = &block {
            self.remember(block).await;
        }
        Ok(block)
    }

    async fn block_by_height(&self, height: u64) -> anyhow::Result<Option<BlockRecord>> {
        let cached_block = self.blocks_by_number.lock().await.get(&height).cloned();
        if let Some(block) = cached_block {
            return Ok(Some(block));
        }

        let block = self.inner.block_by_height(height).await?;
        if let Some(block) = &block {
            self.remember(block).await;
        }
        Ok(block)
    }

    fn retained_range(&self) -> RetainedRange {
        self.inner.retained_range()
    }
}
