//! Access window checks.
//!
//! A node only retains state for a bounded range of recent heights. Every
//! trace request is checked against a fresh [`AccessWindowParams`] snapshot
//! before any replay work starts. The lookback floor is checked before the
//! pruning base, so a height that violates both is reported as
//! [`TraceErrorCode::BlockTooOld`](crate::error::TraceErrorCode::BlockTooOld).

use alloy::primitives::BlockHash;
use alloy::rpc::types::{BlockId, BlockNumberOrTag};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::TraceError;
use crate::metrics::{RejectionReason, TraceMetrics};
use crate::provider::{ChainClient, RetainedRange};

/// Snapshot of the servable height range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessWindowParams {
    pub latest_height: u64,
    /// Negative values disable the lookback limit.
    pub max_lookback: i64,
    /// Zero means nothing has been pruned.
    pub earliest_retained: u64,
}

impl AccessWindowParams {
    pub fn new(range: RetainedRange, max_lookback: i64) -> Self {
        Self {
            latest_height: range.latest_height,
            max_lookback,
            earliest_retained: range.earliest_retained,
        }
    }

    /// Lowest height still inside the lookback window, if the window is
    /// bounded.
    pub fn lookback_floor(&self) -> Option<u64> {
        u64::try_from(self.max_lookback)
            .ok()
            .map(|lookback| self.latest_height.saturating_sub(lookback))
    }

    /// Height a block number refers to. `latest`, `pending`, `safe` and
    /// `finalized` all map to the latest height: consensus finalizes every
    /// committed block.
    pub fn resolve(&self, number: BlockNumberOrTag) -> u64 {
        match number {
            BlockNumberOrTag::Number(n) => n,
            BlockNumberOrTag::Earliest => 0,
            BlockNumberOrTag::Latest
            | BlockNumberOrTag::Pending
            | BlockNumberOrTag::Safe
            | BlockNumberOrTag::Finalized => self.latest_height,
        }
    }
}

/// Checks a concrete height against the window.
pub fn check_height(
    block_number: u64,
    params: &AccessWindowParams,
    metrics: &dyn TraceMetrics,
) -> Result<(), TraceError> {
    if let Some(floor) = params.lookback_floor() {
        if block_number < floor {
            warn!(
                block_number,
                floor,
                max_lookback = params.max_lookback,
                "rejecting trace beyond lookback window"
            );
            metrics.increment_rejection(RejectionReason::Lookback);
            return Err(TraceError::block_too_old(
                block_number,
                params.max_lookback,
            ));
        }
    }
    if params.earliest_retained > 0 && block_number < params.earliest_retained {
        warn!(
            block_number,
            base = params.earliest_retained,
            "rejecting trace of pruned block"
        );
        metrics.increment_rejection(RejectionReason::Pruned);
        return Err(TraceError::block_pruned(
            block_number,
            params.earliest_retained,
        ));
    }
    Ok(())
}

/// Like [`check_height`], but symbolic references to the most recent or
/// finalized block always pass.
pub fn check_block_number(
    number: BlockNumberOrTag,
    params: &AccessWindowParams,
    metrics: &dyn TraceMetrics,
) -> Result<(), TraceError> {
    match number {
        BlockNumberOrTag::Latest
        | BlockNumberOrTag::Pending
        | BlockNumberOrTag::Safe
        | BlockNumberOrTag::Finalized => Ok(()),
        BlockNumberOrTag::Earliest => check_height(0, params, metrics),
        BlockNumberOrTag::Number(n) => check_height(n, params, metrics),
    }
}

/// Resolves `hash` through the consensus client and checks the resulting
/// height. Returns the height on success.
pub async fn check_hash(
    hash: BlockHash,
    client: &dyn ChainClient,
    params: &AccessWindowParams,
    metrics: &dyn TraceMetrics,
) -> Result<u64, TraceError> {
    let height = client
        .resolve_hash_to_height(hash)
        .await
        .map_err(|e| TraceError::block_hash_not_found(format!("{e:#}")))?
        .ok_or_else(|| TraceError::block_hash_not_found(format!("block hash {hash} not found")))?;
    check_height(height, params, metrics)?;
    Ok(height)
}

/// Checks either form of block reference, returning the referenced height.
pub async fn check_block_id(
    id: BlockId,
    client: &dyn ChainClient,
    params: &AccessWindowParams,
    metrics: &dyn TraceMetrics,
) -> Result<u64, TraceError> {
    match id {
        BlockId::Hash(hash) => check_hash(hash.block_hash, client, params, metrics).await,
        BlockId::Number(number) => {
            check_block_number(number, params, metrics)?;
            Ok(params.resolve(number))
        }
    }
}
