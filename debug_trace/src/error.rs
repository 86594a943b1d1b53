use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Machine readable failure codes returned by every trace entrypoint.
///
/// The wire strings are stable: clients branch on them to tell a retryable
/// failure ([`TraceErrorCode::Timeout`]) from a permanent one
/// ([`TraceErrorCode::BlockTooOld`], [`TraceErrorCode::BlockPruned`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TraceErrorCode {
    /// Height is below the lookback floor.
    #[serde(rename = "ERR_BLOCK_TOO_OLD")]
    BlockTooOld,
    /// Height is below the earliest retained state version.
    #[serde(rename = "ERR_BLOCK_PRUNED")]
    BlockPruned,
    #[serde(rename = "ERR_BLOCK_HASH_NOT_FOUND")]
    BlockHashNotFound,
    #[serde(rename = "ERR_TX_NOT_FOUND")]
    TxNotFound,
    /// The transaction record exists but is incomplete.
    #[serde(rename = "ERR_INVALID_TRANSACTION")]
    InvalidTransaction,
    #[serde(rename = "ERR_TRACE_TIMEOUT")]
    Timeout,
    /// An unexpected fault was contained at the entrypoint.
    #[serde(rename = "ERR_INTERNAL")]
    Internal,
}

impl TraceErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceErrorCode::BlockTooOld => "ERR_BLOCK_TOO_OLD",
            TraceErrorCode::BlockPruned => "ERR_BLOCK_PRUNED",
            TraceErrorCode::BlockHashNotFound => "ERR_BLOCK_HASH_NOT_FOUND",
            TraceErrorCode::TxNotFound => "ERR_TX_NOT_FOUND",
            TraceErrorCode::InvalidTransaction => "ERR_INVALID_TRANSACTION",
            TraceErrorCode::Timeout => "ERR_TRACE_TIMEOUT",
            TraceErrorCode::Internal => "ERR_INTERNAL",
        }
    }
}

impl fmt::Display for TraceErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed trace request.
///
/// `height` is the rejected block and `base` the earliest retained height,
/// both only set where they carry meaning.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct TraceError {
    pub code: TraceErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<u64>,
}

impl TraceError {
    pub fn new(code: TraceErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            height: None,
            base: None,
        }
    }

    pub fn block_too_old(block_number: u64, max_lookback: i64) -> Self {
        Self {
            height: Some(block_number),
            ..Self::new(
                TraceErrorCode::BlockTooOld,
                format!("block number {block_number} is beyond max lookback of {max_lookback}"),
            )
        }
    }

    pub fn block_pruned(block_number: u64, earliest_retained: u64) -> Self {
        Self {
            height: Some(block_number),
            base: Some(earliest_retained),
            ..Self::new(
                TraceErrorCode::BlockPruned,
                format!("block number {block_number} is earlier than base {earliest_retained}"),
            )
        }
    }

    pub fn block_hash_not_found(message: impl Into<String>) -> Self {
        Self::new(TraceErrorCode::BlockHashNotFound, message)
    }

    pub fn tx_not_found(message: impl Into<String>) -> Self {
        Self::new(TraceErrorCode::TxNotFound, message)
    }

    pub fn invalid_transaction(message: impl Into<String>) -> Self {
        Self::new(TraceErrorCode::InvalidTransaction, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            TraceErrorCode::Timeout,
            format!("trace exceeded the deadline of {after:?}"),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(TraceErrorCode::Internal, message)
    }

    /// Permanent failures will not succeed on retry with the same scope.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self.code,
            TraceErrorCode::BlockTooOld | TraceErrorCode::BlockPruned
        )
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn display_carries_code() {
        let err = TraceError {
            height: Some(10),
            base: Some(20),
            ..TraceError::new(TraceErrorCode::BlockPruned, "low")
        };
        assert!(err.to_string().contains("ERR_BLOCK_PRUNED"));
        assert_eq!(err.to_string(), "[ERR_BLOCK_PRUNED] low");
    }

    #[test]
    fn serializes_context_only_when_present() {
        assert_eq!(
            serde_json::to_value(TraceError::block_pruned(45, 50)).unwrap(),
            json!({
                "code": "ERR_BLOCK_PRUNED",
                "message": "block number 45 is earlier than base 50",
                "height": 45,
                "base": 50,
            })
        );
        assert_eq!(
            serde_json::to_value(TraceError::tx_not_found("missing")).unwrap(),
            json!({"code": "ERR_TX_NOT_FOUND", "message": "missing"})
        );
    }

    #[test]
    fn code_strings_match_serde_names() {
        for code in [
            TraceErrorCode::BlockTooOld,
            TraceErrorCode::BlockPruned,
            TraceErrorCode::BlockHashNotFound,
            TraceErrorCode::TxNotFound,
            TraceErrorCode::InvalidTransaction,
            TraceErrorCode::Timeout,
            TraceErrorCode::Internal,
        ] {
            assert_eq!(serde_json::to_value(code).unwrap(), json!(code.as_str()));
        }
    }

    #[test]
    fn permanence() {
        assert!(TraceError::block_too_old(1, 1).is_permanent());
        assert!(TraceError::block_pruned(1, 2).is_permanent());
        assert!(!TraceError::timeout(Duration::from_secs(1)).is_permanent());
    }
}
