use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::panic_cache::{DEFAULT_PANIC_CACHE_SIZE, DEFAULT_PANIC_CACHE_TTL};

pub mod cli;

pub const DEFAULT_MAX_CONCURRENT_TRACE_CALLS: usize = 10;
pub const DEFAULT_MAX_TRACE_LOOKBACK_BLOCKS: i64 = 10_000;
pub const DEFAULT_TRACE_TIMEOUT: Duration = Duration::from_secs(30);

/// Runtime settings of the trace service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceServiceConfig {
    /// Zero disables the limit.
    pub max_concurrent_trace_calls: usize,
    /// Negative values disable the lookback check.
    pub max_trace_lookback_blocks: i64,
    /// Zero disables the deadline.
    pub trace_timeout: Duration,
    /// Zero disables the panic cache.
    pub panic_cache_size: usize,
    pub panic_cache_ttl: Duration,
}

impl Default for TraceServiceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_trace_calls: DEFAULT_MAX_CONCURRENT_TRACE_CALLS,
            max_trace_lookback_blocks: DEFAULT_MAX_TRACE_LOOKBACK_BLOCKS,
            trace_timeout: DEFAULT_TRACE_TIMEOUT,
            panic_cache_size: DEFAULT_PANIC_CACHE_SIZE,
            panic_cache_ttl: DEFAULT_PANIC_CACHE_TTL,
        }
    }
}
