use std::time::Duration;

use clap::Args;

const HELP_HEADING: &str = "Trace options";

/// Command line and environment form of
/// [`TraceServiceConfig`](super::TraceServiceConfig).
#[derive(Args, Clone, PartialEq, Eq, Debug)]
pub struct CliTraceConfig {
    /// Maximum number of traces running at once. Zero means unlimited.
    #[arg(long, env="DEBUG_TRACE_MAX_CONCURRENT_TRACE_CALLS", help_heading = HELP_HEADING, default_value_t = super::DEFAULT_MAX_CONCURRENT_TRACE_CALLS)]
    max_concurrent_trace_calls: usize,
    /// How many blocks behind the latest height may be traced. Negative
    /// values disable the check.
    #[arg(long, env="DEBUG_TRACE_MAX_TRACE_LOOKBACK_BLOCKS", help_heading = HELP_HEADING, default_value_t = super::DEFAULT_MAX_TRACE_LOOKBACK_BLOCKS, allow_negative_numbers = true)]
    max_trace_lookback_blocks: i64,
    /// Per call deadline in seconds. Zero disables it.
    #[arg(long, env="DEBUG_TRACE_TRACE_TIMEOUT", help_heading = HELP_HEADING, default_value_t = super::DEFAULT_TRACE_TIMEOUT.as_secs())]
    trace_timeout: u64,
    /// Number of transactions whose panic outcome is remembered.
    #[arg(long, env="DEBUG_TRACE_PANIC_CACHE_SIZE", help_heading = HELP_HEADING, default_value_t = crate::panic_cache::DEFAULT_PANIC_CACHE_SIZE)]
    panic_cache_size: usize,
    /// Seconds a remembered panic outcome stays valid.
    #[arg(long, env="DEBUG_TRACE_PANIC_CACHE_TTL", help_heading = HELP_HEADING, default_value_t = crate::panic_cache::DEFAULT_PANIC_CACHE_TTL.as_secs())]
    panic_cache_ttl: u64,
}

impl From<CliTraceConfig> for super::TraceServiceConfig {
    fn from(cli: CliTraceConfig) -> Self {
        Self {
            max_concurrent_trace_calls: cli.max_concurrent_trace_calls,
            max_trace_lookback_blocks: cli.max_trace_lookback_blocks,
            trace_timeout: Duration::from_secs(cli.trace_timeout),
            panic_cache_size: cli.panic_cache_size,
            panic_cache_ttl: Duration::from_secs(cli.panic_cache_ttl),
        }
    }
}
