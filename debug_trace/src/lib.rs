//! Historical transaction and block tracing.
//!
//! [`api::DebugApi`] re-executes past transactions on demand. Requests are
//! bounded by an [`admission::AdmissionController`], checked against the
//! node's retained height range in [`window`], replayed by
//! [`replay::ReplayEngine`] and contained at the entrypoint should the
//! execution engine crash.

pub mod admission;
pub mod api;
pub mod capture;
pub mod config;
pub mod env;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod panic_cache;
pub mod provider;
pub mod replay;
pub mod server;
pub mod tracing;
pub mod window;

/// Common information for the `--version` CLI flags.
pub fn version() -> String {
    format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}
