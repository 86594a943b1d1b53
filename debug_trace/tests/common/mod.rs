#![allow(dead_code)] // each test binary uses a different subset

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Bytes;
use debug_trace::api::{DebugApi, TraceBackend};
use debug_trace::config::TraceServiceConfig;
use debug_trace::memory::{ChainFixture, KvOp, MemoryChain};
use debug_trace::metrics::{ConnectionType, RejectionReason, TraceMetrics};
use debug_trace::provider::{BlockRecord, ExecutionEngine, ExecutionState};
use parking_lot::Mutex;

pub const BANK_FIXTURE: &[u8] = include_bytes!("../fixtures/bank.json");

/// One `record_request` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedRequest {
    pub endpoint: &'static str,
    pub connection: ConnectionType,
    pub success: bool,
}

/// [`TraceMetrics`] that remembers everything it was told.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    pub rejections: Mutex<Vec<RejectionReason>>,
    pub requests: Mutex<Vec<RecordedRequest>>,
}

impl TraceMetrics for RecordingMetrics {
    fn increment_rejection(&self, reason: RejectionReason) {
        self.rejections.lock().push(reason);
    }

    fn record_request(
        &self,
        endpoint: &'static str,
        connection: ConnectionType,
        _elapsed: Duration,
        success: bool,
    ) {
        self.requests.lock().push(RecordedRequest {
            endpoint,
            connection,
            success,
        });
    }
}

/// Wraps an engine and counts how often state was opened.
pub struct CountingEngine {
    pub inner: Arc<dyn ExecutionEngine>,
    pub opened: AtomicUsize,
}

impl CountingEngine {
    pub fn new(inner: Arc<dyn ExecutionEngine>) -> Self {
        Self {
            inner,
            opened: AtomicUsize::new(0),
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl ExecutionEngine for CountingEngine {
    fn open_state(&self, block: &BlockRecord) -> anyhow::Result<Box<dyn ExecutionState>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.inner.open_state(block)
    }
}

pub struct Harness {
    pub api: Arc<DebugApi>,
    pub chain: Arc<MemoryChain>,
    pub engine: Arc<CountingEngine>,
    pub metrics: Arc<RecordingMetrics>,
}

impl Harness {
    pub fn new(fixture: ChainFixture, config: TraceServiceConfig) -> Self {
        let (chain, engine) = fixture.build();
        let engine = Arc::new(CountingEngine::new(engine));
        let metrics = Arc::new(RecordingMetrics::default());
        let api = DebugApi::new(
            TraceBackend::from_node(chain.clone(), engine.clone(), metrics.clone()),
            &config,
            ConnectionType::Http,
        );
        Self {
            api: Arc::new(api),
            chain,
            engine,
            metrics,
        }
    }

    pub fn bank() -> Self {
        Self::new(bank_fixture(), TraceServiceConfig::default())
    }

    pub fn tx_hash(&self, height: u64, index: usize) -> alloy::primitives::TxHash {
        self.chain
            .block_at(height)
            .map(|block| block.transactions[index].hash)
            .unwrap_or_default()
    }
}

pub fn bank_fixture() -> ChainFixture {
    ChainFixture::from_json(BANK_FIXTURE).unwrap()
}

pub fn bytes(bytes: &[u8]) -> Bytes {
    Bytes::copy_from_slice(bytes)
}

pub fn read(store: &str, key: u8) -> KvOp {
    KvOp::Read {
        store: store.into(),
        key: bytes(&[key]),
    }
}

pub fn write(store: &str, key: u8, value: u8) -> KvOp {
    KvOp::Write {
        store: store.into(),
        key: bytes(&[key]),
        value: Some(bytes(&[value])),
    }
}
