//! In-memory node for development and tests.
//!
//! [`MemoryChain`] serves blocks, transactions and hash lookups from memory.
//! [`KvEngine`] executes transactions whose payload is a JSON list of
//! [`KvOp`]s against a map of named key-value stores.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{keccak256, BlockHash, Bytes, TxHash, B256};
use alloy::rpc::types::trace::geth::{
    GethDebugTracerType, GethDebugTracingCallOptions, GethDebugTracingOptions,
};
use alloy::rpc::types::TransactionRequest;
use anyhow::{anyhow, bail, Context as _};
use async_trait::async_trait;
use itertools::Itertools as _;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::capture::{
    CaptureAccumulators, ConsensusLogEntry, ExecutionHooks, ReceiptEntry, StateTouch,
};
use crate::provider::{
    BlockRecord, BlockStore, ChainClient, ExecutionEngine, ExecutionState, RetainedRange,
    TransactionLocation, TransactionRecord, TransactionStore, TxContext,
};

/// One step of a [`KvEngine`] transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum KvOp {
    Read {
        store: String,
        key: Bytes,
    },
    /// A `None` value deletes the key.
    Write {
        store: String,
        key: Bytes,
        value: Option<Bytes>,
    },
    Log {
        message: String,
    },
    /// Queries the consensus layer for the current block.
    Consensus {
        method: String,
    },
    /// Reverts the transaction.
    Fail {
        reason: String,
    },
    /// Crashes the engine.
    Panic {
        reason: String,
    },
    /// Busy work, one millisecond per iteration. Stops on cancellation.
    Spin {
        iterations: u64,
    },
}

pub fn encode_ops(ops: &[KvOp]) -> Bytes {
    // Serializing these variants cannot fail.
    Bytes::from(serde_json::to_vec(ops).unwrap_or_default())
}

pub fn decode_ops(payload: &[u8]) -> anyhow::Result<Vec<KvOp>> {
    serde_json::from_slice(payload).context("malformed transaction payload")
}

pub fn transaction_hash(block_number: u64, index: usize, payload: &[u8]) -> TxHash {
    let mut preimage = Vec::with_capacity(16 + payload.len());
    preimage.extend_from_slice(&block_number.to_be_bytes());
    preimage.extend_from_slice(&(index as u64).to_be_bytes());
    preimage.extend_from_slice(payload);
    keccak256(preimage)
}

fn block_hash(number: u64, parent_hash: BlockHash, transactions: &[TransactionRecord]) -> BlockHash {
    let mut preimage = Vec::with_capacity(40 + 32 * transactions.len());
    preimage.extend_from_slice(&number.to_be_bytes());
    preimage.extend_from_slice(parent_hash.as_slice());
    for tx in transactions {
        preimage.extend_from_slice(tx.hash.as_slice());
    }
    keccak256(preimage)
}

#[derive(Debug, Default)]
struct ChainInner {
    blocks: Vec<BlockRecord>,
    heights: HashMap<BlockHash, u64>,
    transactions: HashMap<TxHash, TransactionLocation>,
    earliest_retained: u64,
}

/// An append-only chain kept in memory. Height 0 is an empty genesis block.
#[derive(Debug)]
pub struct MemoryChain {
    inner: RwLock<ChainInner>,
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChain {
    pub fn new() -> Self {
        let genesis = BlockRecord {
            hash: block_hash(0, B256::ZERO, &[]),
            number: 0,
            parent_hash: B256::ZERO,
            transactions: Vec::new(),
        };
        let mut inner = ChainInner::default();
        inner.heights.insert(genesis.hash, 0);
        inner.blocks.push(genesis);
        Self {
            inner: RwLock::new(inner),
        }
    }

    /// Appends a block holding `payloads` in order.
    pub fn push_block(&self, payloads: Vec<Bytes>) -> BlockRecord {
        let mut inner = self.inner.write();
        let parent = inner.blocks.last().map(|it| it.hash).unwrap_or_default();
        let number = inner.blocks.len() as u64;
        let transactions = payloads
            .into_iter()
            .enumerate()
            .map(|(index, payload)| TransactionRecord {
                hash: transaction_hash(number, index, &payload),
                payload,
            })
            .collect_vec();
        let block = BlockRecord {
            hash: block_hash(number, parent, &transactions),
            number,
            parent_hash: parent,
            transactions,
        };

        inner.heights.insert(block.hash, number);
        for (index, tx) in block.transactions.iter().enumerate() {
            inner.transactions.insert(
                tx.hash,
                TransactionLocation {
                    tx: Some(tx.clone()),
                    block_hash: block.hash,
                    block_number: number,
                    index,
                },
            );
        }
        inner.blocks.push(block.clone());
        block
    }

    pub fn push_ops_block(&self, transactions: &[Vec<KvOp>]) -> BlockRecord {
        self.push_block(transactions.iter().map(|ops| encode_ops(ops)).collect())
    }

    /// Marks every height below `height` as pruned.
    pub fn prune_to(&self, height: u64) {
        self.inner.write().earliest_retained = height;
    }

    /// Keeps the receipt of `hash` but loses its body, as a partially
    /// corrupted store would.
    pub fn forget_transaction_body(&self, hash: TxHash) {
        if let Some(location) = self.inner.write().transactions.get_mut(&hash) {
            location.tx = None;
        }
    }

    pub fn latest_height(&self) -> u64 {
        self.inner.read().blocks.len() as u64 - 1
    }

    pub fn block_at(&self, height: u64) -> Option<BlockRecord> {
        let index = usize::try_from(height).ok()?;
        self.inner.read().blocks.get(index).cloned()
    }
}

#[async_trait]
impl TransactionStore for MemoryChain {
    async fn lookup_by_hash(&self, hash: TxHash) -> anyhow::Result<Option<TransactionLocation>> {
        Ok(self.inner.read().transactions.get(&hash).cloned())
    }
}

#[async_trait]
impl BlockStore for MemoryChain {
    async fn block_by_hash(&self, hash: BlockHash) -> anyhow::Result<Option<BlockRecord>> {
        let inner = self.inner.read();
        Ok(inner
            .heights
            .get(&hash)
            .and_then(|height| inner.blocks.get(*height as usize))
            .cloned())
    }

    async fn block_by_height(&self, height: u64) -> anyhow::Result<Option<BlockRecord>> {
        Ok(self.block_at(height))
    }

    fn retained_range(&self) -> RetainedRange {
        let inner = self.inner.read();
        RetainedRange {
            latest_height: inner.blocks.len() as u64 - 1,
            earliest_retained: inner.earliest_retained,
        }
    }
}

#[async_trait]
impl ChainClient for MemoryChain {
    async fn resolve_hash_to_height(&self, hash: BlockHash) -> anyhow::Result<Option<u64>> {
        Ok(self.inner.read().heights.get(&hash).copied())
    }
}

/// Initial value of one key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisEntry {
    pub store: String,
    pub key: Bytes,
    pub value: Bytes,
}

/// JSON description of a [`MemoryChain`] and its genesis state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainFixture {
    #[serde(default)]
    pub genesis: Vec<GenesisEntry>,
    /// Blocks after genesis, each a list of transactions.
    pub blocks: Vec<Vec<Vec<KvOp>>>,
    #[serde(default)]
    pub earliest_retained: u64,
}

impl ChainFixture {
    pub fn from_json(bytes: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(bytes).context("invalid chain fixture")
    }

    pub fn build(self) -> (Arc<MemoryChain>, Arc<KvEngine>) {
        let chain = Arc::new(MemoryChain::new());
        for block in &self.blocks {
            chain.push_ops_block(block);
        }
        chain.prune_to(self.earliest_retained);
        let engine = Arc::new(KvEngine::new(chain.clone(), self.genesis));
        (chain, engine)
    }
}

type KvStore = BTreeMap<(String, Bytes), Bytes>;

/// Deterministic execution engine over [`KvOp`] transactions.
///
/// Opening the state of block `n` rebuilds it from genesis by applying the
/// committed writes of blocks `1..n`. Reverted and crashing transactions
/// leave no trace in history.
#[derive(Debug)]
pub struct KvEngine {
    chain: Arc<MemoryChain>,
    genesis: KvStore,
}

impl KvEngine {
    pub fn new(chain: Arc<MemoryChain>, genesis: Vec<GenesisEntry>) -> Self {
        Self {
            chain,
            genesis: genesis
                .into_iter()
                .map(|entry| ((entry.store, entry.key), entry.value))
                .collect(),
        }
    }
}

impl ExecutionEngine for KvEngine {
    fn open_state(&self, block: &BlockRecord) -> anyhow::Result<Box<dyn ExecutionState>> {
        let mut store = self.genesis.clone();
        for height in 1..block.number {
            let historical = self
                .chain
                .block_at(height)
                .ok_or_else(|| anyhow!("missing block #{height} while rebuilding state"))?;
            let transactions = historical
                .transactions
                .iter()
                .map(|tx| decode_ops(&tx.payload))
                .collect::<anyhow::Result<Vec<_>>>()?;
            for ops in transactions.iter().filter(|ops| commits(ops)) {
                for op in ops {
                    if let KvOp::Write { store: name, key, value } = op {
                        set(&mut store, name, key, value.clone());
                    }
                }
            }
        }
        Ok(Box::new(KvState { store }))
    }
}

fn commits(ops: &[KvOp]) -> bool {
    !ops
        .iter()
        .any(|op| matches!(op, KvOp::Fail { .. } | KvOp::Panic { .. }))
}

fn set(store: &mut KvStore, name: &str, key: &Bytes, value: Option<Bytes>) -> Option<Bytes> {
    let slot = (name.to_string(), key.clone());
    match value {
        Some(value) => store.insert(slot, value),
        None => store.remove(&slot),
    }
}

/// What running one transaction produced.
#[derive(Debug, Default)]
struct Outcome {
    logs: Vec<String>,
    failure: Option<String>,
}

#[derive(Clone, Debug)]
struct KvState {
    store: KvStore,
}

impl KvState {
    /// Runs `ops` and commits the writes unless the transaction reverts.
    fn run(
        &mut self,
        block: &BlockRecord,
        tx_hash: TxHash,
        ops: &[KvOp],
        hooks: &mut dyn ExecutionHooks,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Outcome> {
        let mut scratch = self.store.clone();
        let mut outcome = Outcome::default();

        for op in ops {
            match op {
                KvOp::Read { store, key } => {
                    let value = scratch.get(&(store.clone(), key.clone())).cloned();
                    hooks.on_state_touch(StateTouch::read(store, key.clone(), value));
                }
                KvOp::Write { store, key, value } => {
                    let previous = set(&mut scratch, store, key, value.clone());
                    hooks.on_state_touch(StateTouch::write(
                        store,
                        key.clone(),
                        previous,
                        value.clone(),
                    ));
                }
                KvOp::Log { message } => outcome.logs.push(message.clone()),
                KvOp::Consensus { method } => hooks.on_consensus_query(ConsensusLogEntry {
                    method: method.clone(),
                    height: block.number,
                    response: json!({"height": block.number, "hash": block.hash}),
                }),
                KvOp::Fail { reason } => {
                    outcome.failure = Some(reason.clone());
                    break;
                }
                KvOp::Panic { reason } => panic!("{reason}"),
                KvOp::Spin { iterations } => {
                    for _ in 0..*iterations {
                        if cancel.is_cancelled() {
                            bail!("execution cancelled");
                        }
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
            }
        }

        hooks.on_receipt(ReceiptEntry {
            tx_hash,
            receipt: json!({
                "status": u8::from(outcome.failure.is_none()),
                "logs": outcome.logs,
                "error": outcome.failure,
            }),
        });
        if outcome.failure.is_none() {
            self.store = scratch;
        }
        Ok(outcome)
    }

    /// Runs `ops` under the default tracer and renders what they did.
    fn traced(
        &mut self,
        block: &BlockRecord,
        tx_hash: TxHash,
        ops: &[KvOp],
        tracer: Option<&GethDebugTracerType>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Value> {
        if let Some(tracer) = tracer {
            bail!("tracer {tracer:?} is not supported");
        }
        let mut captures = CaptureAccumulators::new();
        let outcome = self.run(block, tx_hash, ops, &mut captures, cancel)?;
        if let Some(reason) = outcome.failure {
            bail!("execution reverted: {reason}");
        }
        Ok(json!({
            "failed": false,
            "logs": outcome.logs,
            "stateAccess": captures.state_touches(),
        }))
    }
}

impl ExecutionState for KvState {
    fn execute(&mut self, ctx: &TxContext<'_>, hooks: &mut dyn ExecutionHooks) -> anyhow::Result<()> {
        let ops = decode_ops(&ctx.tx.payload)?;
        self.run(ctx.block, ctx.tx.hash, &ops, hooks, ctx.cancel)?;
        Ok(())
    }

    fn trace(
        &mut self,
        ctx: &TxContext<'_>,
        config: &GethDebugTracingOptions,
    ) -> anyhow::Result<Value> {
        let ops = decode_ops(&ctx.tx.payload)?;
        self.traced(ctx.block, ctx.tx.hash, &ops, config.tracer.as_ref(), ctx.cancel)
    }

    fn trace_call(
        &mut self,
        block: &BlockRecord,
        call: &TransactionRequest,
        config: &GethDebugTracingCallOptions,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Value> {
        let ops = match call.input.input() {
            Some(input) => decode_ops(input)?,
            None => Vec::new(),
        };
        let mut scratch = self.clone();
        scratch.traced(
            block,
            TxHash::ZERO,
            &ops,
            config.tracing_options.tracer.as_ref(),
            cancel,
        )
    }
}

#[cfg(test)]
mod tests {
    use alloy::rpc::types::trace::geth::GethDebugBuiltInTracerType;
    use alloy::rpc::types::TransactionInput;

    use super::*;
    use crate::capture::{NoCapture, TouchKind};

    /// Replays a whole block without capture.
    fn execute_block(engine: &dyn ExecutionEngine, block: &BlockRecord) -> anyhow::Result<()> {
        let cancel = CancellationToken::new();
        let mut state = engine.open_state(block)?;
        for (index, tx) in block.transactions.iter().enumerate() {
            let ctx = TxContext {
                block,
                tx,
                index,
                cancel: &cancel,
            };
            state.execute(&ctx, &mut NoCapture)?;
        }
        Ok(())
    }

    fn b(bytes: &[u8]) -> Bytes {
        Bytes::copy_from_slice(bytes)
    }

    fn write(key: u8, value: u8) -> KvOp {
        KvOp::Write {
            store: "bank".into(),
            key: b(&[key]),
            value: Some(b(&[value])),
        }
    }

    fn read(key: u8) -> KvOp {
        KvOp::Read {
            store: "bank".into(),
            key: b(&[key]),
        }
    }

    fn ctx<'a>(block: &'a BlockRecord, index: usize, cancel: &'a CancellationToken) -> TxContext<'a> {
        TxContext {
            block,
            tx: &block.transactions[index],
            index,
            cancel,
        }
    }

    #[test]
    fn ops_use_tagged_json() {
        let payload = encode_ops(&[write(1, 2), KvOp::Spin { iterations: 3 }]);
        assert_eq!(
            serde_json::from_slice::<Value>(&payload).unwrap(),
            json!([
                {"op": "write", "store": "bank", "key": "0x01", "value": "0x02"},
                {"op": "spin", "iterations": 3},
            ])
        );
        assert!(decode_ops(b"not json").is_err());
    }

    #[tokio::test]
    async fn chain_indexes_blocks_and_transactions() {
        let chain = MemoryChain::new();
        let first = chain.push_ops_block(&[vec![write(1, 1)], vec![read(1)]]);
        let second = chain.push_ops_block(&[]);

        assert_eq!(chain.latest_height(), 2);
        assert_eq!(second.parent_hash, first.hash);
        assert_eq!(
            chain.resolve_hash_to_height(first.hash).await.unwrap(),
            Some(1)
        );
        let location = chain
            .lookup_by_hash(first.transactions[1].hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(location.block_number, 1);
        assert_eq!(location.index, 1);

        chain.forget_transaction_body(first.transactions[1].hash);
        let location = chain
            .lookup_by_hash(first.transactions[1].hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(location.tx, None);

        chain.prune_to(2);
        assert_eq!(
            chain.retained_range(),
            RetainedRange {
                latest_height: 2,
                earliest_retained: 2,
            }
        );
    }

    #[test]
    fn history_keeps_only_committed_writes() {
        let (chain, engine) = ChainFixture {
            genesis: vec![GenesisEntry {
                store: "bank".into(),
                key: b(&[9]),
                value: b(&[90]),
            }],
            blocks: vec![
                vec![
                    vec![write(1, 10)],
                    vec![
                        write(1, 11),
                        KvOp::Fail {
                            reason: "insufficient funds".into(),
                        },
                    ],
                    vec![
                        write(2, 20),
                        KvOp::Panic {
                            reason: "bad opcode".into(),
                        },
                    ],
                ],
                vec![vec![read(1), read(2), read(9)]],
            ],
            earliest_retained: 0,
        }
        .build();

        let block = chain.block_at(2).unwrap();
        let cancel = CancellationToken::new();
        let mut state = engine.open_state(&block).unwrap();
        let mut captures = CaptureAccumulators::new();
        state
            .execute(&ctx(&block, 0, &cancel), &mut captures)
            .unwrap();

        let values = captures
            .state_touches()
            .iter()
            .map(|touch| match &touch.kind {
                TouchKind::Read { value } => value.clone(),
                TouchKind::Write { .. } => unreachable!(),
            })
            .collect::<Vec<_>>();
        assert_eq!(values, [Some(b(&[10])), None, Some(b(&[90]))]);
    }

    #[test]
    fn reverted_transactions_report_a_failed_receipt() {
        let chain = Arc::new(MemoryChain::new());
        let block = chain.push_ops_block(&[
            vec![
                write(1, 1),
                KvOp::Log {
                    message: "debit".into(),
                },
                KvOp::Fail {
                    reason: "out of gas".into(),
                },
            ],
            vec![read(1)],
        ]);
        let engine = KvEngine::new(chain, Vec::new());
        let cancel = CancellationToken::new();
        let mut state = engine.open_state(&block).unwrap();

        let mut captures = CaptureAccumulators::new();
        state
            .execute(&ctx(&block, 0, &cancel), &mut captures)
            .unwrap();
        state
            .execute(&ctx(&block, 1, &cancel), &mut captures)
            .unwrap();

        let receipts = captures.receipt_entries();
        assert_eq!(receipts[0].receipt["status"], json!(0));
        assert_eq!(receipts[0].receipt["logs"], json!(["debit"]));
        assert_eq!(receipts[0].receipt["error"], json!("out of gas"));
        assert_eq!(receipts[1].receipt["status"], json!(1));
        // The reverted write is not visible to the next transaction.
        assert_eq!(
            captures.state_touches()[1],
            StateTouch::read("bank", b(&[1]), None)
        );
    }

    #[test]
    fn tracing_a_revert_is_an_error() {
        let chain = Arc::new(MemoryChain::new());
        let block = chain.push_ops_block(&[vec![KvOp::Fail {
            reason: "nope".into(),
        }]]);
        let engine = KvEngine::new(chain, Vec::new());
        let cancel = CancellationToken::new();
        let mut state = engine.open_state(&block).unwrap();

        let err = state
            .trace(&ctx(&block, 0, &cancel), &Default::default())
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn unsupported_tracers_are_rejected() {
        let chain = Arc::new(MemoryChain::new());
        let block = chain.push_ops_block(&[vec![read(1)]]);
        let engine = KvEngine::new(chain, Vec::new());
        let cancel = CancellationToken::new();
        let mut state = engine.open_state(&block).unwrap();

        let config = GethDebugTracingOptions {
            tracer: Some(GethDebugTracerType::BuiltInTracer(
                GethDebugBuiltInTracerType::CallTracer,
            )),
            ..Default::default()
        };
        assert!(state.trace(&ctx(&block, 0, &cancel), &config).is_err());
    }

    #[test]
    fn spin_observes_cancellation() {
        let chain = Arc::new(MemoryChain::new());
        let block = chain.push_ops_block(&[vec![KvOp::Spin {
            iterations: u64::MAX,
        }]]);
        let engine = KvEngine::new(chain, Vec::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut state = engine.open_state(&block).unwrap();

        assert!(state
            .execute(&ctx(&block, 0, &cancel), &mut NoCapture)
            .is_err());
    }

    #[test]
    fn calls_do_not_commit() {
        let chain = Arc::new(MemoryChain::new());
        let block = chain.push_ops_block(&[vec![write(1, 1)]]);
        let engine = KvEngine::new(chain, Vec::new());
        let cancel = CancellationToken::new();
        let mut state = engine.open_state(&block).unwrap();
        state
            .execute(&ctx(&block, 0, &cancel), &mut NoCapture)
            .unwrap();

        let call = TransactionRequest::default()
            .input(TransactionInput::new(encode_ops(&[write(1, 7), read(1)])));
        let traced = state
            .trace_call(&block, &call, &Default::default(), &cancel)
            .unwrap();
        assert_eq!(traced["stateAccess"][0]["previous"], json!("0x01"));
        assert_eq!(traced["stateAccess"][1]["value"], json!("0x07"));

        let call = TransactionRequest::default().input(TransactionInput::new(encode_ops(&[read(1)])));
        let traced = state
            .trace_call(&block, &call, &Default::default(), &cancel)
            .unwrap();
        assert_eq!(traced["stateAccess"][0]["value"], json!("0x01"));
    }

    #[test]
    fn fixtures_load_from_json() {
        let fixture = ChainFixture::from_json(
            br#"{
                "genesis": [{"store": "bank", "key": "0x01", "value": "0x64"}],
                "blocks": [[[{"op": "read", "store": "bank", "key": "0x01"}]]],
                "earliestRetained": 1
            }"#,
        )
        .unwrap();
        let (chain, engine) = fixture.build();

        assert_eq!(chain.retained_range().earliest_retained, 1);
        let block = chain.block_at(1).unwrap();
        execute_block(&*engine, &block).unwrap();
    }
}
