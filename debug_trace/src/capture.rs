//! Request scoped capture of what a replay touched.

use std::collections::BTreeMap;

use alloy::primitives::{Bytes, TxHash};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TraceError;

/// Observer API for the execution engine.
///
/// Engines report every state access, consensus query and constructed
/// receipt through these hooks. All methods default to doing nothing.
pub trait ExecutionHooks {
    fn on_state_touch(&mut self, _touch: StateTouch) {}

    fn on_consensus_query(&mut self, _entry: ConsensusLogEntry) {}

    fn on_receipt(&mut self, _entry: ReceiptEntry) {}
}

/// Hooks for a plain replay.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCapture;

impl ExecutionHooks for NoCapture {}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TouchKind {
    Read {
        value: Option<Bytes>,
    },
    /// `None` values mean the key was absent or deleted.
    Write {
        previous: Option<Bytes>,
        value: Option<Bytes>,
    },
}

/// A single key accessed in a named store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTouch {
    pub store: String,
    pub key: Bytes,
    #[serde(flatten)]
    pub kind: TouchKind,
}

impl StateTouch {
    pub fn read(store: impl Into<String>, key: Bytes, value: Option<Bytes>) -> Self {
        Self {
            store: store.into(),
            key,
            kind: TouchKind::Read { value },
        }
    }

    pub fn write(
        store: impl Into<String>,
        key: Bytes,
        previous: Option<Bytes>,
        value: Option<Bytes>,
    ) -> Self {
        Self {
            store: store.into(),
            key,
            kind: TouchKind::Write { previous, value },
        }
    }

    /// Value the key held before this touch.
    fn pre_value(&self) -> Option<&Bytes> {
        match &self.kind {
            TouchKind::Read { value } => value.as_ref(),
            TouchKind::Write { previous, .. } => previous.as_ref(),
        }
    }
}

/// A query the engine made against the consensus layer while replaying.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsensusLogEntry {
    pub method: String,
    pub height: u64,
    pub response: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReceiptEntry {
    #[serde(rename = "txHash")]
    pub tx_hash: TxHash,
    pub receipt: Value,
}

/// Prestate of one key plus its final value if the replay wrote it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrestateEntry {
    pub pre: Option<Bytes>,
    /// Absent when never written, `null` when deleted.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub post: Option<Option<Bytes>>,
}

/// Keeps an explicit `null` as `Some(None)` instead of collapsing it into a
/// missing field.
fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Store name to hex key to prestate entry, in sorted order.
pub type PrestateDelta = BTreeMap<String, BTreeMap<String, PrestateEntry>>;

/// The three capture channels of a state access trace.
///
/// One instance is created per request, moved into the replay and consumed
/// by [`CaptureAccumulators::finalize`].
#[derive(Debug, Default)]
pub struct CaptureAccumulators {
    state: Vec<StateTouch>,
    consensus: Vec<ConsensusLogEntry>,
    receipts: Vec<ReceiptEntry>,
}

impl CaptureAccumulators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state_touches(&self) -> &[StateTouch] {
        &self.state
    }

    pub fn receipt_entries(&self) -> &[ReceiptEntry] {
        &self.receipts
    }

    /// Collapses the state touch log into the value each key held before the
    /// replay and, for written keys, after it.
    pub fn prestate_delta(&self) -> PrestateDelta {
        let mut delta = PrestateDelta::new();
        for touch in &self.state {
            let entry = delta
                .entry(touch.store.clone())
                .or_default()
                .entry(format!("0x{}", hex::encode(&touch.key)))
                .or_insert_with(|| PrestateEntry {
                    pre: touch.pre_value().cloned(),
                    post: None,
                });
            if let TouchKind::Write { value, .. } = &touch.kind {
                entry.post = Some(value.clone());
            }
        }
        delta
    }

    /// Serializes each channel independently and bundles them.
    pub fn finalize(self) -> Result<StateAccessResult, TraceError> {
        let serialize = |channel: &str, it: Result<Value, serde_json::Error>| {
            it.map_err(|e| TraceError::internal(format!("failed to serialize {channel} trace: {e}")))
        };
        Ok(StateAccessResult {
            app: serialize("app state", serde_json::to_value(self.prestate_delta()))?,
            consensus: serialize("consensus", serde_json::to_value(&self.consensus))?,
            receipt: serialize("receipt", serde_json::to_value(&self.receipts))?,
        })
    }
}

impl ExecutionHooks for CaptureAccumulators {
    fn on_state_touch(&mut self, touch: StateTouch) {
        self.state.push(touch);
    }

    fn on_consensus_query(&mut self, entry: ConsensusLogEntry) {
        self.consensus.push(entry);
    }

    fn on_receipt(&mut self, entry: ReceiptEntry) {
        self.receipts.push(entry);
    }
}

/// Response of `debug_traceStateAccess`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateAccessResult {
    pub app: Value,
    #[serde(rename = "tendermint")]
    pub consensus: Value,
    pub receipt: Value,
}
