//! JSON-RPC 2.0 over HTTP.

use std::net::SocketAddr;

use alloy::primitives::{BlockHash, TxHash};
use alloy::rpc::json_rpc::{ErrorPayload, Id, Request, Response, ResponsePayload};
use alloy::rpc::types::trace::geth::{GethDebugTracingCallOptions, GethDebugTracingOptions};
use alloy::rpc::types::{BlockId, BlockNumberOrTag, TransactionRequest};
use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use prometheus::{Registry, TextEncoder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::api::{self, ExcludeFailedApi};
use crate::error::TraceError;

pub const TRACE_BLOCK_BY_NUMBER_EXCLUDE_FAILED: &str = "debug_traceBlockByNumberExcludeTraceFail";
pub const TRACE_BLOCK_BY_HASH_EXCLUDE_FAILED: &str = "debug_traceBlockByHashExcludeTraceFail";
pub const GET_VALIDATION_WINDOW: &str = "debug_getValidationWindow";

pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// Code of every [`TraceError`]; the error itself travels as `data`.
pub const TRACE_ERROR: i64 = -32000;

pub type RpcResponse = Response<Value, Value>;
pub type RpcError = ErrorPayload<Value>;

/// Wire shape of an incoming call, before it becomes a [`Request`].
#[derive(Deserialize)]
struct Envelope {
    #[serde(default = "no_id")]
    id: Id,
    method: String,
    #[serde(default)]
    params: Value,
}

fn no_id() -> Id {
    Id::None
}

impl From<Envelope> for Request<Value> {
    fn from(envelope: Envelope) -> Self {
        Request::new(envelope.method, envelope.id, envelope.params)
    }
}

fn rpc_error(code: i64, message: impl Into<String>) -> RpcError {
    ErrorPayload {
        code,
        message: message.into(),
        data: None,
    }
}

/// Maps a [`TraceError`] onto [`TRACE_ERROR`]. The error is carried as
/// `data`, together with whether retrying can help.
pub fn trace_error(err: TraceError) -> RpcError {
    let mut data = serde_json::to_value(&err).unwrap_or(Value::Null);
    if let Value::Object(fields) = &mut data {
        fields.insert("permanent".to_string(), Value::Bool(err.is_permanent()));
    }
    ErrorPayload {
        code: TRACE_ERROR,
        message: err.to_string(),
        data: Some(data),
    }
}

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct RpcState {
    pub api: ExcludeFailedApi,
    pub registry: Registry,
}

pub fn router(state: RpcState) -> Router {
    Router::new()
        .route("/", post(handle_rpc))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

/// Serves the trace API on `port` until the process exits.
pub async fn serve(port: u16, state: RpcState) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {}", addr);
    Ok(axum::serve(listener, router(state)).await?)
}

async fn handle_rpc(State(state): State<RpcState>, Json(body): Json<Value>) -> Json<RpcResponse> {
    let response = match serde_json::from_value::<Envelope>(body) {
        Ok(envelope) => {
            let request = Request::from(envelope);
            let payload = match dispatch(&state.api, &request.meta.method, &request.params).await {
                Ok(result) => ResponsePayload::Success(result),
                Err(error) => ResponsePayload::Failure(error),
            };
            Response {
                id: request.meta.id,
                payload,
            }
        }
        Err(e) => Response {
            id: Id::None,
            payload: ResponsePayload::Failure(rpc_error(
                INVALID_REQUEST,
                format!("invalid request: {e}"),
            )),
        },
    };
    Json(response)
}

async fn render_metrics(State(state): State<RpcState>) -> Result<String, StatusCode> {
    TextEncoder::new()
        .encode_to_string(&state.registry.gather())
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Routes one call to the trace API.
pub async fn dispatch(
    api: &ExcludeFailedApi,
    method: &str,
    params: &Value,
) -> Result<Value, RpcError> {
    debug!(method, "dispatching rpc call");
    let params = Params::new(params)?;
    let inner = api.inner();
    match method {
        api::TRACE_TRANSACTION => {
            let hash: TxHash = params.required(0)?;
            let config: GethDebugTracingOptions = params.optional(1)?;
            respond(inner.trace_transaction(hash, config).await)
        }
        api::TRACE_BLOCK_BY_NUMBER => {
            let number: BlockNumberOrTag = params.required(0)?;
            let config: GethDebugTracingOptions = params.optional(1)?;
            respond(inner.trace_block_by_number(number, config).await)
        }
        api::TRACE_BLOCK_BY_HASH => {
            let hash: BlockHash = params.required(0)?;
            let config: GethDebugTracingOptions = params.optional(1)?;
            respond(inner.trace_block_by_hash(hash, config).await)
        }
        api::TRACE_CALL => {
            let call: TransactionRequest = params.required(0)?;
            let block: Option<BlockId> = params.optional(1)?;
            let config: GethDebugTracingCallOptions = params.optional(2)?;
            respond(
                inner
                    .trace_call(call, block.unwrap_or_else(BlockId::latest), config)
                    .await,
            )
        }
        api::TRACE_STATE_ACCESS => {
            let hash: TxHash = params.required(0)?;
            respond(inner.trace_state_access(hash).await)
        }
        TRACE_BLOCK_BY_NUMBER_EXCLUDE_FAILED => {
            let number: BlockNumberOrTag = params.required(0)?;
            let config: GethDebugTracingOptions = params.optional(1)?;
            respond(api.trace_block_by_number_exclude_failed(number, config).await)
        }
        TRACE_BLOCK_BY_HASH_EXCLUDE_FAILED => {
            let hash: BlockHash = params.required(0)?;
            let config: GethDebugTracingOptions = params.optional(1)?;
            respond(api.trace_block_by_hash_exclude_failed(hash, config).await)
        }
        GET_VALIDATION_WINDOW => respond(Ok(inner.validation_window())),
        other => Err(rpc_error(
            METHOD_NOT_FOUND,
            format!("the method {other} does not exist/is not available"),
        )),
    }
}

fn respond<T: Serialize>(result: Result<T, TraceError>) -> Result<Value, RpcError> {
    let value = result.map_err(trace_error)?;
    serde_json::to_value(value)
        .map_err(|e| rpc_error(INTERNAL_ERROR, format!("failed to encode result: {e}")))
}

/// Positional parameters. A missing `params` member is an empty list.
struct Params<'a>(&'a [Value]);

impl<'a> Params<'a> {
    fn new(params: &'a Value) -> Result<Self, RpcError> {
        match params {
            Value::Array(values) => Ok(Self(values)),
            Value::Null => Ok(Self(&[])),
            _ => Err(rpc_error(INVALID_PARAMS, "params must be an array")),
        }
    }

    fn required<T: DeserializeOwned>(&self, index: usize) -> Result<T, RpcError> {
        let value = self
            .0
            .get(index)
            .ok_or_else(|| rpc_error(INVALID_PARAMS, format!("missing parameter {index}")))?;
        decode(index, value)
    }

    /// Missing and `null` parameters take their default.
    fn optional<T: DeserializeOwned + Default>(&self, index: usize) -> Result<T, RpcError> {
        match self.0.get(index) {
            None | Some(Value::Null) => Ok(T::default()),
            Some(value) => decode(index, value),
        }
    }
}

fn decode<T: DeserializeOwned>(index: usize, value: &Value) -> Result<T, RpcError> {
    T::deserialize(value)
        .map_err(|e| rpc_error(INVALID_PARAMS, format!("invalid parameter {index}: {e}")))
}
