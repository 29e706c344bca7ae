//! HTTP transport: REST routes plus a JSON-RPC 2.0 endpoint on one listener

use crate::error::{NodeError, NodeResult};
use crate::peer_client::PEER_HEADER;
use crate::service::{FinalizedTransaction, NodeStatus, SendReceipt, TxService};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use cadence_consensus::{ConsensusError, MempoolError};
use cadence_core::SignedTransaction;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    service: Arc<TxService>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PingResponse {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ForwardResponse {
    pub tx_hash: String,
}

type HttpResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

pub fn router(service: Arc<TxService>) -> Router {
    Router::new()
        .route("/core/tx", post(send_transaction))
        .route("/core/tx/:hash", get(get_transaction))
        .route("/core/ping", get(ping))
        .route("/core/forward", post(forward_transaction))
        .route("/core/status", get(status))
        .route("/core/rpc", post(rpc))
        .with_state(AppState { service })
}

pub async fn serve(service: Arc<TxService>, addr: SocketAddr) -> NodeResult<()> {
    serve_listener(service, TcpListener::bind(addr).await?).await
}

pub async fn serve_listener(service: Arc<TxService>, listener: TcpListener) -> NodeResult<()> {
    tracing::info!(addr = %listener.local_addr()?, "HTTP transport listening");
    axum::serve(listener, router(service)).await?;
    Ok(())
}

fn status_code(err: &NodeError) -> StatusCode {
    match err {
        NodeError::NotFound(_) => StatusCode::NOT_FOUND,
        NodeError::Forbidden(_) => StatusCode::FORBIDDEN,
        NodeError::Consensus(ConsensusError::AlreadyFinalized { .. }) => StatusCode::CONFLICT,
        NodeError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        NodeError::Consensus(ConsensusError::Mempool(MempoolError::Full { .. })) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        e if e.is_client_error() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn to_http_error(err: NodeError) -> (StatusCode, Json<ErrorResponse>) {
    let status = status_code(&err);
    if status.is_server_error() {
        tracing::warn!(error = %err, "Request failed");
    }
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

async fn send_transaction(
    State(state): State<AppState>,
    Json(tx): Json<SignedTransaction>,
) -> HttpResult<SendReceipt> {
    let request = Uuid::new_v4();
    tracing::debug!(%request, request_id = %tx.request_id, kind = %tx.kind(), "Send transaction");
    state.service.send(tx).await.map(Json).map_err(to_http_error)
}

async fn get_transaction(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> HttpResult<FinalizedTransaction> {
    state.service.get(&hash).await.map(Json).map_err(to_http_error)
}

async fn ping(State(state): State<AppState>) -> Json<PingResponse> {
    Json(PingResponse {
        message: state.service.ping().to_string(),
    })
}

async fn forward_transaction(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> HttpResult<ForwardResponse> {
    let peer = headers.get(PEER_HEADER).and_then(|value| value.to_str().ok());
    state
        .service
        .forward(body.to_vec(), peer)
        .await
        .map(|hash| {
            Json(ForwardResponse {
                tx_hash: hash.to_string(),
            })
        })
        .map_err(to_http_error)
}

async fn status(State(state): State<AppState>) -> Json<NodeStatus> {
    Json(state.service.status())
}

const PARSE_ERROR: i64 = -32700;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const SERVER_ERROR: i64 = -32000;
const NOT_FOUND: i64 = -32001;
const TIMEOUT: i64 = -32002;

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Deserialize)]
struct SendParams {
    transaction: SignedTransaction,
}

#[derive(Deserialize)]
struct GetParams {
    hash: String,
}

fn rpc_error(id: Value, err: &NodeError) -> RpcResponse {
    let code = match err {
        NodeError::NotFound(_) => NOT_FOUND,
        NodeError::Timeout { .. } => TIMEOUT,
        e if e.is_client_error() => INVALID_PARAMS,
        _ => SERVER_ERROR,
    };
    RpcResponse::error(id, code, err.to_string())
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, NodeError> {
    serde_json::to_value(value).map_err(|e| NodeError::InvalidRequest(e.to_string()))
}

/// Dispatch one JSON-RPC call
pub async fn dispatch(service: &TxService, request: RpcRequest) -> RpcResponse {
    let id = request.id;
    match request.method.as_str() {
        "ping" => RpcResponse::result(id, json!(service.ping())),
        "send_transaction" => {
            let params: SendParams = match serde_json::from_value(request.params) {
                Ok(params) => params,
                Err(e) => return RpcResponse::error(id, INVALID_PARAMS, e.to_string()),
            };
            match service.send(params.transaction).await.and_then(|r| to_value(&r)) {
                Ok(value) => RpcResponse::result(id, value),
                Err(e) => rpc_error(id, &e),
            }
        }
        "get_transaction" => {
            let params: GetParams = match serde_json::from_value(request.params) {
                Ok(params) => params,
                Err(e) => return RpcResponse::error(id, INVALID_PARAMS, e.to_string()),
            };
            match service.get(&params.hash).await.and_then(|r| to_value(&r)) {
                Ok(value) => RpcResponse::result(id, value),
                Err(e) => rpc_error(id, &e),
            }
        }
        other => RpcResponse::error(id, METHOD_NOT_FOUND, format!("unknown method {other}")),
    }
}

async fn rpc(State(state): State<AppState>, body: Bytes) -> Json<RpcResponse> {
    let request: RpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return Json(RpcResponse::error(Value::Null, PARSE_ERROR, e.to_string())),
    };
    Json(dispatch(&state.service, request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer_client::HttpPeerConnector;
    use cadence_consensus::store::{BlockTx, RegisteredNode};
    use cadence_consensus::{AppConfig, CoreApplication, MemoryStore, Mempool, PeerBroadcaster, Store};
    use cadence_core::{ManageEntityLegacy, Transaction};
    use cadence_registry::StaticServiceRegistry;
    use std::time::Duration;

    fn state() -> AppState {
        let app = Arc::new(CoreApplication::new(
            Arc::new(MemoryStore::new()),
            Arc::new(Mempool::new(1)),
            Arc::new(StaticServiceRegistry::default()),
            AppConfig::default(),
        ));
        let peers = Arc::new(PeerBroadcaster::new(
            Arc::new(HttpPeerConnector::new(Duration::from_secs(1), "http://self.example").unwrap()),
            4,
        ));
        AppState {
            service: Arc::new(TxService::new(
                app,
                peers,
                "0xabc".to_string(),
                "ABC".to_string(),
                Duration::from_millis(10),
            )),
        }
    }

    fn entity(nonce: &str) -> SignedTransaction {
        SignedTransaction::unsigned(
            nonce,
            Transaction::ManageEntity(ManageEntityLegacy {
                user_id: 1,
                entity_type: "Track".to_string(),
                entity_id: 7,
                action: "Create".to_string(),
                metadata: "{}".to_string(),
                signature: "0x00".to_string(),
                signer: "0xabc".to_string(),
                nonce: nonce.to_string(),
            }),
        )
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(status_code(&NodeError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_code(&NodeError::Consensus(ConsensusError::Mempool(MempoolError::Full { capacity: 1 }))),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_code(&NodeError::InvalidRequest("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_code(&NodeError::Forbidden("x".into())), StatusCode::FORBIDDEN);
        assert_eq!(
            status_code(&NodeError::Consensus(ConsensusError::AlreadyFinalized {
                tx_hash: cadence_core::TxHash::of_bytes(b"x"),
                height: 3,
            })),
            StatusCode::CONFLICT
        );
        assert_eq!(status_code(&NodeError::Config("x".into())), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_rest_handlers() {
        let state = state();
        assert_eq!(ping(State(state.clone())).await.0.message, "pong");

        let err = get_transaction(State(state.clone()), Path("nothex".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);

        // times out, but the transaction stays pending
        let err = send_transaction(State(state.clone()), Json(entity("1"))).await.unwrap_err();
        assert_eq!(err.0, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status(State(state.clone())).await.0.mempool_size, 1);

        let bytes = Bytes::from(entity("2").to_bytes().unwrap());
        let err = forward_transaction(State(state.clone()), HeaderMap::new(), bytes.clone())
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::FORBIDDEN);

        let mut tx = state.service.app().store().begin_block().await.unwrap();
        tx.insert_registered_node(&RegisteredNode {
            eth_address: "0x2222222222222222222222222222222222222222".to_string(),
            comet_address: "BEEF".to_string(),
            pub_key: vec![3; 32],
            endpoint: "https://peer.example".to_string(),
            node_type: "validator".to_string(),
            sp_id: 2,
            eth_block: 1,
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(PEER_HEADER, "https://peer.example".parse().unwrap());
        // mempool of one is now full
        let err = forward_transaction(State(state), headers, bytes).await.unwrap_err();
        assert_eq!(err.0, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_json_rpc_dispatch() {
        let state = state();
        let request = |method: &str, params: Value| RpcRequest {
            id: json!(7),
            method: method.to_string(),
            params,
        };

        let pong = dispatch(&state.service, request("ping", Value::Null)).await;
        assert_eq!(pong.id, json!(7));
        assert_eq!(pong.result, Some(json!("pong")));

        let unknown = dispatch(&state.service, request("mine", Value::Null)).await;
        assert_eq!(unknown.error.unwrap().code, METHOD_NOT_FOUND);

        let bad = dispatch(&state.service, request("get_transaction", json!({}))).await;
        assert_eq!(bad.error.unwrap().code, INVALID_PARAMS);

        let missing = dispatch(
            &state.service,
            request("get_transaction", json!({ "hash": "B".repeat(64) })),
        )
        .await;
        assert_eq!(missing.error.unwrap().code, NOT_FOUND);

        let params = json!({ "transaction": serde_json::to_value(entity("3")).unwrap() });
        let timed_out = dispatch(&state.service, request("send_transaction", params)).await;
        assert_eq!(timed_out.error.unwrap().code, TIMEOUT);
    }

    #[tokio::test]
    async fn test_rpc_parse_error() {
        let response = rpc(State(state()), Bytes::from_static(b"{not json")).await;
        assert_eq!(response.0.error.as_ref().unwrap().code, PARSE_ERROR);
    }
}
