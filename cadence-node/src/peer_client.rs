//! HTTP clients for other validators and for the local consensus engine

use crate::error::NodeResult;
use async_trait::async_trait;
use cadence_consensus::{ConsensusError, ConsensusResult, ConsensusStatus, PeerClient, PeerConnector};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Route peers accept forwarded transactions on
pub const FORWARD_PATH: &str = "/core/forward";

/// Header naming the endpoint of the forwarding validator
///
/// It identifies the caller for the registered-validator check on
/// [`FORWARD_PATH`]; it is not a signature and does not authenticate it.
pub const PEER_HEADER: &str = "x-cadence-peer";

fn join(base: &str, path: &str) -> String {
    format!("{}{path}", base.trim().trim_end_matches('/'))
}

/// Builds [`HttpPeerClient`]s sharing one connection pool
#[derive(Clone)]
pub struct HttpPeerConnector {
    client: reqwest::Client,
    /// This node's public endpoint, sent in [`PEER_HEADER`]
    self_endpoint: String,
}

impl HttpPeerConnector {
    pub fn new(timeout: Duration, self_endpoint: &str) -> NodeResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            self_endpoint: self_endpoint.trim().to_string(),
        })
    }
}

impl PeerConnector for HttpPeerConnector {
    fn connect(&self, endpoint: &str) -> ConsensusResult<Arc<dyn PeerClient>> {
        let url = reqwest::Url::parse(&join(endpoint, FORWARD_PATH))
            .map_err(|e| ConsensusError::Peer(format!("invalid peer endpoint {endpoint:?}: {e}")))?;
        Ok(Arc::new(HttpPeerClient {
            client: self.client.clone(),
            url,
            self_endpoint: self.self_endpoint.clone(),
        }))
    }
}

pub struct HttpPeerClient {
    client: reqwest::Client,
    url: reqwest::Url,
    self_endpoint: String,
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn forward_transaction(&self, tx_bytes: &[u8]) -> ConsensusResult<()> {
        let response = self
            .client
            .post(self.url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(PEER_HEADER, &self.self_endpoint)
            .body(tx_bytes.to_vec())
            .send()
            .await
            .map_err(|e| ConsensusError::Peer(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConsensusError::Peer(format!("{} answered {status}: {body}", self.url)));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct StatusEnvelope {
    result: StatusResult,
}

#[derive(Deserialize)]
struct StatusResult {
    sync_info: SyncInfo,
}

#[derive(Deserialize)]
struct SyncInfo {
    catching_up: bool,
}

/// Reads `sync_info.catching_up` from the engine's RPC `/status`
pub struct CometRpcStatus {
    client: reqwest::Client,
    url: String,
}

impl CometRpcStatus {
    pub fn new(rpc_url: &str, timeout: Duration) -> NodeResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: join(rpc_url, "/status"),
        })
    }
}

/// Pull `catching_up` out of a `/status` response body
pub fn parse_catching_up(body: &str) -> ConsensusResult<bool> {
    serde_json::from_str::<StatusEnvelope>(body)
        .map(|status| status.result.sync_info.catching_up)
        .map_err(|e| ConsensusError::EngineStatus(format!("unexpected status response: {e}")))
}

#[async_trait]
impl ConsensusStatus for CometRpcStatus {
    async fn catching_up(&self) -> ConsensusResult<bool> {
        let body = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ConsensusError::EngineStatus(e.to_string()))?
            .text()
            .await
            .map_err(|e| ConsensusError::EngineStatus(e.to_string()))?;
        parse_catching_up(&body)
    }
}
