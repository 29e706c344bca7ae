//! Transport tests over real sockets

use cadence_consensus::abci::{Application, RequestFinalizeBlock};
use cadence_consensus::store::{BlockTx, RegisteredNode};
use cadence_consensus::{AppConfig, CoreApplication, MemoryStore, Mempool, PeerBroadcaster, Store};
use cadence_core::{SignedTransaction, TrackPlay, TrackPlays, Transaction};
use cadence_node::http::{serve_listener, ForwardResponse, PingResponse, RpcResponse};
use cadence_node::peer_client::{HttpPeerConnector, PEER_HEADER};
use cadence_node::service::{FinalizedTransaction, NodeStatus, SendReceipt};
use cadence_node::TxService;
use cadence_registry::StaticServiceRegistry;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

struct TestNode {
    url: String,
    app: Arc<CoreApplication>,
    broadcaster: Arc<PeerBroadcaster>,
}

async fn start_node() -> TestNode {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let broadcaster = Arc::new(PeerBroadcaster::new(
        Arc::new(HttpPeerConnector::new(Duration::from_secs(2), &url).unwrap()),
        16,
    ));
    let app = Arc::new(CoreApplication::new(
        Arc::new(MemoryStore::new()),
        Arc::new(Mempool::new(32).with_broadcaster(broadcaster.clone())),
        Arc::new(StaticServiceRegistry::default()),
        AppConfig::default(),
    ));
    let service = Arc::new(TxService::new(
        app.clone(),
        broadcaster.clone(),
        "0xnode".to_string(),
        "NODE".to_string(),
        Duration::from_secs(5),
    ));

    tokio::spawn(serve_listener(service, listener));
    TestNode {
        url,
        app,
        broadcaster,
    }
}

fn plays(user: &str) -> SignedTransaction {
    SignedTransaction::unsigned(
        format!("req-{user}"),
        Transaction::Plays(TrackPlays {
            plays: vec![TrackPlay {
                user_id: user.to_string(),
                track_id: "track".to_string(),
                timestamp: 1_700_000_000,
                signature: "sig".to_string(),
                city: "Austin".to_string(),
                region: "TX".to_string(),
                country: "US".to_string(),
            }],
        }),
    )
}

fn peer(url: &str) -> RegisteredNode {
    RegisteredNode {
        eth_address: format!("0x{url}"),
        comet_address: url.to_ascii_uppercase(),
        pub_key: vec![0; 32],
        endpoint: url.to_string(),
        node_type: "validator".to_string(),
        sp_id: 1,
        eth_block: 1,
    }
}

async fn register(app: &CoreApplication, nodes: &[RegisteredNode]) {
    let mut tx = app.store().begin_block().await.unwrap();
    for node in nodes {
        tx.insert_registered_node(node).await.unwrap();
    }
    tx.commit().await.unwrap();
}

async fn commit_pending(app: &CoreApplication) {
    let height = app.last_block_height() + 1;
    let txs = app
        .mempool()
        .get_batch(100, height)
        .into_iter()
        .map(|entry| entry.tx_bytes.clone())
        .collect();
    app.finalize_block(RequestFinalizeBlock {
        txs,
        misbehavior: vec![],
        hash: vec![],
        height,
        time: chrono::Utc::now(),
        proposer_address: "NODE".to_string(),
    })
    .await
    .unwrap();
    app.commit().await.unwrap();
}

#[tokio::test]
async fn test_send_and_get_over_http() {
    let node = start_node().await;
    let client = reqwest::Client::new();

    let ping: PingResponse = client
        .get(format!("{}/core/ping", node.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ping.message, "pong");

    let tx = plays("alice");
    let expected = tx.hash().unwrap();
    let send = {
        let client = client.clone();
        let url = format!("{}/core/tx", node.url);
        let tx = tx.clone();
        tokio::spawn(async move { client.post(url).json(&tx).send().await })
    };
    while node.app.mempool().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    commit_pending(&node.app).await;

    let receipt: SendReceipt = send.await.unwrap().unwrap().json().await.unwrap();
    assert_eq!(receipt.tx_hash, expected);
    assert_eq!(receipt.code, 0);

    let found: FinalizedTransaction = client
        .get(format!("{}/core/tx/{}", node.url, expected))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(found.transaction, tx);
    assert_eq!(found.height, 1);

    let missing = client
        .get(format!("{}/core/tx/{}", node.url, "0".repeat(64)))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    let status: NodeStatus = client
        .get(format!("{}/core/status", node.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status.height, 1);
    assert_eq!(status.mempool_size, 0);
}

#[tokio::test]
async fn test_json_rpc_get_transaction() {
    let node = start_node().await;
    let tx = plays("bob");
    node.app.submit(tx.clone()).await.unwrap();
    commit_pending(&node.app).await;

    let response: RpcResponse = reqwest::Client::new()
        .post(format!("{}/core/rpc", node.url))
        .json(&json!({
            "jsonrpc": "2.0",
            "id": "abc",
            "method": "get_transaction",
            "params": { "hash": tx.hash().unwrap().as_str() }
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response.id, json!("abc"));
    let result: FinalizedTransaction = serde_json::from_value(response.result.unwrap()).unwrap();
    assert_eq!(result.transaction, tx);
}

#[tokio::test]
async fn test_local_submissions_reach_peers_once() {
    let a = start_node().await;
    let b = start_node().await;
    let nodes = [peer(&a.url), peer(&b.url)];
    register(&a.app, &nodes).await;
    register(&b.app, &nodes).await;
    a.broadcaster.add_validators(&[peer(&a.url), peer(&b.url)], &a.url);
    b.broadcaster.add_validators(&[peer(&a.url), peer(&b.url)], &b.url);
    assert_eq!(a.broadcaster.peer_count(), 1);

    let hash = a.app.submit(plays("carol")).await.unwrap();
    for _ in 0..200 {
        if b.app.mempool().contains(&hash) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(b.app.mempool().contains(&hash));

    // forwarded transactions are not broadcast again
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(a.app.mempool().len(), 1);
    assert_eq!(b.app.mempool().len(), 1);

    let raw = plays("dave").to_bytes().unwrap();
    let forwarded: ForwardResponse = reqwest::Client::new()
        .post(format!("{}/core/forward", b.url))
        .header(PEER_HEADER, a.url.as_str())
        .body(raw.clone())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(forwarded.tx_hash, cadence_core::TxHash::of_bytes(&raw).to_string());
    assert_eq!(b.app.mempool().len(), 2);
    assert_eq!(a.app.mempool().len(), 1);
}

#[tokio::test]
async fn test_forward_from_unknown_sender_refused() {
    let node = start_node().await;
    register(&node.app, &[peer("http://known.example")]).await;
    let client = reqwest::Client::new();
    let raw = plays("erin").to_bytes().unwrap();

    for sender in [None, Some("http://stranger.example")] {
        let mut request = client.post(format!("{}/core/forward", node.url)).body(raw.clone());
        if let Some(sender) = sender {
            request = request.header(PEER_HEADER, sender);
        }
        let response = request.send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);
    }
    assert!(node.app.mempool().is_empty());

    let accepted = client
        .post(format!("{}/core/forward", node.url))
        .header(PEER_HEADER, "http://known.example/")
        .body(raw)
        .send()
        .await
        .unwrap();
    assert!(accepted.status().is_success());
    assert_eq!(node.app.mempool().len(), 1);
}
