//! Remote fan-out: querying partitions served by a peer node over
//! HTTP, against a stub peer endpoint.

use axum::routing::{get, post};
use axum::{Json, Router};
use shoal::metadata::{
    self, MemMetaStore, NodeDef, NodeDefs, NodeDefsKind, PlanPIndex, PlanPIndexNode, PlanPIndexes,
};
use shoal::pindex::kvlite::KvLiteQueryResults;
use shoal::prelude::*;
use shoal::query::remote::IndexClient;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Stub peer serving one pindex's query and count endpoints.
async fn spawn_peer() -> SocketAddr {
    let app = Router::new()
        .route(
            "/api/pindex/{name}/count",
            get(|| async { Json(serde_json::json!({"status": "ok", "count": 5})) }),
        )
        .route(
            "/api/pindex/{name}/query",
            post(|Json(_req): Json<serde_json::Value>| async {
                Json(serde_json::json!({
                    "results": [
                        {"key": "r1", "val": "v1"},
                        {"key": "r2", "val": "v2"},
                    ]
                }))
            }),
        )
        .route(
            "/api/pindex/{name}/slow-query",
            post(|Json(_req): Json<serde_json::Value>| async {
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                Json(serde_json::json!({"results": []}))
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Seed a plan whose only pindex lives on remote node n2.
async fn seed_remote_plan(store: &MemMetaStore, peer: SocketAddr) {
    let mut node_defs = NodeDefs::new("1.0.0");
    node_defs.node_defs.insert(
        "n2".to_string(),
        NodeDef {
            host_port: peer.to_string(),
            uuid: "n2".to_string(),
            impl_version: "1.0.0".to_string(),
            tags: None,
            container: String::new(),
            weight: 0,
        },
    );
    metadata::set_node_defs(store, NodeDefsKind::Known, &node_defs, 0)
        .await
        .unwrap();

    let mut nodes = BTreeMap::new();
    nodes.insert(
        "n2".to_string(),
        PlanPIndexNode {
            can_read: true,
            can_write: true,
            priority: 0,
        },
    );
    let mut plan = PlanPIndexes::new("1.0.0");
    plan.plan_pindexes.insert(
        "i_U_0".to_string(),
        PlanPIndex {
            name: "i_U_0".to_string(),
            uuid: "p-uuid".to_string(),
            index_type: "kvlite".to_string(),
            index_name: "i".to_string(),
            index_uuid: "U".to_string(),
            index_params: String::new(),
            source_type: "direct".to_string(),
            source_name: "s".to_string(),
            source_uuid: String::new(),
            source_params: String::new(),
            source_partitions: "0".to_string(),
            nodes,
        },
    );
    metadata::set_plan_pindexes(store, &plan, 0).await.unwrap();
}

fn local_manager(store: Arc<MemMetaStore>) -> Arc<Manager> {
    Manager::new(
        "1.0.0",
        store,
        ManagerOptions {
            uuid: "n1".to_string(),
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn test_index_client_count_and_query() {
    let peer = spawn_peer().await;
    let base = format!("http://{peer}/api/pindex/i_U_0");
    let client = IndexClient::new(format!("{base}/query"), format!("{base}/count"));

    let count = client.count(CancellationToken::new()).await.unwrap();
    assert_eq!(count, 5);

    let results = client
        .query(&serde_json::json!({}), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(results.results.len(), 2);
    assert_eq!(results.results[0].key, "r1");
}

#[tokio::test]
async fn test_index_client_cancellation() {
    let peer = spawn_peer().await;
    let base = format!("http://{peer}/api/pindex/i_U_0");
    let client = IndexClient::new(format!("{base}/slow-query"), format!("{base}/count"));

    let cancel = CancellationToken::new();
    let cancel2 = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel2.cancel();
    });

    let start = std::time::Instant::now();
    let err = client
        .query(&serde_json::json!({}), cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(start.elapsed() < std::time::Duration::from_secs(5));
}

#[tokio::test]
async fn test_covering_query_reaches_remote_partition() {
    let peer = spawn_peer().await;
    let store = Arc::new(MemMetaStore::new());
    seed_remote_plan(&store, peer).await;

    let mgr = local_manager(store);

    let resp = shoal::query::query_targets(&mgr, &[("i".to_string(), String::new())], b"{}")
        .await
        .unwrap();
    let results: KvLiteQueryResults = serde_json::from_slice(&resp).unwrap();
    let keys: Vec<&str> = results.results.iter().map(|i| i.key.as_str()).collect();
    assert_eq!(keys, vec!["r1", "r2"]);

    let count =
        shoal::query::count_targets(&mgr, &[("i".to_string(), String::new())], CancellationToken::new())
            .await
            .unwrap();
    assert_eq!(count, 5);
}

#[tokio::test]
async fn test_covering_set_demands_known_node_def() {
    let peer = spawn_peer().await;
    let store = Arc::new(MemMetaStore::new());
    seed_remote_plan(&store, peer).await;

    // Wipe the known node defs: the covering set can no longer resolve
    // the remote endpoint.
    let empty = NodeDefs::new("1.0.0");
    let (_, cas) = metadata::get_node_defs(store.as_ref(), NodeDefsKind::Known, "1.0.0")
        .await
        .unwrap()
        .unwrap();
    metadata::set_node_defs(store.as_ref(), NodeDefsKind::Known, &empty, cas)
        .await
        .unwrap();

    let mgr = local_manager(store);
    let err = shoal::query::query_targets(&mgr, &[("i".to_string(), String::new())], b"{}")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Query(_)), "unexpected error: {err}");
}
