//! Consistency waits driven through the full pipeline: plan, janitor,
//! feed, engine.

use shoal::feed::DirectFeed;
use shoal::metadata::{NodeDefsKind, PlanParams};
use shoal::pindex::consistency::LEVEL_AT_PLUS;
use shoal::prelude::*;
use shoal::util::timeout_cancel_token;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

async fn node_with_index(dir: &std::path::Path, partitions: usize) -> Arc<Manager> {
    let mgr = Manager::new(
        "1.0.0",
        Arc::new(MemMetaStore::new()),
        ManagerOptions {
            uuid: "n1".to_string(),
            data_dir: dir.to_path_buf(),
            ..Default::default()
        },
    );
    mgr.start(&[NodeDefsKind::Known, NodeDefsKind::Wanted])
        .await
        .unwrap();
    mgr.create_index(
        "direct",
        "s",
        "",
        &format!(r#"{{"numPartitions":{partitions}}}"#),
        "kvlite",
        "i",
        "",
        PlanParams::default(),
        "",
    )
    .await
    .unwrap();
    mgr.janitor_kick("test barrier").await.unwrap();
    mgr
}

fn the_feed(mgr: &Manager) -> Arc<dyn shoal::feed::Feed> {
    mgr.feeds().into_values().next().expect("one feed")
}

#[tokio::test]
async fn test_wait_times_out_then_satisfies() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = node_with_index(dir.path(), 8).await;

    let feed = the_feed(&mgr);
    let direct = feed.as_any().downcast_ref::<DirectFeed>().unwrap();

    // Partition 7 reaches a durable seq of 100.
    direct.snapshot("7", 0, 100).await.unwrap();
    direct.update("7", b"k1", 100, b"{}").await.unwrap();

    let pindex = mgr.pindexes().into_values().next().expect("one pindex");

    // Asking for 150 with a 50ms budget runs out of time, reporting
    // the seq range observed while waiting.
    let err = pindex
        .dest
        .consistency_wait("7", "", LEVEL_AT_PLUS, 150, timeout_cancel_token(50))
        .await
        .unwrap_err();
    match err {
        Error::ConsistencyWait {
            status,
            start_end_seqs,
        } => {
            assert_eq!(status, "cancelled");
            assert_eq!(start_end_seqs["7"], (100, 100));
        }
        other => panic!("unexpected error: {other}"),
    }

    // Ingest advances durably past the floor; the same request now
    // returns immediately.
    direct.snapshot("7", 100, 200).await.unwrap();
    direct.update("7", b"k2", 200, b"{}").await.unwrap();

    pindex
        .dest
        .consistency_wait("7", "", LEVEL_AT_PLUS, 150, timeout_cancel_token(50))
        .await
        .unwrap();

    mgr.stop().await;
}

#[tokio::test]
async fn test_wait_released_by_ingest() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = node_with_index(dir.path(), 2).await;

    let pindex = mgr.pindexes().into_values().next().unwrap();
    let dest = pindex.dest.clone();

    let waiter = tokio::spawn(async move {
        dest.consistency_wait("0", "", LEVEL_AT_PLUS, 10, CancellationToken::new())
            .await
    });
    tokio::task::yield_now().await;

    let feed = the_feed(&mgr);
    let direct = feed.as_any().downcast_ref::<DirectFeed>().unwrap();
    direct.snapshot("0", 0, 10).await.unwrap();
    direct.update("0", b"k", 10, b"{}").await.unwrap();

    waiter.await.unwrap().unwrap();
    mgr.stop().await;
}

#[tokio::test]
async fn test_wait_fails_fast_on_rolled_over_partition() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = node_with_index(dir.path(), 2).await;

    let feed = the_feed(&mgr);
    let direct = feed.as_any().downcast_ref::<DirectFeed>().unwrap();
    direct
        .set_opaque("0", br#"{"uuid":"current-uuid"}"#)
        .await
        .unwrap();

    let pindex = mgr.pindexes().into_values().next().unwrap();
    let err = pindex
        .dest
        .consistency_wait(
            "0",
            "stale-uuid",
            LEVEL_AT_PLUS,
            1,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PartitionRolledOver { .. }));

    mgr.stop().await;
}

#[tokio::test]
async fn test_rollback_rebuilds_partition_from_zero() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = node_with_index(dir.path(), 2).await;

    let feed = the_feed(&mgr);
    let direct = feed.as_any().downcast_ref::<DirectFeed>().unwrap();
    direct.snapshot("0", 0, 5).await.unwrap();
    direct.update("0", b"k", 5, b"{}").await.unwrap();

    let before = mgr.pindexes().into_values().next().unwrap();
    assert_eq!(before.dest.count(CancellationToken::new()).await.unwrap(), 1);

    // Upstream rewinds; the engine wipes itself and asks for a restart.
    direct.rollback("0", 0).await.unwrap();
    mgr.janitor_kick("after rollback").await.unwrap();

    let after = mgr.pindexes().into_values().next().expect("rebuilt");
    assert_eq!(after.name, before.name);
    assert_eq!(after.dest.count(CancellationToken::new()).await.unwrap(), 0);

    mgr.stop().await;
}
