//! Consistency waits: gate queries on per-partition ingest progress.
//!
//! Each live partition tracks the highest seq observed (`seq_max`) and
//! the highest seq known durable (`seq_max_batch`). An "at_plus" wait
//! parks on a min-heap keyed by seq until a batch commit advances
//! `seq_max_batch` past it.

use crate::pindex::{Dest, PIndex};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Consistency level requiring a per-partition floor on durable seqs.
pub const LEVEL_AT_PLUS: &str = "at_plus";

/// Keyed by "partition" or "partition/partitionUUID"; value is the
/// requested seq floor.
pub type ConsistencyVector = HashMap<String, u64>;

/// Consistency requirements of a client's request. An empty level means
/// stale reads are acceptable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsistencyParams {
    #[serde(default)]
    pub level: String,
    /// Keyed by index name.
    #[serde(default)]
    pub vectors: HashMap<String, ConsistencyVector>,
}

struct Waiter {
    seq: u64,
    done: oneshot::Sender<Result<()>>,
}

// Min-heap by seq on top of std's max-heap.
impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        other.seq.cmp(&self.seq)
    }
}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Waiter {}

/// Per-partition ingest progress plus parked waiters. Owned by an
/// engine instance and mutated under that engine's lock.
#[derive(Default)]
pub struct PartitionSeqs {
    /// Highest seq observed from the feed.
    pub seq_max: u64,
    /// Highest seq known durable; advances only at batch end, and never
    /// decreases except through rollback.
    pub seq_max_batch: u64,
    /// End seq of the current snapshot batch.
    pub seq_snap_end: u64,
    /// Partition identity as reported by the upstream.
    pub last_uuid: String,
    waiters: BinaryHeap<Waiter>,
}

impl PartitionSeqs {
    /// Record an observed mutation seq.
    pub fn observe(&mut self, seq: u64) {
        if seq > self.seq_max {
            self.seq_max = seq;
        }
    }

    /// Mark everything observed so far durable and release satisfied
    /// waiters.
    pub fn commit_batch(&mut self) {
        self.seq_max_batch = self.seq_max;
        while let Some(top) = self.waiters.peek() {
            if top.seq > self.seq_max_batch {
                break;
            }
            if let Some(w) = self.waiters.pop() {
                let _ = w.done.send(Ok(()));
            }
        }
    }

    /// Decide a wait request under the engine lock: satisfied now,
    /// refused, or parked.
    pub fn submit_wait(
        &mut self,
        partition: &str,
        partition_uuid: &str,
        seq: u64,
    ) -> Result<Option<oneshot::Receiver<Result<()>>>> {
        if !partition_uuid.is_empty() && partition_uuid != self.last_uuid {
            return Err(Error::PartitionRolledOver {
                partition: partition.to_string(),
                expected: partition_uuid.to_string(),
                current: self.last_uuid.clone(),
            });
        }
        if seq <= self.seq_max_batch {
            return Ok(None);
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.push(Waiter { seq, done: tx });
        Ok(Some(rx))
    }

    /// Fail every parked waiter, for partition close or rollback.
    pub fn drain_waiters(&mut self, mut err: impl FnMut() -> Error) {
        while let Some(w) = self.waiters.pop() {
            let _ = w.done.send(Err(err()));
        }
    }

    /// Number of parked waiters, for stats.
    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }
}

/// Wait for a parked request to release, or for the cancel token. On
/// cancel the error carries the (start, end) seq pair observed around
/// the wait.
pub async fn consistency_wait_done(
    partition: &str,
    cancel: CancellationToken,
    rx: oneshot::Receiver<Result<()>>,
    curr_seq: impl Fn() -> u64,
) -> Result<()> {
    let seq_start = curr_seq();

    tokio::select! {
        _ = cancel.cancelled() => {
            let mut start_end_seqs = HashMap::new();
            start_end_seqs.insert(partition.to_string(), (seq_start, curr_seq()));
            Err(Error::ConsistencyWait {
                status: "cancelled".to_string(),
                start_end_seqs,
            })
        }
        outcome = rx => match outcome {
            Ok(rv) => rv,
            // Sender dropped without an answer: the partition went away.
            Err(_) => Err(Error::Cancelled),
        }
    }
}

/// Wait for the named partitions of one destination to reach the seqs
/// the vector requests. Vector keys look like "partition" or
/// "partition/partitionUUID"; entries for partitions this destination
/// does not serve are ignored.
pub async fn consistency_wait_partitions(
    dest: &Arc<dyn Dest>,
    partitions: &std::collections::HashSet<String>,
    level: &str,
    vector: &ConsistencyVector,
    cancel: CancellationToken,
) -> Result<()> {
    for (key, &seq) in vector {
        if seq == 0 {
            continue;
        }
        let (partition, partition_uuid) = match key.split_once('/') {
            Some((p, u)) => (p, u),
            None => (key.as_str(), ""),
        };
        if !partitions.contains(partition) {
            continue;
        }
        dest.consistency_wait(partition, partition_uuid, level, seq, cancel.clone())
            .await?;
    }
    Ok(())
}

/// Wait, in parallel, for all partitions across a group of local
/// pindexes to reach the consistency the request names for
/// `index_name`. The first error wins and aborts the rest.
pub async fn consistency_wait_group(
    index_name: &str,
    params: Option<&ConsistencyParams>,
    cancel: CancellationToken,
    local_pindexes: &[Arc<PIndex>],
) -> Result<()> {
    let (level, vector) = match params {
        Some(p) if !p.level.is_empty() => match p.vectors.get(index_name) {
            Some(v) => (p.level.as_str(), v),
            None => return Ok(()),
        },
        _ => return Ok(()),
    };

    let waits = local_pindexes.iter().map(|pindex| {
        let cancel = cancel.clone();
        async move {
            consistency_wait_partitions(
                &pindex.dest,
                &pindex.source_partitions_set,
                level,
                vector,
                cancel,
            )
            .await
        }
    });

    futures::future::try_join_all(waits).await?;

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_wait_satisfied_now() {
        let mut seqs = PartitionSeqs::default();
        seqs.observe(10);
        seqs.commit_batch();

        assert!(seqs.submit_wait("p", "", 5).unwrap().is_none());
        assert!(seqs.submit_wait("p", "", 10).unwrap().is_none());
        assert!(seqs.submit_wait("p", "", 11).unwrap().is_some());
    }

    #[test]
    fn test_submit_wait_uuid_mismatch() {
        let mut seqs = PartitionSeqs {
            last_uuid: "abc".to_string(),
            ..Default::default()
        };
        assert!(seqs.submit_wait("p", "abc", 1).is_ok());
        let err = seqs.submit_wait("p", "xyz", 1).unwrap_err();
        assert!(matches!(err, Error::PartitionRolledOver { .. }));
    }

    #[tokio::test]
    async fn test_commit_batch_releases_in_seq_order() {
        let mut seqs = PartitionSeqs::default();

        let mut rx_150 = seqs.submit_wait("p", "", 150).unwrap().unwrap();
        let mut rx_120 = seqs.submit_wait("p", "", 120).unwrap().unwrap();

        seqs.observe(120);
        seqs.commit_batch();
        assert!(rx_120.try_recv().unwrap().is_ok());
        assert!(rx_150.try_recv().is_err()); // Still parked.

        seqs.observe(200);
        seqs.commit_batch();
        assert!(rx_150.try_recv().unwrap().is_ok());
        assert_eq!(seqs.waiter_count(), 0);
    }

    #[tokio::test]
    async fn test_drain_waiters_fails_pending() {
        let mut seqs = PartitionSeqs::default();
        let mut rx = seqs.submit_wait("p", "", 99).unwrap().unwrap();

        seqs.drain_waiters(|| Error::Rollback {
            partition: "p".to_string(),
            rollback_seq: 0,
        });

        match rx.try_recv().unwrap() {
            Err(Error::Rollback { .. }) => {}
            other => panic!("expected rollback error, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_wait_done_cancelled_reports_seqs() {
        let mut seqs = PartitionSeqs::default();
        seqs.observe(100);
        seqs.commit_batch();

        let rx = seqs.submit_wait("vb7", "", 150).unwrap().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = consistency_wait_done("vb7", cancel, rx, || 100)
            .await
            .unwrap_err();
        match err {
            Error::ConsistencyWait {
                status,
                start_end_seqs,
            } => {
                assert_eq!(status, "cancelled");
                assert_eq!(start_end_seqs["vb7"], (100, 100));
            }
            other => panic!("unexpected: {other}"),
        }
    }
}
