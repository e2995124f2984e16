//! The "direct" source type: an in-process push feed.
//!
//! Suited to embedded deployments and tests, where the application
//! itself produces the mutation stream. Source params declare the
//! partition count; callers push records through the feed handle, which
//! routes each record to the destination serving that partition.

use super::{agent_pool, Feed, SourceType};
use crate::pindex::Dest;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Params for a "direct" data source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectSourceParams {
    #[serde(default = "default_num_partitions")]
    pub num_partitions: usize,
}

fn default_num_partitions() -> usize {
    1
}

impl Default for DirectSourceParams {
    fn default() -> Self {
        Self {
            num_partitions: default_num_partitions(),
        }
    }
}

fn parse_params(source_params: &str) -> Result<DirectSourceParams> {
    if source_params.is_empty() {
        return Ok(DirectSourceParams::default());
    }
    Ok(serde_json::from_str(source_params)?)
}

/// The registered "direct" source type.
pub struct DirectSourceType;

#[async_trait::async_trait]
impl SourceType for DirectSourceType {
    fn description(&self) -> &str {
        "general/direct - mutations pushed by the application in process"
    }

    async fn partitions(
        &self,
        source_name: &str,
        source_uuid: &str,
        source_params: &str,
    ) -> Result<Vec<String>> {
        // Keeps the shared upstream handle warm, the same path a
        // networked source would take.
        let _agent = agent_pool().fetch_agent(source_name, source_uuid);

        let params = parse_params(source_params)?;
        Ok((0..params.num_partitions).map(|i| i.to_string()).collect())
    }

    async fn new_feed(
        &self,
        feed_name: &str,
        index_name: &str,
        _source_name: &str,
        _source_uuid: &str,
        _source_params: &str,
        dests: HashMap<String, Arc<dyn Dest>>,
    ) -> Result<Arc<dyn Feed>> {
        Ok(Arc::new(DirectFeed {
            name: feed_name.to_string(),
            index_name: index_name.to_string(),
            dests,
            running: AtomicBool::new(false),
        }))
    }
}

/// An in-process push feed.
pub struct DirectFeed {
    name: String,
    index_name: String,
    dests: HashMap<String, Arc<dyn Dest>>,
    running: AtomicBool,
}

impl DirectFeed {
    fn dest(&self, partition: &str) -> Result<&Arc<dyn Dest>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::Feed(format!("feed not running: {}", self.name)));
        }
        self.dests.get(partition).ok_or_else(|| {
            Error::Feed(format!(
                "feed {} does not serve partition {}",
                self.name, partition
            ))
        })
    }

    /// Push a document update into a partition.
    pub async fn update(&self, partition: &str, key: &[u8], seq: u64, val: &[u8]) -> Result<()> {
        self.dest(partition)?
            .data_update(partition, key, seq, val)
            .await
    }

    /// Push a document deletion into a partition.
    pub async fn delete(&self, partition: &str, key: &[u8], seq: u64) -> Result<()> {
        self.dest(partition)?.data_delete(partition, key, seq).await
    }

    /// Push a snapshot marker, delimiting a commit batch.
    pub async fn snapshot(&self, partition: &str, snap_start: u64, snap_end: u64) -> Result<()> {
        self.dest(partition)?
            .snapshot_start(partition, snap_start, snap_end)
            .await
    }

    /// Announce the upstream partition identity (opaque blob).
    pub async fn set_opaque(&self, partition: &str, value: &[u8]) -> Result<()> {
        self.dest(partition)?.opaque_set(partition, value).await
    }

    /// Push an upstream rollback.
    pub async fn rollback(&self, partition: &str, rollback_seq: u64) -> Result<()> {
        self.dest(partition)?
            .rollback(partition, rollback_seq)
            .await
    }
}

#[async_trait::async_trait]
impl Feed for DirectFeed {
    fn name(&self) -> &str {
        &self.name
    }

    fn index_name(&self) -> &str {
        &self.index_name
    }

    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        tracing::debug!("feed started: {}", self.name);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        tracing::debug!("feed closed: {}", self.name);
        Ok(())
    }

    fn partitions(&self) -> Vec<String> {
        let mut rv: Vec<String> = self.dests.keys().cloned().collect();
        rv.sort();
        rv
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    /// Records the mutations a feed delivers.
    #[derive(Default)]
    struct RecordingDest {
        updates: Mutex<Vec<(String, Vec<u8>, u64)>>,
        snapshots: Mutex<Vec<(String, u64, u64)>>,
    }

    #[async_trait::async_trait]
    impl Dest for RecordingDest {
        async fn close(&self) -> Result<()> {
            Ok(())
        }
        async fn data_update(
            &self,
            partition: &str,
            key: &[u8],
            seq: u64,
            _val: &[u8],
        ) -> Result<()> {
            self.updates
                .lock()
                .push((partition.to_string(), key.to_vec(), seq));
            Ok(())
        }
        async fn data_delete(&self, partition: &str, key: &[u8], seq: u64) -> Result<()> {
            self.updates
                .lock()
                .push((partition.to_string(), key.to_vec(), seq));
            Ok(())
        }
        async fn snapshot_start(
            &self,
            partition: &str,
            snap_start: u64,
            snap_end: u64,
        ) -> Result<()> {
            self.snapshots
                .lock()
                .push((partition.to_string(), snap_start, snap_end));
            Ok(())
        }
        async fn opaque_get(&self, _partition: &str) -> Result<(Vec<u8>, u64)> {
            Ok((Vec::new(), 0))
        }
        async fn opaque_set(&self, _partition: &str, _value: &[u8]) -> Result<()> {
            Ok(())
        }
        async fn rollback(&self, _partition: &str, _rollback_seq: u64) -> Result<()> {
            Ok(())
        }
        async fn consistency_wait(
            &self,
            _partition: &str,
            _partition_uuid: &str,
            _level: &str,
            _seq: u64,
            _cancel: CancellationToken,
        ) -> Result<()> {
            Ok(())
        }
        async fn count(&self, _cancel: CancellationToken) -> Result<u64> {
            Ok(0)
        }
        async fn query(&self, _req: &[u8], _cancel: CancellationToken) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_feed_routes_by_partition() {
        let d0 = Arc::new(RecordingDest::default());
        let d1 = Arc::new(RecordingDest::default());
        let mut dests: HashMap<String, Arc<dyn Dest>> = HashMap::new();
        dests.insert("0".to_string(), d0.clone());
        dests.insert("1".to_string(), d1.clone());

        let t = DirectSourceType;
        let feed = t.new_feed("f", "i", "s", "", "", dests).await.unwrap();
        feed.start().await.unwrap();
        let direct = feed.as_any().downcast_ref::<DirectFeed>().unwrap();

        direct.update("0", b"a", 1, b"{}").await.unwrap();
        direct.update("1", b"b", 2, b"{}").await.unwrap();
        direct.snapshot("1", 0, 10).await.unwrap();

        assert_eq!(d0.updates.lock().len(), 1);
        assert_eq!(d1.updates.lock().len(), 1);
        assert_eq!(d1.snapshots.lock()[0], ("1".to_string(), 0, 10));
        assert_eq!(feed.partitions(), vec!["0", "1"]);
    }

    #[tokio::test]
    async fn test_partitions_from_params() {
        let t = DirectSourceType;
        let partitions = t
            .partitions("s", "", r#"{"numPartitions":3}"#)
            .await
            .unwrap();
        assert_eq!(partitions, vec!["0", "1", "2"]);

        let default = t.partitions("s", "", "").await.unwrap();
        assert_eq!(default, vec!["0"]);
    }

    #[tokio::test]
    async fn test_feed_refuses_when_not_started() {
        let t = DirectSourceType;
        let feed = t
            .new_feed("f", "i", "s", "", "", HashMap::new())
            .await
            .unwrap();
        let direct = feed.as_any().downcast_ref::<DirectFeed>().unwrap();

        let err = direct.update("0", b"k", 1, b"{}").await.unwrap_err();
        assert!(matches!(err, Error::Feed(_)));
    }

    #[tokio::test]
    async fn test_feed_refuses_unknown_partition() {
        let t = DirectSourceType;
        let feed = t
            .new_feed("f", "i", "s", "", "", HashMap::new())
            .await
            .unwrap();
        feed.start().await.unwrap();
        let direct = feed.as_any().downcast_ref::<DirectFeed>().unwrap();

        let err = direct.update("7", b"k", 1, b"{}").await.unwrap_err();
        assert!(matches!(err, Error::Feed(_)));
    }
}
