//! Upstream data-source feeds.
//!
//! A feed subscribes to one upstream source on behalf of the local
//! partition instances of one index, delivering ordered per-partition
//! mutation records into their destinations. Source types register
//! partition discovery and feed construction; upstream connections are
//! shared through a process-wide keyed agent pool.

mod direct;

pub use direct::{DirectFeed, DirectSourceType};

use crate::pindex::Dest;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// A running subscription delivering mutations into local partitions.
#[async_trait::async_trait]
pub trait Feed: Send + Sync {
    fn name(&self) -> &str;

    fn index_name(&self) -> &str;

    /// Begin delivering records to the registered destinations.
    async fn start(&self) -> Result<()>;

    /// Stop delivery; destinations stay open, owned by their pindexes.
    async fn close(&self) -> Result<()>;

    /// Partition -> destination wiring, for diagnostics.
    fn partitions(&self) -> Vec<String>;

    fn as_any(&self) -> &dyn Any;
}

/// A registered upstream source kind: partition discovery plus feed
/// construction.
#[async_trait::async_trait]
pub trait SourceType: Send + Sync {
    fn description(&self) -> &str;

    /// The ordered list of source partitions (e.g. vBucket IDs).
    async fn partitions(
        &self,
        source_name: &str,
        source_uuid: &str,
        source_params: &str,
    ) -> Result<Vec<String>>;

    /// Build a feed delivering the given partitions into `dests`.
    async fn new_feed(
        &self,
        feed_name: &str,
        index_name: &str,
        source_name: &str,
        source_uuid: &str,
        source_params: &str,
        dests: HashMap<String, Arc<dyn Dest>>,
    ) -> Result<Arc<dyn Feed>>;
}

fn source_table() -> &'static RwLock<HashMap<String, Arc<dyn SourceType>>> {
    static TABLE: OnceLock<RwLock<HashMap<String, Arc<dyn SourceType>>>> = OnceLock::new();
    TABLE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a source type. Init-time only.
pub fn register_source_type(tag: &str, t: Arc<dyn SourceType>) {
    source_table().write().insert(tag.to_string(), t);
}

/// Look up a registered source type by tag.
pub fn source_type(tag: &str) -> Option<Arc<dyn SourceType>> {
    source_table().read().get(tag).cloned()
}

/// Register the built-in "direct" source type.
pub fn register_builtin_sources() {
    register_source_type("direct", Arc::new(DirectSourceType));
}

/// Discover the ordered source partitions for an index's data source.
pub async fn source_partitions(
    source_type_tag: &str,
    source_name: &str,
    source_uuid: &str,
    source_params: &str,
) -> Result<Vec<String>> {
    let t = source_type(source_type_tag)
        .ok_or_else(|| Error::Feed(format!("unknown source type: {source_type_tag}")))?;
    t.partitions(source_name, source_uuid, source_params).await
}

/// Deterministic feed name for one index's local partition subset. A
/// subset change yields a new name, which is what forces the janitor to
/// rebuild the feed.
pub fn feed_name(index_name: &str, index_uuid: &str, partitions_joined: &str) -> String {
    let mut h = crc32fast::Hasher::new();
    h.update(partitions_joined.as_bytes());
    format!("{}_{}_{:x}", index_name, index_uuid, h.finalize())
}

/// A shared connection handle to one upstream source.
pub struct SourceAgent {
    pub source_name: String,
    pub source_uuid: String,
    closed: AtomicBool,
}

impl SourceAgent {
    fn new(source_name: &str, source_uuid: &str) -> Arc<Self> {
        Arc::new(Self {
            source_name: source_name.to_string(),
            source_uuid: source_uuid.to_string(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Process-wide pool of upstream agents, keyed by `source:uuid`.
/// Closing an agent happens asynchronously, after removal from the map,
/// so a slow teardown never blocks feed reconciliation.
pub struct AgentPool {
    entries: Mutex<HashMap<String, Arc<SourceAgent>>>,
}

impl AgentPool {
    fn key(source_name: &str, source_uuid: &str) -> String {
        format!("{source_name}:{source_uuid}")
    }

    /// Fetch the agent for a source, creating it on first use.
    pub fn fetch_agent(&self, source_name: &str, source_uuid: &str) -> Arc<SourceAgent> {
        let mut entries = self.entries.lock();
        entries
            .entry(Self::key(source_name, source_uuid))
            .or_insert_with(|| SourceAgent::new(source_name, source_uuid))
            .clone()
    }

    /// Drop the agent for a source and close it in the background.
    pub fn close_agent(&self, source_name: &str, source_uuid: &str) {
        let removed = self
            .entries
            .lock()
            .remove(&Self::key(source_name, source_uuid));
        if let Some(agent) = removed {
            tokio::spawn(async move { agent.close().await });
        }
    }

    /// Number of live agents, for stats.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// The process-wide agent pool.
pub fn agent_pool() -> &'static AgentPool {
    static POOL: OnceLock<AgentPool> = OnceLock::new();
    POOL.get_or_init(|| AgentPool {
        entries: Mutex::new(HashMap::new()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_name_changes_with_subset() {
        let a = feed_name("i", "U", "0,1,2");
        let b = feed_name("i", "U", "0,1,2");
        let c = feed_name("i", "U", "0,1");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_agent_pool_shares_and_closes() {
        let pool = agent_pool();
        let a1 = pool.fetch_agent("bucket-pool-test", "u1");
        let a2 = pool.fetch_agent("bucket-pool-test", "u1");
        assert!(Arc::ptr_eq(&a1, &a2));

        pool.close_agent("bucket-pool-test", "u1");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(a1.is_closed());

        // A fresh fetch after close builds a new agent.
        let a3 = pool.fetch_agent("bucket-pool-test", "u1");
        assert!(!Arc::ptr_eq(&a1, &a3));
        pool.close_agent("bucket-pool-test", "u1");
    }
}
