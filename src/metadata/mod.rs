//! Shared cluster metadata: versioned key/value store with subscribe
//! and compare-and-swap, plus the typed collections stored in it.
//!
//! Every node observes the same store; index definitions, node
//! definitions, and the partition plan all live under well-known keys.
//! Writers carry the CAS observed at read time; a lost CAS race is a
//! no-op, not an error.

mod defs;
mod memory;

pub use defs::{
    plan_pindex_name, HierarchyRule, IndexDef, IndexDefs, NodeDef, NodeDefs, NodePlanParam,
    PlanParams, PlanPIndex, PlanPIndexNode, PlanPIndexes,
};
pub use memory::MemMetaStore;

use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;

/// Store key for the index definitions collection.
pub const INDEX_DEFS_KEY: &str = "indexDefs";

/// Store key for the partition plan collection.
pub const PLAN_PINDEXES_KEY: &str = "planPIndexes";

/// Store key for the cluster-wide implementation version.
pub const VERSION_KEY: &str = "version";

/// The two node-definition keyspaces: nodes that have announced
/// themselves, and nodes the operator wants in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeDefsKind {
    Known,
    Wanted,
}

/// Store key for a node-definitions collection.
pub fn node_defs_key(kind: NodeDefsKind) -> &'static str {
    match kind {
        NodeDefsKind::Known => "nodeDefs-known",
        NodeDefsKind::Wanted => "nodeDefs-wanted",
    }
}

/// Notification that a key may have changed. Delivery is best-effort:
/// subscribers must tolerate duplicates and missed edges by re-reading.
#[derive(Debug, Clone)]
pub struct MetaEvent {
    pub key: String,
    pub cas: u64,
}

/// Versioned key/value store with optimistic concurrency.
///
/// Semantics: linearizable per key; `set` with cas 0 creates (fails if
/// the key exists), otherwise the cas must match the current value.
/// `del` with cas 0 is unconditional.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Fetch a value and its CAS, or None when the key is absent.
    async fn get(&self, key: &str) -> Result<Option<(Bytes, u64)>>;

    /// Write a value, returning the new CAS. `Error::CasMismatch` when
    /// the provided cas does not match the stored one.
    async fn set(&self, key: &str, val: &[u8], cas: u64) -> Result<u64>;

    /// Delete a key under CAS (0 = unconditional).
    async fn del(&self, key: &str, cas: u64) -> Result<()>;

    /// Subscribe to change events for a key.
    fn subscribe(&self, key: &str) -> broadcast::Receiver<MetaEvent>;

    /// Re-announce current state to subscribers, for stores that cache.
    async fn refresh(&self) -> Result<()>;
}

/// Errors if a stored collection was written by a newer implementation
/// than `runtime_version`.
fn gate_version(impl_version: &str, runtime_version: &str) -> Result<()> {
    if !crate::util::version_gte(runtime_version, impl_version) {
        return Err(Error::VersionTooLow {
            stored: impl_version.to_string(),
            runtime: runtime_version.to_string(),
        });
    }
    Ok(())
}

async fn get_typed<T: DeserializeOwned>(
    store: &dyn MetaStore,
    key: &str,
) -> Result<Option<(T, u64)>> {
    match store.get(key).await? {
        None => Ok(None),
        Some((buf, cas)) => {
            let v: T = serde_json::from_slice(&buf)?;
            Ok(Some((v, cas)))
        }
    }
}

async fn set_typed<T: Serialize>(
    store: &dyn MetaStore,
    key: &str,
    val: &T,
    cas: u64,
) -> Result<u64> {
    let buf = serde_json::to_vec(val)?;
    store.set(key, &buf, cas).await
}

/// Fetch the index definitions, gated against `runtime_version`.
pub async fn get_index_defs(
    store: &dyn MetaStore,
    runtime_version: &str,
) -> Result<Option<(IndexDefs, u64)>> {
    let rv: Option<(IndexDefs, u64)> = get_typed(store, INDEX_DEFS_KEY).await?;
    if let Some((defs, _)) = &rv {
        gate_version(&defs.impl_version, runtime_version)?;
    }
    Ok(rv)
}

/// Write the index definitions under CAS.
pub async fn set_index_defs(store: &dyn MetaStore, defs: &IndexDefs, cas: u64) -> Result<u64> {
    set_typed(store, INDEX_DEFS_KEY, defs, cas).await
}

/// Fetch a node-definitions collection, gated against `runtime_version`.
pub async fn get_node_defs(
    store: &dyn MetaStore,
    kind: NodeDefsKind,
    runtime_version: &str,
) -> Result<Option<(NodeDefs, u64)>> {
    let rv: Option<(NodeDefs, u64)> = get_typed(store, node_defs_key(kind)).await?;
    if let Some((defs, _)) = &rv {
        gate_version(&defs.impl_version, runtime_version)?;
    }
    Ok(rv)
}

/// Write a node-definitions collection under CAS.
pub async fn set_node_defs(
    store: &dyn MetaStore,
    kind: NodeDefsKind,
    defs: &NodeDefs,
    cas: u64,
) -> Result<u64> {
    set_typed(store, node_defs_key(kind), defs, cas).await
}

/// Fetch the partition plan, gated against `runtime_version`.
pub async fn get_plan_pindexes(
    store: &dyn MetaStore,
    runtime_version: &str,
) -> Result<Option<(PlanPIndexes, u64)>> {
    let rv: Option<(PlanPIndexes, u64)> = get_typed(store, PLAN_PINDEXES_KEY).await?;
    if let Some((plan, _)) = &rv {
        gate_version(&plan.impl_version, runtime_version)?;
    }
    Ok(rv)
}

/// Write the partition plan under CAS.
pub async fn set_plan_pindexes(
    store: &dyn MetaStore,
    plan: &PlanPIndexes,
    cas: u64,
) -> Result<u64> {
    set_typed(store, PLAN_PINDEXES_KEY, plan, cas).await
}

/// Check this runtime's version against the cluster-wide version key,
/// bumping the stored version when ours is newer. Returns false when
/// the cluster is already running a newer version than ours.
pub async fn check_version(store: &dyn MetaStore, my_version: &str) -> Result<bool> {
    loop {
        match store.get(VERSION_KEY).await? {
            Some((buf, cas)) => {
                let stored = String::from_utf8_lossy(&buf).to_string();
                if !crate::util::version_gte(my_version, &stored) {
                    return Ok(false);
                }
                if my_version == stored {
                    return Ok(true);
                }
                match store.set(VERSION_KEY, my_version.as_bytes(), cas).await {
                    Ok(_) => return Ok(true),
                    Err(Error::CasMismatch) => continue,
                    Err(e) => return Err(e),
                }
            }
            None => match store.set(VERSION_KEY, my_version.as_bytes(), 0).await {
                Ok(_) => return Ok(true),
                Err(Error::CasMismatch) => continue,
                Err(e) => return Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_check_version_first_writer() {
        let store = MemMetaStore::new();
        assert!(check_version(&store, "1.0.0").await.unwrap());
        // Same version again is fine.
        assert!(check_version(&store, "1.0.0").await.unwrap());
        // A newer runtime bumps the stored version.
        assert!(check_version(&store, "1.1.0").await.unwrap());
        // Now the older runtime is refused.
        assert!(!check_version(&store, "1.0.0").await.unwrap());
    }

    #[tokio::test]
    async fn test_typed_round_trip() {
        let store = MemMetaStore::new();
        let mut defs = IndexDefs::new("1.0.0");
        defs.index_defs.insert(
            "i".to_string(),
            IndexDef {
                name: "i".to_string(),
                uuid: "U".to_string(),
                index_type: "kvlite".to_string(),
                params: String::new(),
                source_type: "direct".to_string(),
                source_name: "s".to_string(),
                source_uuid: String::new(),
                source_params: String::new(),
                plan_params: PlanParams::default(),
            },
        );

        let cas = set_index_defs(&store, &defs, 0).await.unwrap();
        let (got, got_cas) = get_index_defs(&store, "1.0.0").await.unwrap().unwrap();
        assert_eq!(got_cas, cas);
        assert_eq!(got.index_defs.len(), 1);
        assert_eq!(got.index_defs["i"].uuid, "U");
    }

    #[tokio::test]
    async fn test_version_gate_rejects_newer_store() {
        let store = MemMetaStore::new();
        let defs = IndexDefs::new("9.0.0");
        set_index_defs(&store, &defs, 0).await.unwrap();

        let err = get_index_defs(&store, "1.0.0").await.unwrap_err();
        assert!(matches!(err, Error::VersionTooLow { .. }));
    }
}
