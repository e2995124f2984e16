//! In-memory metadata store for development, testing, and single-node
//! deployments.

use super::{MetaEvent, MetaStore};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
struct MemEntry {
    val: Bytes,
    cas: u64,
}

/// In-memory [`MetaStore`] with per-key CAS and best-effort change
/// events over a broadcast channel per subscribed key.
pub struct MemMetaStore {
    entries: DashMap<String, MemEntry>,
    subscribers: DashMap<String, broadcast::Sender<MetaEvent>>,
    next_cas: AtomicU64,
}

impl MemMetaStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            subscribers: DashMap::new(),
            next_cas: AtomicU64::new(1),
        }
    }

    fn fire(&self, key: &str, cas: u64) {
        if let Some(tx) = self.subscribers.get(key) {
            // Nobody listening is fine; receivers that lag just re-read.
            let _ = tx.send(MetaEvent {
                key: key.to_string(),
                cas,
            });
        }
    }
}

impl Default for MemMetaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetaStore for MemMetaStore {
    async fn get(&self, key: &str) -> Result<Option<(Bytes, u64)>> {
        Ok(self
            .entries
            .get(key)
            .map(|e| (e.val.clone(), e.cas)))
    }

    async fn set(&self, key: &str, val: &[u8], cas: u64) -> Result<u64> {
        let new_cas = self.next_cas.fetch_add(1, Ordering::Relaxed);

        // The dashmap entry guard serializes concurrent writers per key.
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occ) => {
                if cas == 0 || occ.get().cas != cas {
                    return Err(Error::CasMismatch);
                }
                occ.insert(MemEntry {
                    val: Bytes::copy_from_slice(val),
                    cas: new_cas,
                });
            }
            dashmap::mapref::entry::Entry::Vacant(vac) => {
                if cas != 0 {
                    return Err(Error::CasMismatch);
                }
                vac.insert(MemEntry {
                    val: Bytes::copy_from_slice(val),
                    cas: new_cas,
                });
            }
        }

        self.fire(key, new_cas);
        Ok(new_cas)
    }

    async fn del(&self, key: &str, cas: u64) -> Result<()> {
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(occ) => {
                if cas != 0 && occ.get().cas != cas {
                    return Err(Error::CasMismatch);
                }
                occ.remove();
            }
            dashmap::mapref::entry::Entry::Vacant(_) => {
                if cas != 0 {
                    return Err(Error::CasMismatch);
                }
            }
        }
        self.fire(key, 0);
        Ok(())
    }

    fn subscribe(&self, key: &str) -> broadcast::Receiver<MetaEvent> {
        self.subscribers
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .subscribe()
    }

    async fn refresh(&self) -> Result<()> {
        for sub in self.subscribers.iter() {
            let cas = self.entries.get(sub.key()).map(|e| e.cas).unwrap_or(0);
            let _ = sub.value().send(MetaEvent {
                key: sub.key().clone(),
                cas,
            });
        }
        Ok(())
    }
}
