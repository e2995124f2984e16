//! kvlite: a lightweight, ordered key-value view engine.
//!
//! The built-in reference implementation type. Each partition instance
//! keeps an in-memory ordered store that is rebuilt from the upstream
//! feed after a restart; batch commits are delimited by snapshot
//! markers. With a `path` param the engine behaves like a secondary
//! index: the named top-level JSON field of each document becomes the
//! stored key, suffixed with the document id.

use super::consistency::{consistency_wait_done, PartitionSeqs, LEVEL_AT_PLUS};
use super::{Dest, PIndexImpl};
use crate::registry::{IndexType, RestartHandle, UpdateEffect};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// File holding the engine params inside a partition directory.
const KVLITE_META_FILENAME: &str = "KVLITE_META";

/// Separator between a secondary key and the document id.
const KEY_SEP: u8 = 0xff;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KvLiteParams {
    /// Top-level JSON field to index by. Empty means the document id
    /// itself is the stored key and the document bytes the value.
    #[serde(default)]
    pub path: String,
}

/// Query request for a kvlite index or partition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KvLiteQueryParams {
    #[serde(default)]
    pub limit: u64,
    #[serde(default)]
    pub skip: u64,
    /// Exact-match convenience over the indexed value.
    #[serde(default)]
    pub q: String,
    #[serde(default)]
    pub start_inclusive: String,
    #[serde(default)]
    pub end_exclusive: String,
}

/// One scan hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvLiteItem {
    pub key: String,
    pub val: String,
}

/// Query response envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KvLiteQueryResults {
    pub results: Vec<KvLiteItem>,
}

#[derive(Default)]
struct KvLiteState {
    closed: bool,
    /// Ordered store; secondary mode keys are `secval 0xff docid`.
    main: BTreeMap<Vec<u8>, Vec<u8>>,
    /// docid -> stored main key, secondary mode only.
    back: BTreeMap<Vec<u8>, Vec<u8>>,
    opaques: HashMap<String, Vec<u8>>,
    partitions: HashMap<String, PartitionSeqs>,
}

/// A kvlite partition instance.
pub struct KvLite {
    params: KvLiteParams,
    path: PathBuf,
    restart: RestartHandle,
    state: Mutex<KvLiteState>,
}

impl KvLite {
    fn new(params: KvLiteParams, path: PathBuf, restart: RestartHandle) -> Arc<Self> {
        Arc::new(Self {
            params,
            path,
            restart,
            state: Mutex::new(KvLiteState::default()),
        })
    }

    fn store_key(&self, key: &[u8], val: &[u8]) -> Option<Vec<u8>> {
        if self.params.path.is_empty() {
            return Some(key.to_vec());
        }
        let doc: serde_json::Value = serde_json::from_slice(val).ok()?;
        let sec = doc.get(&self.params.path)?;
        let sec = match sec {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let mut rv = sec.into_bytes();
        rv.push(KEY_SEP);
        rv.extend_from_slice(key);
        Some(rv)
    }

    fn update_seq(state: &mut KvLiteState, partition: &str, seq: u64) {
        let seqs = state.partitions.entry(partition.to_string()).or_default();
        seqs.observe(seq);
        if seq >= seqs.seq_snap_end {
            seqs.commit_batch();
        }
    }

    /// Collect matching items in key order. The whole store fits in
    /// memory, so a scan snapshot is just a filtered copy.
    pub fn scan_items(&self, p: &KvLiteQueryParams) -> Result<Vec<KvLiteItem>> {
        let (start, end) = self.scan_bounds(p);

        let state = self.state.lock();
        if state.closed {
            return Err(Error::Query("kvlite: already closed".to_string()));
        }

        let mut rv = Vec::new();
        let mut visits = 0u64;
        for (key, val) in state.main.range(start..) {
            if !end.is_empty() && key.as_slice() >= end.as_slice() {
                break;
            }
            visits += 1;
            if visits <= p.skip {
                continue;
            }
            rv.push(KvLiteItem {
                key: String::from_utf8_lossy(key).to_string(),
                val: String::from_utf8_lossy(val).to_string(),
            });
            if p.limit > 0 && (rv.len() as u64) >= p.limit {
                break;
            }
        }
        Ok(rv)
    }

    fn scan_bounds(&self, p: &KvLiteQueryParams) -> (Vec<u8>, Vec<u8>) {
        if !p.q.is_empty() {
            if self.params.path.is_empty() {
                let mut end = p.q.clone().into_bytes();
                end.push(KEY_SEP);
                return (p.q.clone().into_bytes(), end);
            }
            let mut start = p.q.clone().into_bytes();
            start.push(KEY_SEP);
            let mut end = start.clone();
            end.push(KEY_SEP);
            return (start, end);
        }
        (
            p.start_inclusive.clone().into_bytes(),
            p.end_exclusive.clone().into_bytes(),
        )
    }

    /// Number of stored entries.
    pub fn count_items(&self) -> Result<u64> {
        let state = self.state.lock();
        if state.closed {
            return Err(Error::Query("kvlite: already closed".to_string()));
        }
        Ok(state.main.len() as u64)
    }

    /// Durable seq for a partition, for tests and stats.
    pub fn seq_max_batch(&self, partition: &str) -> u64 {
        self.state
            .lock()
            .partitions
            .get(partition)
            .map(|s| s.seq_max_batch)
            .unwrap_or(0)
    }

    fn close_state(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.main.clear();
        state.back.clear();
        for seqs in state.partitions.values_mut() {
            seqs.drain_waiters(|| Error::Query("kvlite: closed".to_string()));
        }
        state.partitions.clear();
    }
}

fn parse_opaque_to_uuid(opaque: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(opaque)
        .ok()
        .and_then(|v| v.get("uuid").and_then(|u| u.as_str()).map(String::from))
        .unwrap_or_default()
}

impl PIndexImpl for KvLite {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[async_trait::async_trait]
impl Dest for KvLite {
    async fn close(&self) -> Result<()> {
        self.close_state();
        Ok(())
    }

    async fn data_update(&self, partition: &str, key: &[u8], seq: u64, val: &[u8]) -> Result<()> {
        let store_key = match self.store_key(key, val) {
            Some(k) => k,
            None => {
                // No indexed field in this document; not an error.
                tracing::debug!(
                    "kvlite: no value at path {} for key {}",
                    self.params.path,
                    String::from_utf8_lossy(key)
                );
                let mut state = self.state.lock();
                Self::update_seq(&mut state, partition, seq);
                return Ok(());
            }
        };
        let store_val = if self.params.path.is_empty() {
            val.to_vec()
        } else {
            Vec::new()
        };

        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Feed("kvlite: already closed".to_string()));
        }
        if !self.params.path.is_empty() {
            if let Some(old_key) = state.back.remove(key) {
                state.main.remove(&old_key);
            }
            state.back.insert(key.to_vec(), store_key.clone());
        }
        state.main.insert(store_key, store_val);
        Self::update_seq(&mut state, partition, seq);
        Ok(())
    }

    async fn data_delete(&self, partition: &str, key: &[u8], seq: u64) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Feed("kvlite: already closed".to_string()));
        }
        if self.params.path.is_empty() {
            state.main.remove(key);
        } else if let Some(old_key) = state.back.remove(key) {
            state.main.remove(&old_key);
        }
        Self::update_seq(&mut state, partition, seq);
        Ok(())
    }

    async fn snapshot_start(&self, partition: &str, _snap_start: u64, snap_end: u64) -> Result<()> {
        let mut state = self.state.lock();
        let seqs = state.partitions.entry(partition.to_string()).or_default();
        seqs.commit_batch();
        seqs.seq_snap_end = snap_end;
        Ok(())
    }

    async fn opaque_get(&self, partition: &str) -> Result<(Vec<u8>, u64)> {
        let mut state = self.state.lock();
        let opaque = state.opaques.get(partition).cloned().unwrap_or_default();
        let uuid = parse_opaque_to_uuid(&opaque);
        let seqs = state.partitions.entry(partition.to_string()).or_default();
        seqs.last_uuid = uuid;
        Ok((opaque, seqs.seq_max))
    }

    async fn opaque_set(&self, partition: &str, value: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let uuid = parse_opaque_to_uuid(value);
        state.opaques.insert(partition.to_string(), value.to_vec());
        state
            .partitions
            .entry(partition.to_string())
            .or_default()
            .last_uuid = uuid;
        Ok(())
    }

    async fn rollback(&self, partition: &str, rollback_seq: u64) -> Result<()> {
        tracing::warn!(
            "kvlite: rollback, partition: {}, rollback seq: {}",
            partition,
            rollback_seq
        );

        // All partitions share one store, so any rollback is a rollback
        // to zero of the whole instance: drain waiters, wipe the files,
        // and let the janitor rebuild from scratch.
        {
            let mut state = self.state.lock();
            for seqs in state.partitions.values_mut() {
                seqs.drain_waiters(|| Error::Rollback {
                    partition: partition.to_string(),
                    rollback_seq,
                });
            }
            state.closed = true;
            state.main.clear();
            state.back.clear();
            state.partitions.clear();
        }

        let _ = tokio::fs::remove_dir_all(&self.path).await;

        (self.restart)();
        Ok(())
    }

    async fn consistency_wait(
        &self,
        partition: &str,
        partition_uuid: &str,
        level: &str,
        seq: u64,
        cancel: CancellationToken,
    ) -> Result<()> {
        if level.is_empty() {
            return Ok(());
        }
        if level != LEVEL_AT_PLUS {
            return Err(Error::UnsupportedConsistencyLevel(level.to_string()));
        }

        let rx = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::Query("kvlite: already closed".to_string()));
            }
            let seqs = state.partitions.entry(partition.to_string()).or_default();
            match seqs.submit_wait(partition, partition_uuid, seq)? {
                None => return Ok(()),
                Some(rx) => rx,
            }
        };

        consistency_wait_done(partition, cancel, rx, || {
            self.state
                .lock()
                .partitions
                .get(partition)
                .map(|s| s.seq_max_batch)
                .unwrap_or(0)
        })
        .await
    }

    async fn count(&self, _cancel: CancellationToken) -> Result<u64> {
        self.count_items()
    }

    async fn query(&self, req: &[u8], _cancel: CancellationToken) -> Result<Vec<u8>> {
        let params: KvLiteQueryParams = serde_json::from_slice(req)?;
        let results = self.scan_items(&params)?;
        Ok(serde_json::to_vec(&KvLiteQueryResults { results })?)
    }
}

/// The registered "kvlite" implementation type.
pub struct KvLiteIndexType;

fn parse_params(index_params: &str) -> Result<KvLiteParams> {
    if index_params.is_empty() {
        return Ok(KvLiteParams::default());
    }
    Ok(serde_json::from_str(index_params)?)
}

#[async_trait::async_trait]
impl IndexType for KvLiteIndexType {
    fn description(&self) -> &str {
        "general/kvlite - lightweight, ordered key-value view index"
    }

    fn validate(&self, _index_name: &str, index_params: &str) -> Result<()> {
        parse_params(index_params).map(|_| ())
    }

    async fn new_pindex(
        &self,
        index_params: &str,
        path: &Path,
        restart: RestartHandle,
    ) -> Result<(Arc<dyn PIndexImpl>, Arc<dyn Dest>)> {
        let params = parse_params(index_params)?;
        tokio::fs::write(path.join(KVLITE_META_FILENAME), index_params.as_bytes()).await?;
        let kvlite = KvLite::new(params, path.to_path_buf(), restart);
        let impl_handle: Arc<dyn PIndexImpl> = kvlite.clone();
        let dest: Arc<dyn Dest> = kvlite;
        Ok((impl_handle, dest))
    }

    async fn open_pindex(
        &self,
        path: &Path,
        restart: RestartHandle,
    ) -> Result<(Arc<dyn PIndexImpl>, Arc<dyn Dest>)> {
        let buf = tokio::fs::read(path.join(KVLITE_META_FILENAME)).await?;
        let params = parse_params(&String::from_utf8_lossy(&buf))?;
        let kvlite = KvLite::new(params, path.to_path_buf(), restart);
        let impl_handle: Arc<dyn PIndexImpl> = kvlite.clone();
        let dest: Arc<dyn Dest> = kvlite;
        Ok((impl_handle, dest))
    }

    async fn open_pindex_using(
        &self,
        path: &Path,
        index_params: &str,
        restart: RestartHandle,
    ) -> Result<(Arc<dyn PIndexImpl>, Arc<dyn Dest>)> {
        let params = parse_params(index_params)?;
        tokio::fs::write(path.join(KVLITE_META_FILENAME), index_params.as_bytes()).await?;
        let kvlite = KvLite::new(params, path.to_path_buf(), restart);
        let impl_handle: Arc<dyn PIndexImpl> = kvlite.clone();
        let dest: Arc<dyn Dest> = kvlite;
        Ok((impl_handle, dest))
    }

    fn analyze_index_def_updates(
        &self,
        cur: &crate::metadata::IndexDef,
        prev: &crate::metadata::IndexDef,
    ) -> UpdateEffect {
        // The store is rebuilt from the feed either way; a params-only
        // change can reopen in place.
        if cur.name == prev.name
            && cur.source_type == prev.source_type
            && cur.source_name == prev.source_name
            && cur.source_uuid == prev.source_uuid
            && cur.source_params == prev.source_params
        {
            return UpdateEffect::Restart;
        }
        UpdateEffect::Rebuild
    }

    async fn count(
        &self,
        mgr: &crate::manager::Manager,
        index_name: &str,
        index_uuid: &str,
    ) -> Result<u64> {
        crate::query::count_index(mgr, index_name, index_uuid).await
    }

    async fn query(
        &self,
        mgr: &crate::manager::Manager,
        index_name: &str,
        index_uuid: &str,
        req: &[u8],
    ) -> Result<Vec<u8>> {
        crate::query::query_index(mgr, index_name, index_uuid, req).await
    }
}

/// Register the "kvlite" type; invoked from `register_builtin_types`.
pub fn register() {
    crate::registry::register_index_type("kvlite", Arc::new(KvLiteIndexType));
}
