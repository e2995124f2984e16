//! Local physical index partitions.
//!
//! A `PIndex` is the live, on-node instance of one `PlanPIndex`: an
//! engine handle plus the destination that receives feed mutations. Its
//! identity is persisted in a `PINDEX_META` file inside the partition's
//! directory so the instance can be reconstituted after restart.

pub mod consistency;
pub mod kvlite;

use crate::registry::{index_type, RestartHandle};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// File holding the JSON-serialized partition identity.
pub const PINDEX_META_FILENAME: &str = "PINDEX_META";

const PINDEX_PATH_SUFFIX: &str = ".pindex";

/// Engine-specific partition implementation handle. Opaque to the core;
/// query paths downcast through `as_any` when they need the concrete
/// engine.
pub trait PIndexImpl: Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// Destination callbacks a feed drives for one partition set, plus the
/// consistency and query surface the core consumes.
///
/// Mutation ordering within one partition is the upstream feed order;
/// snapshot markers delimit commit batches.
#[async_trait::async_trait]
pub trait Dest: Send + Sync {
    /// Stop the destination, draining any pending consistency waiters.
    async fn close(&self) -> Result<()>;

    async fn data_update(&self, partition: &str, key: &[u8], seq: u64, val: &[u8]) -> Result<()>;

    async fn data_delete(&self, partition: &str, key: &[u8], seq: u64) -> Result<()>;

    /// Marks the start of a snapshot covering seqs up to `snap_end`;
    /// the previous batch becomes durable here.
    async fn snapshot_start(&self, partition: &str, snap_start: u64, snap_end: u64) -> Result<()>;

    /// Fetch the stored upstream opaque blob and the max seq seen.
    async fn opaque_get(&self, partition: &str) -> Result<(Vec<u8>, u64)>;

    /// Store the upstream opaque blob (carries the partition UUID).
    async fn opaque_set(&self, partition: &str, value: &[u8]) -> Result<()>;

    /// Upstream history diverged; rewind to `rollback_seq` or rebuild.
    async fn rollback(&self, partition: &str, rollback_seq: u64) -> Result<()>;

    /// Block until the partition's durable seq reaches `seq` under the
    /// given consistency level, or the token fires.
    async fn consistency_wait(
        &self,
        partition: &str,
        partition_uuid: &str,
        level: &str,
        seq: u64,
        cancel: CancellationToken,
    ) -> Result<()>;

    async fn count(&self, cancel: CancellationToken) -> Result<u64>;

    async fn query(&self, req: &[u8], cancel: CancellationToken) -> Result<Vec<u8>>;
}

/// Identity fields persisted in `PINDEX_META`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PIndexMeta {
    name: String,
    uuid: String,
    index_type: String,
    index_name: String,
    index_uuid: String,
    #[serde(default)]
    index_params: String,
    source_type: String,
    source_name: String,
    #[serde(default)]
    source_uuid: String,
    #[serde(default)]
    source_params: String,
    source_partitions: String,
}

/// A live physical index partition on this node.
pub struct PIndex {
    pub name: String,
    pub uuid: String,
    /// Fresh per process-lifetime instance; distinguishes a rebuilt
    /// instance from its predecessor even when the plan UUID is
    /// unchanged, which is what forces feed rewiring.
    pub instance_id: String,
    pub index_type: String,
    pub index_name: String,
    pub index_uuid: String,
    pub index_params: String,
    pub source_type: String,
    pub source_name: String,
    pub source_uuid: String,
    pub source_params: String,
    /// Comma-joined source partitions this instance serves.
    pub source_partitions: String,
    /// Same list as a set, for membership checks on the query path.
    pub source_partitions_set: HashSet<String>,
    pub path: PathBuf,
    pub impl_handle: Arc<dyn PIndexImpl>,
    pub dest: Arc<dyn Dest>,
}

impl std::fmt::Debug for PIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PIndex")
            .field("name", &self.name)
            .field("uuid", &self.uuid)
            .field("index_name", &self.index_name)
            .field("source_partitions", &self.source_partitions)
            .finish()
    }
}

impl PIndex {
    fn from_meta(
        meta: PIndexMeta,
        path: PathBuf,
        impl_handle: Arc<dyn PIndexImpl>,
        dest: Arc<dyn Dest>,
    ) -> Self {
        let source_partitions_set = if meta.source_partitions.is_empty() {
            HashSet::new()
        } else {
            meta.source_partitions
                .split(',')
                .map(|s| s.to_string())
                .collect()
        };
        Self {
            name: meta.name,
            uuid: meta.uuid,
            instance_id: crate::util::new_uuid(),
            index_type: meta.index_type,
            index_name: meta.index_name,
            index_uuid: meta.index_uuid,
            index_params: meta.index_params,
            source_type: meta.source_type,
            source_name: meta.source_name,
            source_uuid: meta.source_uuid,
            source_params: meta.source_params,
            source_partitions: meta.source_partitions,
            source_partitions_set,
            path,
            impl_handle,
            dest,
        }
    }
}

/// Directory path for a partition: `<dataDir>/<pindexName>.pindex`.
pub fn pindex_path(data_dir: &Path, pindex_name: &str) -> PathBuf {
    data_dir.join(format!("{}{}", pindex_name, PINDEX_PATH_SUFFIX))
}

/// Recover the pindex name from a partition directory path, if the path
/// lives under `data_dir` with the expected suffix.
pub fn parse_pindex_path(data_dir: &Path, pindex_dir: &Path) -> Option<String> {
    let file_name = pindex_dir.file_name()?.to_str()?;
    let name = file_name.strip_suffix(PINDEX_PATH_SUFFIX)?;
    if pindex_dir.parent()? != data_dir || name.is_empty() {
        return None;
    }
    Some(name.to_string())
}

#[cfg(unix)]
async fn write_private(path: &Path, buf: &[u8]) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::write(path, buf).await?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn write_private(path: &Path, buf: &[u8]) -> Result<()> {
    tokio::fs::write(path, buf).await?;
    Ok(())
}

/// Create a fresh partition instance: make its directory, instantiate
/// the engine, and persist `PINDEX_META`. The directory is removed
/// again if any step fails.
#[allow(clippy::too_many_arguments)]
pub async fn new_pindex(
    name: &str,
    uuid: &str,
    index_type_tag: &str,
    index_name: &str,
    index_uuid: &str,
    index_params: &str,
    source_type: &str,
    source_name: &str,
    source_uuid: &str,
    source_params: &str,
    source_partitions: &str,
    path: &Path,
    restart: RestartHandle,
) -> Result<PIndex> {
    let t = index_type(index_type_tag)
        .ok_or_else(|| Error::UnknownIndexType(index_type_tag.to_string()))?;

    tokio::fs::create_dir_all(path).await?;

    let created = t.new_pindex(index_params, path, restart).await;
    let (impl_handle, dest) = match created {
        Ok(rv) => rv,
        Err(e) => {
            let _ = tokio::fs::remove_dir_all(path).await;
            return Err(e);
        }
    };

    let meta = PIndexMeta {
        name: name.to_string(),
        uuid: uuid.to_string(),
        index_type: index_type_tag.to_string(),
        index_name: index_name.to_string(),
        index_uuid: index_uuid.to_string(),
        index_params: index_params.to_string(),
        source_type: source_type.to_string(),
        source_name: source_name.to_string(),
        source_uuid: source_uuid.to_string(),
        source_params: source_params.to_string(),
        source_partitions: source_partitions.to_string(),
    };
    let buf = serde_json::to_vec(&meta)?;
    if let Err(e) = write_private(&path.join(PINDEX_META_FILENAME), &buf).await {
        let _ = dest.close().await;
        let _ = tokio::fs::remove_dir_all(path).await;
        return Err(e);
    }

    Ok(PIndex::from_meta(meta, path.to_path_buf(), impl_handle, dest))
}

/// Reconstitute a partition instance from its directory.
pub async fn open_pindex(path: &Path, restart: RestartHandle) -> Result<PIndex> {
    let buf = tokio::fs::read(path.join(PINDEX_META_FILENAME)).await?;
    let meta: PIndexMeta = serde_json::from_slice(&buf)?;

    let t = index_type(&meta.index_type)
        .ok_or_else(|| Error::UnknownIndexType(meta.index_type.clone()))?;

    let (impl_handle, dest) = t.open_pindex(path, restart).await?;

    Ok(PIndex::from_meta(meta, path.to_path_buf(), impl_handle, dest))
}

/// Reopen a partition in place with updated identity and index params,
/// for engines that support config change without a rebuild.
pub async fn open_pindex_using(
    path: &Path,
    uuid: &str,
    index_params: &str,
    restart: RestartHandle,
) -> Result<PIndex> {
    let buf = tokio::fs::read(path.join(PINDEX_META_FILENAME)).await?;
    let mut meta: PIndexMeta = serde_json::from_slice(&buf)?;
    meta.uuid = uuid.to_string();
    meta.index_params = index_params.to_string();

    let t = index_type(&meta.index_type)
        .ok_or_else(|| Error::UnknownIndexType(meta.index_type.clone()))?;

    let (impl_handle, dest) = t.open_pindex_using(path, index_params, restart).await?;

    let out = serde_json::to_vec(&meta)?;
    write_private(&path.join(PINDEX_META_FILENAME), &out).await?;

    Ok(PIndex::from_meta(meta, path.to_path_buf(), impl_handle, dest))
}

/// Close a partition instance, optionally deleting its directory.
pub async fn close_pindex(pindex: &PIndex, remove: bool) -> Result<()> {
    pindex.dest.close().await?;
    if remove {
        tokio::fs::remove_dir_all(&pindex.path).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pindex_path_round_trip() {
        let data_dir = PathBuf::from("/data");
        let p = pindex_path(&data_dir, "i_U_abc123");
        assert_eq!(p, PathBuf::from("/data/i_U_abc123.pindex"));
        assert_eq!(
            parse_pindex_path(&data_dir, &p),
            Some("i_U_abc123".to_string())
        );

        assert_eq!(
            parse_pindex_path(&data_dir, &PathBuf::from("/data/other.dir")),
            None
        );
        assert_eq!(
            parse_pindex_path(&PathBuf::from("/elsewhere"), &p),
            None
        );
        assert_eq!(
            parse_pindex_path(&data_dir, &PathBuf::from("/data/.pindex")),
            None
        );
    }
}
