//! Process-wide index-type registry.
//!
//! Index implementations register themselves once at process startup;
//! after that the table is read-only. The core never depends on a
//! concrete engine type, only on this table. Unknown tags are a hard
//! error when validating an index create, but a silent skip during
//! planning so meta types without an engine never break the planner.

use crate::manager::Manager;
use crate::metadata::IndexDef;
use crate::pindex::{Dest, PIndexImpl};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, OnceLock};

/// Hook an engine calls to ask the owning node to rebuild a partition,
/// such as after an upstream rollback.
pub type RestartHandle = Arc<dyn Fn() + Send + Sync>;

/// What the janitor should do with live partitions when an index
/// definition changes in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateEffect {
    /// Close, wipe, and create the partitions from scratch.
    Rebuild,
    /// A reopen with the new params suffices; keep the files.
    Restart,
}

/// The surface every index implementation type provides.
#[async_trait::async_trait]
pub trait IndexType: Send + Sync {
    /// Short description, like "general/kvlite - ordered key-value view".
    fn description(&self) -> &str;

    /// False for meta types (aliases) that have no engine; the planner
    /// skips these.
    fn can_instantiate(&self) -> bool {
        true
    }

    /// Validate index params before an index create is accepted.
    fn validate(&self, index_name: &str, index_params: &str) -> Result<()>;

    /// Create a partition instance rooted at `path`.
    async fn new_pindex(
        &self,
        index_params: &str,
        path: &Path,
        restart: RestartHandle,
    ) -> Result<(Arc<dyn PIndexImpl>, Arc<dyn Dest>)> {
        let _ = (index_params, path, restart);
        Err(Error::Internal(format!(
            "index type is not instantiable: {}",
            self.description()
        )))
    }

    /// Reconstitute a partition instance from `path` after restart.
    async fn open_pindex(
        &self,
        path: &Path,
        restart: RestartHandle,
    ) -> Result<(Arc<dyn PIndexImpl>, Arc<dyn Dest>)> {
        let _ = (path, restart);
        Err(Error::Internal(format!(
            "index type is not instantiable: {}",
            self.description()
        )))
    }

    /// Reopen in place with updated params. Only types whose
    /// `analyze_index_def_updates` returns [`UpdateEffect::Restart`]
    /// need to support this.
    async fn open_pindex_using(
        &self,
        path: &Path,
        index_params: &str,
        restart: RestartHandle,
    ) -> Result<(Arc<dyn PIndexImpl>, Arc<dyn Dest>)> {
        let _ = (path, index_params, restart);
        Err(Error::Internal(
            "index type does not support reopen with new params".to_string(),
        ))
    }

    /// Decide whether a definition change can be absorbed by a restart.
    fn analyze_index_def_updates(&self, cur: &IndexDef, prev: &IndexDef) -> UpdateEffect {
        let _ = (cur, prev);
        UpdateEffect::Rebuild
    }

    /// Count documents across the whole logical index.
    async fn count(&self, mgr: &Manager, index_name: &str, index_uuid: &str) -> Result<u64>;

    /// Query the whole logical index; `req` and the response are JSON.
    async fn query(
        &self,
        mgr: &Manager,
        index_name: &str,
        index_uuid: &str,
        req: &[u8],
    ) -> Result<Vec<u8>>;
}

fn table() -> &'static RwLock<HashMap<String, Arc<dyn IndexType>>> {
    static TABLE: OnceLock<RwLock<HashMap<String, Arc<dyn IndexType>>>> = OnceLock::new();
    TABLE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register an index implementation type. Init-time only; later
/// registrations replace the tag, which is intended for tests.
pub fn register_index_type(tag: &str, t: Arc<dyn IndexType>) {
    table().write().insert(tag.to_string(), t);
}

/// Look up a registered index type by tag.
pub fn index_type(tag: &str) -> Option<Arc<dyn IndexType>> {
    table().read().get(tag).cloned()
}

/// Registered tags and their descriptions, for meta/diag output.
pub fn index_type_descriptions() -> BTreeMap<String, String> {
    table()
        .read()
        .iter()
        .map(|(tag, t)| (tag.clone(), t.description().to_string()))
        .collect()
}

/// Register the built-in index types ("kvlite", "alias"). Idempotent;
/// called from `Manager::new` and directly by tests.
pub fn register_builtin_types() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        crate::pindex::kvlite::register();
        crate::query::alias::register();
        crate::feed::register_builtin_sources();
    });
}

/// Resolve an index definition and its implementation type together.
pub async fn index_def_and_type(
    mgr: &Manager,
    index_name: &str,
) -> Result<(IndexDef, Arc<dyn IndexType>)> {
    let (index_defs, _) = crate::metadata::get_index_defs(mgr.store().as_ref(), mgr.version())
        .await?
        .ok_or_else(|| Error::IndexNotFound(index_name.to_string()))?;

    let def = index_defs
        .index_defs
        .get(index_name)
        .cloned()
        .ok_or_else(|| Error::IndexNotFound(index_name.to_string()))?;

    let t = index_type(&def.index_type)
        .ok_or_else(|| Error::UnknownIndexType(def.index_type.clone()))?;

    Ok((def, t))
}
