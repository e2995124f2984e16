//! The manager: one node's view of the cluster.
//!
//! Owns the metadata store handle, the live partition and feed maps,
//! and the planner and janitor worker loops. Config-store subscriptions
//! kick the planner; plan writes kick the janitor; both loops drain a
//! work channel so kicks can be awaited synchronously.

use crate::feed::Feed;
use crate::metadata::{
    self, IndexDef, IndexDefs, MetaStore, NodeDef, NodeDefs, NodeDefsKind, PlanParams,
};
use crate::msgring::MsgRing;
use crate::pindex::PIndex;
use crate::registry::RestartHandle;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Options for constructing a [`Manager`].
pub struct ManagerOptions {
    /// Node UUID; generated when empty.
    pub uuid: String,
    /// Capability tags; None means all capabilities.
    pub tags: Option<Vec<String>>,
    /// Hierarchy path, like "zone1/rack2".
    pub container: String,
    /// Placement weight; only positive values count.
    pub weight: i32,
    /// host:port peers use to reach this node.
    pub bind_addr: String,
    /// Root directory for partition data.
    pub data_dir: PathBuf,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            uuid: String::new(),
            tags: None,
            container: String::new(),
            weight: 0,
            bind_addr: "127.0.0.1:8094".to_string(),
            data_dir: PathBuf::from("data"),
        }
    }
}

enum WorkOp {
    Kick,
    Noop,
}

struct WorkReq {
    op: WorkOp,
    msg: String,
    res_tx: Option<oneshot::Sender<Result<()>>>,
}

/// Named counters, copied out field by field for snapshots.
#[derive(Debug, Default)]
pub struct ManagerStats {
    pub tot_planner_kick: AtomicU64,
    pub tot_planner_kick_ok: AtomicU64,
    pub tot_planner_kick_err: AtomicU64,
    pub tot_planner_kick_changed: AtomicU64,
    pub tot_planner_subscription_event: AtomicU64,
    pub tot_janitor_kick: AtomicU64,
    pub tot_janitor_kick_ok: AtomicU64,
    pub tot_janitor_kick_err: AtomicU64,
    pub tot_janitor_subscription_event: AtomicU64,
    pub tot_create_index: AtomicU64,
    pub tot_delete_index: AtomicU64,
}

/// Point-in-time copy of [`ManagerStats`].
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStatsSnapshot {
    pub tot_planner_kick: u64,
    pub tot_planner_kick_ok: u64,
    pub tot_planner_kick_err: u64,
    pub tot_planner_kick_changed: u64,
    pub tot_planner_subscription_event: u64,
    pub tot_janitor_kick: u64,
    pub tot_janitor_kick_ok: u64,
    pub tot_janitor_kick_err: u64,
    pub tot_janitor_subscription_event: u64,
    pub tot_create_index: u64,
    pub tot_delete_index: u64,
}

impl ManagerStats {
    /// Element-by-element atomic copy into a snapshot.
    pub fn snapshot(&self) -> ManagerStatsSnapshot {
        ManagerStatsSnapshot {
            tot_planner_kick: self.tot_planner_kick.load(Ordering::Relaxed),
            tot_planner_kick_ok: self.tot_planner_kick_ok.load(Ordering::Relaxed),
            tot_planner_kick_err: self.tot_planner_kick_err.load(Ordering::Relaxed),
            tot_planner_kick_changed: self.tot_planner_kick_changed.load(Ordering::Relaxed),
            tot_planner_subscription_event: self
                .tot_planner_subscription_event
                .load(Ordering::Relaxed),
            tot_janitor_kick: self.tot_janitor_kick.load(Ordering::Relaxed),
            tot_janitor_kick_ok: self.tot_janitor_kick_ok.load(Ordering::Relaxed),
            tot_janitor_kick_err: self.tot_janitor_kick_err.load(Ordering::Relaxed),
            tot_janitor_subscription_event: self
                .tot_janitor_subscription_event
                .load(Ordering::Relaxed),
            tot_create_index: self.tot_create_index.load(Ordering::Relaxed),
            tot_delete_index: self.tot_delete_index.load(Ordering::Relaxed),
        }
    }
}

/// Claim guard serializing transitions on one partition name.
pub struct PIndexToken {
    set: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl Drop for PIndexToken {
    fn drop(&mut self) {
        self.set.lock().remove(&self.name);
    }
}

/// One node's manager instance. All non-global state hangs off here.
pub struct Manager {
    uuid: String,
    version: String,
    tags: Option<Vec<String>>,
    container: String,
    weight: i32,
    bind_addr: String,
    data_dir: PathBuf,
    store: Arc<dyn MetaStore>,

    pindexes: RwLock<HashMap<String, Arc<PIndex>>>,
    feeds: RwLock<HashMap<String, Arc<dyn Feed>>>,
    pindex_inflight: Arc<Mutex<HashSet<String>>>,

    planner_tx: mpsc::UnboundedSender<WorkReq>,
    planner_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkReq>>>,
    janitor_tx: mpsc::UnboundedSender<WorkReq>,
    janitor_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkReq>>>,
    started: std::sync::atomic::AtomicBool,
    shutdown: CancellationToken,
    self_ref: std::sync::Weak<Manager>,

    msg_ring: Arc<MsgRing>,
    pub stats: ManagerStats,
}

impl Manager {
    pub fn new(version: &str, store: Arc<dyn MetaStore>, options: ManagerOptions) -> Arc<Self> {
        crate::registry::register_builtin_types();

        let uuid = if options.uuid.is_empty() {
            crate::util::new_uuid()
        } else {
            options.uuid
        };

        let (planner_tx, planner_rx) = mpsc::unbounded_channel();
        let (janitor_tx, janitor_rx) = mpsc::unbounded_channel();

        let msg_ring = Arc::new(
            MsgRing::new(Box::new(std::io::sink()), 64).expect("positive ring size"),
        );

        Arc::new_cyclic(|self_ref| Self {
            uuid,
            version: version.to_string(),
            tags: options.tags,
            container: options.container,
            weight: options.weight,
            bind_addr: options.bind_addr,
            data_dir: options.data_dir,
            store,
            pindexes: RwLock::new(HashMap::new()),
            feeds: RwLock::new(HashMap::new()),
            pindex_inflight: Arc::new(Mutex::new(HashSet::new())),
            planner_tx,
            planner_rx: Mutex::new(Some(planner_rx)),
            janitor_tx,
            janitor_rx: Mutex::new(Some(janitor_rx)),
            started: std::sync::atomic::AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            self_ref: self_ref.clone(),
            msg_ring,
            stats: ManagerStats::default(),
        })
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn bind_addr(&self) -> &str {
        &self.bind_addr
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn store(&self) -> &Arc<dyn MetaStore> {
        &self.store
    }

    pub fn msg_ring(&self) -> &Arc<MsgRing> {
        &self.msg_ring
    }

    /// True when this node carries the capability tag; a missing tags
    /// list turns every capability on.
    pub fn has_tag(&self, tag: &str) -> bool {
        match &self.tags {
            None => true,
            Some(tags) if tags.is_empty() => true,
            Some(tags) => tags.iter().any(|t| t == tag),
        }
    }

    // ---------------------------------------------------------------
    // Live partition and feed maps.

    pub fn pindexes(&self) -> HashMap<String, Arc<PIndex>> {
        self.pindexes.read().clone()
    }

    pub fn add_pindex(&self, pindex: Arc<PIndex>) {
        self.pindexes.write().insert(pindex.name.clone(), pindex);
    }

    pub fn remove_pindex(&self, name: &str) {
        self.pindexes.write().remove(name);
    }

    pub fn feeds(&self) -> HashMap<String, Arc<dyn Feed>> {
        self.feeds.read().clone()
    }

    pub fn add_feed(&self, feed: Arc<dyn Feed>) {
        self.feeds.write().insert(feed.name().to_string(), feed);
    }

    pub fn remove_feed(&self, name: &str) {
        self.feeds.write().remove(name);
    }

    /// Claim the transition token for a partition name; None when
    /// another pass holds it.
    pub fn claim_pindex(&self, name: &str) -> Option<PIndexToken> {
        let mut inflight = self.pindex_inflight.lock();
        if !inflight.insert(name.to_string()) {
            return None;
        }
        Some(PIndexToken {
            set: self.pindex_inflight.clone(),
            name: name.to_string(),
        })
    }

    /// Hook handed to a partition's engine so it can ask for a rebuild
    /// (e.g. on rollback): deregisters the dead instance and kicks the
    /// janitor, which recreates it from the plan. Holds only a weak
    /// manager reference so engines never keep the manager alive.
    pub fn restart_handle_for(&self, pindex_name: &str) -> RestartHandle {
        let weak = self.self_ref.clone();
        let name = pindex_name.to_string();
        Arc::new(move || {
            if let Some(mgr) = weak.upgrade() {
                mgr.remove_pindex(&name);
                let _ = mgr.janitor_tx.send(WorkReq {
                    op: WorkOp::Kick,
                    msg: format!("restart pindex: {name}"),
                    res_tx: None,
                });
            }
        })
    }

    // ---------------------------------------------------------------
    // Startup and worker loops.

    /// Register this node in the given keyspaces and spawn the planner
    /// and janitor loops plus the config subscriptions that kick them.
    pub async fn start(&self, register: &[NodeDefsKind]) -> Result<()> {
        let arc_self = self
            .self_ref
            .upgrade()
            .ok_or_else(|| Error::Internal("manager is shutting down".to_string()))?;

        if !metadata::check_version(self.store.as_ref(), &self.version).await? {
            return Err(Error::VersionTooLow {
                stored: "cluster".to_string(),
                runtime: self.version.clone(),
            });
        }

        for kind in register {
            self.register_node_def(*kind).await?;
        }

        self.started.store(true, Ordering::SeqCst);

        // Converge immediately on startup; a restarted node reopens
        // whatever partitions the plan still targets at it.
        if self.has_tag("planner") {
            let _ = self.planner_tx.send(WorkReq {
                op: WorkOp::Kick,
                msg: "start".to_string(),
                res_tx: None,
            });
        }
        if self.has_tag("pindex") {
            let _ = self.janitor_tx.send(WorkReq {
                op: WorkOp::Kick,
                msg: "start".to_string(),
                res_tx: None,
            });
        }

        // Config changes wake the planner; plan writes wake the janitor.
        if self.has_tag("planner") {
            let mgr = arc_self.clone();
            let mut index_rx = self.store.subscribe(metadata::INDEX_DEFS_KEY);
            let mut nodes_rx = self
                .store
                .subscribe(metadata::node_defs_key(NodeDefsKind::Wanted));
            tokio::spawn(async move {
                loop {
                    let key = tokio::select! {
                        _ = mgr.shutdown.cancelled() => return,
                        ev = index_rx.recv() => match ev {
                            Ok(ev) => ev.key,
                            Err(_) => continue, // Lagged; the next event re-kicks.
                        },
                        ev = nodes_rx.recv() => match ev {
                            Ok(ev) => ev.key,
                            Err(_) => continue,
                        },
                    };
                    mgr.stats
                        .tot_planner_subscription_event
                        .fetch_add(1, Ordering::Relaxed);
                    let _ = mgr.planner_tx.send(WorkReq {
                        op: WorkOp::Kick,
                        msg: format!("cfg changed, key: {key}"),
                        res_tx: None,
                    });
                }
            });

            let mgr = arc_self.clone();
            let mut rx = self.planner_rx.lock().take().ok_or_else(|| {
                Error::Internal("manager already started".to_string())
            })?;
            tokio::spawn(async move {
                loop {
                    let req = tokio::select! {
                        _ = mgr.shutdown.cancelled() => return,
                        req = rx.recv() => match req {
                            Some(req) => req,
                            None => return,
                        },
                    };
                    mgr.planner_work(req).await;
                }
            });
        }

        if self.has_tag("pindex") {
            let mgr = arc_self.clone();
            let mut plan_rx = self.store.subscribe(metadata::PLAN_PINDEXES_KEY);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = mgr.shutdown.cancelled() => return,
                        ev = plan_rx.recv() => {
                            if ev.is_err() {
                                continue;
                            }
                        }
                    }
                    mgr.stats
                        .tot_janitor_subscription_event
                        .fetch_add(1, Ordering::Relaxed);
                    let _ = mgr.janitor_tx.send(WorkReq {
                        op: WorkOp::Kick,
                        msg: "the plans have changed".to_string(),
                        res_tx: None,
                    });
                }
            });

            let mgr = arc_self.clone();
            let mut rx = self.janitor_rx.lock().take().ok_or_else(|| {
                Error::Internal("manager already started".to_string())
            })?;
            tokio::spawn(async move {
                loop {
                    let req = tokio::select! {
                        _ = mgr.shutdown.cancelled() => return,
                        req = rx.recv() => match req {
                            Some(req) => req,
                            None => return,
                        },
                    };
                    mgr.janitor_work(req).await;
                }
            });

            // Periodic convergence ticks, backing off while idle. The
            // per-pindex tokens keep these safe alongside kicked passes.
            let mgr = arc_self.clone();
            tokio::spawn(async move {
                let tick = mgr.clone();
                crate::util::exponential_backoff_loop(
                    "janitor-tick",
                    move || {
                        let mgr = tick.clone();
                        async move {
                            if mgr.shutdown.is_cancelled() {
                                return crate::util::Progress::Stop;
                            }
                            match crate::janitor::janitor_once(&mgr, "periodic").await {
                                Ok(true) => crate::util::Progress::Made,
                                Ok(false) => crate::util::Progress::None,
                                Err(e) => {
                                    tracing::warn!("janitor: periodic pass, err: {}", e);
                                    crate::util::Progress::None
                                }
                            }
                        }
                    },
                    std::time::Duration::from_millis(500),
                    2.0,
                    std::time::Duration::from_secs(10),
                )
                .await;
            });
        }

        Ok(())
    }

    async fn planner_work(&self, req: WorkReq) {
        let rv = match req.op {
            WorkOp::Noop => Ok(()),
            WorkOp::Kick => {
                self.stats.tot_planner_kick.fetch_add(1, Ordering::Relaxed);
                match crate::plan::planner_once(self, &req.msg).await {
                    Ok(changed) => {
                        self.stats
                            .tot_planner_kick_ok
                            .fetch_add(1, Ordering::Relaxed);
                        if changed {
                            self.stats
                                .tot_planner_kick_changed
                                .fetch_add(1, Ordering::Relaxed);
                            let _ = self.janitor_tx.send(WorkReq {
                                op: WorkOp::Kick,
                                msg: "the plans have changed".to_string(),
                                res_tx: None,
                            });
                        }
                        Ok(())
                    }
                    Err(Error::CasMismatch) => {
                        // The race is benign; the winner's plan stands.
                        tracing::info!("planner: a concurrent planner won the plan write");
                        self.stats
                            .tot_planner_kick_ok
                            .fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }
                    Err(e) => {
                        tracing::warn!("planner: {}", e);
                        self.stats
                            .tot_planner_kick_err
                            .fetch_add(1, Ordering::Relaxed);
                        Err(e)
                    }
                }
            }
        };
        if let Some(res_tx) = req.res_tx {
            let _ = res_tx.send(rv);
        }
    }

    async fn janitor_work(&self, req: WorkReq) {
        let rv = match req.op {
            WorkOp::Noop => Ok(()),
            WorkOp::Kick => {
                self.stats.tot_janitor_kick.fetch_add(1, Ordering::Relaxed);
                match crate::janitor::janitor_once(self, &req.msg).await {
                    Ok(_) => {
                        self.stats
                            .tot_janitor_kick_ok
                            .fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }
                    Err(e) => {
                        tracing::warn!("janitor: {}", e);
                        self.stats
                            .tot_janitor_kick_err
                            .fetch_add(1, Ordering::Relaxed);
                        Err(e)
                    }
                }
            }
        };
        if let Some(res_tx) = req.res_tx {
            let _ = res_tx.send(rv);
        }
    }

    async fn work(
        &self,
        tx: &mpsc::UnboundedSender<WorkReq>,
        op: WorkOp,
        msg: &str,
    ) -> Result<()> {
        let (res_tx, res_rx) = oneshot::channel();
        tx.send(WorkReq {
            op,
            msg: msg.to_string(),
            res_tx: Some(res_tx),
        })
        .map_err(|_| Error::Internal("worker loop is gone".to_string()))?;
        res_rx
            .await
            .map_err(|_| Error::Internal("worker dropped the request".to_string()))?
    }

    fn worker_ready(&self, tag: &str) -> bool {
        self.started.load(Ordering::SeqCst) && self.has_tag(tag)
    }

    /// Kick the planner and wait for the pass to finish. A no-op on
    /// nodes without a running planner loop.
    pub async fn planner_kick(&self, msg: &str) -> Result<()> {
        if !self.worker_ready("planner") {
            return Ok(());
        }
        self.work(&self.planner_tx, WorkOp::Kick, msg).await
    }

    /// Kick the janitor and wait for the pass to finish. A no-op on
    /// nodes without a running janitor loop.
    pub async fn janitor_kick(&self, msg: &str) -> Result<()> {
        if !self.worker_ready("pindex") {
            return Ok(());
        }
        self.work(&self.janitor_tx, WorkOp::Kick, msg).await
    }

    /// Synchronous no-op through the planner loop, for barriers.
    pub async fn planner_noop(&self, msg: &str) -> Result<()> {
        if !self.worker_ready("planner") {
            return Ok(());
        }
        self.work(&self.planner_tx, WorkOp::Noop, msg).await
    }

    /// Stop worker loops and close local partitions and feeds.
    pub async fn stop(&self) {
        self.shutdown.cancel();

        let feeds: Vec<_> = self.feeds.write().drain().collect();
        for (name, feed) in feeds {
            if let Err(e) = feed.close().await {
                tracing::warn!("manager: stop feed {}, err: {}", name, e);
            }
        }

        let pindexes: Vec<_> = self.pindexes.write().drain().collect();
        for (name, pindex) in pindexes {
            if let Err(e) = crate::pindex::close_pindex(&pindex, false).await {
                tracing::warn!("manager: stop pindex {}, err: {}", name, e);
            }
        }
    }

    // ---------------------------------------------------------------
    // Node registration.

    fn node_def(&self) -> NodeDef {
        NodeDef {
            host_port: self.bind_addr.clone(),
            uuid: self.uuid.clone(),
            impl_version: self.version.clone(),
            tags: self.tags.clone(),
            container: self.container.clone(),
            weight: self.weight,
        }
    }

    /// Upsert this node's definition into a keyspace under CAS.
    pub async fn register_node_def(&self, kind: NodeDefsKind) -> Result<()> {
        loop {
            let (mut defs, cas) =
                match metadata::get_node_defs(self.store.as_ref(), kind, &self.version).await? {
                    Some((defs, cas)) => (defs, cas),
                    None => (NodeDefs::new(&self.version), 0),
                };

            let node_def = self.node_def();
            if defs.node_defs.get(&self.uuid) == Some(&node_def) {
                return Ok(());
            }
            defs.node_defs.insert(self.uuid.clone(), node_def);
            defs.uuid = crate::util::new_uuid();

            match metadata::set_node_defs(self.store.as_ref(), kind, &defs, cas).await {
                Ok(_) => {
                    tracing::info!(
                        "manager: registered node {} into {}",
                        self.uuid,
                        metadata::node_defs_key(kind)
                    );
                    return Ok(());
                }
                Err(Error::CasMismatch) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    // ---------------------------------------------------------------
    // Index definition CRUD.

    /// Create or replace an index definition. `prev_index_uuid` empty
    /// means strict create; otherwise it must match the existing
    /// definition being replaced.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_index(
        &self,
        source_type: &str,
        source_name: &str,
        source_uuid: &str,
        source_params: &str,
        index_type: &str,
        index_name: &str,
        index_params: &str,
        plan_params: PlanParams,
        prev_index_uuid: &str,
    ) -> Result<String> {
        // Unknown tags are a hard error here, unlike in the planner.
        let t = crate::registry::index_type(index_type)
            .ok_or_else(|| Error::UnknownIndexType(index_type.to_string()))?;
        t.validate(index_name, index_params)?;

        if crate::feed::source_type(source_type).is_none() && index_type != "alias" {
            return Err(Error::Config(format!("unknown source type: {source_type}")));
        }

        let index_uuid = crate::util::new_uuid();

        loop {
            let (mut defs, cas) =
                match metadata::get_index_defs(self.store.as_ref(), &self.version).await? {
                    Some((defs, cas)) => (defs, cas),
                    None => (IndexDefs::new(&self.version), 0),
                };

            match defs.index_defs.get(index_name) {
                Some(existing) if prev_index_uuid.is_empty() => {
                    return Err(Error::Config(format!(
                        "index already exists: {index_name}, uuid: {}",
                        existing.uuid
                    )));
                }
                Some(existing) if existing.uuid != prev_index_uuid => {
                    return Err(Error::Config(format!(
                        "index changed underneath us: {index_name}, uuid: {}",
                        existing.uuid
                    )));
                }
                None if !prev_index_uuid.is_empty() => {
                    return Err(Error::IndexNotFound(index_name.to_string()));
                }
                _ => {}
            }

            defs.index_defs.insert(
                index_name.to_string(),
                IndexDef {
                    name: index_name.to_string(),
                    uuid: index_uuid.clone(),
                    index_type: index_type.to_string(),
                    params: index_params.to_string(),
                    source_type: source_type.to_string(),
                    source_name: source_name.to_string(),
                    source_uuid: source_uuid.to_string(),
                    source_params: source_params.to_string(),
                    plan_params: plan_params.clone(),
                },
            );
            defs.uuid = crate::util::new_uuid();

            match metadata::set_index_defs(self.store.as_ref(), &defs, cas).await {
                Ok(_) => break,
                Err(Error::CasMismatch) => continue,
                Err(e) => return Err(e),
            }
        }

        self.stats.tot_create_index.fetch_add(1, Ordering::Relaxed);
        tracing::info!("manager: created index {} ({})", index_name, index_uuid);

        let _ = self.planner_kick(&format!("api/CreateIndex, indexName: {index_name}")).await;

        Ok(index_uuid)
    }

    /// Update an index's plan params in place, keeping its UUID, e.g.
    /// to freeze or unfreeze planning or flip per-node read/write.
    pub async fn set_index_plan_params(
        &self,
        index_name: &str,
        plan_params: PlanParams,
    ) -> Result<()> {
        loop {
            let (mut defs, cas) = metadata::get_index_defs(self.store.as_ref(), &self.version)
                .await?
                .ok_or_else(|| Error::IndexNotFound(index_name.to_string()))?;

            let def = defs
                .index_defs
                .get_mut(index_name)
                .ok_or_else(|| Error::IndexNotFound(index_name.to_string()))?;
            def.plan_params = plan_params.clone();
            defs.uuid = crate::util::new_uuid();

            match metadata::set_index_defs(self.store.as_ref(), &defs, cas).await {
                Ok(_) => break,
                Err(Error::CasMismatch) => continue,
                Err(e) => return Err(e),
            }
        }

        let _ = self
            .planner_kick(&format!("api/IndexControl, indexName: {index_name}"))
            .await;

        Ok(())
    }

    /// Delete an index definition by name.
    pub async fn delete_index(&self, index_name: &str) -> Result<()> {
        loop {
            let (mut defs, cas) =
                metadata::get_index_defs(self.store.as_ref(), &self.version)
                    .await?
                    .ok_or_else(|| Error::IndexNotFound(index_name.to_string()))?;

            if defs.index_defs.remove(index_name).is_none() {
                return Err(Error::IndexNotFound(index_name.to_string()));
            }
            defs.uuid = crate::util::new_uuid();

            match metadata::set_index_defs(self.store.as_ref(), &defs, cas).await {
                Ok(_) => break,
                Err(Error::CasMismatch) => continue,
                Err(e) => return Err(e),
            }
        }

        self.stats.tot_delete_index.fetch_add(1, Ordering::Relaxed);
        tracing::info!("manager: deleted index {}", index_name);

        let _ = self.planner_kick(&format!("api/DeleteIndex, indexName: {index_name}")).await;

        Ok(())
    }

    // ---------------------------------------------------------------
    // Query surface.

    /// Count documents in a logical index, dispatching through its
    /// registered type (alias-aware).
    pub async fn count_index(&self, index_name: &str, index_uuid: &str) -> Result<u64> {
        let (def, t) = crate::registry::index_def_and_type(self, index_name).await?;
        if !index_uuid.is_empty() && def.uuid != index_uuid {
            return Err(Error::Query(format!(
                "index uuid changed: {index_name}, wanted: {index_uuid}, current: {}",
                def.uuid
            )));
        }
        t.count(self, index_name, index_uuid).await
    }

    /// Query a logical index, dispatching through its registered type
    /// (alias-aware). `req` is the JSON query envelope.
    pub async fn query_index(
        &self,
        index_name: &str,
        index_uuid: &str,
        req: &[u8],
    ) -> Result<Vec<u8>> {
        let (def, t) = crate::registry::index_def_and_type(self, index_name).await?;
        if !index_uuid.is_empty() && def.uuid != index_uuid {
            return Err(Error::Query(format!(
                "index uuid changed: {index_name}, wanted: {index_uuid}, current: {}",
                def.uuid
            )));
        }
        t.query(self, index_name, index_uuid, req).await
    }

    // ---------------------------------------------------------------
    // Diagnostics.

    /// One JSON document capturing this node's view of the cluster.
    pub async fn diag_snapshot(&self) -> Result<serde_json::Value> {
        let version = self.version.clone();
        let index_defs = metadata::get_index_defs(self.store.as_ref(), &version)
            .await?
            .map(|(defs, _)| defs);
        let node_defs_wanted =
            metadata::get_node_defs(self.store.as_ref(), NodeDefsKind::Wanted, &version)
                .await?
                .map(|(defs, _)| defs);
        let plan = metadata::get_plan_pindexes(self.store.as_ref(), &version)
            .await?
            .map(|(plan, _)| plan);

        let mut pindex_names: Vec<String> = self.pindexes.read().keys().cloned().collect();
        pindex_names.sort();
        let mut feed_names: Vec<String> = self.feeds.read().keys().cloned().collect();
        feed_names.sort();

        let messages: Vec<String> = self
            .msg_ring
            .messages()
            .into_iter()
            .map(|m| String::from_utf8_lossy(&m).to_string())
            .collect();

        Ok(serde_json::json!({
            "when": chrono::Utc::now().to_rfc3339(),
            "uuid": self.uuid,
            "version": self.version,
            "bindAddr": self.bind_addr,
            "indexTypes": crate::registry::index_type_descriptions(),
            "indexDefs": index_defs,
            "nodeDefsWanted": node_defs_wanted,
            "planPIndexes": plan,
            "pindexes": pindex_names,
            "feeds": feed_names,
            "stats": self.stats.snapshot(),
            "messages": messages,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MemMetaStore;

    fn test_manager(tags: Option<Vec<String>>) -> Arc<Manager> {
        Manager::new(
            "1.0.0",
            Arc::new(MemMetaStore::new()),
            ManagerOptions {
                uuid: "n1".to_string(),
                tags,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_has_tag_defaults_on() {
        let mgr = test_manager(None);
        assert!(mgr.has_tag("planner"));
        assert!(mgr.has_tag("pindex"));

        let tagged = test_manager(Some(vec!["queryer".to_string()]));
        assert!(tagged.has_tag("queryer"));
        assert!(!tagged.has_tag("planner"));
    }

    #[test]
    fn test_claim_pindex_token() {
        let mgr = test_manager(None);

        let token = mgr.claim_pindex("p1").expect("first claim");
        assert!(mgr.claim_pindex("p1").is_none());
        drop(token);
        assert!(mgr.claim_pindex("p1").is_some());
    }

    #[tokio::test]
    async fn test_register_node_def_upserts() {
        let mgr = test_manager(None);
        mgr.register_node_def(NodeDefsKind::Wanted).await.unwrap();
        // Idempotent when nothing changed.
        mgr.register_node_def(NodeDefsKind::Wanted).await.unwrap();

        let (defs, _) =
            metadata::get_node_defs(mgr.store().as_ref(), NodeDefsKind::Wanted, "1.0.0")
                .await
                .unwrap()
                .unwrap();
        assert!(defs.node_defs.contains_key("n1"));
    }

    #[tokio::test]
    async fn test_create_index_rejects_unknown_type() {
        let mgr = test_manager(None);
        let err = mgr
            .create_index(
                "direct",
                "s",
                "",
                "",
                "no-such-type",
                "i",
                "",
                PlanParams::default(),
                "",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownIndexType(_)));
    }

    #[tokio::test]
    async fn test_create_index_rejects_duplicate() {
        let mgr = test_manager(None);
        mgr.create_index(
            "direct",
            "s",
            "",
            "",
            "kvlite",
            "i",
            "",
            PlanParams::default(),
            "",
        )
        .await
        .unwrap();

        let err = mgr
            .create_index(
                "direct",
                "s",
                "",
                "",
                "kvlite",
                "i",
                "",
                PlanParams::default(),
                "",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_stats_snapshot_copies_fields() {
        let mgr = test_manager(None);
        mgr.stats.tot_create_index.fetch_add(3, Ordering::Relaxed);
        let snap = mgr.stats.snapshot();
        assert_eq!(snap.tot_create_index, 3);
        assert_eq!(snap.tot_delete_index, 0);
    }
}
