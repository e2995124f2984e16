//! Query coordination: covering sets, consistency gating, and
//! scatter-gather across local and remote partitions.

pub mod alias;
pub mod remote;

use crate::manager::Manager;
use crate::metadata::{self, NodeDef, NodeDefsKind, PlanPIndex, PlanPIndexNode};
use crate::pindex::consistency::{consistency_wait_group, ConsistencyParams};
use crate::pindex::kvlite::{KvLiteItem, KvLiteQueryParams, KvLiteQueryResults};
use crate::pindex::PIndex;
use crate::util::timeout_cancel_token;
use crate::{Error, Result};
use remote::IndexClient;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Default query timeout in milliseconds.
pub const QUERY_CTL_DEFAULT_TIMEOUT_MS: i64 = 10_000;

/// The "ctl" part of a query request, independent of any index type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryCtlParams {
    #[serde(default)]
    pub ctl: QueryCtl,
}

/// Query execution controls: a timeout, optional consistency
/// requirements, and the partition selection policy.
///
/// Recognized partition_selection values:
/// - ""                : active primaries only
/// - "advanced-local"  : local partitions are favored
/// - "advanced-random" : pseudo-random selection among eligible copies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryCtl {
    #[serde(default = "default_timeout")]
    pub timeout: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consistency: Option<ConsistencyParams>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition_selection: String,
}

fn default_timeout() -> i64 {
    QUERY_CTL_DEFAULT_TIMEOUT_MS
}

impl Default for QueryCtl {
    fn default() -> Self {
        Self {
            timeout: QUERY_CTL_DEFAULT_TIMEOUT_MS,
            consistency: None,
            partition_selection: String::new(),
        }
    }
}

/// Filter deciding whether a plan assignment may serve a query.
pub type PlanPIndexNodeFilter = fn(&PlanPIndexNode) -> bool;

/// Accept any assignment.
pub fn plan_pindex_node_ok(_node: &PlanPIndexNode) -> bool {
    true
}

/// Accept only assignments marked readable.
pub fn plan_pindex_node_can_read(node: &PlanPIndexNode) -> bool {
    node.can_read
}

/// A plan partition served by a peer, with the peer's address.
#[derive(Debug, Clone)]
pub struct RemotePlanPIndex {
    pub plan_pindex: PlanPIndex,
    pub node_def: NodeDef,
}

fn select_node<'a>(
    plan_pindex: &'a PlanPIndex,
    self_uuid: &str,
    filter: PlanPIndexNodeFilter,
    selection: &str,
) -> Option<&'a str> {
    let eligible: Vec<(&str, &PlanPIndexNode)> = plan_pindex
        .nodes
        .iter()
        .filter(|(_, n)| filter(n))
        .filter(|(_, n)| match selection {
            "advanced-local" | "advanced-random" => true,
            // Default policy serves from active primaries only.
            _ => n.priority == 0,
        })
        .map(|(uuid, n)| (uuid.as_str(), n))
        .collect();

    if eligible.is_empty() {
        return None;
    }

    // A local copy always beats a remote hop.
    if let Some((uuid, _)) = eligible.iter().find(|(uuid, _)| *uuid == self_uuid).copied() {
        return Some(uuid);
    }

    match selection {
        "advanced-random" => eligible
            .iter()
            .min_by_key(|(uuid, _)| {
                let mut h = crc32fast::Hasher::new();
                h.update(plan_pindex.uuid.as_bytes());
                h.update(uuid.as_bytes());
                h.finalize()
            })
            .map(|(uuid, _)| *uuid),
        _ => eligible
            .iter()
            .min_by_key(|(uuid, n)| (n.priority, *uuid))
            .map(|(uuid, _)| *uuid),
    }
}

/// Compute a covering set for a logical index: one copy of every plan
/// partition, preferring local copies, honoring the node filter and the
/// selection policy. Returns the local instances and the remote
/// endpoints to query.
pub async fn covering_pindexes(
    mgr: &Manager,
    index_name: &str,
    index_uuid: &str,
    filter: PlanPIndexNodeFilter,
    selection: &str,
) -> Result<(Vec<Arc<PIndex>>, Vec<RemotePlanPIndex>)> {
    let (plan, _) = metadata::get_plan_pindexes(mgr.store().as_ref(), mgr.version())
        .await?
        .ok_or_else(|| Error::Query(format!("no plan for index: {index_name}")))?;

    let (node_defs, _) =
        metadata::get_node_defs(mgr.store().as_ref(), NodeDefsKind::Known, mgr.version())
            .await?
            .ok_or_else(|| Error::Query("no known node definitions".to_string()))?;

    let local_pindexes = mgr.pindexes();

    let mut locals = Vec::new();
    let mut remotes = Vec::new();
    let mut covered_any = false;

    for plan_pindex in plan.plan_pindexes.values() {
        if plan_pindex.index_name != index_name {
            continue;
        }
        if !index_uuid.is_empty() && plan_pindex.index_uuid != index_uuid {
            return Err(Error::Query(format!(
                "index uuid changed: {index_name}, wanted: {index_uuid}, plan: {}",
                plan_pindex.index_uuid
            )));
        }
        covered_any = true;

        let node_uuid = select_node(plan_pindex, mgr.uuid(), filter, selection)
            .ok_or_else(|| {
                Error::Query(format!(
                    "no eligible node for pindex: {}",
                    plan_pindex.name
                ))
            })?;

        if node_uuid == mgr.uuid() {
            let pindex = local_pindexes.get(&plan_pindex.name).cloned().ok_or_else(|| {
                Error::Query(format!(
                    "local pindex not yet open: {}",
                    plan_pindex.name
                ))
            })?;
            locals.push(pindex);
        } else {
            let node_def = node_defs.node_defs.get(node_uuid).cloned().ok_or_else(|| {
                Error::Query(format!("no known node definition, uuid: {node_uuid}"))
            })?;
            remotes.push(RemotePlanPIndex {
                plan_pindex: plan_pindex.clone(),
                node_def,
            });
        }
    }

    if !covered_any {
        return Err(Error::IndexNotFound(index_name.to_string()));
    }

    Ok((locals, remotes))
}

/// Count documents across one or more (indexName, indexUUID) targets.
pub async fn count_targets(
    mgr: &Manager,
    targets: &[(String, String)],
    cancel: CancellationToken,
) -> Result<u64> {
    let mut counts = Vec::new();

    for (index_name, index_uuid) in targets {
        let (locals, remotes) =
            covering_pindexes(mgr, index_name, index_uuid, plan_pindex_node_ok, "").await?;

        for pindex in locals {
            let cancel = cancel.clone();
            counts.push(tokio::spawn(async move { pindex.dest.count(cancel).await }));
        }
        for remote in remotes {
            let client = IndexClient::for_pindex(&remote);
            let cancel = cancel.clone();
            counts.push(tokio::spawn(async move { client.count(cancel).await }));
        }
    }

    let mut total = 0u64;
    for handle in counts {
        total += handle
            .await
            .map_err(|e| Error::Internal(format!("count task panicked: {e}")))??;
    }
    Ok(total)
}

/// Count documents across a logical index, alias-unaware.
pub async fn count_index(mgr: &Manager, index_name: &str, index_uuid: &str) -> Result<u64> {
    let cancel = CancellationToken::new();
    count_targets(
        mgr,
        &[(index_name.to_string(), index_uuid.to_string())],
        cancel,
    )
    .await
}

/// Query one or more targets with a shared request, gating local
/// partitions on the request's consistency vector, then merging the
/// ordered per-source result streams through a k-way heap.
pub async fn query_targets(
    mgr: &Manager,
    targets: &[(String, String)],
    req: &[u8],
) -> Result<Vec<u8>> {
    let ctl_params: QueryCtlParams =
        serde_json::from_slice(req).unwrap_or_else(|_| QueryCtlParams {
            ctl: QueryCtl::default(),
        });
    let scan_params: KvLiteQueryParams = serde_json::from_slice(req)?;

    let cancel = timeout_cancel_token(ctl_params.ctl.timeout);

    let mut locals_all = Vec::new();
    let mut remotes_all = Vec::new();

    for (index_name, index_uuid) in targets {
        let (locals, remotes) = covering_pindexes(
            mgr,
            index_name,
            index_uuid,
            plan_pindex_node_can_read,
            &ctl_params.ctl.partition_selection,
        )
        .await?;

        consistency_wait_group(
            index_name,
            ctl_params.ctl.consistency.as_ref(),
            cancel.clone(),
            &locals,
        )
        .await?;

        locals_all.extend(locals);
        remotes_all.extend(remotes);
    }

    let results = scatter_gather(&locals_all, &remotes_all, &scan_params, req, cancel).await?;
    Ok(serde_json::to_vec(&results)?)
}

/// Query a logical index, alias-unaware.
pub async fn query_index(
    mgr: &Manager,
    index_name: &str,
    index_uuid: &str,
    req: &[u8],
) -> Result<Vec<u8>> {
    query_targets(
        mgr,
        &[(index_name.to_string(), index_uuid.to_string())],
        req,
    )
    .await
}

/// Fan a scan out to every covering source and merge the ordered
/// streams. Child sources scan without skip/limit bounds beyond what
/// the merged result can use; skip and limit apply once, here.
async fn scatter_gather(
    locals: &[Arc<PIndex>],
    remotes: &[RemotePlanPIndex],
    scan_params: &KvLiteQueryParams,
    req: &[u8],
    cancel: CancellationToken,
) -> Result<KvLiteQueryResults> {
    let mut child_params = scan_params.clone();
    child_params.skip = 0;
    if scan_params.limit > 0 {
        child_params.limit = scan_params.skip + scan_params.limit;
    }

    let n = locals.len() + remotes.len();
    let (err_tx, mut err_rx) = mpsc::channel::<Error>(n.max(1));
    let mut cursors = Vec::with_capacity(n);

    for pindex in locals {
        let (tx, rx) = mpsc::channel::<KvLiteItem>(16);
        let pindex = pindex.clone();
        let params = child_params.clone();
        let cancel = cancel.clone();
        let err_tx = err_tx.clone();

        tokio::spawn(async move {
            let buf = match serde_json::to_vec(&params) {
                Ok(buf) => buf,
                Err(e) => {
                    let _ = err_tx.send(e.into()).await;
                    return;
                }
            };
            match pindex.dest.query(&buf, cancel.clone()).await {
                Ok(resp) => match serde_json::from_slice::<KvLiteQueryResults>(&resp) {
                    Ok(results) => {
                        for item in results.results {
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                sent = tx.send(item) => {
                                    if sent.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => {
                        let _ = err_tx.send(e.into()).await;
                    }
                },
                Err(e) => {
                    let _ = err_tx.send(e).await;
                }
            }
        });

        cursors.push(rx);
    }

    for remote in remotes {
        let (tx, rx) = mpsc::channel::<KvLiteItem>(16);
        let client = IndexClient::for_pindex(remote);
        let mut child_req: serde_json::Value =
            serde_json::from_slice(req).unwrap_or(serde_json::Value::Null);
        if let Some(obj) = child_req.as_object_mut() {
            obj.insert("skip".to_string(), 0.into());
            obj.insert("limit".to_string(), child_params.limit.into());
        }
        let cancel = cancel.clone();
        let err_tx = err_tx.clone();

        tokio::spawn(async move {
            match client.query(&child_req, cancel.clone()).await {
                Ok(results) => {
                    for item in results.results {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            sent = tx.send(item) => {
                                if sent.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    let _ = err_tx.send(e).await;
                }
            }
        });

        cursors.push(rx);
    }
    drop(err_tx);

    let merged = merge_ordered(cursors, scan_params.skip, scan_params.limit, &cancel).await;

    if let Ok(e) = err_rx.try_recv() {
        cancel.cancel();
        return Err(e);
    }
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    Ok(KvLiteQueryResults { results: merged })
}

/// K-way merge of per-source ordered item streams, smallest key first.
async fn merge_ordered(
    mut cursors: Vec<mpsc::Receiver<KvLiteItem>>,
    skip: u64,
    limit: u64,
    cancel: &CancellationToken,
) -> Vec<KvLiteItem> {
    let mut heap: BinaryHeap<Reverse<(String, usize)>> = BinaryHeap::new();
    let mut heads: Vec<Option<KvLiteItem>> = Vec::with_capacity(cursors.len());

    for (i, rx) in cursors.iter_mut().enumerate() {
        let head = rx.recv().await;
        if let Some(item) = &head {
            heap.push(Reverse((item.key.clone(), i)));
        }
        heads.push(head);
    }

    let mut rv = Vec::new();
    let mut visits = 0u64;

    while let Some(Reverse((_, i))) = heap.pop() {
        if cancel.is_cancelled() {
            break;
        }
        if let Some(item) = heads[i].take() {
            visits += 1;
            if visits > skip {
                rv.push(item);
            }
            if limit > 0 && (rv.len() as u64) >= limit {
                break;
            }
        }
        heads[i] = cursors[i].recv().await;
        if let Some(item) = &heads[i] {
            heap.push(Reverse((item.key.clone(), i)));
        }
    }

    rv
}
