//! The janitor: converges this node's local partition instances and
//! feeds toward the authoritative plan.
//!
//! Idempotent by construction. Every pass reads the plan fresh,
//! computes wanted-vs-have deltas, and applies them; errors are logged
//! and retried on the next tick, never fatal. Concurrent passes
//! serialize per partition through an in-flight token set.

use crate::manager::Manager;
use crate::metadata::{self, IndexDef, PlanPIndex, PlanPIndexes};
use crate::pindex::{self, PIndex};
use crate::registry::UpdateEffect;
use crate::Result;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// One convergence pass. Returns whether anything changed.
pub async fn janitor_once(mgr: &Manager, reason: &str) -> Result<bool> {
    tracing::info!("janitor: awakes, reason: {}", reason);

    let plan = match metadata::get_plan_pindexes(mgr.store().as_ref(), mgr.version()).await? {
        Some((plan, _)) => plan,
        // No plan yet; converge toward emptiness.
        None => PlanPIndexes::new(mgr.version()),
    };

    let mut changed = reconcile_pindexes(mgr, &plan).await;

    if reconcile_feeds(mgr, &plan).await {
        changed = true;
    }

    Ok(changed)
}

/// Plan partitions assigned to this node with any capability at all.
fn wanted_pindexes<'a>(mgr: &Manager, plan: &'a PlanPIndexes) -> HashMap<String, &'a PlanPIndex> {
    plan.plan_pindexes
        .values()
        .filter(|p| p.nodes.contains_key(mgr.uuid()))
        .map(|p| (p.name.clone(), p))
        .collect()
}

fn pindex_matches_plan(pindex: &PIndex, plan_pindex: &PlanPIndex) -> bool {
    pindex.uuid == plan_pindex.uuid
        && pindex.index_uuid == plan_pindex.index_uuid
        && pindex.index_params == plan_pindex.index_params
        && pindex.source_partitions == plan_pindex.source_partitions
}

/// An `IndexDef`-shaped view of a plan entry, for the registry's
/// update-analysis hook.
fn def_view(p: &PlanPIndex, params: &str) -> IndexDef {
    IndexDef {
        name: p.index_name.clone(),
        uuid: p.index_uuid.clone(),
        index_type: p.index_type.clone(),
        params: params.to_string(),
        source_type: p.source_type.clone(),
        source_name: p.source_name.clone(),
        source_uuid: p.source_uuid.clone(),
        source_params: p.source_params.clone(),
        plan_params: Default::default(),
    }
}

async fn reconcile_pindexes(mgr: &Manager, plan: &PlanPIndexes) -> bool {
    let wanted = wanted_pindexes(mgr, plan);
    let have = mgr.pindexes();

    let mut changed = false;

    // Close partitions the plan no longer targets at this node.
    for name in have.keys() {
        if wanted.contains_key(name) {
            continue;
        }
        let _token = match mgr.claim_pindex(name) {
            Some(token) => token,
            None => continue, // Another pass owns this partition.
        };
        // Re-read under the token; the snapshot may be stale.
        let pindex = match mgr.pindexes().get(name) {
            Some(pindex) => pindex.clone(),
            None => continue,
        };
        tracing::info!("janitor: closing pindex: {}", name);
        mgr.remove_pindex(name);
        changed = true;
        if let Err(e) = pindex::close_pindex(&pindex, true).await {
            tracing::warn!("janitor: close pindex {}, err: {}", name, e);
        }
    }

    // Open or replace partitions the plan targets at this node.
    for (name, plan_pindex) in &wanted {
        if let Some(pindex) = have.get(name) {
            if pindex_matches_plan(pindex, plan_pindex) {
                continue;
            }
        }

        let _token = match mgr.claim_pindex(name) {
            Some(token) => token,
            None => continue,
        };
        // Re-read under the token; the snapshot may be stale.
        let existing = mgr.pindexes().get(name).cloned();
        if let Some(pindex) = &existing {
            if pindex_matches_plan(pindex, plan_pindex) {
                continue;
            }
        }

        if let Some(pindex) = &existing {
            let effect = crate::registry::index_type(&plan_pindex.index_type)
                .map(|t| {
                    t.analyze_index_def_updates(
                        &def_view(plan_pindex, &plan_pindex.index_params),
                        &def_view(plan_pindex, &pindex.index_params),
                    )
                })
                .unwrap_or(UpdateEffect::Rebuild);

            let restartable = effect == UpdateEffect::Restart
                && pindex.source_partitions == plan_pindex.source_partitions;

            mgr.remove_pindex(name);
            changed = true;

            if restartable {
                tracing::info!("janitor: restarting pindex in place: {}", name);
                if let Err(e) = pindex::close_pindex(pindex, false).await {
                    tracing::warn!("janitor: close for restart {}, err: {}", name, e);
                    continue;
                }
                match pindex::open_pindex_using(
                    &pindex.path,
                    &plan_pindex.uuid,
                    &plan_pindex.index_params,
                    mgr.restart_handle_for(name),
                )
                .await
                {
                    Ok(reopened) => {
                        mgr.add_pindex(Arc::new(reopened));
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(
                            "janitor: reopen {} failed, rebuilding, err: {}",
                            name,
                            e
                        );
                        let _ = tokio::fs::remove_dir_all(&pindex.path).await;
                    }
                }
            } else {
                tracing::info!("janitor: rebuilding pindex: {}", name);
                if let Err(e) = pindex::close_pindex(pindex, true).await {
                    tracing::warn!("janitor: close for rebuild {}, err: {}", name, e);
                }
            }
        }

        match open_or_create_pindex(mgr, plan_pindex).await {
            Ok(pindex) => {
                mgr.add_pindex(Arc::new(pindex));
                changed = true;
            }
            Err(e) => {
                // The next tick retries.
                tracing::warn!("janitor: could not start pindex {}, err: {}", name, e);
            }
        }
    }

    changed
}

async fn open_or_create_pindex(mgr: &Manager, plan_pindex: &PlanPIndex) -> Result<PIndex> {
    let path = pindex::pindex_path(mgr.data_dir(), &plan_pindex.name);

    if tokio::fs::try_exists(path.join(pindex::PINDEX_META_FILENAME))
        .await
        .unwrap_or(false)
    {
        tracing::info!("janitor: opening pindex: {}", plan_pindex.name);
        match pindex::open_pindex(&path, mgr.restart_handle_for(&plan_pindex.name)).await {
            Ok(pindex) if pindex_matches_plan(&pindex, plan_pindex) => return Ok(pindex),
            Ok(stale) => {
                // On-disk instance predates the current plan entry.
                let _ = pindex::close_pindex(&stale, true).await;
            }
            Err(e) => {
                tracing::warn!(
                    "janitor: open pindex {} failed, recreating, err: {}",
                    plan_pindex.name,
                    e
                );
                let _ = tokio::fs::remove_dir_all(&path).await;
            }
        }
    }

    tracing::info!("janitor: creating pindex: {}", plan_pindex.name);
    pindex::new_pindex(
        &plan_pindex.name,
        &plan_pindex.uuid,
        &plan_pindex.index_type,
        &plan_pindex.index_name,
        &plan_pindex.index_uuid,
        &plan_pindex.index_params,
        &plan_pindex.source_type,
        &plan_pindex.source_name,
        &plan_pindex.source_uuid,
        &plan_pindex.source_params,
        &plan_pindex.source_partitions,
        &path,
        mgr.restart_handle_for(&plan_pindex.name),
    )
    .await
}

/// Key identifying the feed one index's local partitions need.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct FeedWant {
    index_name: String,
    index_uuid: String,
    source_type: String,
    source_name: String,
    source_uuid: String,
    source_params: String,
    partitions_joined: String,
}

/// Recompute the wanted feed set from the live local partitions: one
/// feed per (source, node-local partition subset) tuple per index. A
/// subset change produces a different feed name, so the stale feed is
/// torn down and a fresh one built.
async fn reconcile_feeds(mgr: &Manager, _plan: &PlanPIndexes) -> bool {
    let pindexes = mgr.pindexes();

    type Wiring = HashMap<String, (String, Arc<dyn crate::pindex::Dest>)>;
    let mut wants: BTreeMap<FeedWant, Wiring> = BTreeMap::new();

    for pindex in pindexes.values() {
        let key = FeedWant {
            index_name: pindex.index_name.clone(),
            index_uuid: pindex.index_uuid.clone(),
            source_type: pindex.source_type.clone(),
            source_name: pindex.source_name.clone(),
            source_uuid: pindex.source_uuid.clone(),
            source_params: pindex.source_params.clone(),
            partitions_joined: String::new(), // Filled below, across pindexes.
        };

        // Feeds group whole indexes; merge this pindex's partitions in.
        let entry = wants.entry(key).or_default();
        for partition in &pindex.source_partitions_set {
            entry.insert(
                partition.clone(),
                (pindex.instance_id.clone(), pindex.dest.clone()),
            );
        }
    }

    // Finalize names once each feed's wiring is complete. The name
    // hashes partition -> instance pairs, so both a subset change and a
    // rewire to rebuilt instances force a fresh feed.
    let mut wanted_feeds: HashMap<
        String,
        (FeedWant, HashMap<String, Arc<dyn crate::pindex::Dest>>),
    > = HashMap::new();
    for (mut key, wiring) in wants {
        let mut pairs: Vec<String> = wiring
            .iter()
            .map(|(partition, (uuid, _))| format!("{partition}:{uuid}"))
            .collect();
        pairs.sort();
        key.partitions_joined = pairs.join(",");
        let name = crate::feed::feed_name(&key.index_name, &key.index_uuid, &key.partitions_joined);
        let dests = wiring
            .into_iter()
            .map(|(partition, (_, dest))| (partition, dest))
            .collect();
        wanted_feeds.insert(name, (key, dests));
    }

    let have = mgr.feeds();
    let mut changed = false;

    for (name, feed) in &have {
        if wanted_feeds.contains_key(name) {
            continue;
        }
        tracing::info!("janitor: closing feed: {}", name);
        mgr.remove_feed(name);
        changed = true;
        if let Err(e) = feed.close().await {
            tracing::warn!("janitor: close feed {}, err: {}", name, e);
        }
    }

    for (name, (key, dests)) in wanted_feeds {
        if have.contains_key(&name) {
            continue;
        }
        let source = match crate::feed::source_type(&key.source_type) {
            Some(source) => source,
            None => {
                tracing::warn!(
                    "janitor: unknown source type: {}, feed: {}",
                    key.source_type,
                    name
                );
                continue;
            }
        };
        match source
            .new_feed(
                &name,
                &key.index_name,
                &key.source_name,
                &key.source_uuid,
                &key.source_params,
                dests,
            )
            .await
        {
            Ok(feed) => {
                if let Err(e) = feed.start().await {
                    tracing::warn!("janitor: start feed {}, err: {}", name, e);
                    continue;
                }
                tracing::info!("janitor: started feed: {}", name);
                mgr.add_feed(feed);
                changed = true;
            }
            Err(e) => {
                tracing::warn!("janitor: build feed {}, err: {}", name, e);
            }
        }
    }

    changed
}
