//! The planner: splits logical indexes into physical partitions and
//! assigns those partitions to nodes.
//!
//! Planning is deterministic over its inputs. Two planners racing on
//! the same config compute structurally identical plans; the CAS write
//! picks the winner and the loser's write is a benign no-op.

pub mod placement;

use crate::manager::Manager;
use crate::metadata::{
    self, plan_pindex_name, IndexDef, IndexDefs, NodeDefs, NodeDefsKind, PlanPIndex,
    PlanPIndexNode, PlanPIndexes,
};
use crate::util::{strings_intersect_strings, strings_remove_strings};
use crate::{Error, Result};
use placement::{index_partition_model, plan_next_map, PartitionMap};
use std::collections::{BTreeMap, HashMap};

/// One planning pass: read config, compute the next plan, and CAS-write
/// it when it differs from the previous plan. Returns whether the plan
/// changed. A lost CAS race surfaces as `Error::CasMismatch`, which the
/// caller treats as "a concurrent planner won".
pub async fn planner_once(mgr: &Manager, reason: &str) -> Result<bool> {
    tracing::info!("planner: awakes, reason: {}", reason);

    let store = mgr.store();
    let version = mgr.version();

    if !metadata::check_version(store.as_ref(), version).await? {
        return Err(Error::Planner(format!("version too low: {version}")));
    }

    let (index_defs, _) = metadata::get_index_defs(store.as_ref(), version)
        .await?
        .ok_or_else(|| Error::Planner("ended since no index definitions".to_string()))?;

    let (node_defs, _) = metadata::get_node_defs(store.as_ref(), NodeDefsKind::Wanted, version)
        .await?
        .ok_or_else(|| Error::Planner("ended since no node definitions".to_string()))?;

    let node_def = node_defs
        .node_defs
        .get(mgr.uuid())
        .ok_or_else(|| Error::Planner(format!("no node definition, uuid: {}", mgr.uuid())))?;
    if !node_def.has_tag("planner") {
        return Err(Error::Planner(format!(
            "node is not a planner, uuid: {}",
            mgr.uuid()
        )));
    }

    let (plan_prev, cas) = match metadata::get_plan_pindexes(store.as_ref(), version).await? {
        Some((plan, cas)) => (plan, cas),
        None => (PlanPIndexes::new(version), 0),
    };

    let plan_next = calc_plan(&index_defs, &node_defs, &plan_prev, version).await?;

    if plan_next.same_as(&plan_prev) {
        return Ok(false);
    }

    metadata::set_plan_pindexes(store.as_ref(), &plan_next, cas).await?;

    tracing::info!(
        "planner: wrote plan, pindexes: {}",
        plan_next.plan_pindexes.len()
    );
    Ok(true)
}

/// Node layout inputs for placement, derived from the wanted node defs
/// and the previous plan.
#[derive(Debug, Default)]
pub struct NodesLayout {
    pub nodes_all: Vec<String>,
    pub nodes_to_add: Vec<String>,
    pub nodes_to_remove: Vec<String>,
    pub node_weights: HashMap<String, i32>,
    pub node_hierarchy: HashMap<String, String>,
}

/// Compute node membership deltas between the wanted node set and the
/// nodes referenced by the previous plan. Only "pindex"-capable nodes
/// participate. All lists come back sorted.
pub fn calc_nodes_layout(node_defs: &NodeDefs, plan_prev: &PlanPIndexes) -> NodesLayout {
    let mut nodes = Vec::new();
    let mut node_weights = HashMap::new();
    let mut node_hierarchy = HashMap::new();

    for node_def in node_defs.node_defs.values() {
        if !node_def.has_tag("pindex") {
            continue;
        }
        nodes.push(node_def.uuid.clone());

        if node_def.weight > 0 {
            node_weights.insert(node_def.uuid.clone(), node_def.weight);
        }

        let mut child = node_def.uuid.as_str();
        for ancestor in node_def.container.split('/') {
            if !child.is_empty() && !ancestor.is_empty() {
                node_hierarchy.insert(child.to_string(), ancestor.to_string());
            }
            child = ancestor;
        }
    }

    let nodes_prev: Vec<String> = plan_prev
        .plan_pindexes
        .values()
        .flat_map(|p| p.nodes.keys().cloned())
        .collect();
    let nodes_prev = strings_intersect_strings(&nodes_prev, &nodes_prev); // Dedupe.

    let mut nodes_all: Vec<String> = nodes.iter().chain(nodes_prev.iter()).cloned().collect();
    nodes_all = strings_intersect_strings(&nodes_all, &nodes_all); // Dedupe.
    let mut nodes_to_add = strings_remove_strings(&nodes_all, &nodes_prev);
    let mut nodes_to_remove = strings_remove_strings(&nodes_all, &nodes);

    nodes_all.sort();
    nodes_to_add.sort();
    nodes_to_remove.sort();

    NodesLayout {
        nodes_all,
        nodes_to_add,
        nodes_to_remove,
        node_weights,
        node_hierarchy,
    }
}

/// Split an index definition into physical partitions: chunks of at
/// most `max_partitions_per_pindex` source partitions (0 = everything
/// in one), the last chunk possibly smaller, at least one chunk even
/// for an empty source.
pub fn split_index_def(index_def: &IndexDef, source_partitions: &[String]) -> Vec<PlanPIndex> {
    let max = index_def.plan_params.max_partitions_per_pindex;

    let mut rv = Vec::new();
    let rv_is_empty = std::cell::Cell::new(true);
    let mut add = |chunk: &[String]| {
        rv_is_empty.set(false);
        let joined = chunk.join(",");
        rv.push(PlanPIndex {
            name: plan_pindex_name(index_def, &joined),
            uuid: crate::util::new_uuid(),
            index_type: index_def.index_type.clone(),
            index_name: index_def.name.clone(),
            index_uuid: index_def.uuid.clone(),
            index_params: index_def.params.clone(),
            source_type: index_def.source_type.clone(),
            source_name: index_def.source_name.clone(),
            source_uuid: index_def.source_uuid.clone(),
            source_params: index_def.source_params.clone(),
            source_partitions: joined,
            nodes: BTreeMap::new(),
        });
    };

    let mut curr: Vec<String> = Vec::new();
    for partition in source_partitions {
        curr.push(partition.clone());
        if max > 0 && curr.len() >= max {
            add(&curr);
            curr.clear();
        }
    }
    if !curr.is_empty() || rv_is_empty.get() {
        add(&curr);
    }

    rv
}

/// Compute the full next plan from the index definitions, wanted node
/// definitions, and the previous plan.
pub async fn calc_plan(
    index_defs: &IndexDefs,
    node_defs: &NodeDefs,
    plan_prev: &PlanPIndexes,
    version: &str,
) -> Result<PlanPIndexes> {
    let layout = calc_nodes_layout(node_defs, plan_prev);

    let mut plan = PlanPIndexes::new(version);

    for index_def in index_defs.index_defs.values() {
        if index_def.plan_params.plan_frozen {
            // Frozen: carry the previous plan for this index forward.
            for (name, prev) in &plan_prev.plan_pindexes {
                if prev.index_name == index_def.name && prev.index_uuid == index_def.uuid {
                    plan.plan_pindexes.insert(name.clone(), prev.clone());
                }
            }
            continue;
        }

        // Types without an engine (aliases) take no partitions; unknown
        // tags degrade the same way so one bad index never halts
        // planning for the rest.
        match crate::registry::index_type(&index_def.index_type) {
            Some(t) if t.can_instantiate() => {}
            _ => {
                tracing::debug!(
                    "planner: skipping index {}, type: {}",
                    index_def.name,
                    index_def.index_type
                );
                continue;
            }
        }

        let source_partitions = match crate::feed::source_partitions(
            &index_def.source_type,
            &index_def.source_name,
            &index_def.source_uuid,
            &index_def.source_params,
        )
        .await
        {
            Ok(partitions) => partitions,
            Err(e) => {
                tracing::warn!(
                    "planner: could not get partitions, index: {}, err: {}",
                    index_def.name,
                    e
                );
                continue; // Keep planning the other indexes.
            }
        };

        let pindexes = split_index_def(index_def, &source_partitions);
        let warnings = assign_pindexes(index_def, pindexes, plan_prev, &layout, &mut plan);
        for warning in &warnings {
            tracing::warn!(
                "planner: index: {}, placement warning: {}",
                index_def.name,
                warning
            );
        }
        plan.warnings.insert(index_def.name.clone(), warnings);
    }

    Ok(plan)
}

/// Run placement for one index's partitions, seeded by the previous
/// plan for stickiness, and record the assigned partitions into `plan`.
fn assign_pindexes(
    index_def: &IndexDef,
    pindexes: Vec<PlanPIndex>,
    plan_prev: &PlanPIndexes,
    layout: &NodesLayout,
    plan: &mut PlanPIndexes,
) -> Vec<String> {
    let model = index_partition_model(index_def.plan_params.num_replicas);

    // Reconstruct the previous map for these partition names, nodes
    // ordered by priority within each state.
    let mut prev_map = PartitionMap::new();
    for pindex in &pindexes {
        let mut states: BTreeMap<String, Vec<String>> = BTreeMap::new();
        if let Some(prev) = plan_prev.plan_pindexes.get(&pindex.name) {
            let mut refs: Vec<(&String, &PlanPIndexNode)> = prev.nodes.iter().collect();
            refs.sort_by_key(|(uuid, node)| (node.priority, uuid.as_str()));
            for (uuid, node) in refs {
                let state = if node.priority <= 0 { "primary" } else { "replica" };
                states
                    .entry(state.to_string())
                    .or_default()
                    .push(uuid.clone());
            }
        }
        prev_map.insert(pindex.name.clone(), states);
    }

    let (next_map, warnings) = plan_next_map(
        &prev_map,
        &layout.nodes_all,
        &layout.nodes_to_remove,
        &layout.nodes_to_add,
        &model,
        &layout.node_weights,
        &layout.node_hierarchy,
        index_def.plan_params.hierarchy_rules.as_ref(),
    );

    for mut pindex in pindexes {
        if let Some(states) = next_map.get(&pindex.name) {
            let empty = Vec::new();
            for node_uuid in states.get("primary").unwrap_or(&empty) {
                pindex
                    .nodes
                    .insert(node_uuid.clone(), assignment(index_def, &pindex.name, node_uuid, 0));
            }
            for (i, node_uuid) in states.get("replica").unwrap_or(&empty).iter().enumerate() {
                pindex.nodes.insert(
                    node_uuid.clone(),
                    assignment(index_def, &pindex.name, node_uuid, i as i32 + 1),
                );
            }
        }
        plan.plan_pindexes.insert(pindex.name.clone(), pindex);
    }

    warnings
}

fn assignment(
    index_def: &IndexDef,
    pindex_name: &str,
    node_uuid: &str,
    priority: i32,
) -> PlanPIndexNode {
    let (can_read, can_write) = match index_def
        .plan_params
        .node_plan_param(node_uuid, pindex_name)
    {
        Some(p) => (p.can_read, p.can_write),
        None => (true, true),
    };
    PlanPIndexNode {
        can_read,
        can_write,
        priority,
    }
}
