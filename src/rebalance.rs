//! Orchestrated rebalancing: apply a membership change as an ordered
//! stream of single-partition assignment moves instead of one big-bang
//! plan replacement.
//!
//! Each move mutates exactly one plan partition's node map under CAS,
//! so feeds and queries observe a sequence of small, safe transitions.
//! A partition never loses its only copy: additions and promotions land
//! before the removals they replace.

use crate::metadata::{
    self, IndexDefs, MetaStore, NodeDefs, PlanPIndexNode, PlanPIndexes,
};
use crate::plan::placement::{index_partition_model, plan_next_map, PartitionMap};
use crate::plan::calc_nodes_layout;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The kind of a single assignment move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOp {
    /// Place a new copy on a node.
    Add,
    /// Change an existing copy's state/priority in place.
    Promote,
    /// Remove a copy from a node.
    Del,
}

/// One single-partition assignment move.
#[derive(Debug, Clone)]
pub struct AssignStep {
    pub index_name: String,
    /// Plan partition (pindex) name.
    pub partition: String,
    pub node: String,
    /// Target state name ("primary" or "replica").
    pub state: String,
    /// Target priority within the partition's node map.
    pub priority: i32,
    pub op: MoveOp,
}

/// index -> partition -> node -> state name.
type CurrStates = HashMap<String, HashMap<String, HashMap<String, String>>>;

/// Drives one rebalance: computes begin/end maps per index and applies
/// the move stream against the shared plan.
pub struct Rebalancer {
    store: Arc<dyn MetaStore>,
    version: String,
    begin_index_defs: IndexDefs,
    begin_node_defs: NodeDefs,
    begin_plan: PlanPIndexes,
    curr_states: Mutex<CurrStates>,
    stop: CancellationToken,
}

impl Rebalancer {
    /// Snapshot the current config as the starting point of a rebalance.
    pub async fn begin(store: Arc<dyn MetaStore>, version: &str) -> Result<Self> {
        let (begin_index_defs, _) = metadata::get_index_defs(store.as_ref(), version)
            .await?
            .ok_or_else(|| Error::Rebalance("no index definitions".to_string()))?;
        let (begin_node_defs, _) =
            metadata::get_node_defs(store.as_ref(), metadata::NodeDefsKind::Wanted, version)
                .await?
                .ok_or_else(|| Error::Rebalance("no node definitions".to_string()))?;
        let (begin_plan, _) = metadata::get_plan_pindexes(store.as_ref(), version)
            .await?
            .ok_or_else(|| Error::Rebalance("no plan to rebalance".to_string()))?;

        Ok(Self {
            store,
            version: version.to_string(),
            begin_index_defs,
            begin_node_defs,
            begin_plan,
            curr_states: Mutex::new(CurrStates::new()),
            stop: CancellationToken::new(),
        })
    }

    /// External stop signal; the orchestrator halts after the in-flight
    /// move.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Run the rebalance to completion, or to the first hard error or
    /// stop signal. Returns the number of moves applied.
    pub async fn run(&self) -> Result<usize> {
        let (tx, mut rx) = mpsc::channel::<AssignStep>(8);

        let steps = self.plan_moves()?;
        let stop = self.stop.clone();
        let producer = tokio::spawn(async move {
            for step in steps {
                if stop.is_cancelled() {
                    return;
                }
                if tx.send(step).await.is_err() {
                    return;
                }
            }
        });

        let mut applied = 0usize;
        let mut failure = None;
        while let Some(step) = rx.recv().await {
            if self.stop.is_cancelled() {
                break;
            }
            match self.assign_step(&step).await {
                Ok(()) => {
                    applied += 1;
                    tracing::info!(
                        "rebalance: applied {:?} {} on {} for {}/{}",
                        step.op,
                        step.state,
                        step.node,
                        step.index_name,
                        step.partition
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "rebalance: move failed, index: {}, partition: {}, err: {}",
                        step.index_name,
                        step.partition,
                        e
                    );
                    self.stop.cancel();
                    failure = Some(e);
                    break;
                }
            }
        }
        drop(rx);
        let _ = producer.await;

        match failure {
            Some(e) => Err(e),
            None => Ok(applied),
        }
    }

    /// Compute the ordered move list across all indexes. Per partition:
    /// adds, then promotions, then removals.
    fn plan_moves(&self) -> Result<Vec<AssignStep>> {
        let layout = calc_nodes_layout(&self.begin_node_defs, &self.begin_plan);

        let mut moves = Vec::new();

        for index_def in self.begin_index_defs.index_defs.values() {
            if index_def.plan_params.plan_frozen {
                continue;
            }
            match crate::registry::index_type(&index_def.index_type) {
                Some(t) if t.can_instantiate() => {}
                _ => continue,
            }

            // Begin map: current assignments of this index's partitions.
            let mut begin_map = PartitionMap::new();
            for plan_pindex in self.begin_plan.plan_pindexes.values() {
                if plan_pindex.index_name != index_def.name
                    || plan_pindex.index_uuid != index_def.uuid
                {
                    continue;
                }
                let mut states: BTreeMap<String, Vec<String>> = BTreeMap::new();
                let mut refs: Vec<(&String, &PlanPIndexNode)> =
                    plan_pindex.nodes.iter().collect();
                refs.sort_by_key(|(uuid, node)| (node.priority, uuid.as_str()));
                for (uuid, node) in refs {
                    let state = if node.priority <= 0 { "primary" } else { "replica" };
                    states
                        .entry(state.to_string())
                        .or_default()
                        .push(uuid.clone());
                }
                begin_map.insert(plan_pindex.name.clone(), states);
            }
            if begin_map.is_empty() {
                continue;
            }

            let model = index_partition_model(index_def.plan_params.num_replicas);
            let (end_map, warnings) = plan_next_map(
                &begin_map,
                &layout.nodes_all,
                &layout.nodes_to_remove,
                &layout.nodes_to_add,
                &model,
                &layout.node_weights,
                &layout.node_hierarchy,
                index_def.plan_params.hierarchy_rules.as_ref(),
            );
            for warning in warnings {
                tracing::warn!(
                    "rebalance: index: {}, placement warning: {}",
                    index_def.name,
                    warning
                );
            }

            for (partition, end_states) in &end_map {
                let begin_states = begin_map.get(partition).cloned().unwrap_or_default();
                moves.extend(partition_moves(
                    &index_def.name,
                    partition,
                    &begin_states,
                    end_states,
                ));
            }

            // Seed the validation table with the begin assignments.
            let mut curr = self.curr_states.lock();
            let by_partition = curr.entry(index_def.name.clone()).or_default();
            for (partition, states) in &begin_map {
                let slots = by_partition.entry(partition.clone()).or_default();
                for (state, nodes) in states {
                    for node in nodes {
                        slots.insert(node.clone(), state.clone());
                    }
                }
            }
        }

        Ok(moves)
    }

    /// Validate one move against the in-memory state table, then apply
    /// it to the shared plan under CAS, retrying a lost race with a
    /// fresh read.
    async fn assign_step(&self, step: &AssignStep) -> Result<()> {
        {
            let mut curr = self.curr_states.lock();
            let slots = curr
                .entry(step.index_name.clone())
                .or_default()
                .entry(step.partition.clone())
                .or_default();

            match step.op {
                MoveOp::Add => {
                    if slots.contains_key(&step.node) {
                        return Err(Error::Rebalance(format!(
                            "add into occupied slot, node: {}, partition: {}",
                            step.node, step.partition
                        )));
                    }
                    slots.insert(step.node.clone(), step.state.clone());
                }
                MoveOp::Promote => {
                    match slots.get_mut(&step.node) {
                        Some(state) => {
                            tracing::debug!(
                                "rebalance: {} moves {} -> {} on {}",
                                step.partition,
                                state,
                                step.state,
                                step.node
                            );
                            *state = step.state.clone();
                        }
                        None => {
                            return Err(Error::Rebalance(format!(
                                "promote of empty slot, node: {}, partition: {}",
                                step.node, step.partition
                            )));
                        }
                    }
                }
                MoveOp::Del => {
                    if slots.remove(&step.node).is_none() {
                        return Err(Error::Rebalance(format!(
                            "del of empty slot, node: {}, partition: {}",
                            step.node, step.partition
                        )));
                    }
                }
            }
        }

        loop {
            let (mut plan, cas) =
                metadata::get_plan_pindexes(self.store.as_ref(), &self.version)
                    .await?
                    .ok_or_else(|| Error::Rebalance("plan disappeared".to_string()))?;

            let plan_pindex = plan
                .plan_pindexes
                .get_mut(&step.partition)
                .ok_or_else(|| {
                    Error::Rebalance(format!("unknown plan partition: {}", step.partition))
                })?;

            match step.op {
                MoveOp::Add => {
                    plan_pindex.nodes.insert(
                        step.node.clone(),
                        PlanPIndexNode {
                            can_read: true,
                            can_write: true,
                            priority: step.priority,
                        },
                    );
                }
                MoveOp::Promote => match plan_pindex.nodes.get_mut(&step.node) {
                    Some(node) => node.priority = step.priority,
                    None => {
                        return Err(Error::Rebalance(format!(
                            "promote of unassigned node: {}, partition: {}",
                            step.node, step.partition
                        )));
                    }
                },
                MoveOp::Del => {
                    plan_pindex.nodes.remove(&step.node);
                }
            }

            // A reassignment is a new incarnation of the partition.
            plan_pindex.uuid = crate::util::new_uuid();
            plan.uuid = crate::util::new_uuid();

            match metadata::set_plan_pindexes(self.store.as_ref(), &plan, cas).await {
                Ok(_) => return Ok(()),
                Err(Error::CasMismatch) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Moves for one partition: adds first, then promotions, then dels, so
/// no intermediate state drops the only copy.
fn partition_moves(
    index_name: &str,
    partition: &str,
    begin: &BTreeMap<String, Vec<String>>,
    end: &BTreeMap<String, Vec<String>>,
) -> Vec<AssignStep> {
    // TODO: compact replica priorities when a rebalance stops partway
    // through a partition's moves.

    let slot = |states: &BTreeMap<String, Vec<String>>, node: &str| -> Option<(String, i32)> {
        for (state, nodes) in states {
            if let Some(pos) = nodes.iter().position(|n| n == node) {
                let priority = if state == "primary" { 0 } else { pos as i32 + 1 };
                return Some((state.clone(), priority));
            }
        }
        None
    };

    let begin_nodes: Vec<&String> = begin.values().flatten().collect();
    let end_nodes: Vec<&String> = end.values().flatten().collect();

    let mut adds = Vec::new();
    let mut promotes = Vec::new();
    let mut dels = Vec::new();

    for node in &end_nodes {
        let (end_state, end_priority) = match slot(end, node) {
            Some(rv) => rv,
            None => continue,
        };
        match slot(begin, node) {
            None => adds.push(AssignStep {
                index_name: index_name.to_string(),
                partition: partition.to_string(),
                node: (*node).clone(),
                state: end_state,
                priority: end_priority,
                op: MoveOp::Add,
            }),
            Some((begin_state, begin_priority)) => {
                if begin_state != end_state || begin_priority != end_priority {
                    promotes.push(AssignStep {
                        index_name: index_name.to_string(),
                        partition: partition.to_string(),
                        node: (*node).clone(),
                        state: end_state,
                        priority: end_priority,
                        op: MoveOp::Promote,
                    });
                }
            }
        }
    }

    for node in &begin_nodes {
        if slot(end, node).is_none() {
            dels.push(AssignStep {
                index_name: index_name.to_string(),
                partition: partition.to_string(),
                node: (*node).clone(),
                state: String::new(),
                priority: 0,
                op: MoveOp::Del,
            });
        }
    }

    let mut rv = adds;
    rv.extend(promotes);
    rv.extend(dels);
    rv
}

#[cfg(test)]
mod tests {
    use super::*;

    fn states(primary: &[&str], replicas: &[&str]) -> BTreeMap<String, Vec<String>> {
        let mut rv = BTreeMap::new();
        rv.insert(
            "primary".to_string(),
            primary.iter().map(|s| s.to_string()).collect(),
        );
        rv.insert(
            "replica".to_string(),
            replicas.iter().map(|s| s.to_string()).collect(),
        );
        rv
    }

    #[test]
    fn test_partition_moves_add_before_del() {
        let begin = states(&["n1"], &[]);
        let end = states(&["n2"], &[]);

        let moves = partition_moves("i", "p", &begin, &end);
        assert_eq!(moves.len(), 2);
        assert_eq!(moves[0].op, MoveOp::Add);
        assert_eq!(moves[0].node, "n2");
        assert_eq!(moves[1].op, MoveOp::Del);
        assert_eq!(moves[1].node, "n1");
    }

    #[test]
    fn test_partition_moves_promote_replica() {
        let begin = states(&["n1"], &["n2"]);
        let end = states(&["n2"], &["n3"]);

        let moves = partition_moves("i", "p", &begin, &end);
        let ops: Vec<(MoveOp, &str)> = moves.iter().map(|m| (m.op, m.node.as_str())).collect();
        assert_eq!(
            ops,
            vec![
                (MoveOp::Add, "n3"),
                (MoveOp::Promote, "n2"),
                (MoveOp::Del, "n1"),
            ]
        );
        // n2 becomes the primary.
        let promote = &moves[1];
        assert_eq!(promote.state, "primary");
        assert_eq!(promote.priority, 0);
    }

    #[test]
    fn test_partition_moves_no_change() {
        let begin = states(&["n1"], &["n2"]);
        let moves = partition_moves("i", "p", &begin, &begin.clone());
        assert!(moves.is_empty());
    }
}
