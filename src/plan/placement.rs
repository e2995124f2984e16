//! Generic balanced partition placement.
//!
//! Assigns partitions to nodes across prioritized states ("primary",
//! "replica"), keeping nodes on their previous assignments when
//! feasible, spreading copies across the container hierarchy when rules
//! ask for it, and respecting node weights. Every tie breaks on node
//! UUID order so independent planners converge on the same answer.

use crate::metadata::HierarchyRule;
use std::collections::{BTreeMap, HashMap, HashSet};

/// One state of the partition model.
#[derive(Debug, Clone, Copy)]
pub struct PartitionModelState {
    /// Lower priority assigns first; 0 is the primary state.
    pub priority: i32,
    /// How many copies this state requires per partition.
    pub constraints: usize,
}

/// The partition model, keyed by state name.
pub type PartitionModel = BTreeMap<String, PartitionModelState>;

/// partition name -> state name -> nodes, ordered by rank within state.
pub type PartitionMap = BTreeMap<String, BTreeMap<String, Vec<String>>>;

/// The two-state model used for index partitions: one primary plus
/// `num_replicas` replicas.
pub fn index_partition_model(num_replicas: usize) -> PartitionModel {
    let mut model = PartitionModel::new();
    model.insert(
        "primary".to_string(),
        PartitionModelState {
            priority: 0,
            constraints: 1,
        },
    );
    model.insert(
        "replica".to_string(),
        PartitionModelState {
            priority: 1,
            constraints: num_replicas,
        },
    );
    model
}

/// Walk `levels` steps up the container hierarchy from `node`.
fn ancestor_at<'a>(
    node: &'a str,
    levels: usize,
    hierarchy: &'a HashMap<String, String>,
) -> Option<&'a str> {
    let mut curr = node;
    for _ in 0..levels {
        curr = hierarchy.get(curr)?.as_str();
    }
    Some(curr)
}

fn hierarchy_penalty(
    candidate: &str,
    chosen: &[&str],
    rules: &[HierarchyRule],
    hierarchy: &HashMap<String, String>,
) -> usize {
    let mut penalty = 0;
    for rule in rules {
        if rule.exclude_level > 0 {
            if let Some(cand_anc) = ancestor_at(candidate, rule.exclude_level, hierarchy) {
                penalty += chosen
                    .iter()
                    .filter(|c| ancestor_at(c, rule.exclude_level, hierarchy) == Some(cand_anc))
                    .count();
            }
        }
        if rule.include_level > rule.exclude_level {
            if let Some(first) = chosen.first() {
                let cand_anc = ancestor_at(candidate, rule.include_level, hierarchy);
                let first_anc = ancestor_at(first, rule.include_level, hierarchy);
                if cand_anc.is_none() || cand_anc != first_anc {
                    penalty += 1;
                }
            }
        }
    }
    penalty
}

/// Compute the next assignment map.
///
/// `prev_map` seeds stickiness: a node keeps its exact previous state
/// when possible, and a node that held the partition in any state is
/// preferred over a cold one (so a surviving replica is promoted when
/// its primary leaves). Returns the new map plus human-readable
/// warnings for constraints that could not be met.
#[allow(clippy::too_many_arguments)]
pub fn plan_next_map(
    prev_map: &PartitionMap,
    nodes_all: &[String],
    nodes_to_remove: &[String],
    _nodes_to_add: &[String],
    model: &PartitionModel,
    node_weights: &HashMap<String, i32>,
    node_hierarchy: &HashMap<String, String>,
    hierarchy_rules: Option<&BTreeMap<String, Vec<HierarchyRule>>>,
) -> (PartitionMap, Vec<String>) {
    let removed: HashSet<&str> = nodes_to_remove.iter().map(|s| s.as_str()).collect();
    let mut candidates: Vec<&str> = nodes_all
        .iter()
        .map(|s| s.as_str())
        .filter(|n| !removed.contains(n))
        .collect();
    candidates.sort_unstable();

    // Assignment counts per node, for weighted balance.
    let mut counts: HashMap<&str, usize> = HashMap::new();

    let mut states: Vec<(&String, &PartitionModelState)> = model.iter().collect();
    states.sort_by_key(|(name, s)| (s.priority, name.as_str()));

    let no_rules = Vec::new();

    let mut next_map = PartitionMap::new();
    let mut warnings = Vec::new();

    for (state_name, state) in states {
        let rules = hierarchy_rules
            .and_then(|r| r.get(state_name.as_str()))
            .unwrap_or(&no_rules);

        for (partition, prev_states) in prev_map {
            let entry = next_map.entry(partition.clone()).or_default();

            let taken: HashSet<&str> = entry
                .values()
                .flat_map(|nodes| nodes.iter().map(|n| n.as_str()))
                .collect();

            let prev_same: HashSet<&str> = prev_states
                .get(state_name.as_str())
                .map(|nodes| nodes.iter().map(|n| n.as_str()).collect())
                .unwrap_or_default();
            let prev_any: HashSet<&str> = prev_states
                .values()
                .flat_map(|nodes| nodes.iter().map(|n| n.as_str()))
                .collect();

            let mut chosen: Vec<&str> = Vec::new();
            for _ in 0..state.constraints {
                // Hierarchy spread first, then weighted load so copies
                // redistribute when membership grows, then stickiness
                // so equally-loaded candidates keep their previous
                // assignment, and finally uuid order for determinism.
                let pick = candidates
                    .iter()
                    .filter(|n| !taken.contains(*n) && !chosen.contains(*n))
                    .min_by_key(|n| {
                        let stickiness = if prev_same.contains(*n) {
                            0
                        } else if prev_any.contains(*n) {
                            1
                        } else {
                            2
                        };
                        let spread = hierarchy_penalty(n, &chosen, rules, node_hierarchy);
                        let weight = node_weights.get(**n).copied().filter(|w| *w > 0).unwrap_or(1);
                        let load =
                            (counts.get(**n).copied().unwrap_or(0) as u64 * 1_000) / weight as u64;
                        (spread, load, stickiness, **n)
                    })
                    .copied();

                match pick {
                    Some(node) => {
                        *counts.entry(node).or_insert(0) += 1;
                        chosen.push(node);
                    }
                    None => {
                        warnings.push(format!(
                            "could not meet constraints, state: {}, partition: {}",
                            state_name, partition
                        ));
                        break;
                    }
                }
            }

            entry.insert(
                state_name.clone(),
                chosen.into_iter().map(|n| n.to_string()).collect(),
            );
        }
    }

    (next_map, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn empty_prev(partitions: &[&str]) -> PartitionMap {
        partitions
            .iter()
            .map(|p| (p.to_string(), BTreeMap::new()))
            .collect()
    }

    #[test]
    fn test_single_node_gets_all_primaries() {
        let prev = empty_prev(&["p0", "p1", "p2"]);
        let nodes = strings(&["n1"]);
        let (map, warnings) = plan_next_map(
            &prev,
            &nodes,
            &[],
            &nodes,
            &index_partition_model(0),
            &HashMap::new(),
            &HashMap::new(),
            None,
        );

        assert!(warnings.is_empty());
        for p in ["p0", "p1", "p2"] {
            assert_eq!(map[p]["primary"], strings(&["n1"]));
            assert!(map[p]["replica"].is_empty());
        }
    }

    #[test]
    fn test_replica_lands_on_distinct_node() {
        let prev = empty_prev(&["p0", "p1"]);
        let nodes = strings(&["n1", "n2"]);
        let (map, warnings) = plan_next_map(
            &prev,
            &nodes,
            &[],
            &nodes,
            &index_partition_model(1),
            &HashMap::new(),
            &HashMap::new(),
            None,
        );

        assert!(warnings.is_empty());
        for p in ["p0", "p1"] {
            let primary = &map[p]["primary"][0];
            let replica = &map[p]["replica"][0];
            assert_ne!(primary, replica);
        }
    }

    #[test]
    fn test_warning_when_not_enough_nodes() {
        let prev = empty_prev(&["p0"]);
        let nodes = strings(&["n1"]);
        let (map, warnings) = plan_next_map(
            &prev,
            &nodes,
            &[],
            &[],
            &index_partition_model(2),
            &HashMap::new(),
            &HashMap::new(),
            None,
        );

        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("replica"));
        assert_eq!(map["p0"]["primary"].len(), 1);
        assert!(map["p0"]["replica"].is_empty());
    }

    #[test]
    fn test_stickiness_keeps_previous_primary() {
        let mut prev = empty_prev(&["p0"]);
        prev.get_mut("p0")
            .unwrap()
            .insert("primary".to_string(), strings(&["n2"]));

        let nodes = strings(&["n1", "n2", "n3"]);
        let (map, _) = plan_next_map(
            &prev,
            &nodes,
            &[],
            &[],
            &index_partition_model(0),
            &HashMap::new(),
            &HashMap::new(),
            None,
        );

        // Without stickiness the uuid tie-break would pick n1.
        assert_eq!(map["p0"]["primary"], strings(&["n2"]));
    }

    #[test]
    fn test_surviving_replica_promoted_when_primary_removed() {
        let mut prev = empty_prev(&["p0"]);
        prev.get_mut("p0")
            .unwrap()
            .insert("primary".to_string(), strings(&["n1"]));
        prev.get_mut("p0")
            .unwrap()
            .insert("replica".to_string(), strings(&["n2"]));

        let nodes_all = strings(&["n1", "n2", "n3"]);
        let (map, _) = plan_next_map(
            &prev,
            &nodes_all,
            &strings(&["n1"]),
            &[],
            &index_partition_model(1),
            &HashMap::new(),
            &HashMap::new(),
            None,
        );

        assert_eq!(map["p0"]["primary"], strings(&["n2"]));
        assert_eq!(map["p0"]["replica"], strings(&["n3"]));
    }

    #[test]
    fn test_weighted_nodes_take_more_partitions() {
        let prev = empty_prev(&["p0", "p1", "p2", "p3"]);
        let nodes = strings(&["n1", "n2"]);
        let mut weights = HashMap::new();
        weights.insert("n1".to_string(), 3);
        weights.insert("n2".to_string(), 1);

        let (map, _) = plan_next_map(
            &prev,
            &nodes,
            &[],
            &[],
            &index_partition_model(0),
            &weights,
            &HashMap::new(),
            None,
        );

        let n1_count = map
            .values()
            .filter(|states| states["primary"] == strings(&["n1"]))
            .count();
        assert!(n1_count >= 3, "n1 should carry most partitions, got {n1_count}");
    }

    #[test]
    fn test_hierarchy_rule_spreads_replicas_across_racks() {
        let prev = empty_prev(&["p0"]);
        // n1, n2 share rack r1; n3 sits in rack r2.
        let nodes = strings(&["n1", "n2", "n3"]);
        let mut hierarchy = HashMap::new();
        hierarchy.insert("n1".to_string(), "r1".to_string());
        hierarchy.insert("n2".to_string(), "r1".to_string());
        hierarchy.insert("n3".to_string(), "r2".to_string());

        let mut rules = BTreeMap::new();
        rules.insert(
            "replica".to_string(),
            vec![HierarchyRule {
                include_level: 0,
                exclude_level: 1,
            }],
        );

        let (map, _) = plan_next_map(
            &prev,
            &nodes,
            &[],
            &[],
            &index_partition_model(1),
            &HashMap::new(),
            &hierarchy,
            Some(&rules),
        );

        // Primary ties break to n1; the replica must avoid rack r1.
        assert_eq!(map["p0"]["primary"], strings(&["n1"]));
        assert_eq!(map["p0"]["replica"], strings(&["n3"]));
    }

    #[test]
    fn test_determinism_independent_of_input_order() {
        let prev = empty_prev(&["p0", "p1", "p2"]);
        let a = strings(&["n1", "n2", "n3"]);
        let mut b = strings(&["n3", "n1", "n2"]);
        b.sort();

        let (map_a, _) = plan_next_map(
            &prev,
            &a,
            &[],
            &[],
            &index_partition_model(1),
            &HashMap::new(),
            &HashMap::new(),
            None,
        );
        let (map_b, _) = plan_next_map(
            &prev,
            &b,
            &[],
            &[],
            &index_partition_model(1),
            &HashMap::new(),
            &HashMap::new(),
            None,
        );

        assert_eq!(map_a, map_b);
    }
}
