//! Model types stored in the metadata store.
//!
//! Collections use BTreeMap so that serialization and planning iterate
//! in a stable order regardless of insertion history.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A user-declared logical index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDef {
    pub name: String,
    pub uuid: String,
    /// Type tag selecting a registered index implementation.
    #[serde(rename = "type")]
    pub index_type: String,
    /// Opaque, type-specific parameters (JSON text).
    #[serde(default)]
    pub params: String,
    pub source_type: String,
    pub source_name: String,
    #[serde(default)]
    pub source_uuid: String,
    #[serde(default)]
    pub source_params: String,
    #[serde(default)]
    pub plan_params: PlanParams,
}

/// The collection of all index definitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDefs {
    /// Changes whenever any index definition changes.
    pub uuid: String,
    pub impl_version: String,
    pub index_defs: BTreeMap<String, IndexDef>,
}

impl IndexDefs {
    pub fn new(impl_version: &str) -> Self {
        Self {
            uuid: crate::util::new_uuid(),
            impl_version: impl_version.to_string(),
            index_defs: BTreeMap::new(),
        }
    }
}

/// Per-index planning knobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanParams {
    /// Max source partitions per physical partition; 0 means all
    /// source partitions land in one physical partition.
    #[serde(default)]
    pub max_partitions_per_pindex: usize,
    /// Number of replica copies wanted beyond the primary.
    #[serde(default)]
    pub num_replicas: usize,
    /// When true the planner only copies the previous plan forward.
    #[serde(default)]
    pub plan_frozen: bool,
    /// Per-node read/write overrides; outer key is a node UUID ("" for
    /// any node), inner key a pindex name ("" for any pindex).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_plan_params: Option<BTreeMap<String, BTreeMap<String, NodePlanParam>>>,
    /// Placement spread rules, keyed by state name ("replica").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hierarchy_rules: Option<BTreeMap<String, Vec<HierarchyRule>>>,
}

/// Read/write override for a node's assignment of a pindex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePlanParam {
    pub can_read: bool,
    pub can_write: bool,
}

impl PlanParams {
    /// Resolve the read/write override for a (node, pindex) pair,
    /// falling back through wildcard entries.
    pub fn node_plan_param(&self, node_uuid: &str, pindex_name: &str) -> Option<&NodePlanParam> {
        let overrides = self.node_plan_params.as_ref()?;
        for node_key in [node_uuid, ""] {
            if let Some(by_pindex) = overrides.get(node_key) {
                for pindex_key in [pindex_name, ""] {
                    if let Some(p) = by_pindex.get(pindex_key) {
                        return Some(p);
                    }
                }
            }
        }
        None
    }
}

/// Placement spread rule: copies of a state should land under distinct
/// ancestors `exclude_level` steps up the container hierarchy, while
/// staying within the ancestor `include_level` steps up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HierarchyRule {
    #[serde(default)]
    pub include_level: usize,
    #[serde(default)]
    pub exclude_level: usize,
}

/// A cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDef {
    pub host_port: String,
    pub uuid: String,
    pub impl_version: String,
    /// Capability tags ("planner", "pindex", "queryer"); None means all
    /// capabilities are on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    /// Hierarchy path, like "zone/rack/host".
    #[serde(default)]
    pub container: String,
    /// Relative capacity for placement; only positive weights count.
    #[serde(default)]
    pub weight: i32,
}

impl NodeDef {
    /// True when this node carries the given capability tag. A missing
    /// tags list means every tag is on.
    pub fn has_tag(&self, tag: &str) -> bool {
        match &self.tags {
            None => true,
            Some(tags) if tags.is_empty() => true,
            Some(tags) => tags.iter().any(|t| t == tag),
        }
    }
}

/// A collection of node definitions (known or wanted keyspace).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDefs {
    pub uuid: String,
    pub impl_version: String,
    pub node_defs: BTreeMap<String, NodeDef>,
}

impl NodeDefs {
    pub fn new(impl_version: &str) -> Self {
        Self {
            uuid: crate::util::new_uuid(),
            impl_version: impl_version.to_string(),
            node_defs: BTreeMap::new(),
        }
    }
}

/// One node's assignment of a physical partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanPIndexNode {
    pub can_read: bool,
    pub can_write: bool,
    /// 0 = primary; >= 1 = replica rank.
    pub priority: i32,
}

/// Authoritative record of one physical partition of one logical index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanPIndex {
    /// Derived deterministically from the index identity and the
    /// source-partition list, so racing planners agree on names.
    pub name: String,
    /// Regenerated whenever the assignment changes.
    pub uuid: String,
    pub index_type: String,
    pub index_name: String,
    pub index_uuid: String,
    #[serde(default)]
    pub index_params: String,
    pub source_type: String,
    pub source_name: String,
    #[serde(default)]
    pub source_uuid: String,
    #[serde(default)]
    pub source_params: String,
    /// Comma-joined source-partition identifiers, in discovery order.
    pub source_partitions: String,
    /// Assignment, keyed by node UUID.
    pub nodes: BTreeMap<String, PlanPIndexNode>,
}

impl PlanPIndex {
    /// Structural equality ignoring the freshly-generated UUID, which
    /// differs between independent planners computing the same plan.
    pub fn same_as(&self, other: &PlanPIndex) -> bool {
        self.name == other.name
            && self.index_type == other.index_type
            && self.index_name == other.index_name
            && self.index_uuid == other.index_uuid
            && self.index_params == other.index_params
            && self.source_type == other.source_type
            && self.source_name == other.source_name
            && self.source_uuid == other.source_uuid
            && self.source_params == other.source_params
            && self.source_partitions == other.source_partitions
            && self.nodes == other.nodes
    }

    /// The source-partition list as a vector.
    pub fn source_partitions_vec(&self) -> Vec<String> {
        if self.source_partitions.is_empty() {
            return Vec::new();
        }
        self.source_partitions
            .split(',')
            .map(|s| s.to_string())
            .collect()
    }
}

/// The full partition plan: the authoritative assignment plus per-index
/// planner warnings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanPIndexes {
    pub uuid: String,
    pub impl_version: String,
    pub plan_pindexes: BTreeMap<String, PlanPIndex>,
    #[serde(default)]
    pub warnings: BTreeMap<String, Vec<String>>,
}

impl PlanPIndexes {
    pub fn new(impl_version: &str) -> Self {
        Self {
            uuid: crate::util::new_uuid(),
            impl_version: impl_version.to_string(),
            plan_pindexes: BTreeMap::new(),
            warnings: BTreeMap::new(),
        }
    }

    /// Structural plan equality, ignoring collection UUIDs and the
    /// fresh UUIDs of individual plan entries.
    pub fn same_as(&self, other: &PlanPIndexes) -> bool {
        if self.plan_pindexes.len() != other.plan_pindexes.len() {
            return false;
        }
        self.plan_pindexes.iter().all(|(name, p)| {
            other
                .plan_pindexes
                .get(name)
                .map(|o| p.same_as(o))
                .unwrap_or(false)
        })
    }
}

/// Deterministic physical-partition name:
/// `<indexName>_<indexUUID>_<hex(crc32-IEEE(sourcePartitions))>`.
///
/// The raw source-partition list can be long (hash partitioning yields
/// hundreds of IDs) and the name doubles as a filesystem path, so the
/// list is folded through crc32.
pub fn plan_pindex_name(index_def: &IndexDef, source_partitions: &str) -> String {
    let mut h = crc32fast::Hasher::new();
    h.update(source_partitions.as_bytes());
    format!("{}_{}_{:x}", index_def.name, index_def.uuid, h.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_def() -> IndexDef {
        IndexDef {
            name: "i".to_string(),
            uuid: "U".to_string(),
            index_type: "kvlite".to_string(),
            params: String::new(),
            source_type: "direct".to_string(),
            source_name: "s".to_string(),
            source_uuid: String::new(),
            source_params: String::new(),
            plan_params: PlanParams::default(),
        }
    }

    #[test]
    fn test_plan_pindex_name_stable() {
        let def = index_def();
        let a = plan_pindex_name(&def, "0,1,2,3");
        let b = plan_pindex_name(&def, "0,1,2,3");
        assert_eq!(a, b);
        assert!(a.starts_with("i_U_"));
        assert_ne!(a, plan_pindex_name(&def, "4,5"));
    }

    #[test]
    fn test_plan_pindex_name_crc() {
        // crc32-IEEE("0,1,2,3") spelled out so the format never drifts.
        let def = index_def();
        let mut h = crc32fast::Hasher::new();
        h.update(b"0,1,2,3");
        assert_eq!(
            plan_pindex_name(&def, "0,1,2,3"),
            format!("i_U_{:x}", h.finalize())
        );
    }

    #[test]
    fn test_same_as_ignores_uuid() {
        let def = index_def();
        let mut a = PlanPIndex {
            name: plan_pindex_name(&def, "0,1"),
            uuid: "uuid-a".to_string(),
            index_type: def.index_type.clone(),
            index_name: def.name.clone(),
            index_uuid: def.uuid.clone(),
            index_params: String::new(),
            source_type: def.source_type.clone(),
            source_name: def.source_name.clone(),
            source_uuid: String::new(),
            source_params: String::new(),
            source_partitions: "0,1".to_string(),
            nodes: BTreeMap::new(),
        };
        let mut b = a.clone();
        b.uuid = "uuid-b".to_string();
        assert!(a.same_as(&b));

        a.nodes.insert(
            "n1".to_string(),
            PlanPIndexNode {
                can_read: true,
                can_write: true,
                priority: 0,
            },
        );
        assert!(!a.same_as(&b));
    }

    #[test]
    fn test_node_def_tags() {
        let mut node = NodeDef {
            host_port: "127.0.0.1:9200".to_string(),
            uuid: "n1".to_string(),
            impl_version: "1.0.0".to_string(),
            tags: None,
            container: String::new(),
            weight: 0,
        };
        assert!(node.has_tag("planner"));
        assert!(node.has_tag("pindex"));

        node.tags = Some(vec!["planner".to_string()]);
        assert!(node.has_tag("planner"));
        assert!(!node.has_tag("pindex"));

        node.tags = Some(vec![]);
        assert!(node.has_tag("queryer"));
    }

    #[test]
    fn test_node_plan_param_fallback() {
        let mut by_pindex = BTreeMap::new();
        by_pindex.insert(
            "".to_string(),
            NodePlanParam {
                can_read: false,
                can_write: true,
            },
        );
        let mut overrides = BTreeMap::new();
        overrides.insert("n1".to_string(), by_pindex);

        let params = PlanParams {
            node_plan_params: Some(overrides),
            ..Default::default()
        };

        let p = params.node_plan_param("n1", "whatever").unwrap();
        assert!(!p.can_read);
        assert!(p.can_write);
        assert!(params.node_plan_param("n2", "whatever").is_none());
    }

    #[test]
    fn test_serde_round_trip() {
        let def = index_def();
        let buf = serde_json::to_vec(&def).unwrap();
        let back: IndexDef = serde_json::from_slice(&buf).unwrap();
        assert_eq!(def, back);

        // Wire field names stay camelCase with "type" for the tag.
        let v: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(v["type"], "kvlite");
        assert_eq!(v["sourceType"], "direct");
        assert!(v["planParams"]["maxPartitionsPerPIndex"].is_number());
    }
}
