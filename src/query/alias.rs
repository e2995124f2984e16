//! The "alias" index type: a naming level of indirection over one or
//! more target indexes.
//!
//! An alias can repoint an application at a new index without an
//! application change, or fan a single query out across several real
//! indexes. Aliases have no engine; the planner skips them.

use crate::manager::Manager;
use crate::metadata::{self, IndexDef};
use crate::registry::IndexType;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Ceiling on targets visited during alias resolution. Aliases of
/// aliases may legitimately re-enter shared targets, so cycle
/// protection is a bound on total work rather than a seen-set.
pub const MAX_ALIAS_TARGETS: usize = 50_000;

/// Definition params for an alias, keyed by target index name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AliasParams {
    #[serde(default)]
    pub targets: BTreeMap<String, AliasParamsTarget>,
}

/// One alias target; the UUID pins an exact index incarnation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AliasParamsTarget {
    #[serde(default)]
    pub index_uuid: String,
}

fn parse_params(index_params: &str) -> Result<AliasParams> {
    if index_params.is_empty() {
        return Ok(AliasParams::default());
    }
    Ok(serde_json::from_str(index_params)?)
}

/// Resolve an alias to the flat list of concrete (indexName, indexUUID)
/// engine targets, depth-first across nested aliases.
pub async fn resolve_alias(
    mgr: &Manager,
    index_name: &str,
    index_uuid: &str,
) -> Result<Vec<(String, String)>> {
    let (index_defs, _) = metadata::get_index_defs(mgr.store().as_ref(), mgr.version())
        .await?
        .ok_or_else(|| Error::IndexNotFound(index_name.to_string()))?;

    let mut rv = Vec::new();
    let mut visited = 0usize;
    // Explicit DFS stack; recursion over async is not worth the boxing.
    let mut stack: Vec<(String, String)> = vec![(index_name.to_string(), index_uuid.to_string())];

    while let Some((alias_name, alias_uuid)) = stack.pop() {
        visited += 1;
        if visited > MAX_ALIAS_TARGETS {
            return Err(Error::AliasCycleOrTooWide {
                alias: index_name.to_string(),
                visited,
            });
        }

        let alias_def = index_defs
            .index_defs
            .get(&alias_name)
            .ok_or_else(|| Error::IndexNotFound(alias_name.clone()))?;
        if alias_def.index_type != "alias" {
            return Err(Error::UnsupportedAliasTarget {
                target: alias_name.clone(),
                target_type: alias_def.index_type.clone(),
            });
        }
        if !alias_uuid.is_empty() && alias_uuid != alias_def.uuid {
            return Err(Error::AliasTargetMismatch {
                target: alias_name.clone(),
                expected: alias_uuid.clone(),
                found: alias_def.uuid.clone(),
            });
        }

        let params = parse_params(&alias_def.params)?;

        for (target_name, target_spec) in &params.targets {
            visited += 1;
            if visited > MAX_ALIAS_TARGETS {
                return Err(Error::AliasCycleOrTooWide {
                    alias: index_name.to_string(),
                    visited,
                });
            }

            let target_def = index_defs.index_defs.get(target_name).ok_or_else(|| {
                Error::IndexNotFound(format!(
                    "alias {alias_name} depends on missing target {target_name}"
                ))
            })?;
            if !target_spec.index_uuid.is_empty() && target_spec.index_uuid != target_def.uuid {
                return Err(Error::AliasTargetMismatch {
                    target: target_name.clone(),
                    expected: target_spec.index_uuid.clone(),
                    found: target_def.uuid.clone(),
                });
            }

            if target_def.index_type == "alias" {
                stack.push((target_name.clone(), target_spec.index_uuid.clone()));
                continue;
            }

            match crate::registry::index_type(&target_def.index_type) {
                Some(t) if t.can_instantiate() => {
                    rv.push((target_name.clone(), target_spec.index_uuid.clone()));
                }
                _ => {
                    return Err(Error::UnsupportedAliasTarget {
                        target: target_name.clone(),
                        target_type: target_def.index_type.clone(),
                    });
                }
            }
        }
    }

    Ok(rv)
}

/// The registered "alias" implementation type.
pub struct AliasIndexType;

#[async_trait::async_trait]
impl IndexType for AliasIndexType {
    fn description(&self) -> &str {
        "advanced/alias - a naming level of indirection to one or more target indexes"
    }

    fn can_instantiate(&self) -> bool {
        false
    }

    fn validate(&self, index_name: &str, index_params: &str) -> Result<()> {
        let params = parse_params(index_params)?;
        if params.targets.is_empty() {
            return Err(Error::Config(format!(
                "alias has no targets: {index_name}"
            )));
        }
        Ok(())
    }

    fn analyze_index_def_updates(
        &self,
        _cur: &IndexDef,
        _prev: &IndexDef,
    ) -> crate::registry::UpdateEffect {
        // Nothing lives on disk for an alias.
        crate::registry::UpdateEffect::Restart
    }

    async fn count(&self, mgr: &Manager, index_name: &str, index_uuid: &str) -> Result<u64> {
        let targets = resolve_alias(mgr, index_name, index_uuid).await?;
        crate::query::count_targets(mgr, &targets, CancellationToken::new()).await
    }

    async fn query(
        &self,
        mgr: &Manager,
        index_name: &str,
        index_uuid: &str,
        req: &[u8],
    ) -> Result<Vec<u8>> {
        let targets = resolve_alias(mgr, index_name, index_uuid).await?;
        crate::query::query_targets(mgr, &targets, req).await
    }
}

/// Register the "alias" type; invoked from `register_builtin_types`.
pub fn register() {
    crate::registry::register_index_type("alias", Arc::new(AliasIndexType));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_empty_targets() {
        let t = AliasIndexType;
        assert!(t.validate("a", "").is_err());
        assert!(t.validate("a", r#"{"targets":{}}"#).is_err());
        assert!(t
            .validate("a", r#"{"targets":{"i":{}}}"#)
            .is_ok());
        assert!(t
            .validate("a", r#"{"targets":{"i":{"indexUUID":"U"}}}"#)
            .is_ok());
    }
}
