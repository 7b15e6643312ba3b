//! Relationship fan-out — expands `connected_to`/`depends_on` edges across
//! the multiplied instance set.
//!
//! Source and target instances are partitioned into relationship components.
//! When the two templates share an enclosing scaling group, the innermost
//! common group defines one component per group instance; otherwise all
//! instances form a single global component. `all_to_all` links every source
//! to every target in its component; `all_to_one` picks one stable target
//! per component.

use std::collections::BTreeMap;

use tracing::debug;

use topoplan_core::{InstanceId, NodeInstance, PlanError, PlanResult, TemplateId};
use topoplan_graph::{ConnectionType, ResolvedScaling, TemplateEdge};

/// Component key of one instance: the enclosing common-group instance id, or
/// the empty string for the global component.
fn component_key(instance: &NodeInstance, common_group: Option<&str>) -> String {
    match common_group {
        Some(group) => instance
            .scaling_groups
            .iter()
            .find(|m| m.name == group)
            .map(|m| m.id.clone())
            .unwrap_or_default(),
        None => String::new(),
    }
}

/// Resolve the target arena slots for every source copy of `edge`.
///
/// The result is indexed by source copy index; each entry lists target arena
/// slots in target index order. `bindings` holds previously resolved
/// `all_to_one` choices; a binding whose target still exists in the component
/// is reused verbatim, so re-expansion never rebinds a surviving target.
pub(crate) fn bind(
    edge: &TemplateEdge,
    instances: &[NodeInstance],
    copies: &BTreeMap<&str, Vec<usize>>,
    scaling: &ResolvedScaling,
    bindings: &BTreeMap<(TemplateId, usize, String), InstanceId>,
) -> PlanResult<Vec<Vec<usize>>> {
    let sources = copies
        .get(edge.source.as_str())
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    let targets = copies
        .get(edge.target.as_str())
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    let common = scaling.common_group(&edge.source, &edge.target);

    if edge.connection == ConnectionType::AllToOne {
        // Every group enclosing the target must also enclose the source,
        // otherwise each target-side group instance would need its own
        // "one" target.
        let source_chain = scaling.chain_of(&edge.source);
        if let Some(foreign) = scaling
            .chain_of(&edge.target)
            .iter()
            .find(|g| !source_chain.contains(g))
        {
            return Err(PlanError::UnsupportedAllToOneInGroup {
                source_node: edge.source.clone(),
                target: edge.target.clone(),
                group: foreign.clone(),
            });
        }
    }

    // Partition target slots by component, preserving index order.
    let mut target_components: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for &slot in targets {
        target_components
            .entry(component_key(&instances[slot], common))
            .or_default()
            .push(slot);
    }

    let mut result = Vec::with_capacity(sources.len());
    for &slot in sources {
        let key = component_key(&instances[slot], common);
        let component = target_components
            .get(&key)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let chosen: Vec<usize> = match edge.connection {
            ConnectionType::AllToAll => component.to_vec(),
            ConnectionType::AllToOne => {
                let prior = bindings
                    .get(&(edge.source.clone(), edge.ordinal, key.clone()))
                    .and_then(|id| component.iter().find(|&&t| instances[t].id == *id));
                match prior.or_else(|| component.first()) {
                    Some(&t) => vec![t],
                    None => Vec::new(),
                }
            }
        };
        result.push(chosen);
    }

    debug!(
        source = %edge.source,
        target = %edge.target,
        components = target_components.len(),
        "resolved relationship fan-out"
    );

    Ok(result)
}

#[cfg(test)]
mod tests {
    use crate::expander::{ReuseTable, expand, expand_with_reuse};
    use std::collections::BTreeMap;
    use topoplan_core::{
        IdAllocator, InstancePolicy, LogicalPlan, NodeTemplate, PlanError, RelationshipTemplate,
        ScalingGroup,
    };

    fn node(id: &str, count: u32, rels: Vec<RelationshipTemplate>) -> NodeTemplate {
        NodeTemplate {
            id: id.into(),
            node_type: "nodes.Root".into(),
            host: false,
            relationships: rels,
            scalable: InstancePolicy::fixed(count),
        }
    }

    fn connected(target: &str, connection: Option<&str>) -> RelationshipTemplate {
        RelationshipTemplate {
            type_name: "connected_to".into(),
            base: None,
            target: target.into(),
            connection_type: connection.map(String::from),
        }
    }

    fn group(id: &str, members: &[&str], count: u32) -> ScalingGroup {
        ScalingGroup {
            id: id.into(),
            members: members.iter().map(|m| m.to_string()).collect(),
            scalable: InstancePolicy::fixed(count),
        }
    }

    #[test]
    fn all_to_all_is_full_bipartite_without_groups() {
        let plan = LogicalPlan {
            node_templates: vec![
                node("web", 2, vec![connected("db", None)]),
                node("db", 3, vec![]),
            ],
            groups: vec![],
        };
        let out = expand(&plan, &mut IdAllocator::seeded(1)).unwrap();
        for web in out.instances_of("web") {
            assert_eq!(web.relationships.len(), 3);
            let mut targets: Vec<&str> =
                web.relationships.iter().map(|r| r.target_id.as_str()).collect();
            targets.dedup();
            assert_eq!(targets.len(), 3);
        }
    }

    #[test]
    fn all_to_all_respects_group_components() {
        // web and db share a group of 2; each web talks only to the db in
        // its own group instance.
        let plan = LogicalPlan {
            node_templates: vec![
                node("web", 1, vec![connected("db", None)]),
                node("db", 1, vec![]),
            ],
            groups: vec![group("tier", &["web", "db"], 2)],
        };
        let out = expand(&plan, &mut IdAllocator::seeded(2)).unwrap();
        let webs = out.instances_of("web");
        let dbs = out.instances_of("db");
        assert_eq!(webs.len(), 2);
        for (web, db) in webs.iter().zip(&dbs) {
            assert_eq!(web.relationships.len(), 1);
            assert_eq!(web.relationships[0].target_id, db.id);
            assert_eq!(web.scaling_groups[0].id, db.scaling_groups[0].id);
        }
    }

    #[test]
    fn all_to_one_binds_every_source_to_the_first_target() {
        let plan = LogicalPlan {
            node_templates: vec![
                node("web", 3, vec![connected("db", Some("all_to_one"))]),
                node("db", 2, vec![]),
            ],
            groups: vec![],
        };
        let out = expand(&plan, &mut IdAllocator::seeded(3)).unwrap();
        let first_db = out.instances_of("db")[0].id.clone();
        for web in out.instances_of("web") {
            assert_eq!(web.relationships.len(), 1);
            assert_eq!(web.relationships[0].target_id, first_db);
            assert_eq!(web.relationships[0].target_name, "db");
        }
    }

    #[test]
    fn all_to_one_reuses_a_prior_binding() {
        let plan = LogicalPlan {
            node_templates: vec![
                node("web", 2, vec![connected("db", Some("all_to_one"))]),
                node("db", 2, vec![]),
            ],
            groups: vec![],
        };
        let fresh = expand(&plan, &mut IdAllocator::seeded(4)).unwrap();
        let second_db = fresh.instances_of("db")[1].id.clone();

        // Pretend the previous deployment had bound the *second* db.
        let mut reuse = ReuseTable::default();
        reuse
            .bindings
            .insert(("web".into(), 0, String::new()), second_db.clone());
        for t in ["web", "db"] {
            reuse.node_ids.insert(
                t.into(),
                fresh.instances_of(t).iter().map(|i| i.id.clone()).collect(),
            );
        }
        let again = expand_with_reuse(
            &plan,
            &mut IdAllocator::seeded(99),
            &reuse,
            &BTreeMap::new(),
        )
        .unwrap();
        for web in again.instances_of("web") {
            assert_eq!(web.relationships[0].target_id, second_db);
        }
    }

    #[test]
    fn all_to_one_into_a_foreign_group_is_rejected() {
        let plan = LogicalPlan {
            node_templates: vec![
                node("web", 1, vec![connected("db", Some("all_to_one"))]),
                node("db", 1, vec![]),
            ],
            groups: vec![group("db_tier", &["db"], 2)],
        };
        let err = expand(&plan, &mut IdAllocator::seeded(5)).unwrap_err();
        assert_eq!(
            err,
            PlanError::UnsupportedAllToOneInGroup {
                source_node: "web".into(),
                target: "db".into(),
                group: "db_tier".into(),
            }
        );
    }

    #[test]
    fn all_to_one_within_a_shared_group_picks_one_per_group_instance() {
        let plan = LogicalPlan {
            node_templates: vec![
                node("web", 2, vec![connected("db", Some("all_to_one"))]),
                node("db", 1, vec![]),
            ],
            groups: vec![group("tier", &["web", "db"], 2)],
        };
        let out = expand(&plan, &mut IdAllocator::seeded(6)).unwrap();
        // 4 webs, 2 dbs, one db per group instance.
        let webs = out.instances_of("web");
        assert_eq!(webs.len(), 4);
        for web in webs {
            assert_eq!(web.relationships.len(), 1);
            let db = out.instance(&web.relationships[0].target_id).unwrap();
            assert_eq!(web.scaling_groups[0].id, db.scaling_groups[0].id);
        }
    }

    #[test]
    fn relationship_order_mirrors_declaration_order() {
        let plan = LogicalPlan {
            node_templates: vec![
                node(
                    "app",
                    1,
                    vec![connected("cache", None), connected("db", None)],
                ),
                node("db", 2, vec![]),
                node("cache", 2, vec![]),
            ],
            groups: vec![],
        };
        let out = expand(&plan, &mut IdAllocator::seeded(7)).unwrap();
        let app = &out.instances_of("app")[0];
        let names: Vec<&str> = app.relationships.iter().map(|r| r.target_name.as_str()).collect();
        // cache first (declared first), all its instances consecutive.
        assert_eq!(names, ["cache", "cache", "db", "db"]);
    }
}
