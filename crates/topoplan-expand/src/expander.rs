//! Instance expansion — multiplies the containment forest into concrete
//! node instances.
//!
//! Each containment tree is walked parent-first with an explicit worklist
//! (the tree node lists are already in parent-before-child order, so no
//! recursion is needed regardless of tree depth). Instances live in an arena
//! indexed by creation order; parent/child relations are stored as arena
//! index lists rather than references.
//!
//! Copy `j` of a child template attaches to parent copy `j mod parent_count`
//! (round-robin), and copy `i` of any template falls in group instance
//! `i mod group_count` of every enclosing group. Both distributions use the
//! same arithmetic, so a group instance always holds matching copies of all
//! its members, and a hosted copy shares every group instance with its host.

use std::collections::BTreeMap;

use tracing::{debug, info};

use topoplan_core::{
    DeploymentPlan, GroupId, GroupMembership, GroupPlan, IdAllocator, InstanceId, LogicalPlan,
    NodeInstance, PlanError, PlanResult, RelationshipInstance, TemplateId,
};
use topoplan_graph::{RelationshipKind, TemplateGraph, decompose, resolve};

use crate::fanout;

/// Identity carried over from a previous plan during re-expansion.
///
/// Slots covered by the table keep their previous ids; only slots beyond it
/// get fresh ids from the allocator. `bindings` preserves previously resolved
/// `all_to_one` targets, keyed by (source template, relationship ordinal,
/// component key).
#[derive(Debug, Clone, Default)]
pub struct ReuseTable {
    /// Template id → surviving previous instance ids, in index order.
    pub node_ids: BTreeMap<TemplateId, Vec<InstanceId>>,
    /// Group id → surviving previous group-instance ids, in index order.
    pub group_ids: BTreeMap<GroupId, Vec<String>>,
    /// (source template, relationship ordinal, component key) → target id.
    pub bindings: BTreeMap<(TemplateId, usize, String), InstanceId>,
}

/// Expand a logical plan into a fresh deployment plan.
pub fn expand(plan: &LogicalPlan, alloc: &mut IdAllocator) -> PlanResult<DeploymentPlan> {
    expand_with_reuse(plan, alloc, &ReuseTable::default(), &BTreeMap::new())
}

/// Expand a logical plan, preserving identity from a previous plan.
///
/// `overrides` replaces the `default_instances` factor of the named templates
/// or groups (absolute per-entity factors, validated against policy bounds).
pub fn expand_with_reuse(
    plan: &LogicalPlan,
    alloc: &mut IdAllocator,
    reuse: &ReuseTable,
    overrides: &BTreeMap<String, u32>,
) -> PlanResult<DeploymentPlan> {
    let graph = TemplateGraph::build(plan)?;
    let forest = decompose(&graph)?;
    let scaling = resolve(plan, &graph, &forest, overrides)?;

    // Group-instance ids, reused where the table covers the slot.
    let mut group_ids: BTreeMap<GroupId, Vec<String>> = BTreeMap::new();
    for group in &plan.groups {
        let count = scaling.group_counts[&group.id] as usize;
        let kept = reuse.group_ids.get(&group.id);
        let ids: Vec<String> = (0..count)
            .map(|k| {
                kept.and_then(|ids| ids.get(k).cloned())
                    .unwrap_or_else(|| alloc.next_id(&group.id))
            })
            .collect();
        group_ids.insert(group.id.clone(), ids);
    }

    // Pass A: create all instances, tree by tree, parent before child.
    let mut instances: Vec<NodeInstance> = Vec::new();
    let mut copies: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    let mut parent_slot: Vec<Option<usize>> = Vec::new();

    for tree in &forest.trees {
        for template_id in &tree.nodes {
            let template = graph.template(template_id).expect("tree node in graph");
            let count = scaling.node_counts[template_id];
            let parent_copies = forest
                .parent_of(template_id)
                .map(|p| copies[p].clone())
                .unwrap_or_default();

            if !parent_copies.is_empty() && count as usize % parent_copies.len() != 0 {
                return Err(PlanError::NonDividingDistribution {
                    child: template_id.clone(),
                    child_count: count,
                    parent: forest.parent_of(template_id).unwrap_or_default().to_string(),
                    parent_count: parent_copies.len() as u32,
                });
            }
            if parent_copies.is_empty() && forest.parent_of(template_id).is_some() && count > 0 {
                // Parent resolved to zero copies but the child did not.
                return Err(PlanError::NonDividingDistribution {
                    child: template_id.clone(),
                    child_count: count,
                    parent: forest.parent_of(template_id).unwrap_or_default().to_string(),
                    parent_count: 0,
                });
            }

            let kept = reuse.node_ids.get(template_id);
            let mut slots = Vec::with_capacity(count as usize);
            for i in 0..count as usize {
                let id = kept
                    .and_then(|ids| ids.get(i).cloned())
                    .unwrap_or_else(|| alloc.next_id(template_id));

                let parent_idx = (!parent_copies.is_empty())
                    .then(|| parent_copies[i % parent_copies.len()]);
                let host_id = if template.host {
                    Some(id.clone())
                } else {
                    parent_idx.and_then(|p| instances[p].host_id.clone())
                };

                let memberships: Vec<GroupMembership> = scaling
                    .chain_of(template_id)
                    .iter()
                    .map(|g| {
                        let group_count = scaling.group_counts[g] as usize;
                        GroupMembership {
                            name: g.clone(),
                            id: group_ids[g][i % group_count].clone(),
                        }
                    })
                    .collect();

                slots.push(instances.len());
                parent_slot.push(parent_idx);
                instances.push(NodeInstance {
                    id,
                    node_id: template_id.clone(),
                    index: i as u32,
                    host_id,
                    relationships: Vec::new(),
                    scaling_groups: memberships,
                    modification: None,
                });
            }
            debug!(node = %template_id, instances = count, "expanded template");
            copies.insert(template_id.as_str(), slots);
        }
    }

    // Pass B: resolve connectivity bindings per edge.
    let mut bound: BTreeMap<(&str, usize), Vec<Vec<usize>>> = BTreeMap::new();
    for template_id in graph.template_order() {
        for edge in graph.edges_from(template_id) {
            if edge.kind.is_containment() {
                continue;
            }
            let bindings =
                fanout::bind(edge, &instances, &copies, &scaling, &reuse.bindings)?;
            bound.insert((template_id, edge.ordinal), bindings);
        }
    }

    // Pass C: materialize relationship instances in declaration order.
    for template_id in graph.template_order() {
        let slots = copies[template_id].clone();
        for edge in graph.edges_from(template_id) {
            for (i, &slot) in slots.iter().enumerate() {
                let targets: Vec<usize> = if edge.kind == RelationshipKind::ContainedIn {
                    parent_slot[slot].into_iter().collect()
                } else {
                    bound[&(template_id, edge.ordinal)][i].clone()
                };
                for target_slot in targets {
                    let rel = RelationshipInstance {
                        type_name: edge.type_name.clone(),
                        target_id: instances[target_slot].id.clone(),
                        target_name: instances[target_slot].node_id.clone(),
                    };
                    instances[slot].relationships.push(rel);
                }
            }
        }
    }

    let scaling_groups: BTreeMap<GroupId, GroupPlan> = plan
        .groups
        .iter()
        .map(|g| {
            (
                g.id.clone(),
                GroupPlan {
                    instances: scaling.group_counts[&g.id],
                    instance_ids: group_ids[&g.id].clone(),
                    members: scaling.members_per_instance[&g.id].clone(),
                },
            )
        })
        .collect();

    info!(
        node_instances = instances.len(),
        groups = scaling_groups.len(),
        "expanded deployment plan"
    );

    Ok(DeploymentPlan {
        node_instances: instances,
        scaling_groups,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use topoplan_core::{InstancePolicy, NodeTemplate, RelationshipTemplate, ScalingGroup};

    fn host(id: &str, count: u32) -> NodeTemplate {
        NodeTemplate {
            id: id.into(),
            node_type: "nodes.Compute".into(),
            host: true,
            relationships: vec![],
            scalable: InstancePolicy::fixed(count),
        }
    }

    fn contained(id: &str, count: u32, parent: &str) -> NodeTemplate {
        NodeTemplate {
            id: id.into(),
            node_type: "nodes.Root".into(),
            host: false,
            relationships: vec![RelationshipTemplate {
                type_name: "contained_in".into(),
                base: None,
                target: parent.into(),
                connection_type: None,
            }],
            scalable: InstancePolicy::fixed(count),
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
    fn hosts_are_self_hosting() {
        let plan = LogicalPlan {
            node_templates: vec![host("vm", 2)],
            groups: vec![],
        };
        let out = expand(&plan, &mut IdAllocator::seeded(1)).unwrap();
        assert_eq!(out.node_instances.len(), 2);
        for instance in &out.node_instances {
            assert_eq!(instance.host_id.as_deref(), Some(instance.id.as_str()));
            assert!(instance.id.starts_with("vm_"));
        }
    }

    #[test]
    fn children_inherit_the_host_and_bind_to_their_parent_copy() {
        let plan = LogicalPlan {
            node_templates: vec![host("vm", 1), contained("db", 2, "vm")],
            groups: vec![],
        };
        let out = expand(&plan, &mut IdAllocator::seeded(2)).unwrap();
        let vm = out.instances_of("vm")[0].id.clone();
        let dbs = out.instances_of("db");
        assert_eq!(dbs.len(), 2);
        for db in dbs {
            assert_eq!(db.host_id.as_deref(), Some(vm.as_str()));
            assert_eq!(db.relationships.len(), 1);
            assert_eq!(db.relationships[0].type_name, "contained_in");
            assert_eq!(db.relationships[0].target_id, vm);
            assert_eq!(db.relationships[0].target_name, "vm");
        }
    }

    #[test]
    fn total_count_without_groups_is_the_sum_of_template_counts() {
        let plan = LogicalPlan {
            node_templates: vec![host("vm", 3), contained("db", 6, "vm"), host("lb", 1)],
            groups: vec![],
        };
        let out = expand(&plan, &mut IdAllocator::seeded(3)).unwrap();
        assert_eq!(out.node_instances.len(), 10);
        // Each vm copy hosts 6/3 = 2 dbs, round-robin.
        for vm in out.instances_of("vm") {
            let hosted = out
                .node_instances
                .iter()
                .filter(|i| i.node_id == "db" && i.host_id.as_deref() == Some(vm.id.as_str()))
                .count();
            assert_eq!(hosted, 2);
        }
    }

    #[test]
    fn non_dividing_child_count_is_rejected() {
        let plan = LogicalPlan {
            node_templates: vec![host("vm", 2), contained("db", 3, "vm")],
            groups: vec![],
        };
        let err = expand(&plan, &mut IdAllocator::seeded(4)).unwrap_err();
        assert_eq!(
            err,
            PlanError::NonDividingDistribution {
                child: "db".into(),
                child_count: 3,
                parent: "vm".into(),
                parent_count: 2,
            }
        );
    }

    #[test]
    fn group_instances_hold_matching_member_copies() {
        let plan = LogicalPlan {
            node_templates: vec![host("vm", 1), contained("db", 1, "vm")],
            groups: vec![group("tier", &["vm", "db"], 2)],
        };
        let out = expand(&plan, &mut IdAllocator::seeded(5)).unwrap();
        assert_eq!(out.instances_of("vm").len(), 2);
        assert_eq!(out.instances_of("db").len(), 2);

        let tier = &out.scaling_groups["tier"];
        assert_eq!(tier.instances, 2);
        assert_eq!(tier.instance_ids.len(), 2);
        assert_eq!(tier.members["vm"], 1);
        assert_eq!(tier.members["db"], 1);

        // Each group instance contains exactly one vm and one db, and the db
        // is hosted on the vm of the same group instance.
        for group_instance in &tier.instance_ids {
            let members: Vec<&NodeInstance> = out
                .node_instances
                .iter()
                .filter(|i| i.scaling_groups.iter().any(|m| &m.id == group_instance))
                .collect();
            assert_eq!(members.len(), 2);
            let vm = members.iter().find(|i| i.node_id == "vm").unwrap();
            let db = members.iter().find(|i| i.node_id == "db").unwrap();
            assert_eq!(db.host_id.as_deref(), Some(vm.id.as_str()));
        }
    }

    #[test]
    fn nested_group_memberships_are_outermost_first() {
        let plan = LogicalPlan {
            node_templates: vec![host("vm", 1)],
            groups: vec![group("outer", &["inner"], 2), group("inner", &["vm"], 1)],
        };
        let out = expand(&plan, &mut IdAllocator::seeded(6)).unwrap();
        let vms = out.instances_of("vm");
        assert_eq!(vms.len(), 2);
        for vm in vms {
            let names: Vec<&str> =
                vm.scaling_groups.iter().map(|m| m.name.as_str()).collect();
            assert_eq!(names, ["outer", "inner"]);
        }
    }

    #[test]
    fn reuse_preserves_surviving_ids_and_allocates_the_rest() {
        let plan = LogicalPlan {
            node_templates: vec![host("vm", 2)],
            groups: vec![],
        };
        let mut alloc = IdAllocator::seeded(7);
        let first = expand(&plan, &mut alloc).unwrap();
        let prev_ids: Vec<String> =
            first.instances_of("vm").iter().map(|i| i.id.clone()).collect();

        let scaled = LogicalPlan {
            node_templates: vec![host("vm", 3)],
            groups: vec![],
        };
        let mut reuse = ReuseTable::default();
        reuse.node_ids.insert("vm".into(), prev_ids.clone());
        for id in &prev_ids {
            alloc.reserve(id);
        }
        let second = expand_with_reuse(&scaled, &mut alloc, &reuse, &BTreeMap::new()).unwrap();
        let new_ids: Vec<String> =
            second.instances_of("vm").iter().map(|i| i.id.clone()).collect();
        assert_eq!(new_ids[..2], prev_ids[..]);
        assert!(!prev_ids.contains(&new_ids[2]));
    }

    #[test]
    fn zero_count_template_produces_no_instances() {
        let plan = LogicalPlan {
            node_templates: vec![host("vm", 0)],
            groups: vec![],
        };
        let out = expand(&plan, &mut IdAllocator::seeded(8)).unwrap();
        assert!(out.node_instances.is_empty());
    }
}
