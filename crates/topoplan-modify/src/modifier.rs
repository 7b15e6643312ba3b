//! Deployment modification — computes scale-out/scale-in diffs.
//!
//! Given the previous deployment plan, the (possibly updated) logical plan,
//! and a map of absolute target counts, the modifier re-runs the expansion
//! pipeline with identity carried over from the previous plan: surviving
//! instances keep their ids, group instances keep theirs, and previously
//! resolved `all_to_one` bindings are reused verbatim. The diff then falls
//! out of the id sets: candidate ids absent from the previous plan are
//! additions, previous ids selected for removal are removals, and existing
//! instances whose relationship set changed are extensions/reductions.
//!
//! Removal is whole-subtree: a removed instance takes its containment
//! descendants, and a removed group instance takes every member copy
//! assigned to it. The selection rule is stable: instances named in the
//! include hint go first, exclude-hinted instances are avoided, and the
//! remainder comes from the highest-indexed copies down.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use topoplan_core::{
    DeploymentPlan, IdAllocator, InstanceId, LogicalPlan, NodeInstance, NodeModification,
    PlanError, PlanResult,
};
use topoplan_expand::{ReuseTable, expand_with_reuse};
use topoplan_graph::{ConnectionType, TemplateGraph, decompose, resolve};

/// One modification request, keyed externally by template or group id.
///
/// `instances` is the absolute target count for the entity (not a delta).
#[derive(Debug, Clone, Default)]
pub struct ModificationRequest {
    pub instances: u32,
    /// Instance ids to prefer removing on scale-in.
    pub removed_ids_include_hint: Vec<InstanceId>,
    /// Instance ids to avoid removing on scale-in.
    pub removed_ids_exclude_hint: Vec<InstanceId>,
}

impl ModificationRequest {
    pub fn count(instances: u32) -> Self {
        Self {
            instances,
            ..Self::default()
        }
    }
}

/// The computed deployment diff.
#[derive(Debug, Clone)]
pub struct ModifyOutcome {
    /// Added instances (marked `added`) plus existing instances related to
    /// them through a relationship or a shared group instance.
    pub added_and_related: Vec<NodeInstance>,
    /// Removed instances (marked `removed`) plus related existing instances,
    /// drawn from the previous plan.
    pub removed_and_related: Vec<NodeInstance>,
    /// Existing instances that only gained relationship edges, plus the
    /// targets of those new edges.
    pub extended_and_related: Vec<NodeInstance>,
    /// Existing instances that only lost relationship edges, plus the
    /// targets of the lost edges.
    pub reduced_and_related: Vec<NodeInstance>,
    /// The full candidate plan after the modification, for the caller to
    /// persist.
    pub plan: DeploymentPlan,
}

impl ModifyOutcome {
    /// True when the modification changed nothing.
    pub fn is_noop(&self) -> bool {
        self.added_and_related.is_empty()
            && self.removed_and_related.is_empty()
            && self.extended_and_related.is_empty()
            && self.reduced_and_related.is_empty()
    }
}

/// Compute the diff between `previous` and `plan` with the requested counts.
pub fn modify(
    previous: &DeploymentPlan,
    plan: &LogicalPlan,
    requests: &BTreeMap<String, ModificationRequest>,
    alloc: &mut IdAllocator,
) -> PlanResult<ModifyOutcome> {
    // Request validation happens before any graph work.
    let overrides = validate_requests(plan, requests)?;

    let graph = TemplateGraph::build(plan)?;
    let forest = decompose(&graph)?;
    let scaling = resolve(plan, &graph, &forest, &overrides)?;

    // Previous identity, in index order.
    let mut slots: BTreeMap<String, Vec<(u32, InstanceId)>> = BTreeMap::new();
    for instance in &previous.node_instances {
        slots
            .entry(instance.node_id.clone())
            .or_default()
            .push((instance.index, instance.id.clone()));
    }
    let prev_node_ids: BTreeMap<String, Vec<InstanceId>> = slots
        .into_iter()
        .map(|(template, mut ids)| {
            ids.sort_by_key(|(index, _)| *index);
            (template, ids.into_iter().map(|(_, id)| id).collect())
        })
        .collect();

    let prev_by_id: BTreeMap<&str, &NodeInstance> = previous
        .node_instances
        .iter()
        .map(|i| (i.id.as_str(), i))
        .collect();

    // The allocator must never re-issue a previous id, surviving or not.
    for instance in &previous.node_instances {
        alloc.reserve(&instance.id);
    }
    for group_plan in previous.scaling_groups.values() {
        for id in &group_plan.instance_ids {
            alloc.reserve(id);
        }
    }

    // Select whole-subtree removals per scale-in request.
    let mut removed_ids: BTreeSet<InstanceId> = BTreeSet::new();
    let mut removed_group_instances: BTreeSet<String> = BTreeSet::new();

    for (target, request) in requests {
        if graph.contains(target) {
            let prev = prev_node_ids.get(target).cloned().unwrap_or_default();
            let new_total = scaling.node_counts[target] as usize;
            if prev.len() > new_total {
                let selected = select_removals(
                    target,
                    &prev,
                    prev.len() - new_total,
                    &request.removed_ids_include_hint,
                    &request.removed_ids_exclude_hint,
                )?;
                for id in selected {
                    collect_subtree(&id, previous, &graph, &mut removed_ids);
                }
            }
        } else {
            // Group target: select whole group instances.
            let prev_gids = previous
                .scaling_groups
                .get(target)
                .map(|g| g.instance_ids.clone())
                .unwrap_or_default();
            let new_total = scaling.group_counts[target] as usize;
            if prev_gids.len() > new_total {
                let hint_to_gid = |hints: &[InstanceId]| -> Vec<String> {
                    hints
                        .iter()
                        .filter_map(|id| prev_by_id.get(id.as_str()))
                        .filter_map(|i| {
                            i.scaling_groups
                                .iter()
                                .find(|m| &m.name == target)
                                .map(|m| m.id.clone())
                        })
                        .collect()
                };
                let selected = select_removals(
                    target,
                    &prev_gids,
                    prev_gids.len() - new_total,
                    &hint_to_gid(&request.removed_ids_include_hint),
                    &hint_to_gid(&request.removed_ids_exclude_hint),
                )?;
                for gid in selected {
                    for instance in &previous.node_instances {
                        if instance.scaling_groups.iter().any(|m| m.id == gid) {
                            collect_subtree(&instance.id, previous, &graph, &mut removed_ids);
                        }
                    }
                    // Nested group instances assigned to this group instance
                    // disappear with it.
                    let removed_index = prev_gids.iter().position(|g| *g == gid);
                    for (nested, nested_plan) in &previous.scaling_groups {
                        if nested == target || !scaling.chain_of(nested).contains(target) {
                            continue;
                        }
                        if let Some(k) = removed_index {
                            for (j, nested_id) in nested_plan.instance_ids.iter().enumerate() {
                                if j % prev_gids.len() == k {
                                    removed_group_instances.insert(nested_id.clone());
                                }
                            }
                        }
                    }
                    removed_group_instances.insert(gid);
                }
            }
        }
    }

    // Survivors become the reuse table.
    let mut reuse = ReuseTable::default();
    for (template, ids) in &prev_node_ids {
        reuse.node_ids.insert(
            template.clone(),
            ids.iter()
                .filter(|id| !removed_ids.contains(*id))
                .cloned()
                .collect(),
        );
    }
    for (group, group_plan) in &previous.scaling_groups {
        reuse.group_ids.insert(
            group.clone(),
            group_plan
                .instance_ids
                .iter()
                .filter(|id| !removed_group_instances.contains(*id))
                .cloned()
                .collect(),
        );
    }
    collect_all_to_one_bindings(previous, &graph, &scaling, &mut reuse);

    let mut candidate = expand_with_reuse(plan, alloc, &reuse, &overrides)?;

    // Mark additions on the candidate, removals on a previous-plan clone.
    let mut added_ids: BTreeSet<&str> = BTreeSet::new();
    for instance in &mut candidate.node_instances {
        if !prev_by_id.contains_key(instance.id.as_str()) {
            instance.modification = Some(NodeModification::Added);
        }
    }
    for instance in &candidate.node_instances {
        if instance.modification == Some(NodeModification::Added) {
            added_ids.insert(&instance.id);
        }
    }

    let mut previous_marked = previous.clone();
    for instance in &mut previous_marked.node_instances {
        if removed_ids.contains(&instance.id) {
            instance.modification = Some(NodeModification::Removed);
        }
    }

    let added_and_related = related_bucket(&candidate.node_instances, &added_ids);
    let removed_set: BTreeSet<&str> = removed_ids.iter().map(String::as_str).collect();
    let removed_and_related = related_bucket(&previous_marked.node_instances, &removed_set);

    // Extensions and reductions: existing instances whose edge set changed.
    let rel_set = |i: &NodeInstance| -> BTreeSet<(String, String)> {
        i.relationships
            .iter()
            .map(|r| (r.type_name.clone(), r.target_id.clone()))
            .collect()
    };
    let cand_by_id: BTreeMap<&str, &NodeInstance> = candidate
        .node_instances
        .iter()
        .map(|i| (i.id.as_str(), i))
        .collect();

    let mut extended_and_related: Vec<NodeInstance> = Vec::new();
    let mut reduced_and_related: Vec<NodeInstance> = Vec::new();
    let mut in_extended: BTreeSet<String> = BTreeSet::new();
    let mut in_reduced: BTreeSet<String> = BTreeSet::new();

    for instance in &candidate.node_instances {
        let Some(prev) = prev_by_id.get(instance.id.as_str()) else {
            continue;
        };
        let gained: Vec<(String, String)> =
            rel_set(instance).difference(&rel_set(prev)).cloned().collect();
        if gained.is_empty() {
            continue;
        }
        if in_extended.insert(instance.id.clone()) {
            extended_and_related.push(instance.clone());
        }
        for (_, target_id) in gained {
            if let Some(target) = cand_by_id.get(target_id.as_str())
                && in_extended.insert(target_id.clone())
            {
                extended_and_related.push((*target).clone());
            }
        }
    }

    for instance in &previous_marked.node_instances {
        let Some(candidate_self) = cand_by_id.get(instance.id.as_str()) else {
            continue;
        };
        let lost: Vec<(String, String)> = rel_set(instance)
            .difference(&rel_set(candidate_self))
            .cloned()
            .collect();
        if lost.is_empty() {
            continue;
        }
        if in_reduced.insert(instance.id.clone()) {
            reduced_and_related.push(instance.clone());
        }
        for (_, target_id) in lost {
            if let Some(target) = previous_marked
                .node_instances
                .iter()
                .find(|i| i.id == target_id)
                && in_reduced.insert(target_id.clone())
            {
                reduced_and_related.push(target.clone());
            }
        }
    }

    info!(
        added = added_ids.len(),
        removed = removed_ids.len(),
        extended = extended_and_related.len(),
        reduced = reduced_and_related.len(),
        "computed deployment modification"
    );

    Ok(ModifyOutcome {
        added_and_related,
        removed_and_related,
        extended_and_related,
        reduced_and_related,
        plan: candidate,
    })
}

/// Validate every request against its target's policy; return the override
/// factors for the scaling resolver.
fn validate_requests(
    plan: &LogicalPlan,
    requests: &BTreeMap<String, ModificationRequest>,
) -> PlanResult<BTreeMap<String, u32>> {
    let mut overrides = BTreeMap::new();
    for (target, request) in requests {
        let policy = plan
            .node_templates
            .iter()
            .find(|t| &t.id == target)
            .map(|t| &t.scalable)
            .or_else(|| {
                plan.groups
                    .iter()
                    .find(|g| &g.id == target)
                    .map(|g| &g.scalable)
            })
            .ok_or_else(|| PlanError::UnknownModificationTarget(target.clone()))?;

        let max = policy
            .max_instances
            .resolve()
            .map_err(|detail| PlanError::InvalidInstanceRange {
                id: target.clone(),
                detail,
            })?;
        if request.instances < policy.min_instances || max.is_some_and(|m| request.instances > m) {
            warn!(target = %target, instances = request.instances, "modification out of range");
            return Err(PlanError::InvalidInstanceRange {
                id: target.clone(),
                detail: format!(
                    "requested {} instances outside [{}, {}]",
                    request.instances,
                    policy.min_instances,
                    max.map_or("unbounded".to_string(), |m| m.to_string())
                ),
            });
        }
        overrides.insert(target.clone(), request.instances);
    }
    Ok(overrides)
}

/// Pick `needed` entries to remove from `ordered` (lowest index first).
///
/// Include-hinted entries are taken first in index order; the remainder comes
/// from the highest index down, skipping exclude-hinted entries.
fn select_removals(
    target: &str,
    ordered: &[String],
    needed: usize,
    include: &[String],
    exclude: &[String],
) -> PlanResult<Vec<String>> {
    let mut chosen: Vec<String> = Vec::with_capacity(needed);
    for id in ordered {
        if chosen.len() == needed {
            break;
        }
        if include.contains(id) {
            chosen.push(id.clone());
        }
    }
    for id in ordered.iter().rev() {
        if chosen.len() == needed {
            break;
        }
        if !chosen.contains(id) && !exclude.contains(id) {
            chosen.push(id.clone());
        }
    }
    if chosen.len() < needed {
        return Err(PlanError::InsufficientRemovableInstances {
            id: target.to_string(),
            requested: needed as u32,
            available: chosen.len() as u32,
        });
    }
    debug!(target = %target, removed = ?chosen, "selected removal slots");
    Ok(chosen)
}

/// Add `root` and its containment descendants (from the previous plan) to
/// `removed`.
///
/// Parentage is read off the template's `contained_in` edge only; a
/// connectivity edge to the same parent template never counts.
fn collect_subtree(
    root: &str,
    previous: &DeploymentPlan,
    graph: &TemplateGraph<'_>,
    removed: &mut BTreeSet<InstanceId>,
) {
    let mut worklist = vec![root.to_string()];
    while let Some(current) = worklist.pop() {
        if !removed.insert(current.clone()) {
            continue;
        }
        for instance in &previous.node_instances {
            let is_child = graph
                .edges_from(&instance.node_id)
                .iter()
                .find(|e| e.kind.is_containment())
                .is_some_and(|edge| {
                    instance.relationships.iter().any(|r| {
                        r.type_name == edge.type_name
                            && r.target_name == edge.target
                            && r.target_id == current
                    })
                });
            if is_child {
                worklist.push(instance.id.clone());
            }
        }
    }
}

/// Previously resolved `all_to_one` targets, keyed the way the fan-out
/// engine looks them up.
fn collect_all_to_one_bindings(
    previous: &DeploymentPlan,
    graph: &TemplateGraph<'_>,
    scaling: &topoplan_graph::ResolvedScaling,
    reuse: &mut ReuseTable,
) {
    for instance in &previous.node_instances {
        for edge in graph.edges_from(&instance.node_id) {
            if edge.connection != ConnectionType::AllToOne {
                continue;
            }
            let Some(bound) = instance
                .relationships
                .iter()
                .find(|r| r.type_name == edge.type_name && r.target_name == edge.target)
            else {
                continue;
            };
            let key = match scaling.common_group(&instance.node_id, &edge.target) {
                Some(group) => instance
                    .scaling_groups
                    .iter()
                    .find(|m| m.name == group)
                    .map(|m| m.id.clone())
                    .unwrap_or_default(),
                None => String::new(),
            };
            reuse
                .bindings
                .entry((instance.node_id.clone(), edge.ordinal, key))
                .or_insert_with(|| bound.target_id.clone());
        }
    }
}

/// All instances in `instances` that are marked, plus the ones related to a
/// marked instance through a relationship (either direction) or a shared
/// group instance. Order follows `instances`.
fn related_bucket(instances: &[NodeInstance], marked: &BTreeSet<&str>) -> Vec<NodeInstance> {
    if marked.is_empty() {
        return Vec::new();
    }

    // Group instances touched by a marked instance.
    let mut marked_groups: BTreeSet<&str> = BTreeSet::new();
    // Targets of marked instances' relationships.
    let mut marked_targets: BTreeSet<&str> = BTreeSet::new();
    for instance in instances {
        if !marked.contains(instance.id.as_str()) {
            continue;
        }
        for membership in &instance.scaling_groups {
            marked_groups.insert(&membership.id);
        }
        for rel in &instance.relationships {
            marked_targets.insert(&rel.target_id);
        }
    }

    instances
        .iter()
        .filter(|instance| {
            marked.contains(instance.id.as_str())
                || marked_targets.contains(instance.id.as_str())
                || instance
                    .relationships
                    .iter()
                    .any(|r| marked.contains(r.target_id.as_str()))
                || instance
                    .scaling_groups
                    .iter()
                    .any(|m| marked_groups.contains(m.id.as_str()))
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use topoplan_core::{InstancePolicy, MaxInstances, NodeTemplate};
    use topoplan_expand::expand;

    fn host(id: &str, count: u32) -> NodeTemplate {
        NodeTemplate {
            id: id.into(),
            node_type: "nodes.Compute".into(),
            host: true,
            relationships: vec![],
            scalable: InstancePolicy::fixed(count),
        }
    }

    fn request(n: u32) -> ModificationRequest {
        ModificationRequest::count(n)
    }

    #[test]
    fn unknown_target_is_rejected_before_expansion() {
        let plan = LogicalPlan {
            node_templates: vec![host("vm", 1)],
            groups: vec![],
        };
        let previous = expand(&plan, &mut IdAllocator::seeded(1)).unwrap();
        let requests = BTreeMap::from([("ghost".to_string(), request(2))]);
        let err = modify(&previous, &plan, &requests, &mut IdAllocator::seeded(2)).unwrap_err();
        assert_eq!(err, PlanError::UnknownModificationTarget("ghost".into()));
    }

    #[test]
    fn out_of_range_request_is_rejected_before_expansion() {
        let mut vm = host("vm", 1);
        vm.scalable.max_instances = MaxInstances::Count(2);
        let plan = LogicalPlan {
            node_templates: vec![vm],
            groups: vec![],
        };
        let previous = expand(&plan, &mut IdAllocator::seeded(1)).unwrap();
        let requests = BTreeMap::from([("vm".to_string(), request(5))]);
        let err = modify(&previous, &plan, &requests, &mut IdAllocator::seeded(2)).unwrap_err();
        assert!(matches!(err, PlanError::InvalidInstanceRange { id, .. } if id == "vm"));
    }

    #[test]
    fn select_removals_prefers_include_and_avoids_exclude() {
        let ordered: Vec<String> = ["a", "b", "c", "d"].map(String::from).into();
        // Include hint wins regardless of position.
        let chosen = select_removals("t", &ordered, 2, &["b".into()], &[]).unwrap();
        assert_eq!(chosen, ["b".to_string(), "d".to_string()]);
        // Without hints, highest-indexed first.
        let chosen = select_removals("t", &ordered, 2, &[], &[]).unwrap();
        assert_eq!(chosen, ["d".to_string(), "c".to_string()]);
        // Exclude protects the tail.
        let chosen = select_removals("t", &ordered, 2, &[], &["d".into()]).unwrap();
        assert_eq!(chosen, ["c".to_string(), "b".to_string()]);
    }

    #[test]
    fn select_removals_fails_when_hints_leave_too_few() {
        let ordered: Vec<String> = ["a", "b"].map(String::from).into();
        let err = select_removals("t", &ordered, 2, &[], &["a".into(), "b".into()]).unwrap_err();
        assert_eq!(
            err,
            PlanError::InsufficientRemovableInstances {
                id: "t".into(),
                requested: 2,
                available: 0,
            }
        );
    }

    #[test]
    fn noop_modification_is_empty_and_keeps_ids() {
        let plan = LogicalPlan {
            node_templates: vec![host("vm", 2)],
            groups: vec![],
        };
        let previous = expand(&plan, &mut IdAllocator::seeded(1)).unwrap();
        let outcome =
            modify(&previous, &plan, &BTreeMap::new(), &mut IdAllocator::seeded(2)).unwrap();
        assert!(outcome.is_noop());
        let prev_ids: BTreeSet<&str> =
            previous.node_instances.iter().map(|i| i.id.as_str()).collect();
        let new_ids: BTreeSet<&str> =
            outcome.plan.node_instances.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(prev_ids, new_ids);
    }
}
