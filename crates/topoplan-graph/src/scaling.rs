//! Scaling-group resolution — validates the group hierarchy and computes
//! effective instance counts.
//!
//! Groups may contain node templates or other groups; nested groups multiply.
//! The resolver checks the membership DAG (no cycles, no double membership),
//! the instance-count policies (`min <= default <= max`, positive or
//! unbounded max), and the containment rule: a grouped template's containment
//! parent, if it is grouped at all, must share the member's group chain.
//! Otherwise the group multiplication and the containment distribution would
//! disagree about the member's copy count.

use std::collections::BTreeMap;

use topoplan_core::{
    GroupId, InstancePolicy, LogicalPlan, PlanError, PlanResult, ScalingGroup, TemplateId,
};

use crate::containment::ContainmentForest;
use crate::graph::TemplateGraph;

/// Fully resolved instance counts for one logical plan.
#[derive(Debug, Clone, Default)]
pub struct ResolvedScaling {
    /// Template id → total instance count across all group instances.
    pub node_counts: BTreeMap<TemplateId, u32>,
    /// Group id → total group-instance count (nested groups multiply).
    pub group_counts: BTreeMap<GroupId, u32>,
    /// Member id (template or group) → enclosing groups, outermost first.
    chains: BTreeMap<String, Vec<GroupId>>,
    /// Group id → transitive template members → copies per group instance.
    pub members_per_instance: BTreeMap<GroupId, BTreeMap<TemplateId, u32>>,
}

impl ResolvedScaling {
    /// Enclosing group chain of a template or group, outermost first.
    pub fn chain_of(&self, id: &str) -> &[GroupId] {
        self.chains.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The innermost group enclosing both ids, if any.
    pub fn common_group(&self, a: &str, b: &str) -> Option<&str> {
        let (ca, cb) = (self.chain_of(a), self.chain_of(b));
        ca.iter()
            .zip(cb.iter())
            .take_while(|(x, y)| x == y)
            .map(|(x, _)| x.as_str())
            .last()
    }
}

/// Resolve the scaling hierarchy of `plan`.
///
/// `overrides` maps a template or group id to a planned count that replaces
/// its `default_instances` factor (used by deployment modification; empty for
/// a fresh expansion). The effective factor is validated against the policy
/// bounds either way.
pub fn resolve(
    plan: &LogicalPlan,
    graph: &TemplateGraph<'_>,
    forest: &ContainmentForest,
    overrides: &BTreeMap<String, u32>,
) -> PlanResult<ResolvedScaling> {
    let groups: BTreeMap<&str, &ScalingGroup> =
        plan.groups.iter().map(|g| (g.id.as_str(), g)).collect();

    // Membership: each template/group may appear in at most one group.
    let mut member_of: BTreeMap<&str, &str> = BTreeMap::new();
    for group in &plan.groups {
        for member in &group.members {
            if !graph.contains(member) && !groups.contains_key(member.as_str()) {
                return Err(PlanError::UnknownGroupMember {
                    group: group.id.clone(),
                    member: member.clone(),
                });
            }
            if let Some(existing) = member_of.insert(member, &group.id) {
                return Err(PlanError::MultipleGroupMembership {
                    member: member.clone(),
                    first: existing.to_string(),
                    second: group.id.clone(),
                });
            }
        }
    }

    // Cycle check: walk each group's enclosure chain upward.
    for group in &plan.groups {
        let mut seen = vec![group.id.as_str()];
        let mut current = group.id.as_str();
        while let Some(enclosing) = member_of.get(current) {
            if seen.contains(enclosing) {
                return Err(PlanError::GroupCycle {
                    groups: seen.iter().map(|s| s.to_string()).collect(),
                });
            }
            seen.push(enclosing);
            current = enclosing;
        }
    }

    // Effective factor per entity: override or default, validated in range.
    let factor = |id: &str, policy: &InstancePolicy| -> PlanResult<u32> {
        let max = policy
            .max_instances
            .resolve()
            .map_err(|detail| PlanError::InvalidInstanceRange {
                id: id.to_string(),
                detail,
            })?;
        if let Some(max) = max
            && policy.min_instances > max
        {
            return Err(PlanError::InvalidInstanceRange {
                id: id.to_string(),
                detail: format!(
                    "min_instances {} exceeds max_instances {max}",
                    policy.min_instances
                ),
            });
        }
        let n = overrides.get(id).copied().unwrap_or(policy.default_instances);
        if n < policy.min_instances || max.is_some_and(|m| n > m) {
            return Err(PlanError::InvalidInstanceRange {
                id: id.to_string(),
                detail: format!(
                    "instance count {n} outside [{}, {}]",
                    policy.min_instances,
                    max.map_or("unbounded".to_string(), |m| m.to_string())
                ),
            });
        }
        Ok(n)
    };

    let mut group_factors: BTreeMap<&str, u32> = BTreeMap::new();
    for group in &plan.groups {
        group_factors.insert(&group.id, factor(&group.id, &group.scalable)?);
    }

    // Enclosing chains, outermost first.
    let chain = |id: &str| -> Vec<GroupId> {
        let mut chain = Vec::new();
        let mut current = id;
        while let Some(enclosing) = member_of.get(current) {
            chain.push(enclosing.to_string());
            current = enclosing;
        }
        chain.reverse();
        chain
    };

    let mut chains: BTreeMap<String, Vec<GroupId>> = BTreeMap::new();
    let mut group_counts: BTreeMap<GroupId, u32> = BTreeMap::new();
    for group in &plan.groups {
        let enclosing = chain(&group.id);
        let multiplier: u32 = enclosing.iter().map(|g| group_factors[g.as_str()]).product();
        group_counts.insert(group.id.clone(), group_factors[group.id.as_str()] * multiplier);
        chains.insert(group.id.clone(), enclosing);
    }

    let mut node_counts: BTreeMap<TemplateId, u32> = BTreeMap::new();
    for id in graph.template_order() {
        let template = graph.template(id).expect("template in order map");
        let enclosing = chain(id);
        let multiplier: u32 = enclosing.iter().map(|g| group_factors[g.as_str()]).product();
        node_counts.insert(id.to_string(), factor(id, &template.scalable)? * multiplier);
        chains.insert(id.to_string(), enclosing);
    }

    // Containment rule: groups(parent) must be a subset of groups(member).
    for id in graph.template_order() {
        let member_chain = &chains[id];
        if let Some(parent) = forest.parent_of(id) {
            for parent_group in &chains[parent] {
                if !member_chain.contains(parent_group) {
                    return Err(PlanError::NonContainedGroupMembers {
                        member: id.to_string(),
                        group: parent_group.clone(),
                        parent: parent.to_string(),
                    });
                }
            }
        }
    }

    // Per group instance: how many copies of each transitive template member.
    let mut members_per_instance: BTreeMap<GroupId, BTreeMap<TemplateId, u32>> = BTreeMap::new();
    for group in &plan.groups {
        let group_count = group_counts[&group.id];
        let mut members = BTreeMap::new();
        for id in graph.template_order() {
            if !chains[id].contains(&group.id) {
                continue;
            }
            // Totals are factor * enclosing-group product, so this always
            // divides evenly. A zero-count group has no instances to fill.
            let per_instance = if group_count == 0 {
                0
            } else {
                node_counts[id] / group_count
            };
            members.insert(id.to_string(), per_instance);
        }
        members_per_instance.insert(group.id.clone(), members);
    }

    tracing::debug!(
        nodes = node_counts.len(),
        groups = group_counts.len(),
        "resolved scaling hierarchy"
    );

    Ok(ResolvedScaling {
        node_counts,
        group_counts,
        chains,
        members_per_instance,
    })
}
