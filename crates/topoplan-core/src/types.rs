//! Domain types for topology expansion.
//!
//! The input side (`LogicalPlan` and everything it contains) is the resolved
//! logical topology handed over by the parsing/merging collaborators: node
//! templates with their relationships and scaling policies, plus the scaling
//! group hierarchy. The output side (`DeploymentPlan`) is the multiplied
//! instance graph. All types are serializable to/from JSON; input types
//! reject unknown keys at the boundary.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique identifier for a node template.
pub type TemplateId = String;

/// Unique identifier for a scaling group.
pub type GroupId = String;

/// Unique identifier for a concrete node instance.
pub type InstanceId = String;

// ── Logical plan (input) ──────────────────────────────────────────

/// The resolved logical topology: what to expand.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct LogicalPlan {
    pub node_templates: Vec<NodeTemplate>,
    #[serde(default)]
    pub groups: Vec<ScalingGroup>,
}

/// A logical, unexpanded unit of topology.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NodeTemplate {
    pub id: TemplateId,
    /// Concrete type name (inheritance already resolved by the collaborator).
    #[serde(rename = "type")]
    pub node_type: String,
    /// Whether the resolved type is a host type (a compute resource whose
    /// instances host their containment children).
    #[serde(default)]
    pub host: bool,
    /// Relationships in declaration order. Order is preserved through
    /// expansion.
    #[serde(default)]
    pub relationships: Vec<RelationshipTemplate>,
    #[serde(default)]
    pub scalable: InstancePolicy,
}

/// A relationship declared on a node template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RelationshipTemplate {
    /// Concrete relationship type name, echoed onto relationship instances.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Resolved base kind (`contained_in` / `connected_to` / `depends_on`).
    /// Defaults to the concrete type name when the relationship is not a
    /// derived type.
    #[serde(default)]
    pub base: Option<String>,
    /// Target node template id.
    pub target: TemplateId,
    /// Fan-out policy: `all_to_all` (default) or `all_to_one`.
    #[serde(default)]
    pub connection_type: Option<String>,
}

impl RelationshipTemplate {
    /// The base kind string used for expansion decisions.
    pub fn base_kind(&self) -> &str {
        self.base.as_deref().unwrap_or(&self.type_name)
    }
}

/// A named, possibly nested collection of templates/groups that multiplies
/// all its members.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ScalingGroup {
    pub id: GroupId,
    /// Member ids: node template ids or other group ids, ordered.
    pub members: Vec<String>,
    #[serde(default)]
    pub scalable: InstancePolicy,
}

/// Instance-count policy on a template or group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct InstancePolicy {
    #[serde(default = "default_instance_count")]
    pub default_instances: u32,
    #[serde(default)]
    pub min_instances: u32,
    #[serde(default)]
    pub max_instances: MaxInstances,
}

fn default_instance_count() -> u32 {
    1
}

impl Default for InstancePolicy {
    fn default() -> Self {
        Self {
            default_instances: 1,
            min_instances: 0,
            max_instances: MaxInstances::default(),
        }
    }
}

impl InstancePolicy {
    /// Policy with a fixed default count and unconstrained bounds.
    pub fn fixed(default_instances: u32) -> Self {
        Self {
            default_instances,
            ..Self::default()
        }
    }
}

/// Upper instance bound: a positive count, or unbounded.
///
/// Accepts a number or the literal string `"unbounded"`; `-1` is the numeric
/// spelling of unbounded. Range validation happens in the scaling resolver
/// so the resulting error can name the offending template or group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MaxInstances {
    Count(i64),
    Literal(String),
}

impl Default for MaxInstances {
    fn default() -> Self {
        MaxInstances::Literal("unbounded".to_string())
    }
}

impl MaxInstances {
    /// Interpret the raw value: `Ok(None)` for unbounded, `Ok(Some(n))` for a
    /// finite positive bound, `Err(description)` for anything else.
    pub fn resolve(&self) -> Result<Option<u32>, String> {
        match self {
            MaxInstances::Count(-1) => Ok(None),
            MaxInstances::Count(n) if *n > 0 => u32::try_from(*n)
                .map(Some)
                .map_err(|_| format!("max_instances {n} exceeds the supported range")),
            MaxInstances::Count(n) => Err(format!("max_instances must be positive or -1, got {n}")),
            MaxInstances::Literal(s) if s == "unbounded" => Ok(None),
            MaxInstances::Literal(s) => {
                Err(format!("max_instances must be a number or \"unbounded\", got {s:?}"))
            }
        }
    }
}

// ── Deployment plan (output) ──────────────────────────────────────

/// The expanded deployment plan: concrete instances plus per-group layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DeploymentPlan {
    pub node_instances: Vec<NodeInstance>,
    /// Group id → resolved group layout.
    #[serde(default)]
    pub scaling_groups: BTreeMap<GroupId, GroupPlan>,
}

impl DeploymentPlan {
    /// All instances belonging to the given template, in index order.
    pub fn instances_of(&self, template: &str) -> Vec<&NodeInstance> {
        let mut out: Vec<&NodeInstance> = self
            .node_instances
            .iter()
            .filter(|i| i.node_id == template)
            .collect();
        out.sort_by_key(|i| i.index);
        out
    }

    /// Look up an instance by id.
    pub fn instance(&self, id: &str) -> Option<&NodeInstance> {
        self.node_instances.iter().find(|i| i.id == id)
    }
}

/// Resolved layout of one scaling group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupPlan {
    /// Number of group instances.
    pub instances: u32,
    /// Group-instance ids, ordered; position `k` is group instance `k`.
    pub instance_ids: Vec<String>,
    /// Member template id → number of member copies per group instance.
    pub members: BTreeMap<TemplateId, u32>,
}

/// One concrete, uniquely-identified copy of a node template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeInstance {
    pub id: InstanceId,
    /// Owning node template id.
    pub node_id: TemplateId,
    /// Combinatorial slot of this copy within its template (0-based).
    pub index: u32,
    /// Nearest host ancestor's instance id. Hosts are self-hosting
    /// (`host_id == id`); absent when no host is in the containment chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<InstanceId>,
    /// Relationship instances, mirroring template declaration order with all
    /// instances of one target consecutive.
    #[serde(default)]
    pub relationships: Vec<RelationshipInstance>,
    /// Group memberships, outermost group first.
    #[serde(default)]
    pub scaling_groups: Vec<GroupMembership>,
    /// Diff marker set by deployment modification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modification: Option<NodeModification>,
}

/// One expanded relationship edge on a node instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelationshipInstance {
    /// Concrete relationship type name from the template.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Target node instance id.
    pub target_id: InstanceId,
    /// Owning template id of the target (for diff bucketing).
    pub target_name: TemplateId,
}

/// Membership of an instance in one concrete group instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupMembership {
    /// Group name (the group id from the logical plan).
    pub name: GroupId,
    /// Concrete group-instance id.
    pub id: String,
}

/// Diff marker applied by the deployment modifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeModification {
    Added,
    Removed,
}
