//! Error taxonomy for topology expansion and deployment modification.
//!
//! Every failure is fatal: the engine never produces a partial plan. Each
//! variant carries the offending node/group/relationship ids so callers can
//! render a precise diagnostic.

use thiserror::Error;

/// Result type alias for planning operations.
pub type PlanResult<T> = Result<T, PlanError>;

/// Errors that can occur while expanding a topology or computing a
/// deployment modification.
#[derive(Debug, Error, PartialEq)]
pub enum PlanError {
    #[error("containment component is not a tree (cycle or multi-parent): {}", nodes.join(", "))]
    NonTreeContainment { nodes: Vec<String> },

    #[error("duplicate node template id: {0}")]
    DuplicateTemplate(String),

    #[error("relationship on node '{node}' targets unknown node template '{target}'")]
    UnknownRelationshipTarget { node: String, target: String },

    #[error("relationship on node '{node}' has unsupported base kind '{kind}'")]
    UnsupportedRelationshipKind { node: String, kind: String },

    #[error("relationship on node '{node}' has invalid connection_type '{value}'")]
    InvalidConnectionType { node: String, value: String },

    #[error(
        "all_to_one relationship from '{source_node}' to '{target}' crosses the boundary \
         of scaling group '{group}': the single-target invariant is unsatisfiable"
    )]
    UnsupportedAllToOneInGroup {
        // Named source_node: thiserror reserves `source` for error chaining.
        source_node: String,
        target: String,
        group: String,
    },

    #[error("scaling group hierarchy contains a cycle: {}", groups.join(" -> "))]
    GroupCycle { groups: Vec<String> },

    #[error("'{member}' is a member of both scaling group '{first}' and '{second}'")]
    MultipleGroupMembership {
        member: String,
        first: String,
        second: String,
    },

    #[error("scaling group '{group}' names unknown member '{member}'")]
    UnknownGroupMember { group: String, member: String },

    #[error(
        "node '{member}' is scaled by group '{group}' but is contained in '{parent}', \
         which does not share that group"
    )]
    NonContainedGroupMembers {
        member: String,
        group: String,
        parent: String,
    },

    #[error(
        "instance count of '{child}' ({child_count}) is not a multiple of \
         its parent '{parent}' ({parent_count})"
    )]
    NonDividingDistribution {
        child: String,
        child_count: u32,
        parent: String,
        parent_count: u32,
    },

    #[error("invalid instance range on '{id}': {detail}")]
    InvalidInstanceRange { id: String, detail: String },

    #[error("modification targets unknown template or group '{0}'")]
    UnknownModificationTarget(String),

    #[error(
        "cannot remove {requested} instance(s) of '{id}': only {available} \
         are removable given the provided hints"
    )]
    InsufficientRemovableInstances {
        id: String,
        requested: u32,
        available: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offenders() {
        let err = PlanError::NonDividingDistribution {
            child: "db".into(),
            child_count: 3,
            parent: "host".into(),
            parent_count: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("db"));
        assert!(msg.contains("host"));
        assert!(msg.contains('3'));

        let err = PlanError::NonTreeContainment {
            nodes: vec!["a".into(), "b".into()],
        };
        assert!(err.to_string().contains("a, b"));

        let err = PlanError::UnsupportedAllToOneInGroup {
            source_node: "web".into(),
            target: "db".into(),
            group: "tier".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("web"));
        assert!(msg.contains("tier"));
    }
}
