//! Template graph — the directed node-template graph built from a logical plan.
//!
//! Edges carry the parsed relationship metadata (base kind, connection type,
//! concrete type name, declaration ordinal). Raw relationship strings are
//! parsed here, at the boundary; everything downstream works with the typed
//! edge representation.

use std::collections::BTreeMap;

use topoplan_core::{LogicalPlan, NodeTemplate, PlanError, PlanResult, TemplateId};

/// Resolved base kind of a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipKind {
    ContainedIn,
    ConnectedTo,
    DependsOn,
}

impl RelationshipKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "contained_in" => Some(Self::ContainedIn),
            "connected_to" => Some(Self::ConnectedTo),
            "depends_on" => Some(Self::DependsOn),
            _ => None,
        }
    }

    /// Containment establishes the host/child tree; everything else fans out.
    pub fn is_containment(self) -> bool {
        matches!(self, Self::ContainedIn)
    }
}

/// Fan-out policy of a non-containment relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionType {
    #[default]
    AllToAll,
    AllToOne,
}

impl ConnectionType {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "all_to_all" => Some(Self::AllToAll),
            "all_to_one" => Some(Self::AllToOne),
            _ => None,
        }
    }
}

/// One parsed relationship edge in the template graph.
#[derive(Debug, Clone)]
pub struct TemplateEdge {
    pub source: TemplateId,
    pub target: TemplateId,
    pub kind: RelationshipKind,
    pub connection: ConnectionType,
    /// Concrete relationship type name, echoed onto relationship instances.
    pub type_name: String,
    /// Position within the source template's relationship list.
    pub ordinal: usize,
}

/// Directed node-template graph keyed by template id.
#[derive(Debug)]
pub struct TemplateGraph<'a> {
    templates: BTreeMap<&'a str, &'a NodeTemplate>,
    /// Template ids in input order (expansion is deterministic in it).
    order: Vec<&'a str>,
    /// Outgoing edges per source template, in declaration order.
    edges: BTreeMap<&'a str, Vec<TemplateEdge>>,
}

impl<'a> TemplateGraph<'a> {
    /// Build the graph, parsing and validating every relationship.
    ///
    /// Duplicate template ids, unknown targets, unknown base kinds and
    /// invalid connection types are fatal immediately.
    pub fn build(plan: &'a LogicalPlan) -> PlanResult<Self> {
        let mut templates: BTreeMap<&str, &NodeTemplate> = BTreeMap::new();
        let mut order = Vec::with_capacity(plan.node_templates.len());
        for template in &plan.node_templates {
            if templates.insert(&template.id, template).is_some() {
                return Err(PlanError::DuplicateTemplate(template.id.clone()));
            }
            order.push(template.id.as_str());
        }

        let mut edges: BTreeMap<&str, Vec<TemplateEdge>> = BTreeMap::new();
        for template in &plan.node_templates {
            let mut outgoing = Vec::with_capacity(template.relationships.len());
            for (ordinal, rel) in template.relationships.iter().enumerate() {
                if !templates.contains_key(rel.target.as_str()) {
                    return Err(PlanError::UnknownRelationshipTarget {
                        node: template.id.clone(),
                        target: rel.target.clone(),
                    });
                }
                let kind = RelationshipKind::parse(rel.base_kind()).ok_or_else(|| {
                    PlanError::UnsupportedRelationshipKind {
                        node: template.id.clone(),
                        kind: rel.base_kind().to_string(),
                    }
                })?;
                let connection = match &rel.connection_type {
                    None => ConnectionType::default(),
                    Some(raw) => ConnectionType::parse(raw).ok_or_else(|| {
                        PlanError::InvalidConnectionType {
                            node: template.id.clone(),
                            value: raw.clone(),
                        }
                    })?,
                };
                outgoing.push(TemplateEdge {
                    source: template.id.clone(),
                    target: rel.target.clone(),
                    kind,
                    connection,
                    type_name: rel.type_name.clone(),
                    ordinal,
                });
            }
            edges.insert(&template.id, outgoing);
        }

        tracing::debug!(
            templates = order.len(),
            edges = edges.values().map(Vec::len).sum::<usize>(),
            "built template graph"
        );

        Ok(Self {
            templates,
            order,
            edges,
        })
    }

    /// Template ids in input order.
    pub fn template_order(&self) -> impl Iterator<Item = &str> {
        self.order.iter().copied()
    }

    pub fn template(&self, id: &str) -> Option<&'a NodeTemplate> {
        self.templates.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.templates.contains_key(id)
    }

    /// Outgoing edges of one template, in declaration order.
    pub fn edges_from(&self, id: &str) -> &[TemplateEdge] {
        self.edges.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All `contained_in` edges, in input order.
    pub fn containment_edges(&self) -> Vec<&TemplateEdge> {
        self.order
            .iter()
            .flat_map(|id| self.edges_from(id))
            .filter(|e| e.kind.is_containment())
            .collect()
    }
}
