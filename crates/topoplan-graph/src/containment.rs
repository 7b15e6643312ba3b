//! Containment decomposition — splits the `contained_in` sub-graph into
//! weakly-connected components and validates each is a tree.
//!
//! Containment edges point child → parent in the template graph; here they
//! are reversed so traversal runs parent → child. A template with no
//! containment edge at all forms a single-node tree. A malformed containment
//! shape (cycle or multi-parent) cannot be safely multiplied, so validation
//! failure aborts the whole expansion.

use std::collections::BTreeMap;

use topoplan_core::{PlanError, PlanResult, TemplateId};

use crate::graph::TemplateGraph;

/// One validated containment tree.
#[derive(Debug, Clone)]
pub struct ContainmentTree {
    pub root: TemplateId,
    /// Every template in the tree, parents before children, siblings in
    /// input order.
    pub nodes: Vec<TemplateId>,
}

/// All containment trees of a plan, plus parent/child lookup across them.
#[derive(Debug, Clone, Default)]
pub struct ContainmentForest {
    pub trees: Vec<ContainmentTree>,
    parent: BTreeMap<TemplateId, TemplateId>,
    children: BTreeMap<TemplateId, Vec<TemplateId>>,
}

impl ContainmentForest {
    /// Containment parent of a template, if any.
    pub fn parent_of(&self, id: &str) -> Option<&str> {
        self.parent.get(id).map(String::as_str)
    }

    /// Direct containment children, in input order.
    pub fn children_of(&self, id: &str) -> &[TemplateId] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Decompose the containment sub-graph of `graph` into validated trees.
pub fn decompose(graph: &TemplateGraph<'_>) -> PlanResult<ContainmentForest> {
    // Union-find over template ids to find weak components.
    let ids: Vec<&str> = graph.template_order().collect();
    let index: BTreeMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    let mut uf: Vec<usize> = (0..ids.len()).collect();

    fn find(uf: &mut Vec<usize>, mut i: usize) -> usize {
        while uf[i] != i {
            uf[i] = uf[uf[i]];
            i = uf[i];
        }
        i
    }

    let mut parent: BTreeMap<TemplateId, TemplateId> = BTreeMap::new();
    let mut children: BTreeMap<TemplateId, Vec<TemplateId>> = BTreeMap::new();
    let mut multi_parent: Vec<&str> = Vec::new();

    for edge in graph.containment_edges() {
        let child = edge.source.as_str();
        let parent_id = edge.target.as_str();
        if parent.insert(child.to_string(), parent_id.to_string()).is_some() {
            multi_parent.push(child);
        }
        children
            .entry(parent_id.to_string())
            .or_default()
            .push(child.to_string());
        let (a, b) = (find(&mut uf, index[child]), find(&mut uf, index[parent_id]));
        uf[a] = b;
    }

    // Group templates by component root, preserving input order.
    let mut components: BTreeMap<usize, Vec<&str>> = BTreeMap::new();
    for id in &ids {
        let root = find(&mut uf, index[id]);
        components.entry(root).or_default().push(id);
    }

    let mut trees = Vec::new();
    // Iterate components in input order of their first member.
    let mut ordered: Vec<Vec<&str>> = components.into_values().collect();
    ordered.sort_by_key(|members| index[members[0]]);

    for members in ordered {
        if multi_parent.iter().any(|m| members.contains(m)) {
            return Err(non_tree(&members));
        }

        // Exactly one root, and every member reachable from it.
        let roots: Vec<&str> = members
            .iter()
            .filter(|m| !parent.contains_key(**m))
            .copied()
            .collect();
        if roots.len() != 1 {
            return Err(non_tree(&members));
        }
        let root = roots[0];

        let mut nodes: Vec<TemplateId> = Vec::with_capacity(members.len());
        let mut queue: Vec<&str> = vec![root];
        while let Some(current) = queue.pop() {
            nodes.push(current.to_string());
            // Children in input order; reversed push keeps pop order stable.
            let mut kids: Vec<&str> = children
                .get(current)
                .map(|c| c.iter().map(String::as_str).collect())
                .unwrap_or_default();
            kids.sort_by_key(|k| index[k]);
            for kid in kids.into_iter().rev() {
                queue.push(kid);
            }
        }
        if nodes.len() != members.len() {
            // A cycle hangs off the component, unreachable from the root.
            return Err(non_tree(&members));
        }

        trees.push(ContainmentTree {
            root: root.to_string(),
            nodes,
        });
    }

    tracing::debug!(trees = trees.len(), "decomposed containment forest");

    Ok(ContainmentForest {
        trees,
        parent,
        children,
    })
}

fn non_tree(members: &[&str]) -> PlanError {
    PlanError::NonTreeContainment {
        nodes: members.iter().map(|m| m.to_string()).collect(),
    }
}
