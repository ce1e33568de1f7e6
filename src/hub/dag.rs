//! Dependency graph over task ids.
//!
//! Tasks declare the ids they depend on. Before a dependency set is stored
//! the whole graph for the owning user is rebuilt with the candidate edges
//! substituted, and rejected if it references unknown tasks or contains a
//! cycle. A cyclic set could never satisfy the completion AND-gate.

use std::collections::{HashMap, HashSet};

use crate::errors::DagError;

/// A task id together with the ids it depends on.
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub id: String,
    pub depends_on: Vec<String>,
}

impl TaskNode {
    pub fn new(id: impl Into<String>, depends_on: Vec<String>) -> Self {
        Self {
            id: id.into(),
            depends_on,
        }
    }
}

#[derive(Debug)]
pub struct DependencyGraph {
    ids: Vec<String>,
    /// index -> tasks that depend on it
    forward_edges: Vec<Vec<usize>>,
    /// index -> tasks it depends on
    reverse_edges: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build and validate a graph. Later nodes with a repeated id replace
    /// earlier ones, so a candidate can be appended to the stored set.
    pub fn build(nodes: Vec<TaskNode>) -> Result<Self, DagError> {
        let mut merged: Vec<TaskNode> = Vec::with_capacity(nodes.len());
        let mut index_map = HashMap::new();
        for node in nodes {
            match index_map.get(&node.id) {
                Some(&i) => merged[i] = node,
                None => {
                    index_map.insert(node.id.clone(), merged.len());
                    merged.push(node);
                }
            }
        }

        let mut forward_edges = vec![Vec::new(); merged.len()];
        let mut reverse_edges = vec![Vec::new(); merged.len()];
        for (to_idx, node) in merged.iter().enumerate() {
            let mut seen = HashSet::new();
            for dep in &node.depends_on {
                if !seen.insert(dep.as_str()) {
                    continue;
                }
                let from_idx =
                    *index_map
                        .get(dep)
                        .ok_or_else(|| DagError::UnknownDependency {
                            task: node.id.clone(),
                            dependency: dep.clone(),
                        })?;
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        let graph = Self {
            ids: merged.into_iter().map(|n| n.id).collect(),
            forward_edges,
            reverse_edges,
        };
        graph.validate_no_cycles()?;
        Ok(graph)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.ids.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    #[cfg(test)]
    fn position(&self, id: &str) -> Option<usize> {
        self.ids.iter().position(|x| x == id)
    }

    /// Ids of tasks that directly depend on `id`.
    #[cfg(test)]
    fn dependents(&self, id: &str) -> Vec<&str> {
        self.position(id)
            .map(|i| {
                self.forward_edges[i]
                    .iter()
                    .map(|&j| self.ids[j].as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Ids `id` directly depends on.
    #[cfg(test)]
    fn dependencies(&self, id: &str) -> Vec<&str> {
        self.position(id)
            .map(|i| {
                self.reverse_edges[i]
                    .iter()
                    .map(|&j| self.ids[j].as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Kahn's algorithm; whatever is left unprocessed sits on a cycle.
    fn validate_no_cycles(&self) -> Result<(), DagError> {
        let mut in_degree: Vec<usize> = self.reverse_edges.iter().map(Vec::len).collect();
        let mut queue: Vec<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;
        while let Some(node) = queue.pop() {
            processed += 1;
            for &dependent in &self.forward_edges[node] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != self.ids.len() {
            let mut tasks: Vec<String> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| self.ids[i].clone())
                .collect();
            tasks.sort();
            return Err(DagError::Cycle { tasks });
        }
        Ok(())
    }
}

/// Deduplicate a dependency list, keeping first occurrences in order.
pub fn normalize_depends_on(depends_on: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    depends_on
        .into_iter()
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty() && seen.insert(d.clone()))
        .collect()
}
