//! Graph utilities for cluster-aware planning
//!
//! Tarjan's strongly-connected-components algorithm plus a topological sort
//! over the condensation (the DAG whose vertices are the SCCs). Planning
//! tolerates cycles inside a cluster but not between clusters.

use std::collections::HashMap;

use crate::domain::PlanError;

/// Compute strongly connected components (Tarjan)
///
/// Returns components in reverse topological order of the condensation,
/// each as a list of node ids. Nodes absent from `edges` form singleton
/// components.
pub fn strongly_connected_components(nodes: &[String], edges: &[(String, String)]) -> Vec<Vec<String>> {
    struct Tarjan<'a> {
        adjacency: &'a HashMap<usize, Vec<usize>>,
        index: Vec<Option<usize>>,
        lowlink: Vec<usize>,
        on_stack: Vec<bool>,
        stack: Vec<usize>,
        next_index: usize,
        components: Vec<Vec<usize>>,
    }

    impl Tarjan<'_> {
        fn visit(&mut self, v: usize) {
            self.index[v] = Some(self.next_index);
            self.lowlink[v] = self.next_index;
            self.next_index += 1;
            self.stack.push(v);
            self.on_stack[v] = true;

            if let Some(successors) = self.adjacency.get(&v) {
                for &w in successors {
                    if self.index[w].is_none() {
                        self.visit(w);
                        self.lowlink[v] = self.lowlink[v].min(self.lowlink[w]);
                    } else if self.on_stack[w] {
                        self.lowlink[v] = self.lowlink[v].min(self.index[w].unwrap());
                    }
                }
            }

            if self.lowlink[v] == self.index[v].unwrap() {
                let mut component = Vec::new();
                while let Some(w) = self.stack.pop() {
                    self.on_stack[w] = false;
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                self.components.push(component);
            }
        }
    }

    let id_of: HashMap<&str, usize> = nodes.iter().enumerate().map(|(i, n)| (n.as_str(), i)).collect();
    let mut adjacency: HashMap<usize, Vec<usize>> = HashMap::new();
    for (from, to) in edges {
        if let (Some(&u), Some(&v)) = (id_of.get(from.as_str()), id_of.get(to.as_str())) {
            adjacency.entry(u).or_default().push(v);
        }
    }

    let n = nodes.len();
    let mut tarjan = Tarjan {
        adjacency: &adjacency,
        index: vec![None; n],
        lowlink: vec![0; n],
        on_stack: vec![false; n],
        stack: Vec::new(),
        next_index: 0,
        components: Vec::new(),
    };

    for v in 0..n {
        if tarjan.index[v].is_none() {
            tarjan.visit(v);
        }
    }

    tarjan
        .components
        .into_iter()
        .map(|component| component.into_iter().map(|i| nodes[i].clone()).collect())
        .collect()
}

/// Linearize a possibly-cyclic graph by its SCC condensation
///
/// Nodes inside one SCC keep their input order; SCCs are ordered by a Kahn
/// topological sort of the condensation. An edge cycle that survives
/// condensation is impossible by construction, so a leftover indicates a
/// bug and maps to [`PlanError::Cycle`].
pub fn condensation_topo_sort(nodes: &[String], edges: &[(String, String)]) -> Result<Vec<String>, PlanError> {
    let components = strongly_connected_components(nodes, edges);

    let mut component_of: HashMap<&str, usize> = HashMap::new();
    for (index, component) in components.iter().enumerate() {
        for node in component {
            component_of.insert(node.as_str(), index);
        }
    }

    // Build the condensation DAG
    let count = components.len();
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); count];
    let mut in_degree = vec![0usize; count];
    for (from, to) in edges {
        match (component_of.get(from.as_str()), component_of.get(to.as_str())) {
            (Some(&u), Some(&v)) if u != v => {
                if !successors[u].contains(&v) {
                    successors[u].push(v);
                    in_degree[v] += 1;
                }
            }
            _ => {}
        }
    }

    // Kahn over the condensation
    let mut ready: Vec<usize> = (0..count).filter(|&c| in_degree[c] == 0).collect();
    ready.sort();
    let mut order = Vec::with_capacity(count);
    while let Some(c) = ready.pop() {
        order.push(c);
        for &next in &successors[c] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(next);
            }
        }
    }

    if order.len() != count {
        let stuck = components
            .iter()
            .enumerate()
            .find(|(i, _)| !order.contains(i))
            .and_then(|(_, c)| c.first().cloned())
            .unwrap_or_default();
        return Err(PlanError::Cycle(stuck));
    }

    // Preserve input order within each component
    let position: HashMap<&str, usize> = nodes.iter().enumerate().map(|(i, n)| (n.as_str(), i)).collect();
    let mut result = Vec::with_capacity(nodes.len());
    for c in order {
        let mut members = components[c].clone();
        members.sort_by_key(|m| position.get(m.as_str()).copied().unwrap_or(usize::MAX));
        result.extend(members);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn edge_list(v: &[(&str, &str)]) -> Vec<(String, String)> {
        v.iter().map(|(a, b)| (a.to_string(), b.to_string())).collect()
    }

    #[test]
    fn test_scc_acyclic_all_singletons() {
        let components = strongly_connected_components(
            &names(&["a", "b", "c"]),
            &edge_list(&[("a", "b"), ("b", "c")]),
        );
        assert_eq!(components.len(), 3);
        assert!(components.iter().all(|c| c.len() == 1));
    }

    #[test]
    fn test_scc_detects_cycle() {
        let components = strongly_connected_components(
            &names(&["a", "b", "c", "d"]),
            &edge_list(&[("a", "b"), ("b", "a"), ("b", "c"), ("c", "d")]),
        );
        let cluster = components.iter().find(|c| c.len() == 2).expect("cycle cluster");
        let mut cluster = cluster.clone();
        cluster.sort();
        assert_eq!(cluster, names(&["a", "b"]));
    }

    #[test]
    fn test_topo_sort_linear() {
        let order = condensation_topo_sort(
            &names(&["c", "a", "b"]),
            &edge_list(&[("a", "b"), ("b", "c")]),
        )
        .unwrap();
        let pos = |x: &str| order.iter().position(|n| n == x).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    #[test]
    fn test_topo_sort_tolerates_internal_cycle() {
        // a <-> b form a cluster that feeds c
        let order = condensation_topo_sort(
            &names(&["a", "b", "c"]),
            &edge_list(&[("a", "b"), ("b", "a"), ("b", "c")]),
        )
        .unwrap();
        let pos = |x: &str| order.iter().position(|n| n == x).unwrap();
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("c"));
        // members of the cluster keep input order
        assert!(pos("a") < pos("b"));
    }

    #[test]
    fn test_topo_sort_disconnected() {
        let order = condensation_topo_sort(&names(&["x", "y"]), &[]).unwrap();
        assert_eq!(order.len(), 2);
    }
}
