use std::collections::{HashMap, HashSet, VecDeque};

/// Dependency DAG over job ids. Edge `a → b` means "b depends on a".
///
/// Stores forward adjacency plus incrementally-maintained in-degrees so
/// the ready set is an O(n) scan and node removal is O(edges). Cycle
/// candidates are rejected at edge-insertion time via BFS reachability.
#[derive(Debug, Default)]
pub struct JobGraph {
    adjacency: HashMap<i64, HashSet<i64>>,
    in_degree: HashMap<i64, usize>,
}

impl JobGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: i64) {
        self.adjacency.entry(node).or_default();
        self.in_degree.entry(node).or_insert(0);
    }

    /// Add edge `from → to`. Returns false (no state change) for
    /// self-edges or edges that would close a cycle.
    pub fn add_edge(&mut self, from: i64, to: i64) -> bool {
        if from == to {
            return false;
        }
        self.add_node(from);
        self.add_node(to);
        if self.has_path(to, from) {
            return false;
        }
        if self.adjacency.get_mut(&from).expect("node added").insert(to) {
            *self.in_degree.get_mut(&to).expect("node added") += 1;
        }
        true
    }

    /// Remove a node and its edges, decrementing dependents' in-degrees.
    pub fn remove_node(&mut self, node: i64) {
        if let Some(dependents) = self.adjacency.remove(&node) {
            for dependent in dependents {
                if let Some(degree) = self.in_degree.get_mut(&dependent) {
                    *degree = degree.saturating_sub(1);
                }
            }
        }
        self.in_degree.remove(&node);
        for dependents in self.adjacency.values_mut() {
            dependents.remove(&node);
        }
    }

    /// Nodes with no unresolved dependencies.
    pub fn ready_nodes(&self) -> Vec<i64> {
        self.in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(&node, _)| node)
            .collect()
    }

    /// Direct dependents of a node.
    pub fn dependents(&self, node: i64) -> Vec<i64> {
        self.adjacency
            .get(&node)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, node: i64) -> bool {
        self.adjacency.contains_key(&node)
    }

    pub fn len(&self) -> usize {
        self.adjacency.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adjacency.is_empty()
    }

    /// Kahn's algorithm. Returns `None` if the graph contains a cycle
    /// (cannot happen through `add_edge`, but the check keeps the
    /// invariant observable).
    pub fn topological_sort(&self) -> Option<Vec<i64>> {
        let mut degrees = self.in_degree.clone();
        let mut queue: VecDeque<i64> = degrees
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&n, _)| n)
            .collect();
        let mut order = Vec::with_capacity(self.adjacency.len());

        while let Some(node) = queue.pop_front() {
            order.push(node);
            if let Some(dependents) = self.adjacency.get(&node) {
                for &dependent in dependents {
                    let degree = degrees.get_mut(&dependent).expect("known node");
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        (order.len() == self.adjacency.len()).then_some(order)
    }

    /// BFS reachability `from →* to`.
    fn has_path(&self, from: i64, to: i64) -> bool {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([from]);
        while let Some(node) = queue.pop_front() {
            if node == to {
                return true;
            }
            if !visited.insert(node) {
                continue;
            }
            if let Some(next) = self.adjacency.get(&node) {
                queue.extend(next.iter().copied());
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nodes_start_ready() {
        let mut graph = JobGraph::new();
        graph.add_node(1);
        graph.add_node(2);
        let mut ready = graph.ready_nodes();
        ready.sort_unstable();
        assert_eq!(ready, vec![1, 2]);
    }

    #[test]
    fn edge_blocks_dependent() {
        let mut graph = JobGraph::new();
        assert!(graph.add_edge(1, 2));
        assert_eq!(graph.ready_nodes(), vec![1]);
        assert_eq!(graph.dependents(1), vec![2]);
    }

    #[test]
    fn duplicate_edge_does_not_inflate_in_degree() {
        let mut graph = JobGraph::new();
        assert!(graph.add_edge(1, 2));
        assert!(graph.add_edge(1, 2));
        graph.remove_node(1);
        assert_eq!(graph.ready_nodes(), vec![2]);
    }

    #[test]
    fn self_edge_rejected() {
        let mut graph = JobGraph::new();
        assert!(!graph.add_edge(3, 3));
    }

    #[test]
    fn cycle_rejected_without_state_change() {
        let mut graph = JobGraph::new();
        assert!(graph.add_edge(1, 2));
        assert!(graph.add_edge(2, 3));
        assert!(!graph.add_edge(3, 1));

        // Graph still acyclic and 1 still the only ready node.
        assert_eq!(graph.ready_nodes(), vec![1]);
        assert!(graph.topological_sort().is_some());
    }

    #[test]
    fn removing_node_unblocks_dependents() {
        let mut graph = JobGraph::new();
        graph.add_edge(1, 2);
        graph.add_edge(1, 3);
        assert_eq!(graph.ready_nodes(), vec![1]);

        graph.remove_node(1);
        let mut ready = graph.ready_nodes();
        ready.sort_unstable();
        assert_eq!(ready, vec![2, 3]);
        assert!(!graph.contains(1));
    }

    #[test]
    fn diamond_resolves_in_dependency_order() {
        let mut graph = JobGraph::new();
        graph.add_edge(1, 2);
        graph.add_edge(1, 3);
        graph.add_edge(2, 4);
        graph.add_edge(3, 4);

        let order = graph.topological_sort().unwrap();
        let pos = |n: i64| order.iter().position(|&x| x == n).unwrap();
        assert!(pos(1) < pos(2));
        assert!(pos(1) < pos(3));
        assert!(pos(2) < pos(4));
        assert!(pos(3) < pos(4));
    }
}
