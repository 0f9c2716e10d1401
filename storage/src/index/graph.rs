use std::collections::{HashMap, VecDeque};

/// Edge representation: (target id, edge type)
pub type EdgeData = (String, String);

/// Adjacency-list graph index. Nodes are container-scoped entity ids; the
/// graph store keys one of these per container.
#[derive(Clone, Debug, Default)]
pub struct AdjacencyGraph {
    adjacency: HashMap<String, Vec<EdgeData>>,
}

impl AdjacencyGraph {
    pub fn new() -> Self {
        Self {
            adjacency: HashMap::new(),
        }
    }

    pub fn add_edge(&mut self, source: &str, target: &str, edge_type: &str) {
        let edges = self.adjacency.entry(source.to_string()).or_default();
        // Merge by (target, type); re-adding the same edge is a no-op.
        if !edges
            .iter()
            .any(|(t, ty)| t == target && ty == edge_type)
        {
            edges.push((target.to_string(), edge_type.to_string()));
        }
    }

    pub fn remove_node(&mut self, id: &str) {
        self.adjacency.remove(id);
        for edges in self.adjacency.values_mut() {
            edges.retain(|(t, _)| t != id);
        }
    }

    /// 1-hop neighbors.
    pub fn neighbors(&self, id: &str) -> Vec<&EdgeData> {
        self.adjacency
            .get(id)
            .map(|edges| edges.iter().collect())
            .unwrap_or_default()
    }

    /// Neighbors within max_hops (BFS). Returns (node id, distance), the
    /// start node excluded.
    pub fn expand(&self, start_id: &str, max_hops: u8) -> Vec<(String, u8)> {
        if max_hops == 0 {
            return vec![];
        }

        let mut visited: HashMap<&str, u8> = HashMap::new();
        let mut queue = VecDeque::new();

        visited.insert(start_id, 0);
        queue.push_back((start_id, 0u8));

        let mut result = Vec::new();

        while let Some((curr_id, dist)) = queue.pop_front() {
            if dist >= max_hops {
                continue;
            }

            if let Some(edges) = self.adjacency.get(curr_id) {
                for (target, _) in edges {
                    if !visited.contains_key(target.as_str()) {
                        visited.insert(target, dist + 1);
                        result.push((target.clone(), dist + 1));
                        queue.push_back((target, dist + 1));
                    }
                }
            }
        }

        result
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.values().map(|v| v.len()).sum()
    }

    pub fn node_count(&self) -> usize {
        let mut nodes: std::collections::BTreeSet<&str> = std::collections::BTreeSet::new();
        for (source, edges) in &self.adjacency {
            nodes.insert(source);
            for (target, _) in edges {
                nodes.insert(target);
            }
        }
        nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_1hop() {
        let mut graph = AdjacencyGraph::new();
        graph.add_edge("ent_a", "ent_b", "influenced_by");
        graph.add_edge("ent_a", "ent_c", "member_of");

        let neighbors = graph.neighbors("ent_a");
        assert_eq!(neighbors.len(), 2);
    }

    #[test]
    fn test_graph_expand_tracks_distance() {
        let mut graph = AdjacencyGraph::new();
        graph.add_edge("ent_a", "ent_b", "knows");
        graph.add_edge("ent_b", "ent_c", "knows");
        graph.add_edge("ent_b", "ent_d", "knows");

        let result = graph.expand("ent_a", 2);
        assert_eq!(result.len(), 3);

        let hop1: Vec<_> = result.iter().filter(|(_, h)| *h == 1).collect();
        let hop2: Vec<_> = result.iter().filter(|(_, h)| *h == 2).collect();
        assert_eq!(hop1.len(), 1);
        assert_eq!(hop2.len(), 2);
    }

    #[test]
    fn duplicate_edges_merge() {
        let mut graph = AdjacencyGraph::new();
        graph.add_edge("ent_a", "ent_b", "knows");
        graph.add_edge("ent_a", "ent_b", "knows");
        graph.add_edge("ent_a", "ent_b", "cites");

        assert_eq!(graph.neighbors("ent_a").len(), 2);
    }

    #[test]
    fn test_graph_remove() {
        let mut graph = AdjacencyGraph::new();
        graph.add_edge("ent_a", "ent_b", "knows");
        graph.add_edge("ent_b", "ent_c", "knows");

        graph.remove_node("ent_b");

        assert!(graph.neighbors("ent_a").is_empty());
        assert!(graph.neighbors("ent_b").is_empty());
    }
}
