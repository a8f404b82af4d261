//! Graph memory as an arena of nodes plus a separate edge list.
//!
//! Nodes never own each other; cycles live only in the edge list.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::services::{GraphNode, MemoryQuery, NodeId};

/// Directed, labelled edge between two arena nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    /// Source node.
    pub from: NodeId,
    /// Target node.
    pub to: NodeId,
    /// Relation label.
    pub relation: String,
}

/// Node arena keyed by opaque id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphArena {
    nodes: IndexMap<NodeId, GraphNode>,
    edges: Vec<GraphEdge>,
}

impl GraphArena {
    /// Inserts or replaces a node, returning its id.
    pub fn upsert(&mut self, node: GraphNode) -> NodeId {
        let id = node.id.clone();
        self.nodes.insert(id.clone(), node);
        id
    }

    /// Adds an edge; both endpoints must exist. Duplicate edges are ignored.
    pub fn link(&mut self, from: &NodeId, to: &NodeId, relation: impl Into<String>) -> bool {
        if !self.nodes.contains_key(from) || !self.nodes.contains_key(to) {
            return false;
        }
        let edge = GraphEdge {
            from: from.clone(),
            to: to.clone(),
            relation: relation.into(),
        };
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
        true
    }

    /// Removes a node and every incident edge.
    pub fn remove(&mut self, id: &NodeId) -> bool {
        if self.nodes.shift_remove(id).is_none() {
            return false;
        }
        self.edges.retain(|edge| &edge.from != id && &edge.to != id);
        true
    }

    /// Looks up a node.
    #[must_use]
    pub fn get(&self, id: &NodeId) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    /// Targets of outgoing edges, optionally filtered by relation.
    #[must_use]
    pub fn neighbors(&self, id: &NodeId, relation: Option<&str>) -> Vec<&GraphNode> {
        self.edges
            .iter()
            .filter(|edge| &edge.from == id)
            .filter(|edge| relation.map_or(true, |r| edge.relation == r))
            .filter_map(|edge| self.nodes.get(&edge.to))
            .collect()
    }

    /// Nodes matching every set field of the query, in insertion order.
    #[must_use]
    pub fn query(&self, query: &MemoryQuery) -> Vec<GraphNode> {
        let needle = query.text.as_ref().map(|text| text.to_lowercase());
        let matches = self.nodes.values().filter(|node| {
            query.node_id.as_ref().map_or(true, |id| &node.id == id)
                && query
                    .node_type
                    .as_ref()
                    .map_or(true, |kind| &node.node_type == kind)
                && needle.as_ref().map_or(true, |needle| contains_text(node, needle))
        });
        let limit = if query.limit == 0 { usize::MAX } else { query.limit };
        matches.take(limit).cloned().collect()
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the arena holds no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}

fn contains_text(node: &GraphNode, needle: &str) -> bool {
    if node.id.0.to_lowercase().contains(needle) {
        return true;
    }
    node.attributes.values().any(|value| match value {
        serde_json::Value::String(text) => text.to_lowercase().contains(needle),
        other => other.to_string().to_lowercase().contains(needle),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cycles_live_in_the_edge_list() {
        let mut arena = GraphArena::default();
        let a = arena.upsert(GraphNode::new("a", "concept"));
        let b = arena.upsert(GraphNode::new("b", "concept"));
        assert!(arena.link(&a, &b, "relates"));
        assert!(arena.link(&b, &a, "relates"));
        assert!(!arena.link(&a, &NodeId::new("missing"), "relates"));
        assert_eq!(arena.neighbors(&a, Some("relates"))[0].id, b);
        assert_eq!(arena.neighbors(&b, None)[0].id, a);

        assert!(arena.remove(&a));
        assert_eq!(arena.edge_count(), 0);
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn query_filters_and_limits() {
        let mut arena = GraphArena::default();
        arena.upsert(GraphNode::new("weather/today", "observation").with_attribute("text", json!("Rain expected")));
        arena.upsert(GraphNode::new("weather/tomorrow", "observation"));
        arena.upsert(GraphNode::new("agent/name", "identity"));

        let rain = arena.query(&MemoryQuery {
            text: Some("rain".into()),
            ..MemoryQuery::default()
        });
        assert_eq!(rain.len(), 1);

        let observations = arena.query(&MemoryQuery {
            node_type: Some("observation".into()),
            limit: 1,
            ..MemoryQuery::default()
        });
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].id, NodeId::new("weather/today"));
    }
}
