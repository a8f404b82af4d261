use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::Switches;
use crate::{
    error::ProviderError,
    graph::GraphArena,
    services::{GraphNode, MemoryQuery, MemoryScope, MemoryService, NodeId},
};

/// Memory provider keeping one [`GraphArena`] per scope.
#[derive(Debug, Default)]
pub struct GraphMemory {
    name: String,
    scopes: RwLock<HashMap<MemoryScope, GraphArena>>,
    switches: Switches,
}

impl GraphMemory {
    /// Creates an empty store.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Links two nodes of the same scope.
    pub fn link(&self, scope: MemoryScope, from: &NodeId, to: &NodeId, relation: &str) -> bool {
        self.scopes
            .write()
            .entry(scope)
            .or_default()
            .link(from, to, relation)
    }

    /// Node count in a scope.
    #[must_use]
    pub fn node_count(&self, scope: MemoryScope) -> usize {
        self.scopes.read().get(&scope).map_or(0, GraphArena::len)
    }

    /// Health and failure switches.
    #[must_use]
    pub const fn switches(&self) -> &Switches {
        &self.switches
    }

    fn check(&self) -> Result<(), ProviderError> {
        if self.switches.failing() {
            return Err(ProviderError::new(format!("{} is failing", self.name)));
        }
        Ok(())
    }
}

#[async_trait]
impl MemoryService for GraphMemory {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> bool {
        self.switches.healthy()
    }

    async fn memorize(&self, node: &GraphNode, scope: MemoryScope) -> Result<NodeId, ProviderError> {
        self.check()?;
        Ok(self.scopes.write().entry(scope).or_default().upsert(node.clone()))
    }

    async fn recall(
        &self,
        query: &MemoryQuery,
        scope: MemoryScope,
    ) -> Result<Vec<GraphNode>, ProviderError> {
        self.check()?;
        Ok(self
            .scopes
            .read()
            .get(&scope)
            .map(|arena| arena.query(query))
            .unwrap_or_default())
    }

    async fn forget(&self, id: &NodeId, scope: MemoryScope) -> Result<bool, ProviderError> {
        self.check()?;
        Ok(self
            .scopes
            .write()
            .get_mut(&scope)
            .is_some_and(|arena| arena.remove(id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn scopes_are_isolated() {
        let memory = GraphMemory::new("graph");
        let node = GraphNode::new("tone", "identity").with_attribute("value", json!("calm"));
        memory.memorize(&node, MemoryScope::Identity).await.unwrap();
        assert_eq!(memory.node_count(MemoryScope::Identity), 1);
        assert_eq!(memory.node_count(MemoryScope::Local), 0);

        let found = memory
            .recall(&MemoryQuery { text: Some("CALM".into()), ..MemoryQuery::default() }, MemoryScope::Identity)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(!memory.forget(&node.id, MemoryScope::Local).await.unwrap());
        assert!(memory.forget(&node.id, MemoryScope::Identity).await.unwrap());
    }
}
