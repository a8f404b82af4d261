use std::sync::Arc;

use cognos_kernel::{
    services::{GraphNode, MemoryQuery, MemoryScope, NodeId, ServiceCategory, ServiceProvider},
    CognosError,
};
use futures::FutureExt;

use super::category_mismatch;
use crate::registry::RegistryContext;

/// Typed access to graph memory.
#[derive(Debug, Clone)]
pub struct MemoryBus {
    registry: Arc<RegistryContext>,
}

impl MemoryBus {
    /// Creates the bus.
    #[must_use]
    pub const fn new(registry: Arc<RegistryContext>) -> Self {
        Self { registry }
    }

    /// Writes a node.
    pub async fn memorize(&self, node: &GraphNode, scope: MemoryScope) -> Result<NodeId, CognosError> {
        self.registry
            .dispatch(ServiceCategory::Memory, "memorize", |provider| {
                async move {
                    match provider {
                        ServiceProvider::Memory(memory) => memory.memorize(node, scope).await,
                        other => Err(category_mismatch(&other)),
                    }
                }
                .boxed()
            })
            .await
    }

    /// Queries nodes.
    pub async fn recall(&self, query: &MemoryQuery, scope: MemoryScope) -> Result<Vec<GraphNode>, CognosError> {
        self.registry
            .dispatch(ServiceCategory::Memory, "recall", |provider| {
                async move {
                    match provider {
                        ServiceProvider::Memory(memory) => memory.recall(query, scope).await,
                        other => Err(category_mismatch(&other)),
                    }
                }
                .boxed()
            })
            .await
    }

    /// Removes a node.
    pub async fn forget(&self, id: &NodeId, scope: MemoryScope) -> Result<bool, CognosError> {
        self.registry
            .dispatch(ServiceCategory::Memory, "forget", |provider| {
                async move {
                    match provider {
                        ServiceProvider::Memory(memory) => memory.forget(id, scope).await,
                        other => Err(category_mismatch(&other)),
                    }
                }
                .boxed()
            })
            .await
    }
}
