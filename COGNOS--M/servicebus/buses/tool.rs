use std::sync::Arc;

use cognos_kernel::{
    services::{ServiceCategory, ServiceProvider, ToolInfo, ToolResult},
    CognosError,
};
use futures::FutureExt;
use serde_json::Value;

use super::category_mismatch;
use crate::registry::RegistryContext;

/// Typed access to tool executors.
#[derive(Debug, Clone)]
pub struct ToolBus {
    registry: Arc<RegistryContext>,
}

impl ToolBus {
    /// Creates the bus.
    #[must_use]
    pub const fn new(registry: Arc<RegistryContext>) -> Self {
        Self { registry }
    }

    /// Executes a tool.
    pub async fn execute_tool(&self, name: &str, params: &Value) -> Result<ToolResult, CognosError> {
        self.registry
            .dispatch(ServiceCategory::Tool, "execute_tool", |provider| {
                async move {
                    match provider {
                        ServiceProvider::Tool(tool) => tool.execute_tool(name, params).await,
                        other => Err(category_mismatch(&other)),
                    }
                }
                .boxed()
            })
            .await
    }

    /// Lists tools of the best available provider.
    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>, CognosError> {
        self.registry
            .dispatch(ServiceCategory::Tool, "list_tools", |provider| {
                async move {
                    match provider {
                        ServiceProvider::Tool(tool) => tool.list_tools().await,
                        other => Err(category_mismatch(&other)),
                    }
                }
                .boxed()
            })
            .await
    }
}
