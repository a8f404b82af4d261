use std::sync::Arc;

use chrono::{DateTime, Utc};
use cognos_kernel::{
    services::{Message, ServiceCategory, ServiceProvider},
    CognosError,
};
use futures::FutureExt;

use super::category_mismatch;
use crate::registry::RegistryContext;

/// Typed access to messaging adapters.
#[derive(Debug, Clone)]
pub struct CommunicationBus {
    registry: Arc<RegistryContext>,
}

impl CommunicationBus {
    /// Creates the bus.
    #[must_use]
    pub const fn new(registry: Arc<RegistryContext>) -> Self {
        Self { registry }
    }

    /// Sends a message; `false` means the adapter refused it.
    pub async fn send_message(&self, channel_id: &str, content: &str) -> Result<bool, CognosError> {
        self.registry
            .dispatch(ServiceCategory::Communication, "send_message", |provider| {
                async move {
                    match provider {
                        ServiceProvider::Communication(comm) => comm.send_message(channel_id, content).await,
                        other => Err(category_mismatch(&other)),
                    }
                }
                .boxed()
            })
            .await
    }

    /// Fetches recent messages.
    pub async fn fetch_messages(
        &self,
        channel_id: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, CognosError> {
        self.registry
            .dispatch(ServiceCategory::Communication, "fetch_messages", |provider| {
                async move {
                    match provider {
                        ServiceProvider::Communication(comm) => {
                            comm.fetch_messages(channel_id, limit, before).await
                        }
                        other => Err(category_mismatch(&other)),
                    }
                }
                .boxed()
            })
            .await
    }
}
