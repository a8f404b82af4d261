use std::sync::Arc;

use cognos_kernel::{
    services::{ServiceCategory, ServiceProvider},
    state::{CognitiveState, RuntimeStatus},
    CognosError,
};
use futures::FutureExt;

use super::category_mismatch;
use crate::registry::RegistryContext;

/// Typed access to runtime-control surfaces.
#[derive(Debug, Clone)]
pub struct RuntimeControlBus {
    registry: Arc<RegistryContext>,
}

impl RuntimeControlBus {
    /// Creates the bus.
    #[must_use]
    pub const fn new(registry: Arc<RegistryContext>) -> Self {
        Self { registry }
    }

    /// Announces a state transition.
    pub async fn notify_state_transition(
        &self,
        from: CognitiveState,
        to: CognitiveState,
        reason: &str,
    ) -> Result<(), CognosError> {
        self.registry
            .dispatch(ServiceCategory::RuntimeControl, "notify_state_transition", |provider| {
                async move {
                    match provider {
                        ServiceProvider::RuntimeControl(control) => {
                            control.notify_state_transition(from, to, reason).await
                        }
                        other => Err(category_mismatch(&other)),
                    }
                }
                .boxed()
            })
            .await
    }

    /// Publishes a status snapshot.
    pub async fn publish_status(&self, status: &RuntimeStatus) -> Result<(), CognosError> {
        self.registry
            .dispatch(ServiceCategory::RuntimeControl, "publish_status", |provider| {
                async move {
                    match provider {
                        ServiceProvider::RuntimeControl(control) => control.publish_status(status).await,
                        other => Err(category_mismatch(&other)),
                    }
                }
                .boxed()
            })
            .await
    }
}
