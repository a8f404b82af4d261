use std::sync::Arc;

use cognos_kernel::{
    services::{DeferralId, DeferralRequest, Guidance, GuidanceContext, ServiceCategory, ServiceProvider},
    CognosError,
};
use futures::FutureExt;

use super::category_mismatch;
use crate::registry::RegistryContext;

/// Typed access to the wise authority.
#[derive(Debug, Clone)]
pub struct WiseAuthorityBus {
    registry: Arc<RegistryContext>,
}

impl WiseAuthorityBus {
    /// Creates the bus.
    #[must_use]
    pub const fn new(registry: Arc<RegistryContext>) -> Self {
        Self { registry }
    }

    /// Asks for guidance.
    pub async fn fetch_guidance(&self, context: &GuidanceContext) -> Result<Guidance, CognosError> {
        self.registry
            .dispatch(ServiceCategory::WiseAuthority, "fetch_guidance", |provider| {
                async move {
                    match provider {
                        ServiceProvider::WiseAuthority(wa) => wa.fetch_guidance(context).await,
                        other => Err(category_mismatch(&other)),
                    }
                }
                .boxed()
            })
            .await
    }

    /// Files a deferral.
    pub async fn send_deferral(&self, request: &DeferralRequest) -> Result<DeferralId, CognosError> {
        self.registry
            .dispatch(ServiceCategory::WiseAuthority, "send_deferral", |provider| {
                async move {
                    match provider {
                        ServiceProvider::WiseAuthority(wa) => wa.send_deferral(request).await,
                        other => Err(category_mismatch(&other)),
                    }
                }
                .boxed()
            })
            .await
    }
}
