use async_trait::async_trait;
use parking_lot::Mutex;

use super::Switches;
use crate::{
    error::ProviderError,
    services::{DeferralId, DeferralRequest, Guidance, GuidanceContext, WiseAuthorityService},
};

/// Wise authority that files deferrals in memory and answers with fixed guidance.
#[derive(Debug)]
pub struct RecordingWiseAuthority {
    name: String,
    guidance: Mutex<Guidance>,
    deferrals: Mutex<Vec<DeferralRequest>>,
    questions: Mutex<Vec<GuidanceContext>>,
    switches: Switches,
}

impl RecordingWiseAuthority {
    /// Creates an authority that approves every question.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            guidance: Mutex::new(Guidance {
                text: "proceed with care".into(),
                approved: Some(true),
            }),
            deferrals: Mutex::new(Vec::new()),
            questions: Mutex::new(Vec::new()),
            switches: Switches::default(),
        }
    }

    /// Replaces the canned guidance.
    pub fn set_guidance(&self, guidance: Guidance) {
        *self.guidance.lock() = guidance;
    }

    /// Deferrals received so far.
    #[must_use]
    pub fn deferrals(&self) -> Vec<DeferralRequest> {
        self.deferrals.lock().clone()
    }

    /// Guidance questions received so far.
    #[must_use]
    pub fn questions(&self) -> Vec<GuidanceContext> {
        self.questions.lock().clone()
    }

    /// Health and failure switches.
    #[must_use]
    pub const fn switches(&self) -> &Switches {
        &self.switches
    }
}

#[async_trait]
impl WiseAuthorityService for RecordingWiseAuthority {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> bool {
        self.switches.healthy()
    }

    async fn fetch_guidance(&self, context: &GuidanceContext) -> Result<Guidance, ProviderError> {
        if self.switches.failing() {
            return Err(ProviderError::new(format!("{} is failing", self.name)));
        }
        self.questions.lock().push(context.clone());
        Ok(self.guidance.lock().clone())
    }

    async fn send_deferral(&self, request: &DeferralRequest) -> Result<DeferralId, ProviderError> {
        if self.switches.failing() {
            return Err(ProviderError::new(format!("{} is failing", self.name)));
        }
        let mut deferrals = self.deferrals.lock();
        deferrals.push(request.clone());
        Ok(DeferralId(format!("{}-deferral-{}", self.name, deferrals.len())))
    }
}
