//! Contracts the runtime expects from external collaborators.
//!
//! Providers are registered with the service registry wrapped in a
//! [`ServiceProvider`]; the audit sink is injected directly.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    action::{DmaResult, HandlerAction, RationaleEntry},
    error::ProviderError,
    state::{CognitiveState, RuntimeStatus},
    task::TaskId,
    thought::ThoughtId,
};

/// Multi-provider service categories, one bus each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceCategory {
    /// Graph memory.
    Memory,
    /// Language models.
    Llm,
    /// Chat and messaging adapters.
    Communication,
    /// Tool execution.
    Tool,
    /// Human or authority review.
    WiseAuthority,
    /// Runtime control surfaces.
    RuntimeControl,
}

impl ServiceCategory {
    /// Every category.
    pub const ALL: [Self; 6] = [
        Self::Memory,
        Self::Llm,
        Self::Communication,
        Self::Tool,
        Self::WiseAuthority,
        Self::RuntimeControl,
    ];

    /// Snake-case label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Llm => "llm",
            Self::Communication => "communication",
            Self::Tool => "tool",
            Self::WiseAuthority => "wise_authority",
            Self::RuntimeControl => "runtime_control",
        }
    }
}

impl fmt::Display for ServiceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Chat message returned by `fetch_messages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message id.
    pub id: String,
    /// Channel the message belongs to.
    pub channel_id: String,
    /// Author handle.
    pub author: String,
    /// Body.
    pub content: String,
    /// Send time.
    pub timestamp: DateTime<Utc>,
}

/// Parameters for `LlmService::generate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmParams {
    /// Caller purpose (`dma.ethical`, `dma.action_selection`, ...).
    pub purpose: String,
    /// Output token budget.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
}

impl LlmParams {
    /// Parameters for the given purpose with default budget.
    #[must_use]
    pub fn for_purpose(purpose: impl Into<String>) -> Self {
        Self {
            purpose: purpose.into(),
            ..Self::default()
        }
    }
}

impl Default for LlmParams {
    fn default() -> Self {
        Self {
            purpose: "general".into(),
            max_tokens: 1024,
            temperature: 0.0,
        }
    }
}

/// Token usage reported by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens.
    pub input_tokens: u64,
    /// Completion tokens.
    pub output_tokens: u64,
}

/// Output of `LlmService::generate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    /// Generated text.
    pub text: String,
    /// Reported usage.
    pub token_usage: TokenUsage,
    /// Provider-reported cost; the runtime only sums it.
    pub cost: f64,
}

/// Question sent to the wise authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidanceContext {
    /// Thought asking for guidance.
    pub thought_id: ThoughtId,
    /// Owning task.
    pub task_id: TaskId,
    /// Question.
    pub question: String,
}

/// Answer from the wise authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guidance {
    /// Guidance text.
    pub text: String,
    /// Explicit approval, when the authority gave one.
    pub approved: Option<bool>,
}

/// Deferral handed to the wise authority, with the rationale chain intact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferralRequest {
    /// Deferred task.
    pub task_id: TaskId,
    /// Thought that resolved to DEFER.
    pub thought_id: ThoughtId,
    /// Reason.
    pub reason: String,
    /// Optional earliest retry time.
    pub defer_until: Option<DateTime<Utc>>,
    /// Evaluation, guardrail and substitution entries that led here.
    pub rationale_chain: Vec<RationaleEntry>,
    /// Every DMA result of the last evaluation.
    pub dma_results: Vec<DmaResult>,
}

/// Ticket returned for an accepted deferral.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeferralId(pub String);

/// Outcome of a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the tool succeeded.
    pub success: bool,
    /// Tool output.
    #[serde(default)]
    pub output: serde_json::Value,
    /// Error text on failure.
    #[serde(default)]
    pub error: Option<String>,
}

/// Tool description returned by `list_tools`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInfo {
    /// Tool name.
    pub name: String,
    /// Description.
    pub description: String,
}

/// Opaque memory node id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    /// Creates an id from any string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Memory partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryScope {
    /// Agent-local working knowledge.
    #[default]
    Local,
    /// Identity attributes; changes feed the variance check.
    Identity,
    /// Facts about the environment.
    Environment,
    /// Shared community knowledge.
    Community,
}

/// Memory node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Node id.
    pub id: NodeId,
    /// Node type (`concept`, `identity`, `observation`, ...).
    pub node_type: String,
    /// Attributes.
    #[serde(default)]
    pub attributes: IndexMap<String, serde_json::Value>,
}

impl GraphNode {
    /// Creates a node without attributes.
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(id),
            node_type: node_type.into(),
            attributes: IndexMap::new(),
        }
    }

    /// Adds an attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// Memory query.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemoryQuery {
    /// Exact node id.
    #[serde(default)]
    pub node_id: Option<NodeId>,
    /// Node type filter.
    #[serde(default)]
    pub node_type: Option<String>,
    /// Case-insensitive text contained in the id or an attribute value.
    #[serde(default)]
    pub text: Option<String>,
    /// Maximum nodes returned; 0 means unlimited.
    #[serde(default)]
    pub limit: usize,
}

/// Context attached to an audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditContext {
    /// Thought that produced the action.
    pub thought_id: ThoughtId,
    /// Owning task.
    pub task_id: TaskId,
    /// Round in which the outcome was applied.
    pub round_number: u64,
    /// State in force.
    pub cognitive_state: CognitiveState,
    /// Rationale of the selected action.
    pub rationale: String,
}

/// Outcome attached to an audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditOutcome {
    /// Whether dispatch succeeded.
    pub success: bool,
    /// Detail text.
    pub detail: String,
}

/// Audit entry id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditEntryId(pub String);

/// Messaging adapter.
#[async_trait]
pub trait CommunicationService: Send + Sync {
    /// Provider handle.
    fn name(&self) -> &str;

    /// Reports whether the provider can serve requests.
    async fn health_check(&self) -> bool {
        true
    }

    /// Sends a message; `false` means the adapter refused it.
    async fn send_message(&self, channel_id: &str, content: &str) -> Result<bool, ProviderError>;

    /// Fetches up to `limit` messages, optionally older than `before`.
    async fn fetch_messages(
        &self,
        channel_id: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, ProviderError>;
}

/// Language model provider.
#[async_trait]
pub trait LlmService: Send + Sync {
    /// Provider handle.
    fn name(&self) -> &str;

    /// Reports whether the provider can serve requests.
    async fn health_check(&self) -> bool {
        true
    }

    /// Generates text.
    async fn generate(&self, prompt: &str, params: &LlmParams) -> Result<LlmResponse, ProviderError>;
}

/// Human or authority review surface.
#[async_trait]
pub trait WiseAuthorityService: Send + Sync {
    /// Provider handle.
    fn name(&self) -> &str;

    /// Reports whether the provider can serve requests.
    async fn health_check(&self) -> bool {
        true
    }

    /// Asks for guidance.
    async fn fetch_guidance(&self, context: &GuidanceContext) -> Result<Guidance, ProviderError>;

    /// Files a deferral.
    async fn send_deferral(&self, request: &DeferralRequest) -> Result<DeferralId, ProviderError>;
}

/// Tool executor.
#[async_trait]
pub trait ToolService: Send + Sync {
    /// Provider handle.
    fn name(&self) -> &str;

    /// Reports whether the provider can serve requests.
    async fn health_check(&self) -> bool {
        true
    }

    /// Executes a tool.
    async fn execute_tool(
        &self,
        name: &str,
        params: &serde_json::Value,
    ) -> Result<ToolResult, ProviderError>;

    /// Lists available tools.
    async fn list_tools(&self) -> Result<Vec<ToolInfo>, ProviderError>;
}

/// Graph memory store.
#[async_trait]
pub trait MemoryService: Send + Sync {
    /// Provider handle.
    fn name(&self) -> &str;

    /// Reports whether the provider can serve requests.
    async fn health_check(&self) -> bool {
        true
    }

    /// Writes a node.
    async fn memorize(&self, node: &GraphNode, scope: MemoryScope) -> Result<NodeId, ProviderError>;

    /// Queries nodes.
    async fn recall(
        &self,
        query: &MemoryQuery,
        scope: MemoryScope,
    ) -> Result<Vec<GraphNode>, ProviderError>;

    /// Removes a node; `false` when it did not exist.
    async fn forget(&self, id: &NodeId, scope: MemoryScope) -> Result<bool, ProviderError>;
}

/// Runtime control surface notified of state changes.
#[async_trait]
pub trait RuntimeControlService: Send + Sync {
    /// Provider handle.
    fn name(&self) -> &str;

    /// Reports whether the provider can serve requests.
    async fn health_check(&self) -> bool {
        true
    }

    /// Announces a cognitive state transition.
    async fn notify_state_transition(
        &self,
        from: CognitiveState,
        to: CognitiveState,
        reason: &str,
    ) -> Result<(), ProviderError>;

    /// Publishes a runtime status snapshot.
    async fn publish_status(&self, status: &RuntimeStatus) -> Result<(), ProviderError>;
}

/// Append-only audit log. Failures are never fatal to the caller.
#[async_trait]
pub trait AuditService: Send + Sync {
    /// Records an action outcome.
    async fn log_action(
        &self,
        action: HandlerAction,
        context: &AuditContext,
        outcome: &AuditOutcome,
    ) -> Result<AuditEntryId, ProviderError>;
}

/// A provider object tagged with its category.
#[derive(Clone)]
pub enum ServiceProvider {
    /// Memory provider.
    Memory(Arc<dyn MemoryService>),
    /// LLM provider.
    Llm(Arc<dyn LlmService>),
    /// Communication provider.
    Communication(Arc<dyn CommunicationService>),
    /// Tool provider.
    Tool(Arc<dyn ToolService>),
    /// Wise-authority provider.
    WiseAuthority(Arc<dyn WiseAuthorityService>),
    /// Runtime-control provider.
    RuntimeControl(Arc<dyn RuntimeControlService>),
}

impl ServiceProvider {
    /// Category the provider serves.
    #[must_use]
    pub const fn category(&self) -> ServiceCategory {
        match self {
            Self::Memory(_) => ServiceCategory::Memory,
            Self::Llm(_) => ServiceCategory::Llm,
            Self::Communication(_) => ServiceCategory::Communication,
            Self::Tool(_) => ServiceCategory::Tool,
            Self::WiseAuthority(_) => ServiceCategory::WiseAuthority,
            Self::RuntimeControl(_) => ServiceCategory::RuntimeControl,
        }
    }

    /// Provider's self-reported name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Memory(p) => p.name(),
            Self::Llm(p) => p.name(),
            Self::Communication(p) => p.name(),
            Self::Tool(p) => p.name(),
            Self::WiseAuthority(p) => p.name(),
            Self::RuntimeControl(p) => p.name(),
        }
    }

    /// Delegates to the provider's health check.
    pub async fn health_check(&self) -> bool {
        match self {
            Self::Memory(p) => p.health_check().await,
            Self::Llm(p) => p.health_check().await,
            Self::Communication(p) => p.health_check().await,
            Self::Tool(p) => p.health_check().await,
            Self::WiseAuthority(p) => p.health_check().await,
            Self::RuntimeControl(p) => p.health_check().await,
        }
    }
}

impl fmt::Debug for ServiceProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceProvider")
            .field("category", &self.category())
            .field("name", &self.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_labels_match_serde() {
        for category in ServiceCategory::ALL {
            let encoded = serde_json::to_value(category).unwrap();
            assert_eq!(encoded, serde_json::Value::String(category.label().into()));
        }
    }

    #[test]
    fn graph_node_builder() {
        let node = GraphNode::new("agent/name", "identity")
            .with_attribute("value", serde_json::json!("cognos"));
        assert_eq!(node.id.to_string(), "agent/name");
        assert_eq!(node.attributes.len(), 1);
    }
}
