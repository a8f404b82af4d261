//! Executes a permitted action through the buses.

use cognos_kernel::{
    action::{ActionParams, ActionSelectionResult, DmaResult, RationaleEntry},
    services::{DeferralId, DeferralRequest, GraphNode, Message},
    thought::Thought,
    CognosError,
};
use cognos_servicebus::ServiceBuses;
use serde::{Deserialize, Serialize};

/// What dispatching an action did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// The action finished the thought.
    Completed {
        /// Detail for the audit trail.
        detail: String,
    },
    /// The action asks for a follow-up thought.
    Continue {
        /// Questions carried into the continuation.
        notes: Vec<String>,
        /// Data gathered for the continuation.
        observations: Vec<String>,
    },
    /// The task went to the wise authority.
    Deferred {
        /// Why.
        reason: String,
        /// Ticket when the authority accepted it; `None` during an outage.
        deferral_id: Option<DeferralId>,
    },
    /// The agent declined the task.
    Rejected {
        /// Why.
        reason: String,
    },
    /// The bus call failed.
    Failed {
        /// Why.
        reason: String,
    },
}

impl DispatchOutcome {
    /// Whether the outcome counts as success for auditing.
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }

    /// One-line summary.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::Completed { detail } => detail.clone(),
            Self::Continue { notes, observations } => {
                format!("continue with {} notes, {} observations", notes.len(), observations.len())
            }
            Self::Deferred { reason, .. } | Self::Rejected { reason } | Self::Failed { reason } => {
                reason.clone()
            }
        }
    }
}

/// Evaluation context forwarded with a deferral.
#[derive(Debug, Clone, Default)]
pub struct DeferralContext {
    /// Rationale chain of the deciding thought.
    pub trail: Vec<RationaleEntry>,
    /// DMA results of the deciding evaluation.
    pub dma_results: Vec<DmaResult>,
}

/// Maps each of the ten actions onto a bus call.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    buses: ServiceBuses,
    home_channel: Option<String>,
}

impl Dispatcher {
    /// Creates the dispatcher.
    #[must_use]
    pub const fn new(buses: ServiceBuses, home_channel: Option<String>) -> Self {
        Self {
            buses,
            home_channel,
        }
    }

    fn channel<'a>(&'a self, requested: Option<&'a String>, thought: &'a Thought) -> Option<&'a str> {
        requested
            .or(thought.context.channel_id.as_ref())
            .or(self.home_channel.as_ref())
            .map(String::as_str)
    }

    /// Dispatches `result` on behalf of `thought`.
    pub async fn dispatch(
        &self,
        thought: &Thought,
        result: &ActionSelectionResult,
        deferral: DeferralContext,
    ) -> DispatchOutcome {
        match self.try_dispatch(thought, result, deferral).await {
            Ok(outcome) => outcome,
            Err(err) => DispatchOutcome::Failed {
                reason: err.to_string(),
            },
        }
    }

    async fn try_dispatch(
        &self,
        thought: &Thought,
        result: &ActionSelectionResult,
        deferral: DeferralContext,
    ) -> Result<DispatchOutcome, CognosError> {
        let outcome = match &result.params {
            ActionParams::Speak(speak) => {
                let channel = self.require_channel(speak.channel_id.as_ref(), thought)?;
                if self.buses.communication.send_message(channel, &speak.content).await? {
                    DispatchOutcome::Completed {
                        detail: format!("sent to {channel}"),
                    }
                } else {
                    DispatchOutcome::Failed {
                        reason: format!("{channel} refused the message"),
                    }
                }
            }
            ActionParams::Observe(observe) if observe.active => {
                let channel = self.require_channel(observe.channel_id.as_ref(), thought)?;
                let messages = self
                    .buses
                    .communication
                    .fetch_messages(channel, observe.limit, None)
                    .await?;
                DispatchOutcome::Continue {
                    notes: Vec::new(),
                    observations: messages.iter().map(render_message).collect(),
                }
            }
            ActionParams::Observe(_) => DispatchOutcome::Completed {
                detail: "noted current context".into(),
            },
            ActionParams::Tool(tool) => {
                let outcome = self.buses.tool.execute_tool(&tool.name, &tool.arguments).await?;
                if outcome.success {
                    DispatchOutcome::Completed {
                        detail: format!("{} returned {}", tool.name, outcome.output),
                    }
                } else {
                    DispatchOutcome::Failed {
                        reason: outcome
                            .error
                            .unwrap_or_else(|| format!("{} failed", tool.name)),
                    }
                }
            }
            ActionParams::Memorize(memorize) => {
                let id = self.buses.memory.memorize(&memorize.node, memorize.scope).await?;
                DispatchOutcome::Completed {
                    detail: format!("memorized {id}"),
                }
            }
            ActionParams::Recall(recall) => {
                let nodes = self.buses.memory.recall(&recall.query, recall.scope).await?;
                DispatchOutcome::Continue {
                    notes: Vec::new(),
                    observations: nodes.iter().map(render_node).collect(),
                }
            }
            ActionParams::Forget(forget) => {
                let removed = self.buses.memory.forget(&forget.node_id, forget.scope).await?;
                DispatchOutcome::Completed {
                    detail: if removed {
                        format!("forgot {}", forget.node_id)
                    } else {
                        format!("{} was not stored", forget.node_id)
                    },
                }
            }
            ActionParams::Ponder(ponder) => DispatchOutcome::Continue {
                notes: ponder.questions.clone(),
                observations: Vec::new(),
            },
            ActionParams::Reject(reject) => DispatchOutcome::Rejected {
                reason: reject.reason.clone(),
            },
            ActionParams::TaskComplete(done) => DispatchOutcome::Completed {
                detail: if done.summary.is_empty() {
                    "task complete".into()
                } else {
                    done.summary.clone()
                },
            },
            ActionParams::Defer(defer) => {
                let request = DeferralRequest {
                    task_id: thought.task_id,
                    thought_id: thought.id,
                    reason: defer.reason.clone(),
                    defer_until: defer.defer_until,
                    rationale_chain: deferral.trail,
                    dma_results: deferral.dma_results,
                };
                let deferral_id = match self.buses.wise_authority.send_deferral(&request).await {
                    Ok(id) => Some(id),
                    Err(err) => {
                        tracing::warn!(target: "cognos", task_id = %thought.task_id, error = %err, "deferral kept locally");
                        None
                    }
                };
                DispatchOutcome::Deferred {
                    reason: defer.reason.clone(),
                    deferral_id,
                }
            }
        };
        Ok(outcome)
    }

    fn require_channel<'a>(
        &'a self,
        requested: Option<&'a String>,
        thought: &'a Thought,
    ) -> Result<&'a str, CognosError> {
        self.channel(requested, thought)
            .ok_or_else(|| CognosError::Internal("no channel to address".into()))
    }
}

fn render_message(message: &Message) -> String {
    format!("[{}] {}: {}", message.channel_id, message.author, message.content)
}

fn render_node(node: &GraphNode) -> String {
    let attributes = serde_json::to_string(&node.attributes).unwrap_or_default();
    format!("{} ({}): {attributes}", node.id, node.node_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use cognos_kernel::{
        action::{ObserveParams, SpeakParams, ToolParams},
        config::{BreakerConfig, BusConfig},
        loopback::{RecordingCommunication, RecordingWiseAuthority},
        services::ServiceProvider,
        task::{Task, TaskSpec},
        thought::{ContextSnapshot, ThoughtType},
        CognitiveState, ManualClock,
    };
    use cognos_servicebus::{RegistryContext, ServiceRegistration};

    fn thought(channel: Option<&str>) -> Thought {
        let mut spec = TaskSpec::new("help");
        if let Some(channel) = channel {
            spec = spec.with_channel(channel);
        }
        let task = Task::new(spec, 1, Utc::now());
        let context = ContextSnapshot::for_task(&task, CognitiveState::Work, 1, Utc::now());
        Thought::new(task.id, ThoughtType::Initial, 1, 0, context, Utc::now())
    }

    fn buses() -> ServiceBuses {
        ServiceBuses::new(Arc::new(RegistryContext::new(
            BreakerConfig::default(),
            BusConfig::default(),
            Arc::new(ManualClock::default()),
        )))
    }

    #[tokio::test]
    async fn speak_uses_task_channel_and_observe_continues() {
        let buses = buses();
        let comms = Arc::new(RecordingCommunication::new("chat"));
        comms.seed("general", "ana", "hello?");
        buses.registry.register(ServiceRegistration::new(
            "chat",
            ServiceProvider::Communication(comms.clone()),
        ));
        let dispatcher = Dispatcher::new(buses, None);
        let thought = thought(Some("general"));

        let speak = ActionSelectionResult::new(
            ActionParams::Speak(SpeakParams {
                channel_id: None,
                content: "hi".into(),
            }),
            0.9,
            "greet",
        );
        let outcome = dispatcher.dispatch(&thought, &speak, DeferralContext::default()).await;
        assert_eq!(outcome, DispatchOutcome::Completed { detail: "sent to general".into() });
        assert_eq!(comms.sent().len(), 1);

        let observe = ActionSelectionResult::new(
            ActionParams::Observe(ObserveParams {
                channel_id: None,
                active: true,
                limit: 5,
            }),
            0.9,
            "look",
        );
        match dispatcher.dispatch(&thought, &observe, DeferralContext::default()).await {
            DispatchOutcome::Continue { observations, .. } => {
                assert!(observations.iter().any(|line| line.contains("hello?")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_provider_or_channel_fails() {
        let dispatcher = Dispatcher::new(buses(), None);
        let speak = ActionSelectionResult::new(
            ActionParams::Speak(SpeakParams {
                channel_id: None,
                content: "hi".into(),
            }),
            0.9,
            "greet",
        );
        let outcome = dispatcher
            .dispatch(&thought(None), &speak, DeferralContext::default())
            .await;
        assert!(!outcome.succeeded());

        let tool = ActionSelectionResult::new(
            ActionParams::Tool(ToolParams {
                name: "echo".into(),
                arguments: serde_json::json!({"x": 1}),
            }),
            0.9,
            "echo",
        );
        let outcome = dispatcher
            .dispatch(&thought(None), &tool, DeferralContext::default())
            .await;
        assert!(matches!(outcome, DispatchOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn deferral_survives_authority_outage() {
        let buses = buses();
        let dispatcher = Dispatcher::new(buses.clone(), None);
        let defer = ActionSelectionResult::new(ActionParams::defer("unsure"), 0.2, "unsure");
        let outcome = dispatcher
            .dispatch(&thought(None), &defer, DeferralContext::default())
            .await;
        assert_eq!(
            outcome,
            DispatchOutcome::Deferred {
                reason: "unsure".into(),
                deferral_id: None
            }
        );

        let wa = Arc::new(RecordingWiseAuthority::new("wa"));
        buses
            .registry
            .register(ServiceRegistration::new("wa", ServiceProvider::WiseAuthority(wa.clone())));
        let trail = vec![RationaleEntry::new(
            cognos_kernel::RationaleStage::Guardrail,
            "guardrails",
            false,
            "entropy",
        )];
        let outcome = dispatcher
            .dispatch(
                &thought(None),
                &defer,
                DeferralContext {
                    trail,
                    dma_results: Vec::new(),
                },
            )
            .await;
        assert!(matches!(outcome, DispatchOutcome::Deferred { deferral_id: Some(_), .. }));
        assert_eq!(wa.deferrals()[0].rationale_chain.len(), 1);
    }
}
