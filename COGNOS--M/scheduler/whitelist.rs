//! Per-state action whitelists and the substitution applied to disallowed actions.

use std::collections::{BTreeSet, HashMap};

use cognos_kernel::{
    action::{ActionParams, ActionSelectionResult, HandlerAction},
    config::SchedulerConfig,
    CognitiveState, CognosError,
};

/// Default whitelist for a state. DEFER is always present.
#[must_use]
pub fn default_whitelist(state: CognitiveState) -> BTreeSet<HandlerAction> {
    use HandlerAction::{Defer, Forget, Memorize, Observe, Ponder, Recall, Reject, Speak, TaskComplete};
    let actions: &[HandlerAction] = match state {
        CognitiveState::Wakeup => &[Speak, Ponder, Defer, Reject, Recall, TaskComplete],
        CognitiveState::Work | CognitiveState::Play => &HandlerAction::ALL,
        CognitiveState::Solitude => &[Observe, Speak, Reject, Ponder, Defer, Memorize, Recall, Forget, TaskComplete],
        CognitiveState::Dream => &[Memorize, Recall, Forget, Ponder, Defer, Reject, TaskComplete, Observe],
        CognitiveState::Shutdown => &[Speak, Memorize, Ponder, Defer, Reject, TaskComplete],
    };
    actions.iter().copied().collect()
}

/// Result of checking a selected action against the current state.
#[derive(Debug, Clone, PartialEq)]
pub struct Enforcement {
    /// Action to dispatch.
    pub result: ActionSelectionResult,
    /// The refused action and the error describing it, when a substitution happened.
    pub refused: Option<CognosError>,
}

/// Whitelists for every state.
#[derive(Debug, Clone)]
pub struct ActionWhitelist {
    allowed: HashMap<CognitiveState, BTreeSet<HandlerAction>>,
}

impl Default for ActionWhitelist {
    fn default() -> Self {
        Self {
            allowed: CognitiveState::ALL
                .into_iter()
                .map(|state| (state, default_whitelist(state)))
                .collect(),
        }
    }
}

impl ActionWhitelist {
    /// Defaults with the configured overrides applied. DEFER is re-added if missing.
    #[must_use]
    pub fn from_config(config: &SchedulerConfig) -> Self {
        let mut whitelist = Self::default();
        for entry in &config.whitelist_overrides {
            let mut allowed: BTreeSet<HandlerAction> = entry.allowed.iter().copied().collect();
            allowed.insert(HandlerAction::Defer);
            whitelist.allowed.insert(entry.state, allowed);
        }
        whitelist
    }

    /// Whether `params` may be dispatched in `state`.
    ///
    /// DREAM only permits passive OBSERVE.
    #[must_use]
    pub fn permits(&self, state: CognitiveState, params: &ActionParams) -> bool {
        if let (CognitiveState::Dream, ActionParams::Observe(observe)) = (state, params) {
            if observe.active {
                return false;
            }
        }
        self.allows(state, params.action())
    }

    /// Whether the action kind is listed for `state`.
    #[must_use]
    pub fn allows(&self, state: CognitiveState, action: HandlerAction) -> bool {
        action == HandlerAction::Defer
            || self
                .allowed
                .get(&state)
                .is_some_and(|allowed| allowed.contains(&action))
    }

    /// Returns `result` unchanged when permitted, otherwise PONDER (or DEFER
    /// when PONDER is not allowed either). The refused action is never returned.
    #[must_use]
    pub fn enforce(&self, state: CognitiveState, result: ActionSelectionResult) -> Enforcement {
        if self.permits(state, &result.params) {
            return Enforcement {
                result,
                refused: None,
            };
        }
        let action = result.selected_action();
        let error = CognosError::InvalidActionForState { action, state };
        let params = if self.allows(state, HandlerAction::Ponder) {
            ActionParams::ponder(format!(
                "{action} is not available while {state}; what can be done instead?"
            ))
        } else {
            ActionParams::defer(error.to_string())
        };
        Enforcement {
            result: ActionSelectionResult::new(params, result.confidence, error.to_string()),
            refused: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cognos_kernel::{
        action::{ObserveParams, ToolParams},
        config::WhitelistOverride,
    };

    fn tool() -> ActionSelectionResult {
        ActionSelectionResult::new(
            ActionParams::Tool(ToolParams {
                name: "clock".into(),
                arguments: serde_json::Value::Null,
            }),
            0.8,
            "check the time",
        )
    }

    #[test]
    fn dream_refuses_tool_with_ponder() {
        let whitelist = ActionWhitelist::default();
        let enforced = whitelist.enforce(CognitiveState::Dream, tool());
        assert_eq!(enforced.result.selected_action(), HandlerAction::Ponder);
        assert_eq!(
            enforced.refused,
            Some(CognosError::InvalidActionForState {
                action: HandlerAction::Tool,
                state: CognitiveState::Dream
            })
        );
    }

    #[test]
    fn defaults_match_each_state() {
        let whitelist = ActionWhitelist::default();
        for state in CognitiveState::ALL {
            assert!(whitelist.allows(state, HandlerAction::Defer));
        }
        assert!(HandlerAction::ALL.iter().all(|a| whitelist.allows(CognitiveState::Play, *a)));
        assert!(!whitelist.allows(CognitiveState::Solitude, HandlerAction::Tool));
        assert!(!whitelist.allows(CognitiveState::Wakeup, HandlerAction::Observe));
        assert!(!whitelist.allows(CognitiveState::Shutdown, HandlerAction::Recall));

        let active = ActionParams::Observe(ObserveParams {
            channel_id: None,
            active: true,
            limit: 5,
        });
        assert!(!whitelist.permits(CognitiveState::Dream, &active));
        assert!(whitelist.permits(CognitiveState::Work, &active));
    }

    #[test]
    fn override_without_ponder_falls_back_to_defer() {
        let config = SchedulerConfig {
            whitelist_overrides: vec![WhitelistOverride {
                state: CognitiveState::Solitude,
                allowed: vec![HandlerAction::Speak],
            }],
            ..SchedulerConfig::default()
        };
        let whitelist = ActionWhitelist::from_config(&config);
        let enforced = whitelist.enforce(CognitiveState::Solitude, tool());
        assert_eq!(enforced.result.selected_action(), HandlerAction::Defer);
        assert!(enforced.refused.is_some());
    }
}
