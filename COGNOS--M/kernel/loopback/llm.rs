use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::Switches;
use crate::{
    error::ProviderError,
    services::{LlmParams, LlmResponse, LlmService, TokenUsage},
};

/// Purpose key matched when nothing more specific is scripted.
pub const ANY_PURPOSE: &str = "*";

/// One recorded `generate` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmCall {
    /// Purpose from the call parameters.
    pub purpose: String,
    /// Prompt text.
    pub prompt: String,
}

/// Language model answering from per-purpose queues.
///
/// Lookup tries the exact purpose, then each dotted prefix (`dma.domain.x`,
/// `dma.domain`, `dma`), then [`ANY_PURPOSE`]. The last queued answer of a
/// purpose is repeated instead of being consumed.
#[derive(Debug)]
pub struct ScriptedLlm {
    name: String,
    scripts: Mutex<HashMap<String, VecDeque<String>>>,
    delay: Mutex<Option<Duration>>,
    cost_per_call: f64,
    calls: Mutex<Vec<LlmCall>>,
    switches: Switches,
}

impl ScriptedLlm {
    /// Empty script; every call fails until a response is queued.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scripts: Mutex::new(HashMap::new()),
            delay: Mutex::new(None),
            cost_per_call: 0.0,
            calls: Mutex::new(Vec::new()),
            switches: Switches::default(),
        }
    }

    /// Script where every evaluator approves and selection speaks once.
    #[must_use]
    pub fn cooperative(name: impl Into<String>) -> Self {
        Self::new(name)
            .with_response(
                "dma.ethical",
                json!({"decision": "approve", "alignment": 0.9, "confidence": 0.9, "rationale": "no conflict with principles"}).to_string(),
            )
            .with_response(
                "dma.common_sense",
                json!({"plausibility": 0.9, "flags": [], "confidence": 0.9, "rationale": "ordinary request"}).to_string(),
            )
            .with_response(
                "dma.domain",
                json!({"score": 0.8, "recommendation": null, "confidence": 0.8, "rationale": "within domain norms"}).to_string(),
            )
            .with_response(
                "dma.action_selection",
                json!({"action": "SPEAK", "parameters": {"content": "Acknowledged."}, "confidence": 0.9, "rationale": "respond to the request"}).to_string(),
            )
            .with_response("faculty.entropy", json!({"score": 0.1, "rationale": "focused"}).to_string())
            .with_response("faculty.coherence", json!({"score": 0.9, "rationale": "consistent"}).to_string())
            .with_response(
                "faculty.optimization_veto",
                json!({"score": 1.0, "rationale": "proportionate"}).to_string(),
            )
            .with_response(
                "faculty.epistemic_humility",
                json!({"score": 0.9, "rationale": "well grounded"}).to_string(),
            )
    }

    /// Queues a response for `purpose`.
    #[must_use]
    pub fn with_response(self, purpose: impl Into<String>, text: impl Into<String>) -> Self {
        self.push_response(purpose, text);
        self
    }

    /// Adds latency to every call.
    #[must_use]
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock() = Some(delay);
        self
    }

    /// Reported cost of every call.
    #[must_use]
    pub const fn with_cost(mut self, cost_per_call: f64) -> Self {
        self.cost_per_call = cost_per_call;
        self
    }

    /// Queues a response for `purpose`.
    pub fn push_response(&self, purpose: impl Into<String>, text: impl Into<String>) {
        self.scripts
            .lock()
            .entry(purpose.into())
            .or_default()
            .push_back(text.into());
    }

    /// Drops every queued response for `purpose` and queues `text`.
    pub fn replace_response(&self, purpose: impl Into<String>, text: impl Into<String>) {
        let mut queue = VecDeque::new();
        queue.push_back(text.into());
        self.scripts.lock().insert(purpose.into(), queue);
    }

    /// Changes the per-call latency.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Health and failure switches.
    #[must_use]
    pub const fn switches(&self) -> &Switches {
        &self.switches
    }

    /// Every call made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<LlmCall> {
        self.calls.lock().clone()
    }

    /// Calls whose purpose starts with `prefix`.
    #[must_use]
    pub fn call_count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.purpose.starts_with(prefix))
            .count()
    }

    fn next_response(&self, purpose: &str) -> Option<String> {
        let mut scripts = self.scripts.lock();
        let mut key = purpose;
        loop {
            if let Some(queue) = scripts.get_mut(key) {
                if queue.len() > 1 {
                    return queue.pop_front();
                }
                if let Some(last) = queue.front() {
                    return Some(last.clone());
                }
            }
            match key.rfind('.') {
                Some(idx) => key = &key[..idx],
                None if key != ANY_PURPOSE => key = ANY_PURPOSE,
                None => return None,
            }
        }
    }
}

fn word_count(text: &str) -> u64 {
    u64::try_from(text.split_whitespace().count()).unwrap_or(u64::MAX)
}

#[async_trait]
impl LlmService for ScriptedLlm {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> bool {
        self.switches.healthy()
    }

    async fn generate(&self, prompt: &str, params: &LlmParams) -> Result<LlmResponse, ProviderError> {
        self.calls.lock().push(LlmCall {
            purpose: params.purpose.clone(),
            prompt: prompt.to_string(),
        });
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.switches.failing() {
            return Err(ProviderError::new(format!("{} is failing", self.name)));
        }
        let text = self
            .next_response(&params.purpose)
            .ok_or_else(|| ProviderError::new(format!("no scripted response for {}", params.purpose)))?;
        Ok(LlmResponse {
            token_usage: TokenUsage {
                input_tokens: word_count(prompt),
                output_tokens: word_count(&text),
            },
            text,
            cost: self.cost_per_call,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn falls_back_through_dotted_prefixes() {
        let llm = ScriptedLlm::new("scripted")
            .with_response("dma.domain", "domain")
            .with_response(ANY_PURPOSE, "anything");
        let domain = llm
            .generate("p", &LlmParams::for_purpose("dma.domain.medical"))
            .await
            .unwrap();
        assert_eq!(domain.text, "domain");
        let other = llm.generate("p", &LlmParams::for_purpose("faculty.entropy")).await.unwrap();
        assert_eq!(other.text, "anything");
        assert_eq!(llm.call_count("dma."), 1);
    }

    #[tokio::test]
    async fn last_response_repeats_and_failures_switch_on() {
        let llm = ScriptedLlm::new("scripted")
            .with_response("x", "first")
            .with_response("x", "second");
        let params = LlmParams::for_purpose("x");
        assert_eq!(llm.generate("a b", &params).await.unwrap().text, "first");
        assert_eq!(llm.generate("a b", &params).await.unwrap().text, "second");
        let repeat = llm.generate("a b", &params).await.unwrap();
        assert_eq!(repeat.text, "second");
        assert_eq!(repeat.token_usage.input_tokens, 2);

        llm.switches().set_failing(true);
        assert!(llm.generate("a", &params).await.is_err());
        assert!(ScriptedLlm::new("empty").generate("a", &params).await.is_err());
    }
}
