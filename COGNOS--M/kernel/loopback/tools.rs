use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::Switches;
use crate::{
    error::ProviderError,
    services::{ToolInfo, ToolResult, ToolService},
};

/// Tool provider with a fixed set of built-in tools plus an invocation log.
///
/// Built-ins: `echo` returns its arguments, `clock` returns the current time.
#[derive(Debug)]
pub struct LoopbackTools {
    name: String,
    extra: BTreeMap<String, Value>,
    invocations: Mutex<Vec<(String, Value)>>,
    switches: Switches,
}

impl LoopbackTools {
    /// Creates the provider with the built-in tools.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extra: BTreeMap::new(),
            invocations: Mutex::new(Vec::new()),
            switches: Switches::default(),
        }
    }

    /// Adds a tool that always returns `output`.
    #[must_use]
    pub fn with_static_tool(mut self, name: impl Into<String>, output: Value) -> Self {
        self.extra.insert(name.into(), output);
        self
    }

    /// Recorded `(tool, arguments)` pairs.
    #[must_use]
    pub fn invocations(&self) -> Vec<(String, Value)> {
        self.invocations.lock().clone()
    }

    /// Health and failure switches.
    #[must_use]
    pub const fn switches(&self) -> &Switches {
        &self.switches
    }
}

#[async_trait]
impl ToolService for LoopbackTools {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> bool {
        self.switches.healthy()
    }

    async fn execute_tool(&self, name: &str, params: &Value) -> Result<ToolResult, ProviderError> {
        if self.switches.failing() {
            return Err(ProviderError::new(format!("{} is failing", self.name)));
        }
        self.invocations.lock().push((name.to_string(), params.clone()));
        let result = match name {
            "echo" => ToolResult {
                success: true,
                output: params.clone(),
                error: None,
            },
            "clock" => ToolResult {
                success: true,
                output: json!({ "now": chrono::Utc::now().to_rfc3339() }),
                error: None,
            },
            other => match self.extra.get(other) {
                Some(output) => ToolResult {
                    success: true,
                    output: output.clone(),
                    error: None,
                },
                None => ToolResult {
                    success: false,
                    output: Value::Null,
                    error: Some(format!("unknown tool {other}")),
                },
            },
        };
        Ok(result)
    }

    async fn list_tools(&self) -> Result<Vec<ToolInfo>, ProviderError> {
        let mut tools = vec![
            ToolInfo {
                name: "echo".into(),
                description: "returns its arguments".into(),
            },
            ToolInfo {
                name: "clock".into(),
                description: "returns the current time".into(),
            },
        ];
        tools.extend(self.extra.keys().map(|name| ToolInfo {
            name: name.clone(),
            description: "static output".into(),
        }));
        Ok(tools)
    }
}
