use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use tessera_core::error::{Result, TesseraError};
use tessera_core::traits::Tool;
use tessera_core::types::{ExecutionResult, ToolContext, ToolDefinition};

/// Registry of available tools.
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    /// Register a tool. A tool with the same name is replaced.
    pub fn register(&mut self, tool: impl Tool) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    /// Register an already shared tool.
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Unregister a tool by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// List all registered tools, sorted by name.
    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// Get tool definitions for sending to the LLM, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Definitions restricted to `names`; an empty filter means every tool.
    pub fn definitions_for(&self, names: &[String]) -> Vec<ToolDefinition> {
        if names.is_empty() {
            return self.definitions();
        }
        self.definitions()
            .into_iter()
            .filter(|d| names.contains(&d.name))
            .collect()
    }

    /// Execute a tool by name under its timeout.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ExecutionResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| TesseraError::ToolNotFound(name.to_string()))?;

        let timeout = std::time::Duration::from_secs(tool.timeout_secs());
        debug!(tool = %name, node = %ctx.node_id, "Executing tool");

        match tokio::time::timeout(timeout, tool.execute(input, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(TesseraError::ToolTimeout {
                tool: name.to_string(),
                timeout_secs: tool.timeout_secs(),
            }),
        }
    }

    /// Execute a tool and fold every failure into an error `ExecutionResult`,
    /// so callers can record the outcome as data.
    pub async fn invoke(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> ExecutionResult {
        match self.execute(name, input, ctx).await {
            Ok(result) => result,
            Err(e) => {
                warn!(tool = %name, error = %e, "Tool invocation failed");
                ExecutionResult::error(e.to_string())
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::types::RunId;
    use tessera_test_utils::{EchoTool, FailingTool, GatedTool};

    fn ctx() -> ToolContext {
        ToolContext::new(RunId::from_string("r"), "node")
    }

    #[tokio::test]
    async fn test_invoke_success() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool::new("echo"));

        let result = registry
            .invoke("echo", serde_json::json!({"x": 1}), ctx())
            .await;
        assert!(result.is_success());
        assert_eq!(result.output["x"], 1);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let registry = ToolRegistry::new();
        let err = registry
            .execute("missing", serde_json::Value::Null, ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::ToolNotFound(_)));

        let result = registry.invoke("missing", serde_json::Value::Null, ctx()).await;
        assert!(!result.is_success());
        assert!(result.error.unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn test_failing_tool_becomes_error_result() {
        let mut registry = ToolRegistry::new();
        registry.register(FailingTool::new("flaky", "disk full"));
        let result = registry.invoke("flaky", serde_json::Value::Null, ctx()).await;
        assert!(!result.is_success());
        assert!(result.error.unwrap().contains("disk full"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let mut registry = ToolRegistry::new();
        registry.register(GatedTool::new("slow").with_timeout(1));
        let err = registry
            .execute("slow", serde_json::Value::Null, ctx())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TesseraError::ToolTimeout {
                timeout_secs: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_definitions_sorted_and_filtered() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool::new("b"));
        registry.register(EchoTool::new("a"));
        let names: Vec<_> = registry.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["a", "b"]);
        let only_b = registry.definitions_for(&["b".to_string()]);
        assert_eq!(only_b.len(), 1);
        assert_eq!(registry.definitions_for(&[]).len(), 2);
    }
}
