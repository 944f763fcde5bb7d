use serde::{Deserialize, Serialize};
use serde_json::Value;

use tessera_core::config::CompactionConfig;

/// A node in a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier for this node.
    pub id: String,
    /// What the node does.
    #[serde(flatten)]
    pub kind: NodeKind,
    /// A failure of a critical node aborts the whole run.
    #[serde(default)]
    pub critical: bool,
    /// Overrides `engine.node_timeout_secs`.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// When the node may start if several edges lead into it.
    #[serde(default)]
    pub join: JoinPolicy,
    /// Also store the node's result under this variable.
    #[serde(default)]
    pub output_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    /// A think-act loop.
    Agent {
        instructions: String,
        #[serde(default)]
        system_prompt: Option<String>,
        /// Tool names available to this node (empty = all tools).
        #[serde(default)]
        tools: Vec<String>,
        #[serde(default)]
        max_iterations: Option<usize>,
        #[serde(default)]
        compaction: Option<CompactionConfig>,
    },
    /// A single registry tool call.
    Tool {
        tool: String,
        /// Fixed arguments; when absent the node input is passed.
        #[serde(default)]
        arguments: Value,
    },
    /// A named function from the function registry.
    Function {
        function: String,
        #[serde(default)]
        arguments: Value,
    },
    /// Suspends its branch until a human answers.
    HumanApproval {
        prompt: String,
        #[serde(default = "default_approval_options")]
        options: Vec<String>,
    },
    /// Counts iterations and picks `loop_continue` or `loop_exit` edges.
    Loop {
        max_iterations: u32,
        /// Extra condition that must hold to keep looping.
        #[serde(default)]
        condition: Option<String>,
    },
}

fn default_approval_options() -> Vec<String> {
    vec!["approve".to_string(), "reject".to_string()]
}

/// Join policy for nodes with several incoming edges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Wait for every forward predecessor.
    #[default]
    All,
    /// Start on the first arrival.
    Any,
}

impl Node {
    fn with_kind(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            critical: false,
            timeout_secs: None,
            join: JoinPolicy::All,
            output_key: None,
        }
    }

    pub fn agent(id: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self::with_kind(
            id,
            NodeKind::Agent {
                instructions: instructions.into(),
                system_prompt: None,
                tools: vec![],
                max_iterations: None,
                compaction: None,
            },
        )
    }

    pub fn tool(id: impl Into<String>, tool: impl Into<String>) -> Self {
        Self::with_kind(
            id,
            NodeKind::Tool {
                tool: tool.into(),
                arguments: Value::Null,
            },
        )
    }

    pub fn function(id: impl Into<String>, function: impl Into<String>) -> Self {
        Self::with_kind(
            id,
            NodeKind::Function {
                function: function.into(),
                arguments: Value::Null,
            },
        )
    }

    pub fn human_approval(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::with_kind(
            id,
            NodeKind::HumanApproval {
                prompt: prompt.into(),
                options: default_approval_options(),
            },
        )
    }

    pub fn loop_node(id: impl Into<String>, max_iterations: u32) -> Self {
        Self::with_kind(
            id,
            NodeKind::Loop {
                max_iterations,
                condition: None,
            },
        )
    }

    /// Mark the node critical.
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_join(mut self, join: JoinPolicy) -> Self {
        self.join = join;
        self
    }

    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    /// Restrict an agent node to `tools`. No effect on other kinds.
    pub fn with_tools(mut self, names: Vec<String>) -> Self {
        if let NodeKind::Agent { tools, .. } = &mut self.kind {
            *tools = names;
        }
        self
    }

    /// Fixed arguments for tool and function nodes.
    pub fn with_arguments(mut self, args: Value) -> Self {
        match &mut self.kind {
            NodeKind::Tool { arguments, .. } | NodeKind::Function { arguments, .. } => {
                *arguments = args;
            }
            _ => {}
        }
        self
    }

    /// Keep-looping condition for loop nodes.
    pub fn with_condition(mut self, expr: impl Into<String>) -> Self {
        if let NodeKind::Loop { condition, .. } = &mut self.kind {
            *condition = Some(expr.into());
        }
        self
    }

    pub fn is_loop(&self) -> bool {
        matches!(self.kind, NodeKind::Loop { .. })
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            NodeKind::Agent { .. } => "agent",
            NodeKind::Tool { .. } => "tool",
            NodeKind::Function { .. } => "function",
            NodeKind::HumanApproval { .. } => "human_approval",
            NodeKind::Loop { .. } => "loop",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        let node = Node::tool("fetch", "http_get")
            .with_arguments(serde_json::json!({"url": "x"}))
            .critical()
            .with_timeout(5);
        assert!(node.critical);
        assert_eq!(node.timeout_secs, Some(5));
        assert_eq!(node.kind_name(), "tool");
        match node.kind {
            NodeKind::Tool { arguments, .. } => assert_eq!(arguments["url"], "x"),
            _ => panic!("expected tool node"),
        }

        let looped = Node::loop_node("again", 3).with_condition("score < 5");
        assert!(looped.is_loop());
        assert!(matches!(
            looped.kind,
            NodeKind::Loop { condition: Some(ref c), .. } if c == "score < 5"
        ));
    }

    #[test]
    fn test_deserialize_flattened_kind() {
        let node: Node = toml::from_str(
            r#"
            id = "review"
            kind = "agent"
            instructions = "Review the draft"
            tools = ["search"]
            critical = true
            join = "any"
            "#,
        )
        .unwrap();
        assert_eq!(node.id, "review");
        assert!(node.critical);
        assert_eq!(node.join, JoinPolicy::Any);
        assert!(matches!(node.kind, NodeKind::Agent { ref tools, .. } if tools == &["search"]));

        let gate: Node = toml::from_str(
            r#"
            id = "gate"
            kind = "human_approval"
            prompt = "Ship it?"
            "#,
        )
        .unwrap();
        assert!(matches!(gate.kind, NodeKind::HumanApproval { ref options, .. } if options.len() == 2));
    }
}
