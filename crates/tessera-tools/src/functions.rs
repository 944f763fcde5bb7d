use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use tessera_core::error::{Result, TesseraError};

/// A named, synchronous transformation run by `function` nodes.
pub type NodeFunction = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// Registry of plain Rust functions callable from a workflow.
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, NodeFunction>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(f));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn list(&self) -> Vec<&str> {
        self.functions.keys().map(|s| s.as_str()).collect()
    }

    pub fn call(&self, name: &str, input: Value) -> Result<Value> {
        let f = self
            .functions
            .get(name)
            .ok_or_else(|| TesseraError::FunctionNotFound(name.to_string()))?;
        f(input)
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.list())
            .finish()
    }
}
