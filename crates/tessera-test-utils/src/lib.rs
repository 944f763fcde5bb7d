//! Mocks and fixtures shared by the Tessera test suites.

pub mod fixtures;
pub mod mock_llm;
pub mod mock_tools;

pub use fixtures::*;
pub use mock_llm::ScriptedLlm;
pub use mock_tools::{EchoTool, FailingTool, GatedTool};
