//! Workflow graphs.
//!
//! A workflow is a directed graph of `Node`s connected by `Edge`s. Nodes are
//! agents, single tool calls, registered functions, human approvals or loop
//! counters. Edges carry conditions (Always, OnSuccess, OnFailure,
//! Conditional expression, LoopContinue, LoopExit). Cycles must pass through
//! a loop node, which bounds how often they can be taken.
//!
//! `WorkflowGraph::validate` derives the `Topology` the engine schedules by.

pub mod edge;
pub mod node;
pub mod workflow;

pub use edge::{evaluate_condition, Edge, EdgeCondition};
pub use node::{JoinPolicy, Node, NodeKind};
pub use workflow::{Topology, WorkflowDefinition, WorkflowGraph};
