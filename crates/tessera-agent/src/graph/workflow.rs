use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::Path;

use serde::Deserialize;

use tessera_core::error::{Result, TesseraError};

use super::edge::{Edge, EdgeCondition};
use super::node::Node;

/// A workflow: nodes plus edges in declaration order. `validate` checks it.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    name: String,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    edges: Vec<Edge>,
    entry: Option<String>,
}

/// Structure derived by `WorkflowGraph::validate`.
#[derive(Debug, Clone)]
pub struct Topology {
    /// Where traversal starts.
    pub entry: String,
    /// Indices of edges that close a loop.
    pub back_edges: HashSet<usize>,
    /// Sources of forward edges into each node, used by join policies.
    pub forward_preds: HashMap<String, BTreeSet<String>>,
    /// Loop nodes and every node on a cycle through one; these may run more than once.
    pub repeatable: HashSet<String>,
}

impl Topology {
    pub fn is_back_edge(&self, edge_index: usize) -> bool {
        self.back_edges.contains(&edge_index)
    }

    pub fn forward_preds(&self, node_id: &str) -> Option<&BTreeSet<String>> {
        self.forward_preds.get(node_id)
    }
}

impl WorkflowGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            index: HashMap::new(),
            edges: Vec::new(),
            entry: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_node(&mut self, node: Node) -> Result<()> {
        if self.index.contains_key(&node.id) {
            return Err(TesseraError::DuplicateNode(node.id));
        }
        self.index.insert(node.id.clone(), self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    pub fn add_edge(&mut self, edge: Edge) -> Result<()> {
        for end in [&edge.from, &edge.to] {
            if !self.index.contains_key(end) {
                return Err(TesseraError::UnknownNode(end.clone()));
            }
        }
        self.edges.push(edge);
        Ok(())
    }

    /// Pin the entry node instead of inferring it from the edges.
    pub fn set_entry(&mut self, id: impl Into<String>) -> Result<()> {
        let id = id.into();
        if !self.index.contains_key(&id) {
            return Err(TesseraError::UnknownNode(id));
        }
        self.entry = Some(id);
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Outgoing edges of `id` with their indices, in declaration order.
    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = (usize, &'a Edge)> + 'a {
        self.edges.iter().enumerate().filter(move |(_, e)| e.from == id)
    }

    pub fn incoming<'a>(&'a self, id: &'a str) -> impl Iterator<Item = (usize, &'a Edge)> + 'a {
        self.edges.iter().enumerate().filter(move |(_, e)| e.to == id)
    }

    /// Check the graph and derive its topology.
    ///
    /// Cycles are allowed only through loop nodes: an edge into a loop node
    /// from a node the loop can reach is a back edge, and the graph without
    /// back edges must be acyclic.
    pub fn validate(&self) -> Result<Topology> {
        if self.nodes.is_empty() {
            return Err(TesseraError::Validation(format!(
                "workflow '{}' has no nodes",
                self.name
            )));
        }

        for node in &self.nodes {
            if let super::NodeKind::Loop { max_iterations, .. } = node.kind {
                if max_iterations == 0 {
                    return Err(TesseraError::Validation(format!(
                        "loop node '{}' must allow at least one iteration",
                        node.id
                    )));
                }
            }
        }

        for edge in &self.edges {
            let loop_edge = matches!(
                edge.condition,
                EdgeCondition::LoopContinue | EdgeCondition::LoopExit
            );
            let from_loop = self.node(&edge.from).is_some_and(Node::is_loop);
            if loop_edge && !from_loop {
                return Err(TesseraError::Validation(format!(
                    "edge {} -> {} uses a loop condition but '{}' is not a loop node",
                    edge.from, edge.to, edge.from
                )));
            }
            if from_loop && !loop_edge {
                return Err(TesseraError::Validation(format!(
                    "loop node '{}' may only leave through loop_continue or loop_exit edges, \
                     not the edge to '{}'",
                    edge.from, edge.to
                )));
            }
        }

        // Every cycle must pass through a loop_continue edge, whose loop
        // counter bounds it. A loop_exit that leads back to its loop would
        // restart the counter on each arrival.
        let bounded: Vec<usize> = self
            .edges
            .iter()
            .enumerate()
            .filter(|(_, e)| e.condition != EdgeCondition::LoopContinue)
            .map(|(i, _)| i)
            .collect();
        self.check_acyclic(&bounded)?;

        let all_edges: Vec<usize> = (0..self.edges.len()).collect();
        let mut back_edges = HashSet::new();
        let mut repeatable = HashSet::new();
        for node in self.nodes.iter().filter(|n| n.is_loop()) {
            // The loop body: what the loop reaches without leaving through its own exits.
            let body_edges: Vec<usize> = all_edges
                .iter()
                .copied()
                .filter(|&i| {
                    let e = &self.edges[i];
                    !(e.from == node.id && e.condition == EdgeCondition::LoopExit)
                })
                .collect();
            let reach = self.reachable_from(&node.id, &body_edges);
            for (i, edge) in self.incoming(&node.id) {
                if reach.contains(edge.from.as_str()) {
                    back_edges.insert(i);
                }
            }
            let returns = self.reaching(&node.id);
            repeatable.extend(
                reach
                    .intersection(&returns)
                    .map(|id| id.to_string()),
            );
            repeatable.insert(node.id.clone());
        }

        let forward: Vec<usize> = all_edges
            .iter()
            .copied()
            .filter(|i| !back_edges.contains(i))
            .collect();
        self.check_acyclic(&forward)?;

        let mut forward_preds: HashMap<String, BTreeSet<String>> = HashMap::new();
        for &i in &forward {
            let edge = &self.edges[i];
            forward_preds
                .entry(edge.to.clone())
                .or_default()
                .insert(edge.from.clone());
        }

        let entry = match &self.entry {
            Some(entry) => entry.clone(),
            None => self.infer_entry(&forward_preds)?,
        };

        let reach = self.reachable_from(&entry, &all_edges);
        if let Some(node) = self.nodes.iter().find(|n| !reach.contains(n.id.as_str())) {
            return Err(TesseraError::UnreachableNode(node.id.clone()));
        }

        Ok(Topology {
            entry,
            back_edges,
            forward_preds,
            repeatable,
        })
    }

    /// The single node without forward predecessors.
    fn infer_entry(&self, forward_preds: &HashMap<String, BTreeSet<String>>) -> Result<String> {
        let entries: Vec<&str> = self
            .nodes
            .iter()
            .filter(|n| !forward_preds.contains_key(&n.id))
            .map(|n| n.id.as_str())
            .collect();
        match entries.as_slice() {
            [single] => Ok(single.to_string()),
            [] => Err(TesseraError::Validation(format!(
                "workflow '{}' has no entry node",
                self.name
            ))),
            many => Err(TesseraError::Validation(format!(
                "workflow '{}' has multiple entry nodes: {}",
                self.name,
                many.join(", ")
            ))),
        }
    }

    /// Nodes reachable from `start` (inclusive) over the given edges.
    fn reachable_from<'a>(&'a self, start: &'a str, edges: &[usize]) -> HashSet<&'a str> {
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(id) = queue.pop_front() {
            for &i in edges {
                let edge = &self.edges[i];
                if edge.from == id && seen.insert(edge.to.as_str()) {
                    queue.push_back(edge.to.as_str());
                }
            }
        }
        seen
    }

    /// Nodes that can reach `target` (inclusive).
    fn reaching<'a>(&'a self, target: &'a str) -> HashSet<&'a str> {
        let mut seen = HashSet::from([target]);
        let mut queue = VecDeque::from([target]);
        while let Some(id) = queue.pop_front() {
            for edge in &self.edges {
                if edge.to == id && seen.insert(edge.from.as_str()) {
                    queue.push_back(edge.from.as_str());
                }
            }
        }
        seen
    }

    /// Kahn's algorithm over the forward edges.
    fn check_acyclic(&self, forward: &[usize]) -> Result<()> {
        let mut in_degree: HashMap<&str, usize> =
            self.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
        for &i in forward {
            *in_degree.entry(self.edges[i].to.as_str()).or_insert(0) += 1;
        }

        let mut queue: VecDeque<&str> = self
            .nodes
            .iter()
            .map(|n| n.id.as_str())
            .filter(|id| in_degree[id] == 0)
            .collect();
        let mut visited = 0usize;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for &i in forward {
                let edge = &self.edges[i];
                if edge.from == id {
                    if let Some(d) = in_degree.get_mut(edge.to.as_str()) {
                        *d -= 1;
                        if *d == 0 {
                            queue.push_back(edge.to.as_str());
                        }
                    }
                }
            }
        }

        if visited < self.nodes.len() {
            let stuck = self
                .nodes
                .iter()
                .find(|n| in_degree[n.id.as_str()] > 0)
                .map(|n| n.id.clone())
                .unwrap_or_default();
            return Err(TesseraError::Cycle(stuck));
        }
        Ok(())
    }
}

/// A workflow as written in TOML:
///
/// ```toml
/// name = "triage"
///
/// [[nodes]]
/// id = "classify"
/// kind = "agent"
/// instructions = "Classify the ticket"
///
/// [[edges]]
/// from = "classify"
/// to = "notify"
/// condition = { type = "conditional", expr = "classify.priority == high" }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Entry node; inferred from the edges when absent.
    #[serde(default)]
    pub entry: Option<String>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl WorkflowDefinition {
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| TesseraError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(TesseraError::ConfigNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Build the graph through `add_node`/`add_edge` so construction errors surface.
    pub fn build(self) -> Result<WorkflowGraph> {
        let mut graph = WorkflowGraph::new(self.name);
        for node in self.nodes {
            graph.add_node(node)?;
        }
        for edge in self.edges {
            graph.add_edge(edge)?;
        }
        if let Some(entry) = self.entry {
            graph.set_entry(entry)?;
        }
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(nodes: Vec<Node>, edges: Vec<Edge>) -> WorkflowGraph {
        let mut g = WorkflowGraph::new("test");
        for n in nodes {
            g.add_node(n).unwrap();
        }
        for e in edges {
            g.add_edge(e).unwrap();
        }
        g
    }

    #[test]
    fn test_construction_errors() {
        let mut g = WorkflowGraph::new("g");
        g.add_node(Node::tool("a", "t")).unwrap();
        assert!(matches!(
            g.add_node(Node::tool("a", "t")),
            Err(TesseraError::DuplicateNode(id)) if id == "a"
        ));
        assert!(matches!(
            g.add_edge(Edge::always("a", "ghost")),
            Err(TesseraError::UnknownNode(id)) if id == "ghost"
        ));
    }

    #[test]
    fn test_linear_topology() {
        let g = graph(
            vec![Node::tool("a", "t"), Node::tool("b", "t"), Node::tool("c", "t")],
            vec![Edge::always("a", "b"), Edge::on_success("b", "c")],
        );
        let topo = g.validate().unwrap();
        assert_eq!(topo.entry, "a");
        assert!(topo.back_edges.is_empty());
        assert!(topo.repeatable.is_empty());
        assert_eq!(g.outgoing("b").count(), 1);
    }

    #[test]
    fn test_cycle_without_loop_node_is_rejected() {
        let g = graph(
            vec![Node::tool("a", "t"), Node::tool("b", "t"), Node::tool("c", "t")],
            vec![
                Edge::always("a", "b"),
                Edge::always("b", "c"),
                Edge::always("c", "b"),
            ],
        );
        assert!(matches!(g.validate(), Err(TesseraError::Cycle(_))));
    }

    #[test]
    fn test_cycle_through_loop_node_is_allowed() {
        let g = graph(
            vec![
                Node::tool("start", "t"),
                Node::loop_node("again", 3),
                Node::agent("work", "do it"),
                Node::tool("done", "t"),
            ],
            vec![
                Edge::always("start", "again"),
                Edge::loop_continue("again", "work"),
                Edge::always("work", "again"),
                Edge::loop_exit("again", "done"),
            ],
        );
        let topo = g.validate().unwrap();
        assert_eq!(topo.entry, "start");
        assert_eq!(topo.back_edges, HashSet::from([2]));
        assert!(topo.repeatable.contains("work"));
        assert!(topo.repeatable.contains("again"));
        assert!(!topo.repeatable.contains("done"));
        assert_eq!(topo.forward_preds("again").unwrap().len(), 1);
    }

    #[test]
    fn test_entry_and_reachability() {
        let two_entries = graph(
            vec![Node::tool("a", "t"), Node::tool("b", "t")],
            vec![],
        );
        assert!(matches!(two_entries.validate(), Err(TesseraError::Validation(_))));

        let empty = WorkflowGraph::new("empty");
        assert!(matches!(empty.validate(), Err(TesseraError::Validation(_))));

        let mut pinned = graph(
            vec![Node::tool("a", "t"), Node::tool("b", "t"), Node::tool("c", "t")],
            vec![Edge::always("a", "b")],
        );
        pinned.set_entry("a").unwrap();
        assert!(matches!(
            pinned.validate(),
            Err(TesseraError::UnreachableNode(id)) if id == "c"
        ));
        assert!(matches!(
            pinned.set_entry("ghost"),
            Err(TesseraError::UnknownNode(_))
        ));
    }

    #[test]
    fn test_loop_rules() {
        let zero = graph(vec![Node::loop_node("l", 0)], vec![]);
        assert!(matches!(zero.validate(), Err(TesseraError::Validation(_))));

        let misuse = graph(
            vec![Node::tool("a", "t"), Node::tool("b", "t")],
            vec![Edge::loop_exit("a", "b")],
        );
        assert!(matches!(misuse.validate(), Err(TesseraError::Validation(_))));

        let plain_exit = graph(
            vec![Node::loop_node("l", 2), Node::tool("b", "t")],
            vec![Edge::on_success("l", "b"), Edge::always("b", "l")],
        );
        assert!(matches!(plain_exit.validate(), Err(TesseraError::Validation(_))));
    }

    #[test]
    fn test_loop_exit_back_into_loop_is_a_cycle() {
        let g = graph(
            vec![
                Node::tool("start", "t"),
                Node::loop_node("again", 2),
                Node::tool("work", "t"),
                Node::tool("after", "t"),
            ],
            vec![
                Edge::always("start", "again"),
                Edge::loop_continue("again", "work"),
                Edge::always("work", "again"),
                Edge::loop_exit("again", "after"),
                Edge::always("after", "again"),
            ],
        );
        assert!(matches!(g.validate(), Err(TesseraError::Cycle(_))));
    }

    #[test]
    fn test_nested_loops_are_allowed() {
        let g = graph(
            vec![
                Node::tool("start", "t"),
                Node::loop_node("outer", 2),
                Node::loop_node("inner", 3),
                Node::tool("work", "t"),
                Node::tool("done", "t"),
            ],
            vec![
                Edge::always("start", "outer"),
                Edge::loop_continue("outer", "inner"),
                Edge::loop_continue("inner", "work"),
                Edge::always("work", "inner"),
                Edge::loop_exit("inner", "outer"),
                Edge::loop_exit("outer", "done"),
            ],
        );
        let topo = g.validate().unwrap();
        assert_eq!(topo.entry, "start");
        assert!(topo.repeatable.contains("work"));
    }

    #[test]
    fn test_definition_from_toml() {
        let def = WorkflowDefinition::from_toml(
            r#"
            name = "triage"

            [[nodes]]
            id = "classify"
            kind = "agent"
            instructions = "Classify the ticket"

            [[nodes]]
            id = "notify"
            kind = "tool"
            tool = "send"

            [[edges]]
            from = "classify"
            to = "notify"
            condition = { type = "conditional", expr = "classify.priority == high" }
            "#,
        )
        .unwrap();
        let graph = def.build().unwrap();
        assert_eq!(graph.name(), "triage");
        assert_eq!(graph.validate().unwrap().entry, "classify");

        let dup = WorkflowDefinition::from_toml(
            r#"
            name = "dup"
            [[nodes]]
            id = "a"
            kind = "tool"
            tool = "t"
            [[nodes]]
            id = "a"
            kind = "tool"
            tool = "t"
            "#,
        )
        .unwrap();
        assert!(matches!(dup.build(), Err(TesseraError::DuplicateNode(_))));
    }
}
