//! Static task graph with layered execution.
//!
//! ```text
//! GraphBuilder::add_node / add_edge
//!   → compile()          validate names, edges, reachability, acyclicity
//!                        assign each node to layer = longest path from START
//!   → invoke(history)
//!       for each layer:
//!         snapshot history
//!         JoinSet::spawn(node.run(snapshot)) × nodes in layer   (fan-out)
//!         join all; first failure aborts the layer and the run  (barrier)
//!         append replies in declaration order                   (fan-in)
//! ```
//!
//! Nodes in one layer never observe each other's output. A node with
//! several predecessors runs once, after all of them have finished.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::errors::ArbiterError;
use crate::llm::Message;

/// Virtual entry point. Edges from `START` mark entry nodes.
pub const START: &str = "__start__";
/// Virtual exit point. Edges into `END` are accepted and carry no work.
pub const END: &str = "__end__";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("graph has no nodes")]
    Empty,

    #[error("node '{0}' added twice")]
    DuplicateNode(String),

    #[error("'{0}' is a reserved node name")]
    ReservedName(String),

    #[error("edge {from} → {to} references unknown node '{missing}'")]
    UnknownNode {
        from: String,
        to: String,
        missing: String,
    },

    #[error("invalid edge {from} → {to}")]
    InvalidEdge { from: String, to: String },

    #[error("no edge leaves the start node")]
    NoEntry,

    #[error("node '{0}' is not reachable from the start node")]
    Unreachable(String),

    #[error("cycle detected among nodes {0:?}")]
    Cycle(Vec<String>),
}

/// A unit of work in the graph. Given the history accumulated by earlier
/// layers, append exactly one message.
#[async_trait]
pub trait GraphNode: Send + Sync {
    async fn run(&self, history: &[Message]) -> Result<Message, ArbiterError>;
}

/// One node's contribution to a layer.
#[derive(Debug, Clone)]
pub struct NodeCompletion {
    pub node: String,
    pub elapsed: Duration,
    pub reply: Message,
}

/// Everything a layer appended, in declaration order.
#[derive(Debug, Clone)]
pub struct LayerReport {
    pub index: usize,
    pub completed: Vec<NodeCompletion>,
}

impl LayerReport {
    pub fn contains(&self, node: &str) -> bool {
        self.completed.iter().any(|c| c.node == node)
    }
}

type NamedNode = (String, Arc<dyn GraphNode>);

#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<NamedNode>,
    edges: Vec<(String, String)>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, name: impl Into<String>, node: Arc<dyn GraphNode>) -> &mut Self {
        self.nodes.push((name.into(), node));
        self
    }

    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.edges.push((from.into(), to.into()));
        self
    }

    /// Validate the definition and compute execution layers.
    pub fn compile(self) -> Result<CompiledGraph, GraphError> {
        if self.nodes.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, (name, _)) in self.nodes.iter().enumerate() {
            if name == START || name == END {
                return Err(GraphError::ReservedName(name.clone()));
            }
            if index.insert(name.as_str(), i).is_some() {
                return Err(GraphError::DuplicateNode(name.clone()));
            }
        }

        let n = self.nodes.len();
        let mut entries: Vec<usize> = Vec::new();
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut seen_edges: HashSet<(usize, usize)> = HashSet::new();

        for (from, to) in &self.edges {
            if from == END || to == START || (from == START && to == END) {
                return Err(GraphError::InvalidEdge {
                    from: from.clone(),
                    to: to.clone(),
                });
            }
            let lookup = |name: &String| {
                index.get(name.as_str()).copied().ok_or_else(|| GraphError::UnknownNode {
                    from: from.clone(),
                    to: to.clone(),
                    missing: name.clone(),
                })
            };

            if from == START {
                let t = lookup(to)?;
                if !entries.contains(&t) {
                    entries.push(t);
                }
                continue;
            }
            let f = lookup(from)?;
            if to == END {
                continue;
            }
            let t = lookup(to)?;
            if seen_edges.insert((f, t)) {
                successors[f].push(t);
            }
        }

        if entries.is_empty() {
            return Err(GraphError::NoEntry);
        }

        // Reachability from START.
        let mut reached = vec![false; n];
        let mut queue: VecDeque<usize> = entries.iter().copied().collect();
        for &e in &entries {
            reached[e] = true;
        }
        while let Some(u) = queue.pop_front() {
            for &v in &successors[u] {
                if !reached[v] {
                    reached[v] = true;
                    queue.push_back(v);
                }
            }
        }
        if let Some(i) = reached.iter().position(|r| !r) {
            return Err(GraphError::Unreachable(self.nodes[i].0.clone()));
        }

        // Kahn's algorithm; level = longest path from START.
        let mut indegree = vec![0usize; n];
        for succ in &successors {
            for &v in succ {
                indegree[v] += 1;
            }
        }
        let mut level = vec![0usize; n];
        let mut ready: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut processed = 0;
        while let Some(u) = ready.pop_front() {
            processed += 1;
            for &v in &successors[u] {
                level[v] = level[v].max(level[u] + 1);
                indegree[v] -= 1;
                if indegree[v] == 0 {
                    ready.push_back(v);
                }
            }
        }
        if processed < n {
            let cyclic = (0..n)
                .filter(|&i| indegree[i] > 0)
                .map(|i| self.nodes[i].0.clone())
                .collect();
            return Err(GraphError::Cycle(cyclic));
        }

        let depth = level.iter().copied().max().unwrap_or(0) + 1;
        let mut layers: Vec<Vec<NamedNode>> = vec![Vec::new(); depth];
        for (i, node) in self.nodes.into_iter().enumerate() {
            layers[level[i]].push(node);
        }

        Ok(CompiledGraph { layers })
    }
}

/// A validated graph ready to run.
pub struct CompiledGraph {
    layers: Vec<Vec<NamedNode>>,
}

impl CompiledGraph {
    /// Node names per layer, in execution order.
    pub fn layers(&self) -> Vec<Vec<&str>> {
        self.layers
            .iter()
            .map(|layer| layer.iter().map(|(name, _)| name.as_str()).collect())
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.layers.iter().map(Vec::len).sum()
    }

    /// Run every node once and return the accumulated history.
    pub async fn invoke(&self, history: Vec<Message>) -> Result<Vec<Message>, ArbiterError> {
        self.invoke_observed(history, |_| {}).await
    }

    /// Like [`invoke`](Self::invoke), calling `observer` after each layer joins.
    pub async fn invoke_observed<F>(
        &self,
        mut history: Vec<Message>,
        mut observer: F,
    ) -> Result<Vec<Message>, ArbiterError>
    where
        F: FnMut(&LayerReport) + Send,
    {
        for (index, layer) in self.layers.iter().enumerate() {
            debug!(
                layer = index,
                nodes = ?layer.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
                history_len = history.len(),
                "layer starting"
            );

            let snapshot = Arc::new(history.clone());
            let mut join_set = JoinSet::new();
            let mut slots = HashMap::new();

            for (slot, (_, node)) in layer.iter().enumerate() {
                let node = Arc::clone(node);
                let snapshot = Arc::clone(&snapshot);
                let handle = join_set.spawn(async move {
                    let start = Instant::now();
                    let result = node.run(&snapshot).await;
                    (slot, start.elapsed(), result)
                });
                slots.insert(handle.id(), slot);
            }

            let mut replies: Vec<Option<(Message, Duration)>> = vec![None; layer.len()];
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((slot, elapsed, Ok(reply))) => {
                        debug!(
                            node = %layer[slot].0,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "node finished"
                        );
                        replies[slot] = Some((reply, elapsed));
                    }
                    Ok((slot, _, Err(e))) => {
                        warn!(node = %layer[slot].0, error = %e, "node failed, aborting run");
                        join_set.abort_all();
                        return Err(e);
                    }
                    Err(join_err) => {
                        let node = slots
                            .get(&join_err.id())
                            .map(|&slot| layer[slot].0.clone())
                            .unwrap_or_else(|| "<unknown>".to_string());
                        warn!(node = %node, error = %join_err, "node task did not complete");
                        join_set.abort_all();
                        return Err(ArbiterError::NodePanicked {
                            node,
                            detail: join_err.to_string(),
                        });
                    }
                }
            }

            let mut completed = Vec::with_capacity(layer.len());
            for ((name, _), reply) in layer.iter().zip(replies) {
                let (reply, elapsed) = reply.ok_or_else(|| ArbiterError::NodePanicked {
                    node: name.clone(),
                    detail: "node produced no reply".to_string(),
                })?;
                history.push(reply.clone());
                completed.push(NodeCompletion {
                    node: name.clone(),
                    elapsed,
                    reply,
                });
            }

            observer(&LayerReport { index, completed });
        }

        Ok(history)
    }
}
