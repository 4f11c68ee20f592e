//! Dependency graph, cycle rejection, and parallel wave computation.
//!
//! Uses `petgraph` to model node dependencies as a directed graph with edges
//! pointing from producer to consumer. Cycles are rejected when an edge is
//! added, using a reachability check from the edge's target back to its
//! source, so the graph is acyclic at every point of construction.

use std::collections::{BTreeSet, HashMap};

use petgraph::Direction;
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use super::definition::DefinitionError;

/// Index of a node within its definition.
pub type NodeId = usize;

/// Why one node depends on another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// The consumer declared the producer's output as an input.
    Data,
    /// An explicit "run after" constraint with no data flow.
    Ordering,
}

// ---------------------------------------------------------------------------
// DependencyGraph
// ---------------------------------------------------------------------------

/// Directed acyclic graph of node names.
///
/// Node indices are assigned sequentially and never removed, so a `NodeId`
/// doubles as the petgraph index.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: DiGraph<String, EdgeKind>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, name: impl Into<String>) -> NodeId {
        self.graph.add_node(name.into()).index()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn name(&self, id: NodeId) -> Option<&str> {
        self.graph.node_weight(NodeIndex::new(id)).map(String::as_str)
    }

    /// Add a `from -> to` edge (`to` depends on `from`).
    ///
    /// Rejects the edge if `from` is already reachable from `to`. The graph is
    /// left untouched on error. Adding an edge that already exists is a no-op.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId, kind: EdgeKind) -> Result<(), DefinitionError> {
        let (from_idx, to_idx) = (self.index(from)?, self.index(to)?);

        if from == to || has_path_connecting(&self.graph, to_idx, from_idx, None) {
            return Err(DefinitionError::CycleDetected(format!(
                "'{}' -> '{}' would create a cycle",
                self.graph[from_idx], self.graph[to_idx]
            )));
        }

        if self.graph.find_edge(from_idx, to_idx).is_none() {
            self.graph.add_edge(from_idx, to_idx, kind);
        }
        Ok(())
    }

    /// Direct dependencies of `id` (data and ordering), ascending.
    pub fn dependencies(&self, id: NodeId) -> Vec<NodeId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Nodes that directly depend on `id`, ascending.
    pub fn dependents(&self, id: NodeId) -> Vec<NodeId> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Kind of the edge `from -> to`, if present.
    pub fn edge_kind(&self, from: NodeId, to: NodeId) -> Option<EdgeKind> {
        self.graph
            .find_edge(NodeIndex::new(from), NodeIndex::new(to))
            .and_then(|e| self.graph.edge_weight(e).copied())
    }

    /// Every node reachable from `id` along dependency edges, excluding `id`.
    pub fn transitive_dependents(&self, id: NodeId) -> BTreeSet<NodeId> {
        let mut visited = BTreeSet::new();
        let mut stack = vec![id];

        while let Some(current) = stack.pop() {
            for dep in self.dependents(current) {
                if visited.insert(dep) {
                    stack.push(dep);
                }
            }
        }

        visited
    }

    /// Group nodes into waves by dependency depth.
    ///
    /// Each wave contains nodes whose dependencies all sit in earlier waves.
    /// The engine schedules event-driven rather than wave by wave; waves are
    /// a planning and display aid.
    pub fn execution_waves(&self) -> Result<Vec<Vec<NodeId>>, DefinitionError> {
        if self.is_empty() {
            return Ok(vec![]);
        }

        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            DefinitionError::CycleDetected(format!(
                "cycle detected involving node '{}'",
                self.graph[cycle.node_id()]
            ))
        })?;

        // Root nodes have depth 0
        let mut depths: HashMap<NodeIndex, usize> = HashMap::new();
        for &node in &sorted {
            let depth = self
                .graph
                .edges_directed(node, Direction::Incoming)
                .map(|e| depths.get(&e.source()).copied().unwrap_or(0) + 1)
                .max()
                .unwrap_or(0);
            depths.insert(node, depth);
        }

        let max_depth = depths.values().copied().max().unwrap_or(0);
        let mut waves: Vec<Vec<NodeId>> = vec![vec![]; max_depth + 1];
        for idx in self.graph.node_indices() {
            waves[depths[&idx]].push(idx.index());
        }

        Ok(waves)
    }

    fn index(&self, id: NodeId) -> Result<NodeIndex, DefinitionError> {
        if id < self.graph.node_count() {
            Ok(NodeIndex::new(id))
        } else {
            Err(DefinitionError::UnknownDependency(format!("node #{id}")))
        }
    }

    fn neighbors(&self, id: NodeId, direction: Direction) -> Vec<NodeId> {
        if id >= self.graph.node_count() {
            return vec![];
        }
        let set: BTreeSet<NodeId> = self
            .graph
            .neighbors_directed(NodeIndex::new(id), direction)
            .map(|n| n.index())
            .collect();
        set.into_iter().collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
