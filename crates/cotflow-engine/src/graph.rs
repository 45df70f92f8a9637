//! Linear flow graph over reasoning steps.

use cotflow_core::{FlowEdge, FlowGraph, ReasoningStep};

/// Accumulates steps into a chain `1 → 2 → 3 …`.
#[derive(Debug, Clone, Default)]
pub struct FlowGraphBuilder {
    graph: FlowGraph,
}

impl FlowGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the chain for steps given in creation order.
    pub fn from_steps(steps: impl IntoIterator<Item = ReasoningStep>) -> FlowGraph {
        let mut builder = Self::new();
        for step in steps {
            builder.push(step);
        }
        builder.build()
    }

    /// Appends a node, returning the edge from the previous node if any.
    pub fn push(&mut self, step: ReasoningStep) -> Option<FlowEdge> {
        let edge = self.graph.last().map(|prev| FlowEdge {
            from: prev.step_id,
            to: step.step_id,
        });
        if let Some(edge) = edge {
            self.graph.edges.push(edge);
        }
        self.graph.nodes.push(step);
        edge
    }

    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    pub fn clear(&mut self) {
        self.graph = FlowGraph::default();
    }

    pub fn build(self) -> FlowGraph {
        self.graph
    }
}
