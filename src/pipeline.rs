//! Pipeline order backed by a petgraph DAG.
//!
//! The configured `stage_order` is turned into a chain graph
//! (`stage[i] → stage[i+1]`). Routing questions ("what runs after the
//! visualizer?", "is this target upstream of the reviewer?") are answered
//! from the graph rather than from ad-hoc index arithmetic.

use std::collections::{HashMap, HashSet};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;

use crate::{ReelError, Result, StageId};

/// The fixed, total order in which a chunk visits its stages.
#[derive(Debug, Clone)]
pub struct StageOrder {
    graph: DiGraph<StageId, ()>,
    index: HashMap<StageId, NodeIndex>,
    order: Vec<StageId>,
}

impl StageOrder {
    /// Builds and validates the order.
    ///
    /// # Errors
    ///
    /// Returns [`ReelError::Configuration`] if the list is empty, repeats a
    /// stage, or does not end with [`StageId::Reviewer`].
    pub fn new(stages: &[StageId]) -> Result<Self> {
        if stages.is_empty() {
            return Err(ReelError::Configuration(
                "stage_order must not be empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        if let Some(dup) = stages.iter().find(|id| !seen.insert(**id)) {
            return Err(ReelError::Configuration(format!(
                "stage_order lists {} more than once",
                dup
            )));
        }

        if stages.last() != Some(&StageId::Reviewer) {
            return Err(ReelError::Configuration(format!(
                "stage_order must end with {}",
                StageId::Reviewer
            )));
        }

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for id in stages {
            index.insert(*id, graph.add_node(*id));
        }
        for pair in stages.windows(2) {
            graph.add_edge(index[&pair[0]], index[&pair[1]], ());
        }

        let order = petgraph::algo::toposort(&graph, None)
            .map_err(|_| ReelError::Configuration("stage_order forms a cycle".to_string()))?
            .into_iter()
            .map(|idx| graph[idx])
            .collect();

        Ok(Self {
            graph,
            index,
            order,
        })
    }

    /// Stages in execution order.
    pub fn stages(&self) -> &[StageId] {
        &self.order
    }

    /// Number of stages in the pipeline.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Always false; an order has at least the reviewer.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Returns true if `stage` is part of the pipeline.
    pub fn contains(&self, stage: StageId) -> bool {
        self.index.contains_key(&stage)
    }

    /// Zero-based position of `stage`, if configured.
    pub fn position(&self, stage: StageId) -> Option<usize> {
        self.order.iter().position(|id| *id == stage)
    }

    /// The stage that issues verdicts. Always last.
    pub fn reviewer(&self) -> StageId {
        StageId::Reviewer
    }

    /// Returns true if `stage` runs strictly before the reviewer.
    pub fn is_upstream_of_reviewer(&self, stage: StageId) -> bool {
        stage != StageId::Reviewer && self.contains(stage)
    }

    /// Stages strictly before `stage`, in order.
    pub fn before(&self, stage: StageId) -> &[StageId] {
        match self.position(stage) {
            Some(pos) => &self.order[..pos],
            None => &[],
        }
    }

    /// `stage` and every stage reachable after it, in execution order.
    ///
    /// # Errors
    ///
    /// Returns [`ReelError::StageNotFound`] if `stage` is not configured.
    pub fn from_stage(&self, stage: StageId) -> Result<Vec<StageId>> {
        let start = self
            .index
            .get(&stage)
            .ok_or_else(|| ReelError::StageNotFound(stage.to_string()))?;

        let mut reachable = HashSet::new();
        let mut dfs = Dfs::new(&self.graph, *start);
        while let Some(node) = dfs.next(&self.graph) {
            reachable.insert(self.graph[node]);
        }

        Ok(self
            .order
            .iter()
            .copied()
            .filter(|id| reachable.contains(id))
            .collect())
    }
}
