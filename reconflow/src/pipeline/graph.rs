//! Validated stage graphs.

use crate::core::ArtifactKey;
use crate::errors::{ContractErrorInfo, PipelineValidationError};
use crate::scheduler::{Wave, WavePlan};
use crate::stages::RunnableStage;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// A stage and the indices of the stages it depends on.
#[derive(Debug, Clone)]
pub(crate) struct StageNode {
    pub(crate) stage: Arc<dyn RunnableStage>,
    pub(crate) dependencies: Vec<usize>,
}

/// An acyclic stage graph whose every input is satisfied.
///
/// Only [`super::GraphBuilder`] creates graphs, so the invariants hold by
/// construction.
#[derive(Debug, Clone)]
pub struct StageGraph {
    name: String,
    nodes: Vec<StageNode>,
    index: HashMap<String, usize>,
    producers: BTreeMap<ArtifactKey, usize>,
    external: BTreeSet<ArtifactKey>,
}

impl StageGraph {
    pub(crate) fn new(
        name: String,
        nodes: Vec<StageNode>,
        index: HashMap<String, usize>,
        producers: BTreeMap<ArtifactKey, usize>,
        external: BTreeSet<ArtifactKey>,
    ) -> Self {
        Self {
            name,
            nodes,
            index,
            producers,
            external,
        }
    }

    /// Returns the graph name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterates over the stages in insertion order.
    pub fn stages(&self) -> impl Iterator<Item = &Arc<dyn RunnableStage>> {
        self.nodes.iter().map(|n| &n.stage)
    }

    /// Returns a stage by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&Arc<dyn RunnableStage>> {
        self.index.get(name).map(|&i| &self.nodes[i].stage)
    }

    /// Returns the externally available artifacts.
    #[must_use]
    pub const fn external(&self) -> &BTreeSet<ArtifactKey> {
        &self.external
    }

    /// Returns the names of the stages `name` depends on, in input order.
    #[must_use]
    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        self.index
            .get(name)
            .map(|&i| {
                self.nodes[i]
                    .dependencies
                    .iter()
                    .map(|&d| self.nodes[d].stage.name())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the name of the stage producing an artifact.
    #[must_use]
    pub fn producer_of(&self, key: &ArtifactKey) -> Option<&str> {
        self.producers.get(key).map(|&i| self.nodes[i].stage.name())
    }

    /// Returns a valid execution order.
    ///
    /// Among ready stages the earliest inserted comes first, so the order is
    /// deterministic.
    #[must_use]
    pub fn topological_order(&self) -> Vec<&str> {
        let mut remaining: Vec<usize> = self.nodes.iter().map(|n| n.dependencies.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            for &dep in &node.dependencies {
                dependents[dep].push(i);
            }
        }

        let mut ready: BTreeSet<usize> = (0..self.nodes.len()).filter(|&i| remaining[i] == 0).collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(next) = ready.pop_first() {
            order.push(self.nodes[next].stage.name());
            for &child in &dependents[next] {
                remaining[child] -= 1;
                if remaining[child] == 0 {
                    ready.insert(child);
                }
            }
        }
        order
    }

    /// Returns the dependency level of every stage.
    ///
    /// Stages without dependencies are level 0; every other stage sits one
    /// level above its deepest dependency.
    #[must_use]
    pub fn levels(&self) -> Vec<usize> {
        let mut levels = vec![0usize; self.nodes.len()];
        for name in self.topological_order() {
            let i = self.index[name];
            levels[i] = self.nodes[i]
                .dependencies
                .iter()
                .map(|&d| levels[d] + 1)
                .max()
                .unwrap_or(0);
        }
        levels
    }

    /// Partitions the graph into dependency levels, one wave per level.
    #[must_use]
    pub fn waves(&self) -> WavePlan {
        let levels = self.levels();
        let depth = levels.iter().max().map_or(0, |&d| d + 1);
        let mut plan = WavePlan::new(self.name.clone());
        for level in 0..depth {
            let stages = self
                .nodes
                .iter()
                .zip(&levels)
                .filter(|(_, &l)| l == level)
                .map(|(node, _)| Arc::clone(&node.stage));
            plan = plan.with_wave(Wave::new(format!("level_{level}")).with_stages(stages));
        }
        plan
    }

    /// Checks that the graph produces every artifact of an output contract.
    ///
    /// # Errors
    ///
    /// Returns an error naming the artifacts no stage produces.
    pub fn check_contract(&self, contract: &[ArtifactKey]) -> Result<(), PipelineValidationError> {
        let missing: Vec<String> = contract
            .iter()
            .filter(|key| !self.producers.contains_key(key))
            .map(ToString::to_string)
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(
            PipelineValidationError::new(format!(
                "Graph '{}' does not produce {}",
                self.name,
                missing.join(", ")
            ))
            .with_error_info(
                ContractErrorInfo::new("RECON-GRAPH-CONTRACT", "Output contract not met")
                    .with_context_entry("missing", missing.join(", "))
                    .with_fix_hint("Both reconstruction engines must expose the same outputs."),
            ),
        )
    }
}
