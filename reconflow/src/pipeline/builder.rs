//! Graph builder with validation.

use super::{StageGraph, StageNode};
use crate::core::ArtifactKey;
use crate::errors::{
    ContractErrorInfo, CycleError, OutputOverlapError, PipelineValidationError, ReconflowError, UnsatisfiedInputError,
};
use crate::stages::RunnableStage;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Builder for stage graphs linked by declared artifacts.
///
/// An edge runs from A to B iff B consumes an artifact A produces.
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    /// The graph name.
    name: String,
    /// Artifacts available before any stage runs.
    external: BTreeSet<ArtifactKey>,
    /// Stages in insertion order.
    stages: Vec<Arc<dyn RunnableStage>>,
}

impl GraphBuilder {
    /// Creates a new graph builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            external: BTreeSet::new(),
            stages: Vec::new(),
        }
    }

    /// Declares an externally available artifact.
    #[must_use]
    pub fn with_external(mut self, key: ArtifactKey) -> Self {
        self.external.insert(key);
        self
    }

    /// Declares several externally available artifacts.
    #[must_use]
    pub fn with_externals(mut self, keys: impl IntoIterator<Item = ArtifactKey>) -> Self {
        self.external.extend(keys);
        self
    }

    /// Adds a stage.
    #[must_use]
    pub fn with_stage(mut self, stage: Arc<dyn RunnableStage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Adds a stage in place.
    pub fn add_stage(&mut self, stage: Arc<dyn RunnableStage>) {
        self.stages.push(stage);
    }

    /// Returns the graph name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Builds the graph.
    ///
    /// # Errors
    ///
    /// Returns an error if the builder has no stages, a descriptor is
    /// invalid, two stages share a name or an output, an input has no
    /// producer, or the induced graph is cyclic.
    pub fn build(self) -> Result<StageGraph, ReconflowError> {
        if self.stages.is_empty() {
            return Err(PipelineValidationError::new("Graph has no stages")
                .with_error_info(
                    ContractErrorInfo::new("RECON-GRAPH-EMPTY", "Cannot build an empty graph")
                        .with_fix_hint("Add at least one stage before building."),
                )
                .into());
        }

        let mut index: HashMap<String, usize> = HashMap::new();
        let mut producers: BTreeMap<ArtifactKey, usize> = BTreeMap::new();
        for (i, stage) in self.stages.iter().enumerate() {
            stage.validate()?;
            let descriptor = stage.descriptor();
            if index.insert(descriptor.name.clone(), i).is_some() {
                return Err(PipelineValidationError::new(format!(
                    "Stage '{}' is declared twice",
                    descriptor.name
                ))
                .with_stages(vec![descriptor.name.clone()])
                .with_error_info(ContractErrorInfo::new(
                    "RECON-GRAPH-DUPLICATE",
                    format!("Duplicate stage '{}'", descriptor.name),
                ))
                .into());
            }
            for key in &descriptor.outputs {
                if self.external.contains(key) {
                    return Err(OutputOverlapError::new(key.clone(), "<external>", descriptor.name.clone()).into());
                }
                if let Some(&owner) = producers.get(key) {
                    return Err(OutputOverlapError::new(
                        key.clone(),
                        self.stages[owner].name(),
                        descriptor.name.clone(),
                    )
                    .into());
                }
                producers.insert(key.clone(), i);
            }
        }

        let mut dependencies: Vec<Vec<usize>> = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let descriptor = stage.descriptor();
            let mut deps: Vec<usize> = Vec::new();
            for key in &descriptor.inputs {
                if self.external.contains(key) {
                    continue;
                }
                let producer = producers
                    .get(key)
                    .ok_or_else(|| UnsatisfiedInputError::new(descriptor.name.clone(), key.clone()))?;
                if !deps.contains(producer) {
                    deps.push(*producer);
                }
            }
            dependencies.push(deps);
        }

        if let Some(cycle) = detect_cycle(&dependencies) {
            let path = cycle.into_iter().map(|i| self.stages[i].name().to_string()).collect();
            return Err(CycleError::new(path).into());
        }

        let nodes = self
            .stages
            .into_iter()
            .zip(dependencies)
            .map(|(stage, dependencies)| StageNode { stage, dependencies })
            .collect();
        Ok(StageGraph::new(self.name, nodes, index, producers, self.external))
    }
}

/// Returns the first cycle found, visiting stages in insertion order.
///
/// The cycle starts and ends with the same stage.
fn detect_cycle(dependencies: &[Vec<usize>]) -> Option<Vec<usize>> {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    for node in 0..dependencies.len() {
        if !visited.contains(&node) {
            if let Some(cycle) = dfs_cycle(node, dependencies, &mut visited, &mut rec_stack, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

fn dfs_cycle(
    node: usize,
    dependencies: &[Vec<usize>],
    visited: &mut HashSet<usize>,
    rec_stack: &mut HashSet<usize>,
    path: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    for &dep in &dependencies[node] {
        if !visited.contains(&dep) {
            if let Some(cycle) = dfs_cycle(dep, dependencies, visited, rec_stack, path) {
                return Some(cycle);
            }
        } else if rec_stack.contains(&dep) {
            let start = path.iter().position(|&n| n == dep).unwrap_or(0);
            let mut cycle = path[start..].to_vec();
            cycle.push(dep);
            // Report in execution direction: producer first.
            cycle.reverse();
            return Some(cycle);
        }
    }

    path.pop();
    rec_stack.remove(&node);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingStage;
    use pretty_assertions::assert_eq;

    fn stage(name: &str, inputs: &[&str], outputs: &[&str]) -> Arc<dyn RunnableStage> {
        Arc::new(RecordingStage::new(
            name,
            inputs.iter().map(|k| ArtifactKey::custom(*k)),
            outputs.iter().map(|k| ArtifactKey::custom(*k)),
        ))
    }

    #[test]
    fn test_builder_creation() {
        let builder = GraphBuilder::new("recon").with_stage(stage("a", &[], &["x"]));
        assert_eq!(builder.name(), "recon");
        assert_eq!(builder.stage_count(), 1);
    }

    #[test]
    fn test_empty_graph() {
        let err = GraphBuilder::new("recon").build().unwrap_err();
        match err {
            ReconflowError::Validation(e) => {
                assert_eq!(e.error_info.unwrap().code, "RECON-GRAPH-EMPTY");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_edges_follow_artifacts() {
        let graph = GraphBuilder::new("recon")
            .with_external(ArtifactKey::custom("t1w"))
            .with_stage(stage("convert", &["xfm", "surf"], &["gii"]))
            .with_stage(stage("recon", &["t1w"], &["surf"]))
            .with_stage(stage("register", &["surf", "t1w"], &["xfm"]))
            .build()
            .unwrap();

        assert_eq!(graph.dependencies("convert"), vec!["register", "recon"]);
        assert_eq!(graph.dependencies("recon"), Vec::<&str>::new());
        assert_eq!(graph.producer_of(&ArtifactKey::custom("xfm")), Some("register"));
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let err = GraphBuilder::new("recon")
            .with_stage(stage("loop", &["x"], &["x"]))
            .build()
            .unwrap_err();

        match err {
            ReconflowError::Cycle(e) => assert_eq!(e.cycle_path, vec!["loop".to_string(), "loop".to_string()]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_mutual_dependency_is_cycle() {
        let err = GraphBuilder::new("recon")
            .with_stage(stage("a", &["y"], &["x"]))
            .with_stage(stage("b", &["x"], &["y"]))
            .build()
            .unwrap_err();

        match err {
            ReconflowError::Cycle(e) => {
                assert_eq!(e.cycle_path.len(), 3);
                assert_eq!(e.cycle_path.first(), e.cycle_path.last());
                assert_eq!(e.error_info.code, "RECON-GRAPH-CYCLE");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unsatisfied_input() {
        let err = GraphBuilder::new("recon")
            .with_stage(stage("ribbon", &["lh.pial"], &["ribbon"]))
            .build()
            .unwrap_err();

        match err {
            ReconflowError::UnsatisfiedInput(e) => {
                assert_eq!(e.stage, "ribbon");
                assert_eq!(e.artifact, ArtifactKey::custom("lh.pial"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_output_overlap() {
        let err = GraphBuilder::new("recon")
            .with_stage(stage("lh", &[], &["stats"]))
            .with_stage(stage("rh", &[], &["stats"]))
            .build()
            .unwrap_err();
        assert!(matches!(err, ReconflowError::OutputOverlap(ref e) if e.first == "lh" && e.second == "rh"));

        let err = GraphBuilder::new("recon")
            .with_external(ArtifactKey::custom("t1w"))
            .with_stage(stage("clobber", &[], &["t1w"]))
            .build()
            .unwrap_err();
        assert!(matches!(err, ReconflowError::OutputOverlap(ref e) if e.first == "<external>"));
    }

    #[test]
    fn test_duplicate_stage_name() {
        let err = GraphBuilder::new("recon")
            .with_stage(stage("a", &[], &["x"]))
            .with_stage(stage("a", &[], &["y"]))
            .build()
            .unwrap_err();
        assert!(matches!(err, ReconflowError::Validation(_)));
    }
}
