//! Waves and wave plans.

use super::JoinBarrier;
use crate::core::ArtifactKey;
use crate::errors::{
    ContractErrorInfo, OutputOverlapError, PipelineValidationError, ReconflowError, UnsatisfiedInputError,
};
use crate::stages::RunnableStage;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Stages that may run concurrently, optionally followed by a join barrier.
#[derive(Debug, Clone)]
pub struct Wave {
    label: String,
    stages: Vec<Arc<dyn RunnableStage>>,
    barrier: Option<JoinBarrier>,
}

impl Wave {
    /// Creates an empty wave.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            stages: Vec::new(),
            barrier: None,
        }
    }

    /// Adds a stage.
    #[must_use]
    pub fn with_stage(mut self, stage: Arc<dyn RunnableStage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Adds several stages.
    #[must_use]
    pub fn with_stages(mut self, stages: impl IntoIterator<Item = Arc<dyn RunnableStage>>) -> Self {
        self.stages.extend(stages);
        self
    }

    /// Joins the wave's branches with a barrier.
    #[must_use]
    pub fn with_barrier(mut self, name: impl Into<String>) -> Self {
        self.barrier = Some(JoinBarrier::new(name));
        self
    }

    /// Returns the wave label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns the stages.
    #[must_use]
    pub fn stages(&self) -> &[Arc<dyn RunnableStage>] {
        &self.stages
    }

    /// Returns the barrier, if any.
    #[must_use]
    pub const fn barrier(&self) -> Option<&JoinBarrier> {
        self.barrier.as_ref()
    }

    /// Returns the stage names in declaration order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }
}

/// An ordered list of waves executed strictly in sequence.
#[derive(Debug, Clone)]
pub struct WavePlan {
    name: String,
    waves: Vec<Wave>,
}

impl WavePlan {
    /// Creates an empty plan.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            waves: Vec::new(),
        }
    }

    /// Appends a wave.
    #[must_use]
    pub fn with_wave(mut self, wave: Wave) -> Self {
        self.waves.push(wave);
        self
    }

    /// Returns the plan name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the waves.
    #[must_use]
    pub fn waves(&self) -> &[Wave] {
        &self.waves
    }

    /// Returns the number of waves.
    #[must_use]
    pub fn len(&self) -> usize {
        self.waves.len()
    }

    /// Returns true if the plan has no waves.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waves.is_empty()
    }

    /// Iterates over every stage, wave by wave.
    pub fn stages(&self) -> impl Iterator<Item = &Arc<dyn RunnableStage>> {
        self.waves.iter().flat_map(|w| w.stages.iter())
    }

    /// Returns every declared output in plan order.
    #[must_use]
    pub fn outputs(&self) -> Vec<ArtifactKey> {
        self.stages()
            .flat_map(|s| s.descriptor().outputs.iter().cloned())
            .collect()
    }

    /// Returns the inputs no stage of the plan produces, in first-use order.
    #[must_use]
    pub fn external_inputs(&self) -> Vec<ArtifactKey> {
        let produced: BTreeSet<ArtifactKey> = self.outputs().into_iter().collect();
        let mut seen = BTreeSet::new();
        self.stages()
            .flat_map(|s| s.descriptor().inputs.iter())
            .filter(|key| !produced.contains(*key) && seen.insert((*key).clone()))
            .cloned()
            .collect()
    }

    /// Validates the plan against the externally available artifacts.
    ///
    /// Every input must be external or produced by an earlier wave, no stage
    /// may depend on a sibling in its own wave, and every artifact has at
    /// most one owner.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self, external: &BTreeSet<ArtifactKey>) -> Result<(), ReconflowError> {
        let mut producer_wave: HashMap<&ArtifactKey, (usize, &str)> = HashMap::new();
        let mut names: BTreeSet<&str> = BTreeSet::new();

        for (index, wave) in self.waves.iter().enumerate() {
            if wave.stages.is_empty() {
                return Err(PipelineValidationError::new(format!(
                    "Wave '{}' of plan '{}' has no stages",
                    wave.label, self.name
                ))
                .with_error_info(ContractErrorInfo::new("RECON-WAVE-EMPTY", "Empty wave"))
                .into());
            }
            for stage in &wave.stages {
                stage.validate()?;
                let descriptor = stage.descriptor();
                if !names.insert(descriptor.name.as_str()) {
                    return Err(PipelineValidationError::new(format!(
                        "Stage '{}' appears twice in plan '{}'",
                        descriptor.name, self.name
                    ))
                    .with_stages(vec![descriptor.name.clone()])
                    .into());
                }
                for key in &descriptor.outputs {
                    if external.contains(key) {
                        return Err(OutputOverlapError::new(key.clone(), "<external>", descriptor.name.clone()).into());
                    }
                    if let Some((_, owner)) = producer_wave.insert(key, (index, descriptor.name.as_str())) {
                        return Err(OutputOverlapError::new(key.clone(), owner, descriptor.name.clone()).into());
                    }
                }
            }
        }

        for (index, wave) in self.waves.iter().enumerate() {
            for stage in &wave.stages {
                let descriptor = stage.descriptor();
                for key in &descriptor.inputs {
                    if external.contains(key) {
                        continue;
                    }
                    match producer_wave.get(key) {
                        Some((produced_in, _)) if *produced_in < index => {}
                        Some((produced_in, producer)) => {
                            let relation = if *produced_in == index { "the same wave" } else { "a later wave" };
                            return Err(PipelineValidationError::new(format!(
                                "Stage '{}' consumes '{}' produced by '{}' in {}",
                                descriptor.name, key, producer, relation
                            ))
                            .with_stages(vec![(*producer).to_string(), descriptor.name.clone()])
                            .with_error_info(
                                ContractErrorInfo::new("RECON-WAVE-ORDER", format!("'{key}' is not ready"))
                                    .with_context_entry("wave", wave.label.clone())
                                    .with_fix_hint("Move the producer into an earlier wave."),
                            )
                            .into());
                        }
                        None => return Err(UnsatisfiedInputError::new(descriptor.name.clone(), key.clone()).into()),
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingStage;

    fn stage(name: &str, inputs: &[&str], outputs: &[&str]) -> Arc<dyn RunnableStage> {
        Arc::new(RecordingStage::new(
            name,
            inputs.iter().map(|k| ArtifactKey::custom(*k)),
            outputs.iter().map(|k| ArtifactKey::custom(*k)),
        ))
    }

    fn external(keys: &[&str]) -> BTreeSet<ArtifactKey> {
        keys.iter().map(|k| ArtifactKey::custom(*k)).collect()
    }

    #[test]
    fn test_valid_plan() {
        let plan = WavePlan::new("plan")
            .with_wave(Wave::new("first").with_stage(stage("a", &["in"], &["x"])))
            .with_wave(
                Wave::new("second")
                    .with_stage(stage("b", &["x"], &["y"]))
                    .with_stage(stage("c", &["x", "in"], &["z"]))
                    .with_barrier("join"),
            );

        plan.validate(&external(&["in"])).unwrap();
        assert_eq!(plan.external_inputs(), vec![ArtifactKey::custom("in")]);
        assert_eq!(plan.outputs().len(), 3);
        assert_eq!(plan.waves()[1].stage_names(), vec!["b", "c"]);
    }

    #[test]
    fn test_intra_wave_dependency() {
        let plan = WavePlan::new("plan").with_wave(
            Wave::new("only")
                .with_stage(stage("a", &[], &["x"]))
                .with_stage(stage("b", &["x"], &["y"])),
        );

        let err = plan.validate(&external(&[])).unwrap_err();
        assert!(err.to_string().contains("the same wave"));
    }

    #[test]
    fn test_input_from_later_wave() {
        let plan = WavePlan::new("plan")
            .with_wave(Wave::new("first").with_stage(stage("b", &["x"], &["y"])))
            .with_wave(Wave::new("second").with_stage(stage("a", &[], &["x"])));

        let err = plan.validate(&external(&[])).unwrap_err();
        assert!(err.to_string().contains("a later wave"));
    }

    #[test]
    fn test_overlap_within_wave() {
        let plan = WavePlan::new("plan").with_wave(
            Wave::new("only")
                .with_stage(stage("lh", &[], &["stats"]))
                .with_stage(stage("rh", &[], &["stats"])),
        );

        match plan.validate(&external(&[])).unwrap_err() {
            ReconflowError::OutputOverlap(e) => {
                assert_eq!(e.first, "lh");
                assert_eq!(e.second, "rh");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unsatisfied_and_empty() {
        let plan = WavePlan::new("plan").with_wave(Wave::new("only").with_stage(stage("a", &["missing"], &["x"])));
        assert!(matches!(
            plan.validate(&external(&[])),
            Err(ReconflowError::UnsatisfiedInput(_))
        ));

        let plan = WavePlan::new("plan").with_wave(Wave::new("hollow"));
        assert!(matches!(plan.validate(&external(&[])), Err(ReconflowError::Validation(_))));
    }
}
