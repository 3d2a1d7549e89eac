//! Immutable stage descriptors.

use crate::core::{ArtifactKey, Hemisphere};
use crate::errors::PipelineValidationError;
use serde::{Deserialize, Serialize};

/// Thread and memory requirements of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceHint {
    /// Threads the stage keeps busy.
    pub threads: u32,
    /// Peak resident memory in GB.
    pub mem_gb: f64,
}

impl ResourceHint {
    /// Creates a new resource hint.
    #[must_use]
    pub const fn new(threads: u32, mem_gb: f64) -> Self {
        Self { threads, mem_gb }
    }

    /// A hint for stages that only coordinate nested stages.
    ///
    /// Coordinators hold no budget so the stages they launch can.
    #[must_use]
    pub const fn coordinator() -> Self {
        Self::new(0, 0.0)
    }
}

impl Default for ResourceHint {
    fn default() -> Self {
        Self::new(1, 1.0)
    }
}

/// Declared shape of one external-tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDescriptor {
    /// The unique name of the stage.
    pub name: String,
    /// Artifacts the stage reads, in declaration order.
    pub inputs: Vec<ArtifactKey>,
    /// Artifacts the stage owns and writes, in declaration order.
    pub outputs: Vec<ArtifactKey>,
    /// Resource requirements.
    pub resources: ResourceHint,
    /// Whether outputs left by a prior run may be reused.
    pub resumable: bool,
    /// Whether the stage runs even when its outputs already exist.
    pub always_run: bool,
    /// The hemisphere this stage is restricted to, for partitioned stages.
    pub partition: Option<Hemisphere>,
}

impl StageDescriptor {
    /// Creates a new resumable descriptor with no inputs or outputs.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            resources: ResourceHint::default(),
            resumable: true,
            always_run: false,
            partition: None,
        }
    }

    /// Sets the inputs.
    #[must_use]
    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = ArtifactKey>) -> Self {
        self.inputs = inputs.into_iter().collect();
        self
    }

    /// Adds an input.
    #[must_use]
    pub fn with_input(mut self, input: ArtifactKey) -> Self {
        self.inputs.push(input);
        self
    }

    /// Sets the outputs.
    #[must_use]
    pub fn with_outputs(mut self, outputs: impl IntoIterator<Item = ArtifactKey>) -> Self {
        self.outputs = outputs.into_iter().collect();
        self
    }

    /// Adds an output.
    #[must_use]
    pub fn with_output(mut self, output: ArtifactKey) -> Self {
        self.outputs.push(output);
        self
    }

    /// Sets the resource hint.
    #[must_use]
    pub const fn with_resources(mut self, resources: ResourceHint) -> Self {
        self.resources = resources;
        self
    }

    /// Marks the stage as not reusing prior output.
    #[must_use]
    pub const fn not_resumable(mut self) -> Self {
        self.resumable = false;
        self
    }

    /// Marks the stage as always executed.
    #[must_use]
    pub const fn always_run(mut self) -> Self {
        self.always_run = true;
        self
    }

    /// Restricts the stage to one hemisphere.
    #[must_use]
    pub const fn with_partition(mut self, hemi: Hemisphere) -> Self {
        self.partition = Some(hemi);
        self
    }

    /// Returns true if the stage may be skipped when its outputs exist.
    #[must_use]
    pub const fn skippable(&self) -> bool {
        self.resumable && !self.always_run && !self.outputs.is_empty()
    }

    /// Validates the descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is blank or an output is declared twice.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.name.trim().is_empty() {
            return Err(PipelineValidationError::new("Stage name cannot be empty"));
        }
        for (i, output) in self.outputs.iter().enumerate() {
            if self.outputs[..i].contains(output) {
                return Err(PipelineValidationError::new(format!(
                    "Stage '{}' declares output '{}' twice",
                    self.name, output
                ))
                .with_stages(vec![self.name.clone()]));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_builder() {
        let desc = StageDescriptor::new("autorecon3")
            .with_input(ArtifactKey::custom("stats/lh.aparc.stats"))
            .with_outputs([ArtifactKey::ReconAseg, ArtifactKey::ReconAparcAseg])
            .with_resources(ResourceHint::new(8, 5.0))
            .always_run();

        assert_eq!(desc.inputs.len(), 1);
        assert_eq!(desc.outputs.len(), 2);
        assert_eq!(desc.resources.threads, 8);
        assert!(desc.always_run);
        assert!(!desc.skippable());
    }

    #[test]
    fn test_skippable() {
        let desc = StageDescriptor::new("t1w2fsnative_xfm").with_output(ArtifactKey::T1wToFsnative);
        assert!(desc.skippable());
        assert!(!desc.clone().not_resumable().skippable());
        assert!(!StageDescriptor::new("empty").skippable());
    }

    #[test]
    fn test_validate_duplicate_output() {
        let desc = StageDescriptor::new("dup").with_outputs([ArtifactKey::Aseg, ArtifactKey::Aseg]);
        assert!(desc.validate().is_err());
        assert!(StageDescriptor::new("  ").validate().is_err());
    }
}
