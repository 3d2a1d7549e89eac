//! Error types for reconflow.
//!
//! Graph construction, scheduling, refinement and external tool failures all
//! surface through [`ReconflowError`]. Nothing here is retried automatically:
//! an external tool may have left partially written state on disk.

use crate::core::{ArtifactKey, Frame, StageOutput};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for reconflow operations.
#[derive(Debug, Error)]
pub enum ReconflowError {
    /// A generic graph or plan validation error.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// The stage graph contains a cycle.
    #[error("{0}")]
    Cycle(#[from] CycleError),

    /// A stage input is neither external nor produced by another stage.
    #[error("{0}")]
    UnsatisfiedInput(#[from] UnsatisfiedInputError),

    /// Two stages declare the same output artifact.
    #[error("{0}")]
    OutputOverlap(#[from] OutputOverlapError),

    /// Partitioned branches disagree on shared subject state.
    #[error("{0}")]
    JoinBarrierMismatch(#[from] JoinBarrierMismatchError),

    /// Refinement inputs do not share a coordinate frame or grid.
    #[error("{0}")]
    FrameMismatch(#[from] FrameMismatchError),

    /// An external tool exited non-zero or did not deposit an artifact.
    #[error("{0}")]
    ExternalTool(#[from] ExternalToolFailure),

    /// A stage running a nested wave plan stopped part way through.
    #[error("{0}")]
    NestedPlan(#[from] NestedPlanError),

    /// An affine transform could not be used.
    #[error("{0}")]
    Transform(#[from] TransformError),

    /// The reconstruction path was selected more than once.
    #[error("{0}")]
    PathSelection(#[from] PathSelectionError),

    /// A volume could not be read, written or validated.
    #[error("{0}")]
    Volume(#[from] VolumeError),

    /// Invalid configuration.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// An artifact was registered twice with different paths.
    #[error("{0}")]
    ArtifactConflict(#[from] ArtifactConflictError),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReconflowError {
    /// Returns the stage name attached to this error, if any.
    #[must_use]
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::ExternalTool(e) => Some(&e.stage),
            Self::JoinBarrierMismatch(e) => Some(&e.barrier),
            Self::UnsatisfiedInput(e) => Some(&e.stage),
            Self::NestedPlan(e) => Some(&e.stage),
            _ => None,
        }
    }
}

/// Metadata about a contract error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "RECON-GRAPH-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when a stage graph or wave plan fails validation.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional contract error info.
    pub error_info: Option<ContractErrorInfo>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the contract error info.
    #[must_use]
    pub fn with_error_info(mut self, info: ContractErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }
}

/// Error raised when the induced stage graph is not acyclic.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in stage graph: {}", cycle_path.join(" -> "))]
pub struct CycleError {
    /// The stages forming the cycle, first stage repeated at the end.
    pub cycle_path: Vec<String>,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl CycleError {
    /// Creates a new cycle error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ContractErrorInfo::new(
            "RECON-GRAPH-CYCLE",
            format!("Stage graph contains a dependency cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("A stage consumes an artifact produced downstream of itself.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

/// Error raised when a declared input has no producer.
#[derive(Debug, Clone, Error)]
#[error("Stage '{stage}' requires artifact '{artifact}' which is neither supplied externally nor produced by any stage")]
pub struct UnsatisfiedInputError {
    /// The consuming stage.
    pub stage: String,
    /// The missing artifact.
    pub artifact: ArtifactKey,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl UnsatisfiedInputError {
    /// Creates a new unsatisfied input error.
    #[must_use]
    pub fn new(stage: impl Into<String>, artifact: ArtifactKey) -> Self {
        let stage = stage.into();
        let info = ContractErrorInfo::new(
            "RECON-GRAPH-UNSATISFIED",
            format!("No producer for '{artifact}'"),
        )
        .with_context_entry("stage", stage.clone())
        .with_fix_hint("Declare the artifact as an external input or add the stage producing it.");

        Self {
            stage,
            artifact,
            error_info: info,
        }
    }
}

/// Error raised when two stages claim ownership of the same artifact.
#[derive(Debug, Clone, Error)]
#[error("Artifact '{artifact}' is declared as output of both '{first}' and '{second}'")]
pub struct OutputOverlapError {
    /// The contested artifact.
    pub artifact: ArtifactKey,
    /// The stage that declared it first.
    pub first: String,
    /// The stage that declared it again.
    pub second: String,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl OutputOverlapError {
    /// Creates a new output overlap error.
    #[must_use]
    pub fn new(artifact: ArtifactKey, first: impl Into<String>, second: impl Into<String>) -> Self {
        let first = first.into();
        let second = second.into();
        let info = ContractErrorInfo::new("RECON-GRAPH-OVERLAP", format!("'{artifact}' has two owners"))
            .with_context_entry("first", first.clone())
            .with_context_entry("second", second.clone())
            .with_fix_hint("Each artifact must be written by exactly one stage.");
        Self {
            artifact,
            first,
            second,
            error_info: info,
        }
    }
}

/// Error raised when branches joined by a barrier report different shared state.
#[derive(Debug, Clone, Error)]
#[error("Join barrier '{barrier}' found non-identical {field} values: {}", values.join(", "))]
pub struct JoinBarrierMismatchError {
    /// The barrier name.
    pub barrier: String,
    /// Which shared field disagreed (`subjects_dir` or `subject_id`).
    pub field: String,
    /// The values reported, one per branch.
    pub values: Vec<String>,
}

impl JoinBarrierMismatchError {
    /// Creates a new barrier mismatch error.
    #[must_use]
    pub fn new(barrier: impl Into<String>, field: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            barrier: barrier.into(),
            field: field.into(),
            values,
        }
    }
}

/// Error raised when refinement inputs disagree on frame, shape or affine.
#[derive(Debug, Clone, Error)]
#[error("Frame mismatch on '{input}': expected {expected_frame} {expected_shape:?}, found {found_frame} {found_shape:?}{}", if *affine_differs { " (affine differs)" } else { "" })]
pub struct FrameMismatchError {
    /// The offending input.
    pub input: String,
    /// Frame of the reference volume.
    pub expected_frame: Frame,
    /// Shape of the reference volume.
    pub expected_shape: [usize; 3],
    /// Frame of the offending volume.
    pub found_frame: Frame,
    /// Shape of the offending volume.
    pub found_shape: [usize; 3],
    /// Whether the voxel-to-world affines disagree.
    pub affine_differs: bool,
}

/// Error raised when an external tool fails.
#[derive(Debug, Clone, Error)]
#[error("Stage '{stage}' failed for subject '{subject}': {reason}{}", artifact.as_ref().map(|p| format!(" ({})", p.display())).unwrap_or_default())]
pub struct ExternalToolFailure {
    /// The stage name.
    pub stage: String,
    /// The subject being processed.
    pub subject: String,
    /// Short reason.
    pub reason: String,
    /// The exit code, when the process ran.
    pub exit_code: Option<i32>,
    /// The artifact path involved, if any.
    pub artifact: Option<PathBuf>,
    /// Tail of the captured diagnostic output.
    pub diagnostics: String,
}

impl ExternalToolFailure {
    /// Creates a failure for a non-zero exit status.
    #[must_use]
    pub fn exit(
        stage: impl Into<String>,
        subject: impl Into<String>,
        exit_code: Option<i32>,
        diagnostics: impl Into<String>,
    ) -> Self {
        let reason = exit_code.map_or_else(
            || "terminated by signal".to_string(),
            |code| format!("exited with status {code}"),
        );
        Self {
            stage: stage.into(),
            subject: subject.into(),
            reason,
            exit_code,
            artifact: None,
            diagnostics: diagnostics.into(),
        }
    }

    /// Creates a failure for an expected artifact that was not produced.
    #[must_use]
    pub fn missing_artifact(
        stage: impl Into<String>,
        subject: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            stage: stage.into(),
            subject: subject.into(),
            reason: "expected artifact was not produced".to_string(),
            exit_code: Some(0),
            artifact: Some(path.into()),
            diagnostics: String::new(),
        }
    }

    /// Creates a failure for a process that could not be launched.
    #[must_use]
    pub fn launch(stage: impl Into<String>, subject: impl Into<String>, error: &std::io::Error) -> Self {
        Self {
            stage: stage.into(),
            subject: subject.into(),
            reason: format!("could not launch process: {error}"),
            exit_code: None,
            artifact: None,
            diagnostics: String::new(),
        }
    }
}

/// Error raised by a stage whose nested wave plan failed.
///
/// Carries the progress of the nested plan so the enclosing report can name
/// the last wave that finished inside it.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct NestedPlanError {
    /// The stage that ran the nested plan.
    pub stage: String,
    /// Nested waves that completed before the failure.
    pub completed_waves: Vec<String>,
    /// Outputs of nested stages that finished.
    pub outputs: Vec<(String, StageOutput)>,
    /// Nested stages that failed.
    pub failed: Vec<String>,
    /// The error that stopped the nested plan.
    pub source: Box<ReconflowError>,
}

/// Errors related to affine transforms.
#[derive(Debug, Clone, Error)]
pub enum TransformError {
    /// The matrix has no inverse.
    #[error("Affine transform is singular (|det| = {determinant:e})")]
    Singular {
        /// The determinant that fell under tolerance.
        determinant: f64,
    },

    /// The bottom row is not `[0, 0, 0, 1]`.
    #[error("Affine transform has a non-homogeneous bottom row: {row:?}")]
    NotAffine {
        /// The offending row.
        row: [f64; 4],
    },
}

/// Error raised on an invalid path-selector transition.
#[derive(Debug, Clone, Error)]
#[error("Reconstruction path already selected as {current}; cannot switch to {requested}")]
pub struct PathSelectionError {
    /// The already selected path.
    pub current: String,
    /// The requested path.
    pub requested: String,
}

/// Errors related to raster volumes.
#[derive(Debug, Error)]
pub enum VolumeError {
    /// Data length does not match shape.
    #[error("Volume data has {found} voxels but shape {shape:?} needs {expected}")]
    ShapeMismatch {
        /// The declared shape.
        shape: [usize; 3],
        /// Voxels implied by the shape.
        expected: usize,
        /// Voxels present.
        found: usize,
    },

    /// A label outside the closed label set was found.
    #[error("Label {label} at voxel {voxel:?} is not part of the '{set}' label set")]
    UnknownLabel {
        /// The label value.
        label: u16,
        /// Voxel coordinates.
        voxel: [usize; 3],
        /// Label set name.
        set: String,
    },

    /// A label volume holds a value that is not a label.
    #[error("Voxel value {value} in {path} is not a label")]
    LabelValue {
        /// The file path.
        path: PathBuf,
        /// The offending value.
        value: f64,
    },

    /// A mask that must have foreground has none.
    #[error("Mask '{name}' has no foreground voxels")]
    EmptyMask {
        /// Which mask.
        name: String,
    },

    /// A volume file header could not be understood.
    #[error("Invalid volume header in {path}: {reason}")]
    Header {
        /// The file path.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// The stored data type cannot be read as requested.
    #[error("Unsupported data type '{dtype}' in {path}")]
    DataType {
        /// The file path.
        path: PathBuf,
        /// The stored type.
        dtype: String,
    },

    /// The voxel-to-world affine is unusable.
    #[error("Invalid affine in {path}: {source}")]
    Affine {
        /// The file path.
        path: PathBuf,
        /// The transform error.
        source: TransformError,
    },

    /// IO error while reading or writing.
    #[error("IO error on {path}: {source}")]
    Io {
        /// The file path.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Cannot read configuration {path}: {source}")]
    Read {
        /// The file path.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },

    /// The file could not be parsed.
    #[error("Cannot parse configuration {path}: {source}")]
    Parse {
        /// The file path.
        path: PathBuf,
        /// The underlying error.
        source: serde_json::Error,
    },

    /// A field holds an invalid value.
    #[error("Invalid configuration value for '{field}': {reason}")]
    Invalid {
        /// The field name.
        field: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl ConfigError {
    /// Creates an invalid-field error.
    #[must_use]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Error raised when an artifact is registered twice with different paths.
#[derive(Debug, Clone, Error)]
#[error("Artifact '{artifact}' for subject '{subject}' already registered at {existing}, refusing {requested}")]
pub struct ArtifactConflictError {
    /// The subject id.
    pub subject: String,
    /// The artifact key.
    pub artifact: ArtifactKey,
    /// The registered path.
    pub existing: String,
    /// The rejected path.
    pub requested: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Hemisphere;

    #[test]
    fn test_cycle_error_message() {
        let err = CycleError::new(vec!["a".to_string(), "b".to_string(), "a".to_string()]);

        assert!(err.to_string().contains("a -> b -> a"));
        assert_eq!(err.error_info.code, "RECON-GRAPH-CYCLE");
    }

    #[test]
    fn test_unsatisfied_input_context() {
        let err = UnsatisfiedInputError::new("cortribbon", ArtifactKey::ReconSurface(Hemisphere::Left, crate::core::SurfaceKind::Pial));

        assert_eq!(err.error_info.code, "RECON-GRAPH-UNSATISFIED");
        assert_eq!(err.error_info.context.get("stage"), Some(&"cortribbon".to_string()));
        assert!(err.to_string().contains("lh.pial"));
    }

    #[test]
    fn test_external_tool_failure_display() {
        let err = ExternalToolFailure::exit("autorecon1", "sub-01", Some(1), "ERROR: talairach failed");
        assert_eq!(err.to_string(), "Stage 'autorecon1' failed for subject 'sub-01': exited with status 1");

        let missing = ExternalToolFailure::missing_artifact("gcareg", "sub-01", "/sd/sub-01/mri/transforms/talairach.m3z");
        assert!(missing.to_string().ends_with("(/sd/sub-01/mri/transforms/talairach.m3z)"));
    }

    #[test]
    fn test_error_stage_accessor() {
        let err: ReconflowError = JoinBarrierMismatchError::new(
            "surfaces_join",
            "subjects_dir",
            vec!["/a".to_string(), "/b".to_string()],
        )
        .into();

        assert_eq!(err.stage(), Some("surfaces_join"));
        assert!(err.to_string().contains("/a, /b"));
    }
}
