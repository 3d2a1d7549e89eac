//! Stage output type with factory methods.

use super::{ArtifactKey, StageStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// Subject state every stage reports back.
///
/// Partitioned stages (one per hemisphere) each report their view of the
/// shared subject state; a join barrier requires the views to be identical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SharedState {
    /// The subjects directory the stage operated on.
    pub subjects_dir: PathBuf,
    /// The subject id the stage operated on.
    pub subject_id: String,
}

impl SharedState {
    /// Creates a new shared state.
    #[must_use]
    pub fn new(subjects_dir: impl Into<PathBuf>, subject_id: impl Into<String>) -> Self {
        Self {
            subjects_dir: subjects_dir.into(),
            subject_id: subject_id.into(),
        }
    }
}

/// The output of a successful or skipped stage execution.
///
/// Failures are reported through `Err` rather than a status on this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutput {
    /// The status of the stage execution.
    pub status: StageStatus,

    /// Artifacts the stage produced, with the paths they were found at.
    #[serde(default, with = "produced_pairs")]
    pub produced: BTreeMap<ArtifactKey, PathBuf>,

    /// Subject state the stage operated on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared: Option<SharedState>,

    /// Additional metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,

    /// Skip reason (for skipped executions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,

    /// Wall-clock duration in milliseconds.
    #[serde(default)]
    pub duration_ms: f64,
}

impl StageOutput {
    /// Creates a successful output.
    #[must_use]
    pub fn ok(shared: SharedState) -> Self {
        Self {
            status: StageStatus::Ok,
            produced: BTreeMap::new(),
            shared: Some(shared),
            metadata: HashMap::new(),
            skip_reason: None,
            duration_ms: 0.0,
        }
    }

    /// Creates a skip output with a reason.
    #[must_use]
    pub fn skip(shared: SharedState, reason: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Skip,
            skip_reason: Some(reason.into()),
            ..Self::ok(shared)
        }
    }

    /// Records a produced artifact.
    #[must_use]
    pub fn with_artifact(mut self, key: ArtifactKey, path: impl Into<PathBuf>) -> Self {
        self.produced.insert(key, path.into());
        self
    }

    /// Adds metadata to the output.
    #[must_use]
    pub fn add_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Sets the measured duration.
    #[must_use]
    pub const fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Returns the path of a produced artifact.
    #[must_use]
    pub fn artifact(&self, key: &ArtifactKey) -> Option<&PathBuf> {
        self.produced.get(key)
    }

    /// Returns true if the stage was skipped.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        self.status == StageStatus::Skip
    }
}

/// Serializes artifact maps as `[key, path]` pairs.
///
/// Keys such as `recon_surface` carry data, which JSON object keys cannot.
mod produced_pairs {
    use super::ArtifactKey;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    pub fn serialize<S: Serializer>(map: &BTreeMap<ArtifactKey, PathBuf>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(map.iter())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BTreeMap<ArtifactKey, PathBuf>, D::Error> {
        let pairs = Vec::<(ArtifactKey, PathBuf)>::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> SharedState {
        SharedState::new("/data/freesurfer", "sub-01")
    }

    #[test]
    fn test_ok_output() {
        let output = StageOutput::ok(shared())
            .with_artifact(ArtifactKey::ReconAseg, "/data/freesurfer/sub-01/mri/aseg.mgz")
            .add_metadata("directive", serde_json::json!("autorecon3"));

        assert_eq!(output.status, StageStatus::Ok);
        assert_eq!(
            output.artifact(&ArtifactKey::ReconAseg),
            Some(&PathBuf::from("/data/freesurfer/sub-01/mri/aseg.mgz"))
        );
        assert_eq!(output.metadata.len(), 1);
        assert!(!output.is_skipped());
    }

    #[test]
    fn test_skip_output_keeps_shared_state() {
        let output = StageOutput::skip(shared(), "outputs present");

        assert!(output.is_skipped());
        assert_eq!(output.shared, Some(shared()));
        assert_eq!(output.skip_reason.as_deref(), Some("outputs present"));
    }

    #[test]
    fn test_serializes_data_carrying_keys() {
        let output = StageOutput::ok(shared()).with_artifact(
            ArtifactKey::ReconSurface(crate::core::Hemisphere::Left, crate::core::SurfaceKind::White),
            "/data/freesurfer/sub-01/surf/lh.white",
        );

        let json = serde_json::to_string(&output).unwrap();
        let back: StageOutput = serde_json::from_str(&json).unwrap();
        assert_eq!(back.produced, output.produced);
    }
}
