//! In-process refinement stage.

use super::codec::VolumeCodec;
use super::volume::LabelSet;
use super::{refine_brain_mask, RefineConfig, RefineOutcome};
use crate::core::{ArtifactKey, StageOutput};
use crate::errors::ReconflowError;
use crate::observability::StageTimer;
use crate::stages::{ResourceHint, RunnableStage, StageContext, StageDescriptor};
use async_trait::async_trait;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Produces the consensus brain mask from the external mask, the native-space
/// segmentation and the bias-corrected T1w.
pub struct RefineMaskStage {
    descriptor: StageDescriptor,
    codec: Arc<dyn VolumeCodec>,
    config: RefineConfig,
    labels: LabelSet,
}

impl RefineMaskStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(codec: Arc<dyn VolumeCodec>, config: RefineConfig) -> Self {
        let descriptor = StageDescriptor::new("refine")
            .with_inputs([ArtifactKey::ExternalMask, ArtifactKey::Aseg, ArtifactKey::CorrectedT1w])
            .with_output(ArtifactKey::Brainmask)
            .with_resources(ResourceHint::new(1, 2.0));
        Self {
            descriptor,
            codec,
            config,
            labels: LabelSet::freesurfer(),
        }
    }

    /// Replaces the label set segmentations are validated against.
    #[must_use]
    pub fn with_label_set(mut self, labels: LabelSet) -> Self {
        self.labels = labels;
        self
    }
}

impl fmt::Debug for RefineMaskStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefineMaskStage")
            .field("descriptor", &self.descriptor)
            .field("config", &self.config)
            .field("labels", &self.labels.name())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RunnableStage for RefineMaskStage {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, ReconflowError> {
        let name = &self.descriptor.name;
        self.config.validate()?;
        let timer = StageTimer::start(name.clone());
        let mask_path = ctx.resolve(name, &ArtifactKey::ExternalMask)?;
        let aseg_path = ctx.resolve(name, &ArtifactKey::Aseg)?;
        let anat_path = ctx.resolve(name, &ArtifactKey::CorrectedT1w)?;
        let out_path = ctx.resolve(name, &ArtifactKey::Brainmask)?;

        let codec = Arc::clone(&self.codec);
        let config = self.config.clone();
        let label_set = self.labels.clone();
        let target = out_path.clone();
        let outcome: RefineOutcome = tokio::task::spawn_blocking(move || -> Result<RefineOutcome, ReconflowError> {
            let anat = codec.read_intensity(&anat_path)?;
            let labels = codec.read_labels(&aseg_path)?;
            label_set.validate(&labels)?;
            let external = codec.read_mask(&mask_path)?;
            let outcome = refine_brain_mask(&external, &labels, &anat, &config)?;
            codec.write_mask(&target, &outcome.mask)?;
            Ok(outcome)
        })
        .await
        .map_err(|e| ReconflowError::Internal(format!("refinement task failed: {e}")))??;

        info!(
            stage = %name,
            subject = %ctx.subject().id(),
            voxels = outcome.mask.count(),
            confidence = ?outcome.confidence,
            "consensus brain mask written"
        );

        Ok(StageOutput::ok(ctx.shared_state())
            .with_artifact(ArtifactKey::Brainmask, out_path)
            .add_metadata("confidence", json!(outcome.confidence))
            .add_metadata("band_voxels", json!(outcome.band_voxels))
            .add_metadata("accepted_external", json!(outcome.accepted_external))
            .add_metadata("accepted_likelihood", json!(outcome.accepted_likelihood))
            .with_duration_ms(timer.elapsed_ms()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Frame;
    use crate::events::NoOpEventSink;
    use crate::refine::{Affine, MockVolumeCodec, Volume};
    use crate::store::ArtifactStore;

    fn context(root: &std::path::Path) -> StageContext {
        let store = Arc::new(ArtifactStore::new(root));
        store.register("sub-01", ArtifactKey::ExternalMask, "/bids/desc-brain_mask.nii.gz").unwrap();
        store.register("sub-01", ArtifactKey::CorrectedT1w, "/bids/desc-preproc_T1w.nii.gz").unwrap();
        StageContext::new(store.subject("sub-01"), store, Arc::new(NoOpEventSink))
    }

    #[tokio::test]
    async fn test_shape_mismatch_writes_nothing() {
        let mut codec = MockVolumeCodec::new();
        codec
            .expect_read_intensity()
            .returning(|_| Ok(Volume::filled([8, 8, 8], Frame::Native, Affine::identity(), 1.0)));
        codec
            .expect_read_labels()
            .returning(|_| Ok(Volume::filled([8, 8, 9], Frame::Native, Affine::identity(), 0)));
        codec
            .expect_read_mask()
            .returning(|_| Ok(Volume::filled([8, 8, 8], Frame::Native, Affine::identity(), false)));
        codec.expect_write_mask().times(0);

        let stage = RefineMaskStage::new(Arc::new(codec), RefineConfig::default());
        let err = stage.execute(&context(std::path::Path::new("/fs"))).await.unwrap_err();
        assert!(matches!(err, ReconflowError::FrameMismatch(ref e) if e.found_shape == [8, 8, 9]));
    }

    #[tokio::test]
    async fn test_writes_consensus_mask() {
        let mut codec = MockVolumeCodec::new();
        codec
            .expect_read_intensity()
            .returning(|_| Ok(Volume::filled([6, 6, 6], Frame::Native, Affine::identity(), 1.0)));
        codec.expect_read_labels().returning(|_| {
            let mut v = Volume::filled([6, 6, 6], Frame::Native, Affine::identity(), 0);
            v.set(2, 2, 2, 17);
            Ok(v)
        });
        codec
            .expect_read_mask()
            .returning(|_| Ok(Volume::filled([6, 6, 6], Frame::Native, Affine::identity(), false)));
        codec
            .expect_write_mask()
            .withf(|path, mask| path.ends_with("sub-01/mri/brainmask.consensus.nii.gz") && mask.count() == 1)
            .times(1)
            .returning(|_, _| Ok(()));

        let stage = RefineMaskStage::new(Arc::new(codec), RefineConfig::default());
        let output = stage.execute(&context(std::path::Path::new("/fs"))).await.unwrap();

        assert_eq!(output.metadata["confidence"], json!("low"));
        assert!(output.artifact(&ArtifactKey::Brainmask).is_some());
    }

    #[tokio::test]
    async fn test_unknown_label_rejected() {
        let mut codec = MockVolumeCodec::new();
        codec
            .expect_read_intensity()
            .returning(|_| Ok(Volume::filled([2, 2, 2], Frame::Native, Affine::identity(), 1.0)));
        codec
            .expect_read_labels()
            .returning(|_| Ok(Volume::filled([2, 2, 2], Frame::Native, Affine::identity(), 9999)));
        codec.expect_read_mask().times(0);
        codec.expect_write_mask().times(0);

        let stage = RefineMaskStage::new(Arc::new(codec), RefineConfig::default());
        let err = stage.execute(&context(std::path::Path::new("/fs"))).await.unwrap_err();
        assert!(matches!(err, ReconflowError::Volume(_)));
    }
}
