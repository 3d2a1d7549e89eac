//! The learned engine: FastSurfer segmentation and surface pipeline.

use super::{common_stages, ReconEngine, ReconPath};
use crate::config::PipelineConfig;
use crate::core::{ArtifactKey, Hemisphere, SurfaceKind};
use crate::stages::{CommandStage, ResourceHint, RunnableStage, StageDescriptor};
use std::sync::Arc;

/// Memory declared by the FastSurfer run, in GB.
const FASTSURFER_MEM_GB: f64 = 12.0;

/// FastSurfer names its cortical parcellation after the atlas it was trained on.
const DKT_APARC_ASEG: &str = "mri/aparc.DKTatlas+aseg.deep.mgz";

/// Runs `run_fastsurfer.sh` as one opaque stage.
///
/// FastSurfer cannot resume a partial subject directory, so the stage always
/// runs in full.
#[derive(Debug, Clone)]
pub struct LearnedEngine {
    config: PipelineConfig,
}

impl LearnedEngine {
    /// Creates the engine.
    #[must_use]
    pub const fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    fn fastsurfer(&self) -> CommandStage {
        let mut outputs = vec![
            ArtifactKey::SubjectDir,
            ArtifactKey::ReconT1,
            ArtifactKey::ReconAseg,
            ArtifactKey::ReconAparcAseg,
        ];
        for hemi in Hemisphere::BOTH {
            outputs.extend(
                [SurfaceKind::White, SurfaceKind::Pial, SurfaceKind::Inflated]
                    .map(|kind| ArtifactKey::ReconSurface(hemi, kind)),
            );
        }
        let threads = self.config.resources.omp_nthreads.max(1);
        let descriptor = StageDescriptor::new("fastsurfer")
            .with_input(ArtifactKey::T1w)
            .with_outputs(outputs)
            .with_resources(ResourceHint::new(threads, FASTSURFER_MEM_GB))
            .not_resumable()
            .always_run();

        let options = &self.config.fastsurfer;
        let mut stage = CommandStage::new(descriptor, &self.config.tools.fastsurfer)
            .arg("--sd")
            .subjects_dir()
            .arg("--sid")
            .subject_id()
            .arg("--t1")
            .input(ArtifactKey::T1w);
        if options.surfreg {
            stage = stage.arg("--surfreg");
        }
        if options.parallel {
            stage = stage.arg("--parallel");
        }
        stage = stage.arg("--threads").arg(threads.to_string());
        if let Some(license) = &options.fs_license {
            stage = stage.arg("--fs_license").arg(license.display().to_string());
        }
        stage
    }
}

impl ReconEngine for LearnedEngine {
    fn path(&self) -> ReconPath {
        ReconPath::Learned
    }

    fn layout(&self) -> Vec<(ArtifactKey, &'static str)> {
        vec![(ArtifactKey::ReconAparcAseg, DKT_APARC_ASEG)]
    }

    fn stages(&self) -> Vec<Arc<dyn RunnableStage>> {
        let mut stages: Vec<Arc<dyn RunnableStage>> = vec![Arc::new(self.fastsurfer())];
        stages.extend(common_stages(&self.config.tools));
        stages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InputPaths;
    use crate::events::NoOpEventSink;
    use crate::stages::StageContext;
    use crate::store::ArtifactStore;
    use pretty_assertions::assert_eq;

    fn config() -> PipelineConfig {
        PipelineConfig::new(
            "/fs",
            "sub-01",
            InputPaths {
                t1w: "/bids/T1w.nii.gz".into(),
                t2w: Some("/bids/T2w.nii.gz".into()),
                flair: None,
                skull_stripped_t1w: "/work/brain.nii.gz".into(),
                corrected_t1w: "/work/desc-preproc_T1w.nii.gz".into(),
                external_mask: "/work/desc-brain_mask.nii.gz".into(),
                min_voxel_mm: None,
            },
        )
    }

    #[test]
    fn test_fastsurfer_command_line() {
        let mut config = config();
        config.resources.omp_nthreads = 6;
        config.fastsurfer.parallel = false;
        config.fastsurfer.fs_license = Some("/opt/license.txt".into());

        let store = Arc::new(ArtifactStore::new("/fs"));
        store.register("sub-01", ArtifactKey::T1w, "/bids/T1w.nii.gz").unwrap();
        let ctx = StageContext::new(store.subject("sub-01"), store, Arc::new(NoOpEventSink));

        let stage = LearnedEngine::new(config).fastsurfer();
        assert_eq!(
            stage.command_line(&ctx).unwrap(),
            "run_fastsurfer.sh --sd /fs --sid sub-01 --t1 /bids/T1w.nii.gz --surfreg --threads 6 \
             --fs_license /opt/license.txt"
        );
        assert_eq!(stage.descriptor().resources.mem_gb, FASTSURFER_MEM_GB);
        assert!(stage.descriptor().always_run);
    }

    #[test]
    fn test_ignores_t2w() {
        let stage = LearnedEngine::new(config()).fastsurfer();
        assert_eq!(stage.descriptor().inputs, vec![ArtifactKey::T1w]);
    }

    #[test]
    fn test_layout_override() {
        let engine = LearnedEngine::new(config());
        assert_eq!(engine.layout(), vec![(ArtifactKey::ReconAparcAseg, DKT_APARC_ASEG)]);
        assert_eq!(engine.path(), ReconPath::Learned);
    }
}
