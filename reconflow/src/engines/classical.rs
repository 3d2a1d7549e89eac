//! The classical engine: `recon-all` with injected brain extraction.

use super::{common_stages, ReconEngine, ReconPath};
use crate::config::PipelineConfig;
use crate::core::ArtifactKey;
use crate::scheduler::{resume_plan, ResumeOptions, ResumeStage, WaveScheduler};
use crate::stages::{CommandStage, InjectBrainStage, ResourceHint, RunnableStage, StageDescriptor};
use std::sync::Arc;

/// Memory declared by `-autorecon1`, in GB.
const AUTORECON1_MEM_GB: f64 = 5.0;

/// FreeSurfer `recon-all`, split so the engine's skull stripping can be
/// replaced and the resume phase parallelized per hemisphere.
#[derive(Debug, Clone)]
pub struct ClassicalEngine {
    config: PipelineConfig,
    hires: bool,
    scheduler: WaveScheduler,
}

impl ClassicalEngine {
    /// Creates the engine. `hires` is the flag accepted by the path selector.
    #[must_use]
    pub fn new(config: PipelineConfig, hires: bool, scheduler: WaveScheduler) -> Self {
        Self {
            config,
            hires,
            scheduler,
        }
    }

    fn autorecon1(&self) -> CommandStage {
        let inputs = &self.config.inputs;
        let mut descriptor = StageDescriptor::new("autorecon1")
            .with_input(ArtifactKey::T1w)
            .with_outputs([ArtifactKey::SubjectDir, ArtifactKey::ReconT1])
            .with_resources(ResourceHint::new(self.config.resources.omp_nthreads, AUTORECON1_MEM_GB))
            .not_resumable()
            .always_run();
        if inputs.t2w.is_some() {
            descriptor = descriptor.with_input(ArtifactKey::T2w);
        } else if inputs.flair.is_some() {
            descriptor = descriptor.with_input(ArtifactKey::Flair);
        }

        let mut stage = CommandStage::new(descriptor, &self.config.tools.recon_all)
            .arg("-subjid")
            .subject_id()
            .arg("-sd")
            .subjects_dir()
            .args(["-autorecon1", "-noskullstrip", "-noT2pial", "-noFLAIRpial", "-i"])
            .input(ArtifactKey::T1w);
        if inputs.t2w.is_some() {
            stage = stage.arg("-T2").input(ArtifactKey::T2w);
        } else if inputs.flair.is_some() {
            stage = stage.arg("-FLAIR").input(ArtifactKey::Flair);
        }
        if self.config.large_fov {
            stage = stage.arg("-cw256");
        }
        if self.hires {
            stage = stage.arg("-hires");
        }
        stage
            .arg("-openmp")
            .arg(self.config.resources.omp_nthreads.max(1).to_string())
    }

    fn resume_options(&self) -> ResumeOptions {
        let mut options = ResumeOptions::new(&self.config.tools.recon_all, self.config.resources.omp_nthreads);
        options.t2pial = self.config.inputs.t2w.is_some();
        options.flairpial = !options.t2pial && self.config.inputs.flair.is_some();
        options
    }
}

impl ReconEngine for ClassicalEngine {
    fn path(&self) -> ReconPath {
        ReconPath::Classical
    }

    fn stages(&self) -> Vec<Arc<dyn RunnableStage>> {
        let mut stages: Vec<Arc<dyn RunnableStage>> = vec![
            Arc::new(self.autorecon1()),
            Arc::new(InjectBrainStage::new("skull_strip_extern", &self.config.tools.mri_convert)),
            Arc::new(ResumeStage::new(
                "autorecon_resume",
                resume_plan(&self.resume_options()),
                self.scheduler.clone(),
            )),
        ];
        stages.extend(common_stages(&self.config.tools));
        stages
    }
}
