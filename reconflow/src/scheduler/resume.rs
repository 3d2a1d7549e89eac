//! The classical engine's resume phase as a fixed wave plan.
//!
//! After `-autorecon1` and brain injection, recon-all is resumed in six
//! waves. Hemisphere stages run concurrently; hypointensity relabelling and
//! parcellation statistics are held back from them because they are
//! volumetric or need the cortical ribbon.

use super::{Wave, WavePlan, WaveScheduler};
use crate::core::{ArtifactKey, Hemisphere, StageOutput, SurfaceKind};
use crate::errors::{NestedPlanError, ReconflowError};
use crate::stages::{CommandStage, ResourceHint, RunnableStage, StageContext, StageDescriptor};
use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Memory every resume stage declares, in GB.
const RESUME_MEM_GB: f64 = 5.0;

/// Threads claimed by `-cortribbon`, one per hemisphere of pial refinement.
const CORTRIBBON_THREADS: u32 = 2;

const TALAIRACH: &str = "mri/transforms/talairach.lta";
const PRESURF_ASEG: &str = "mri/aseg.presurf.mgz";
const FILLED: &str = "mri/filled.mgz";
const RIBBON: &str = "mri/ribbon.mgz";
const ASEG_STATS: &str = "stats/aseg.stats";

fn parcstats(hemi: Hemisphere) -> ArtifactKey {
    ArtifactKey::custom(format!("stats/{hemi}.aparc.stats"))
}

fn hemi_surfaces(hemi: Hemisphere) -> [ArtifactKey; 3] {
    [SurfaceKind::White, SurfaceKind::Pial, SurfaceKind::Inflated].map(|k| ArtifactKey::ReconSurface(hemi, k))
}

/// Options of the resume plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeOptions {
    /// recon-all command.
    pub recon_all: PathBuf,
    /// Threads given to each multithreaded stage.
    pub omp_nthreads: u32,
    /// Refine pial surfaces with the T2w image.
    pub t2pial: bool,
    /// Refine pial surfaces with the FLAIR image; ignored when `t2pial` is set.
    pub flairpial: bool,
}

impl ResumeOptions {
    /// Creates options with neither T2w nor FLAIR pial refinement.
    #[must_use]
    pub fn new(recon_all: impl Into<PathBuf>, omp_nthreads: u32) -> Self {
        Self {
            recon_all: recon_all.into(),
            omp_nthreads,
            t2pial: false,
            flairpial: false,
        }
    }

    fn pial_flag(&self) -> Option<&'static str> {
        if self.t2pial {
            Some("-T2pial")
        } else if self.flairpial {
            Some("-FLAIRpial")
        } else {
            None
        }
    }

    fn recon_all(&self, descriptor: StageDescriptor) -> CommandStage {
        CommandStage::new(descriptor, &self.recon_all)
            .arg("-subjid")
            .subject_id()
            .arg("-sd")
            .subjects_dir()
    }

    fn openmp(&self, stage: CommandStage) -> CommandStage {
        stage.arg("-openmp").arg(self.omp_nthreads.max(1).to_string())
    }

    fn descriptor(&self, name: impl Into<String>) -> StageDescriptor {
        StageDescriptor::new(name)
            .with_resources(ResourceHint::new(self.omp_nthreads.max(1), RESUME_MEM_GB))
            .always_run()
    }
}

/// Builds the six-wave resume plan.
#[must_use]
pub fn resume_plan(options: &ResumeOptions) -> WavePlan {
    let gcareg = options.openmp(
        options
            .recon_all(
                options
                    .descriptor("gcareg")
                    .with_input(ArtifactKey::InjectedBrainmask)
                    .with_output(ArtifactKey::custom(TALAIRACH)),
            )
            .arg("-gcareg"),
    );

    let autorecon2_vol = options.openmp(
        options
            .recon_all(
                options
                    .descriptor("autorecon2_vol")
                    .with_input(ArtifactKey::custom(TALAIRACH))
                    .with_outputs([ArtifactKey::custom(PRESURF_ASEG), ArtifactKey::custom(FILLED)]),
            )
            .arg("-autorecon2-volonly"),
    );

    let surfs = Hemisphere::BOTH.map(|hemi| {
        let mut stage = options
            .recon_all(
                options
                    .descriptor(format!("autorecon_surfs_{hemi}"))
                    .with_inputs([ArtifactKey::custom(PRESURF_ASEG), ArtifactKey::custom(FILLED)])
                    .with_outputs(hemi_surfaces(hemi))
                    .with_partition(hemi),
            )
            .args(["-autorecon-hemi", hemi.prefix()])
            .args(["-noparcstats", "-noparcstats2", "-noparcstats3", "-nohyporelabel", "-nobalabels"]);
        if let Some(flag) = options.pial_flag() {
            stage = stage.arg(flag);
        }
        Arc::new(options.openmp(stage)) as Arc<dyn RunnableStage>
    });

    let mut cortribbon = options
        .recon_all(
            StageDescriptor::new("cortribbon")
                .with_inputs(Hemisphere::BOTH.into_iter().flat_map(hemi_surfaces))
                .with_output(ArtifactKey::custom(RIBBON))
                .with_resources(ResourceHint::new(CORTRIBBON_THREADS, RESUME_MEM_GB))
                .always_run(),
        )
        .args(["-cortribbon", "-parallel"]);
    if let Some(flag) = options.pial_flag() {
        cortribbon = cortribbon.arg(flag);
    }

    let parcstats_stages = Hemisphere::BOTH.map(|hemi| {
        let stage = options
            .recon_all(
                options
                    .descriptor(format!("parcstats_{hemi}"))
                    .with_input(ArtifactKey::custom(RIBBON))
                    .with_output(parcstats(hemi))
                    .with_partition(hemi),
            )
            .args(["-autorecon-hemi", hemi.prefix(), "-nohyporelabel"]);
        Arc::new(options.openmp(stage)) as Arc<dyn RunnableStage>
    });

    let autorecon3 = options.openmp(
        options
            .recon_all(
                options
                    .descriptor("autorecon3")
                    .with_inputs(Hemisphere::BOTH.map(parcstats))
                    .with_outputs([
                        ArtifactKey::ReconAseg,
                        ArtifactKey::ReconAparcAseg,
                        ArtifactKey::custom(ASEG_STATS),
                    ]),
            )
            .arg("-autorecon3"),
    );

    WavePlan::new("autorecon_resume")
        .with_wave(Wave::new("gcareg").with_stage(Arc::new(gcareg)))
        .with_wave(Wave::new("autorecon2_vol").with_stage(Arc::new(autorecon2_vol)))
        .with_wave(
            Wave::new("autorecon_surfs")
                .with_stages(surfs)
                .with_barrier("surfaces_join"),
        )
        .with_wave(Wave::new("cortribbon").with_stage(Arc::new(cortribbon)))
        .with_wave(
            Wave::new("parcstats")
                .with_stages(parcstats_stages)
                .with_barrier("parcstats_join"),
        )
        .with_wave(Wave::new("autorecon3").with_stage(Arc::new(autorecon3)))
}

/// Runs a nested wave plan as a single stage of an enclosing graph.
///
/// The stage itself holds no resources; the nested stages draw from the
/// scheduler's budget.
#[derive(Debug)]
pub struct ResumeStage {
    descriptor: StageDescriptor,
    plan: WavePlan,
    scheduler: WaveScheduler,
}

impl ResumeStage {
    /// Wraps a plan.
    #[must_use]
    pub fn new(name: impl Into<String>, plan: WavePlan, scheduler: WaveScheduler) -> Self {
        let descriptor = StageDescriptor::new(name)
            .with_inputs(plan.external_inputs())
            .with_outputs(plan.outputs())
            .with_resources(ResourceHint::coordinator())
            .always_run();
        Self {
            descriptor,
            plan,
            scheduler,
        }
    }

    /// Returns the nested plan.
    #[must_use]
    pub const fn plan(&self) -> &WavePlan {
        &self.plan
    }
}

#[async_trait]
impl RunnableStage for ResumeStage {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    fn validate(&self) -> Result<(), ReconflowError> {
        self.descriptor.validate()?;
        let external: BTreeSet<ArtifactKey> = self.descriptor.inputs.iter().cloned().collect();
        self.plan.validate(&external)
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, ReconflowError> {
        let mut report = self.scheduler.run(&self.plan, ctx).await;
        if let Some(err) = report.error.take() {
            warn!(
                stage = %self.descriptor.name,
                subject = %ctx.subject().id(),
                last_completed_wave = report.last_completed_wave().unwrap_or("none"),
                error = %err,
                "nested plan stopped"
            );
            return Err(NestedPlanError {
                stage: self.descriptor.name.clone(),
                completed_waves: report.completed_waves,
                outputs: report.outputs,
                failed: report.failed,
                source: Box::new(err),
            }
            .into());
        }

        let mut output = StageOutput::ok(ctx.shared_state())
            .add_metadata("waves", json!(report.completed_waves))
            .with_duration_ms(report.duration_ms);
        output.produced = report.produced();
        Ok(output)
    }
}
