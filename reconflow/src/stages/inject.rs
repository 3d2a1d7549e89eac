//! Injection of an externally computed brain extraction into a subject directory.

use super::{collect_outputs, ResourceHint, RunnableStage, StageContext, StageDescriptor};
use crate::core::{ArtifactKey, StageOutput};
use crate::errors::{ExternalToolFailure, ReconflowError};
use crate::observability::StageTimer;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Relative path of the unedited brain mask the classical engine expects.
pub const BRAINMASK_AUTO: &str = "mri/brainmask.auto.mgz";

/// Replaces the engine's own skull stripping with a supplied brain image.
///
/// The skull-stripped T1w is written to `mri/brainmask.auto.mgz`, converting
/// it with `mri_convert` unless it is already MGZ, and then copied to
/// `mri/brainmask.mgz`.
#[derive(Debug, Clone)]
pub struct InjectBrainStage {
    descriptor: StageDescriptor,
    converter: PathBuf,
}

impl InjectBrainStage {
    /// Creates the injection stage.
    #[must_use]
    pub fn new(name: impl Into<String>, converter: impl Into<PathBuf>) -> Self {
        let descriptor = StageDescriptor::new(name)
            .with_inputs([ArtifactKey::SkullStrippedT1w, ArtifactKey::ReconT1])
            .with_outputs([ArtifactKey::custom(BRAINMASK_AUTO), ArtifactKey::InjectedBrainmask])
            .with_resources(ResourceHint::new(1, 0.5))
            .always_run();
        Self {
            descriptor,
            converter: converter.into(),
        }
    }

    async fn convert(&self, ctx: &StageContext, source: &Path, target: &Path) -> Result<(), ReconflowError> {
        let name = &self.descriptor.name;
        let subject = ctx.subject().id();
        if is_mgz(source) {
            tokio::fs::copy(source, target).await?;
            return Ok(());
        }

        let output = Command::new(&self.converter)
            .arg(source)
            .arg(target)
            .env("SUBJECTS_DIR", ctx.subject().subjects_dir())
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ExternalToolFailure::launch(name.clone(), subject, &e))?;
        if !output.status.success() {
            return Err(ExternalToolFailure::exit(
                name.clone(),
                subject,
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).into_owned(),
            )
            .into());
        }
        Ok(())
    }
}

fn is_mgz(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("mgz"))
}

#[async_trait]
impl RunnableStage for InjectBrainStage {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, ReconflowError> {
        let name = &self.descriptor.name;
        let timer = StageTimer::start(name.clone());
        let source = ctx.resolve(name, &ArtifactKey::SkullStrippedT1w)?;
        let auto = ctx.resolve(name, &ArtifactKey::custom(BRAINMASK_AUTO))?;
        let brainmask = ctx.resolve(name, &ArtifactKey::InjectedBrainmask)?;

        if let Some(parent) = auto.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        debug!(stage = %name, source = %source.display(), "injecting brain extraction");
        self.convert(ctx, &source, &auto).await?;
        tokio::fs::copy(&auto, &brainmask).await?;

        Ok(collect_outputs(&self.descriptor, ctx)?.with_duration_ms(timer.elapsed_ms()))
    }
}
