//! Runnable stages.
//!
//! A stage is one tool invocation with declared artifact inputs and outputs.
//! External tools are wrapped by [`CommandStage`]; in-process work (brain
//! injection, mask refinement, nested wave plans) implements the same
//! [`RunnableStage`] capability.

mod command;
mod descriptor;
mod inject;

pub use command::{Arg, CommandStage};
pub use descriptor::{ResourceHint, StageDescriptor};
pub use inject::InjectBrainStage;

use crate::core::{ArtifactKey, SharedState, StageOutput};
use crate::errors::{ExternalToolFailure, ReconflowError, UnsatisfiedInputError};
use crate::events::EventSink;
use crate::store::{ArtifactStore, Subject};
use async_trait::async_trait;
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;

/// Capability of a stage the scheduler can run.
#[async_trait]
pub trait RunnableStage: Send + Sync + Debug {
    /// Returns the stage descriptor.
    fn descriptor(&self) -> &StageDescriptor;

    /// Returns the name of the stage.
    fn name(&self) -> &str {
        &self.descriptor().name
    }

    /// Checks the stage before it joins a graph or plan.
    ///
    /// # Errors
    ///
    /// Returns the first problem found; by default, in the descriptor.
    fn validate(&self) -> Result<(), ReconflowError> {
        self.descriptor().validate().map_err(Into::into)
    }

    /// Executes the stage.
    ///
    /// Returns the produced artifacts on success. A stage either fails
    /// detectably or leaves every declared output in place.
    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, ReconflowError>;
}

/// Per-run context handed to every stage.
#[derive(Clone)]
pub struct StageContext {
    subject: Subject,
    store: Arc<ArtifactStore>,
    events: Arc<dyn EventSink>,
}

impl StageContext {
    /// Creates a new stage context.
    #[must_use]
    pub fn new(subject: Subject, store: Arc<ArtifactStore>, events: Arc<dyn EventSink>) -> Self {
        Self {
            subject,
            store,
            events,
        }
    }

    /// Returns the subject being processed.
    #[must_use]
    pub const fn subject(&self) -> &Subject {
        &self.subject
    }

    /// Returns the artifact store.
    #[must_use]
    pub const fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    /// Returns the event sink.
    #[must_use]
    pub const fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Returns the shared state stages report for this subject.
    #[must_use]
    pub fn shared_state(&self) -> SharedState {
        self.subject.shared_state()
    }

    /// Resolves an artifact path for a stage.
    ///
    /// # Errors
    ///
    /// Returns an error if the artifact has no registered or default location.
    pub fn resolve(&self, stage: &str, key: &ArtifactKey) -> Result<PathBuf, UnsatisfiedInputError> {
        self.store
            .resolve(self.subject.id(), key)
            .ok_or_else(|| UnsatisfiedInputError::new(stage, key.clone()))
    }
}

impl Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("subject", &self.subject)
            .field("subjects_dir", &self.store.subjects_dir())
            .finish_non_exhaustive()
    }
}

/// Checks that every declared output exists and builds the stage output.
///
/// # Errors
///
/// Returns an [`ExternalToolFailure`] naming the first missing artifact.
pub fn collect_outputs(
    descriptor: &StageDescriptor,
    ctx: &StageContext,
) -> Result<StageOutput, ReconflowError> {
    let mut output = StageOutput::ok(ctx.shared_state());
    for key in &descriptor.outputs {
        let path = ctx.resolve(&descriptor.name, key)?;
        if !path.exists() {
            return Err(ExternalToolFailure::missing_artifact(
                descriptor.name.clone(),
                ctx.subject().id(),
                path,
            )
            .into());
        }
        output = output.with_artifact(key.clone(), path);
    }
    Ok(output)
}
