//! Mock stages for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::{ArtifactKey, SharedState, StageOutput};
use crate::errors::{ExternalToolFailure, ReconflowError};
use crate::stages::{collect_outputs, ResourceHint, RunnableStage, StageContext, StageDescriptor};

/// When one stage ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSpan {
    /// Instant the stage body started.
    pub start: Instant,
    /// Instant the stage body finished.
    pub end: Instant,
}

/// Shared record of stage execution spans.
#[derive(Debug, Clone, Default)]
pub struct StageTrace {
    spans: Arc<Mutex<Vec<(String, StageSpan)>>>,
}

impl StageTrace {
    /// Creates an empty trace.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a span.
    pub fn record(&self, stage: impl Into<String>, span: StageSpan) {
        self.spans.lock().push((stage.into(), span));
    }

    /// Returns the first span recorded for a stage.
    #[must_use]
    pub fn span(&self, stage: &str) -> Option<StageSpan> {
        self.spans.lock().iter().find(|(name, _)| name == stage).map(|(_, span)| *span)
    }

    /// Returns stage names in the order they finished.
    #[must_use]
    pub fn finished(&self) -> Vec<String> {
        let mut spans = self.spans.lock().clone();
        spans.sort_by_key(|(_, span)| span.end);
        spans.into_iter().map(|(name, _)| name).collect()
    }

    /// Returns the number of recorded spans.
    #[must_use]
    pub fn len(&self) -> usize {
        self.spans.lock().len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.spans.lock().is_empty()
    }
}

/// Writes a placeholder for every declared output.
async fn touch_outputs(descriptor: &StageDescriptor, ctx: &StageContext) -> Result<(), ReconflowError> {
    for key in &descriptor.outputs {
        let path = ctx.resolve(&descriptor.name, key)?;
        if *key == ArtifactKey::SubjectDir {
            tokio::fs::create_dir_all(&path).await?;
            continue;
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, descriptor.name.as_bytes()).await?;
    }
    Ok(())
}

/// A stage that creates its outputs and records when it ran.
#[derive(Debug)]
pub struct RecordingStage {
    descriptor: StageDescriptor,
    delay: Duration,
    trace: Option<StageTrace>,
    executions: Mutex<usize>,
}

impl RecordingStage {
    /// Creates a recording stage.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        inputs: impl IntoIterator<Item = ArtifactKey>,
        outputs: impl IntoIterator<Item = ArtifactKey>,
    ) -> Self {
        Self {
            descriptor: StageDescriptor::new(name).with_inputs(inputs).with_outputs(outputs),
            delay: Duration::ZERO,
            trace: None,
            executions: Mutex::new(0),
        }
    }

    /// Sleeps for `delay` before creating the outputs.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Records spans into `trace`.
    #[must_use]
    pub fn with_trace(mut self, trace: StageTrace) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Sets the resource hint.
    #[must_use]
    pub fn with_resources(mut self, resources: ResourceHint) -> Self {
        self.descriptor = self.descriptor.with_resources(resources);
        self
    }

    /// Marks the stage as always executed.
    #[must_use]
    pub fn always_run(mut self) -> Self {
        self.descriptor = self.descriptor.always_run();
        self
    }

    /// Returns how often the stage executed.
    #[must_use]
    pub fn execution_count(&self) -> usize {
        *self.executions.lock()
    }
}

#[async_trait]
impl RunnableStage for RecordingStage {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, ReconflowError> {
        let start = Instant::now();
        *self.executions.lock() += 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        touch_outputs(&self.descriptor, ctx).await?;
        if let Some(trace) = &self.trace {
            trace.record(self.descriptor.name.clone(), StageSpan { start, end: Instant::now() });
        }
        collect_outputs(&self.descriptor, ctx)
    }
}

/// A stage that fails like an external tool exiting with status 1.
#[derive(Debug)]
pub struct FailingStage {
    descriptor: StageDescriptor,
    diagnostics: String,
}

impl FailingStage {
    /// Creates a failing stage declaring `outputs`.
    #[must_use]
    pub fn new(name: impl Into<String>, outputs: impl IntoIterator<Item = ArtifactKey>) -> Self {
        Self {
            descriptor: StageDescriptor::new(name).with_outputs(outputs).always_run(),
            diagnostics: "ERROR: simulated failure".to_string(),
        }
    }

    /// Sets the captured diagnostic output.
    #[must_use]
    pub fn with_diagnostics(mut self, diagnostics: impl Into<String>) -> Self {
        self.diagnostics = diagnostics.into();
        self
    }
}

#[async_trait]
impl RunnableStage for FailingStage {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, ReconflowError> {
        Err(ExternalToolFailure::exit(
            self.descriptor.name.clone(),
            ctx.subject().id(),
            Some(1),
            self.diagnostics.clone(),
        )
        .into())
    }
}

/// A stage that reports a fixed shared state, for join barrier tests.
#[derive(Debug)]
pub struct ReportingStage {
    descriptor: StageDescriptor,
    shared: SharedState,
}

impl ReportingStage {
    /// Creates a stage reporting `shared` after creating `outputs`.
    #[must_use]
    pub fn new(name: impl Into<String>, outputs: impl IntoIterator<Item = ArtifactKey>, shared: SharedState) -> Self {
        Self {
            descriptor: StageDescriptor::new(name).with_outputs(outputs).always_run(),
            shared,
        }
    }
}

#[async_trait]
impl RunnableStage for ReportingStage {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, ReconflowError> {
        touch_outputs(&self.descriptor, ctx).await?;
        let mut output = collect_outputs(&self.descriptor, ctx)?;
        output.shared = Some(self.shared.clone());
        Ok(output)
    }
}
