//! Wave execution.
//!
//! Waves run strictly in sequence. Every stage of a wave is spawned as its
//! own task and waits for its share of the [`ResourceBudget`]; completion
//! order inside a wave is unconstrained. When a stage fails its siblings are
//! left to drain and no further wave starts.

use super::{ResourceBudget, Wave, WavePlan};
use crate::core::{ArtifactKey, StageOutput};
use crate::errors::ReconflowError;
use crate::observability::StageTimer;
use crate::stages::{RunnableStage, StageContext};
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Outcome of running a wave plan.
#[derive(Debug)]
pub struct ScheduleReport {
    /// Name of the plan.
    pub plan: String,
    /// Outputs of finished stages, wave by wave in declaration order.
    pub outputs: Vec<(String, StageOutput)>,
    /// Labels of waves that finished, barrier included.
    ///
    /// When a stage running a nested plan fails, the nested waves it finished
    /// follow as `<stage>/<wave>`.
    pub completed_waves: Vec<String>,
    /// Names of stages that failed.
    pub failed: Vec<String>,
    /// The first error that stopped the plan.
    pub error: Option<ReconflowError>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: f64,
}

impl ScheduleReport {
    fn new(plan: &str) -> Self {
        Self {
            plan: plan.to_string(),
            outputs: Vec::new(),
            completed_waves: Vec::new(),
            failed: Vec::new(),
            error: None,
            duration_ms: 0.0,
        }
    }

    /// Returns true if every wave completed.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.error.is_none()
    }

    /// Returns the label of the last wave that completed.
    #[must_use]
    pub fn last_completed_wave(&self) -> Option<&str> {
        self.completed_waves.last().map(String::as_str)
    }

    /// Returns the output of a stage.
    #[must_use]
    pub fn output(&self, stage: &str) -> Option<&StageOutput> {
        self.outputs.iter().find(|(name, _)| name == stage).map(|(_, out)| out)
    }

    /// Returns every artifact produced or reused by the plan.
    #[must_use]
    pub fn produced(&self) -> BTreeMap<ArtifactKey, PathBuf> {
        self.outputs
            .iter()
            .flat_map(|(_, out)| out.produced.iter().map(|(k, p)| (k.clone(), p.clone())))
            .collect()
    }

    /// Converts the report into a result, surfacing the stopping error.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the plan.
    pub fn into_result(mut self) -> Result<Self, ReconflowError> {
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

/// Runs wave plans against a shared resource budget.
#[derive(Debug, Clone)]
pub struct WaveScheduler {
    budget: ResourceBudget,
}

impl WaveScheduler {
    /// Creates a scheduler.
    #[must_use]
    pub const fn new(budget: ResourceBudget) -> Self {
        Self { budget }
    }

    /// Returns the resource budget.
    #[must_use]
    pub const fn budget(&self) -> &ResourceBudget {
        &self.budget
    }

    /// Runs a plan to completion or to the first failing wave.
    ///
    /// Execution errors are recorded in the report, never retried.
    pub async fn run(&self, plan: &WavePlan, ctx: &StageContext) -> ScheduleReport {
        let timer = StageTimer::start(plan.name());
        let mut report = ScheduleReport::new(plan.name());
        let subject = ctx.subject().id().to_string();

        for (index, wave) in plan.waves().iter().enumerate() {
            info!(plan = %plan.name(), wave = %wave.label(), subject = %subject, stages = wave.stages().len(), "wave started");
            ctx.events()
                .emit(
                    "wave.started",
                    Some(json!({
                        "plan": plan.name(),
                        "wave": wave.label(),
                        "index": index,
                        "stages": wave.stage_names(),
                    })),
                )
                .await;

            if let Err(err) = self.run_wave(wave, ctx, &mut report).await {
                error!(plan = %plan.name(), wave = %wave.label(), subject = %subject, error = %err, "wave failed");
                report.error = Some(err);
                break;
            }

            ctx.events()
                .emit(
                    "wave.completed",
                    Some(json!({"plan": plan.name(), "wave": wave.label(), "index": index})),
                )
                .await;
            report.completed_waves.push(wave.label().to_string());
        }

        report.duration_ms = timer.elapsed_ms();
        report
    }

    async fn run_wave(
        &self,
        wave: &Wave,
        ctx: &StageContext,
        report: &mut ScheduleReport,
    ) -> Result<(), ReconflowError> {
        let mut active: FuturesUnordered<tokio::task::JoinHandle<(String, Result<StageOutput, ReconflowError>)>> =
            FuturesUnordered::new();
        for stage in wave.stages() {
            let stage = Arc::clone(stage);
            let ctx = ctx.clone();
            let budget = self.budget.clone();
            active.push(tokio::spawn(async move {
                let result = run_stage(stage.as_ref(), &ctx, &budget).await;
                (stage.name().to_string(), result)
            }));
        }

        let mut finished: HashMap<String, StageOutput> = HashMap::new();
        let mut nested_outputs: Vec<(String, StageOutput)> = Vec::new();
        let mut first_error: Option<ReconflowError> = None;
        while let Some(joined) = active.next().await {
            let outcome = match joined {
                Ok((name, Ok(output))) => register_outputs(ctx, &output).map(|()| (name, output)),
                Ok((name, Err(mut err))) => {
                    if let ReconflowError::NestedPlan(nested) = &mut err {
                        report
                            .completed_waves
                            .extend(nested.completed_waves.drain(..).map(|wave| format!("{name}/{wave}")));
                        nested_outputs.append(&mut nested.outputs);
                    }
                    report.failed.push(name);
                    Err(err)
                }
                Err(join) => Err(ReconflowError::Internal(format!("Task join error: {join}"))),
            };
            match outcome {
                Ok((name, output)) => {
                    finished.insert(name, output);
                }
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    } else {
                        warn!(wave = %wave.label(), error = %err, "additional stage failure while draining wave");
                    }
                }
            }
        }

        for name in wave.stage_names() {
            if let Some(output) = finished.remove(name) {
                report.outputs.push((name.to_string(), output));
            }
        }
        report.outputs.append(&mut nested_outputs);
        if let Some(err) = first_error {
            return Err(err);
        }

        if let Some(barrier) = wave.barrier() {
            let branches: Vec<(&str, &StageOutput)> = report
                .outputs
                .iter()
                .filter(|(name, _)| wave.stage_names().contains(&name.as_str()))
                .map(|(name, out)| (name.as_str(), out))
                .collect();
            let state = barrier.check(&branches)?;
            debug!(barrier = %barrier.name(), branches = branches.len(), "join barrier passed");
            ctx.events()
                .emit(
                    "barrier.passed",
                    Some(json!({
                        "barrier": barrier.name(),
                        "wave": wave.label(),
                        "shared": state,
                    })),
                )
                .await;
        }
        Ok(())
    }
}

fn register_outputs(ctx: &StageContext, output: &StageOutput) -> Result<(), ReconflowError> {
    for (key, path) in &output.produced {
        ctx.store().register(ctx.subject().id(), key.clone(), path.clone())?;
    }
    Ok(())
}

/// Resolves the outputs of a skippable stage if all of them already exist.
fn reusable_outputs(stage: &dyn RunnableStage, ctx: &StageContext) -> Option<StageOutput> {
    let descriptor = stage.descriptor();
    if !descriptor.skippable() {
        return None;
    }
    let mut output = StageOutput::skip(ctx.shared_state(), "all declared outputs already present");
    for key in &descriptor.outputs {
        let path = ctx.store().resolve(ctx.subject().id(), key)?;
        if !path.exists() {
            return None;
        }
        output = output.with_artifact(key.clone(), path);
    }
    Some(output)
}

async fn run_stage(
    stage: &dyn RunnableStage,
    ctx: &StageContext,
    budget: &ResourceBudget,
) -> Result<StageOutput, ReconflowError> {
    let name = stage.name();
    let subject = ctx.subject().id();

    if let Some(output) = reusable_outputs(stage, ctx) {
        info!(stage = %name, subject = %subject, "outputs present, skipping stage");
        ctx.events()
            .emit(
                "stage.skipped",
                Some(json!({"stage": name, "reason": output.skip_reason})),
            )
            .await;
        return Ok(output);
    }

    let lease = budget.acquire(&stage.descriptor().resources).await?;
    debug!(stage = %name, threads = lease.threads(), memory_mb = lease.memory_mb(), "resources leased");
    ctx.events()
        .emit(
            "stage.started",
            Some(json!({"stage": name, "subject": subject, "threads": lease.threads()})),
        )
        .await;

    let timer = StageTimer::start(name);
    let result = stage.execute(ctx).await;
    drop(lease);
    let duration_ms = timer.elapsed_ms();

    match result {
        Ok(mut output) => {
            if output.duration_ms <= 0.0 {
                output.duration_ms = duration_ms;
            }
            info!(stage = %name, subject = %subject, duration_ms, "stage completed");
            ctx.events()
                .emit(
                    "stage.completed",
                    Some(json!({"stage": name, "duration_ms": duration_ms})),
                )
                .await;
            Ok(output)
        }
        Err(err) => {
            error!(stage = %name, subject = %subject, error = %err, "stage failed");
            ctx.events()
                .emit(
                    "stage.failed",
                    Some(json!({"stage": name, "error": err.to_string(), "duration_ms": duration_ms})),
                )
                .await;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SharedState;
    use crate::events::CollectingEventSink;
    use crate::store::ArtifactStore;
    use crate::testing::{FailingStage, RecordingStage, ReportingStage, StageTrace};
    use std::time::Duration;

    fn context(root: &std::path::Path, events: Arc<CollectingEventSink>) -> StageContext {
        let store = Arc::new(ArtifactStore::new(root));
        StageContext::new(store.subject("sub-01"), store, events)
    }

    fn keys(names: &[&str]) -> Vec<ArtifactKey> {
        names.iter().map(|k| ArtifactKey::custom(*k)).collect()
    }

    #[tokio::test]
    async fn test_waves_run_in_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(CollectingEventSink::new());
        let ctx = context(dir.path(), Arc::clone(&events));
        let trace = StageTrace::new();

        let plan = WavePlan::new("plan")
            .with_wave(
                Wave::new("first")
                    .with_stage(Arc::new(
                        RecordingStage::new("slow", keys(&[]), keys(&["a"]))
                            .with_delay(Duration::from_millis(40))
                            .with_trace(trace.clone()),
                    ))
                    .with_stage(Arc::new(
                        RecordingStage::new("fast", keys(&[]), keys(&["b"])).with_trace(trace.clone()),
                    )),
            )
            .with_wave(Wave::new("second").with_stage(Arc::new(
                RecordingStage::new("next", keys(&["a", "b"]), keys(&["c"])).with_trace(trace.clone()),
            )));

        let report = WaveScheduler::new(ResourceBudget::new(4, 4.0)).run(&plan, &ctx).await;

        assert!(report.success());
        assert_eq!(report.completed_waves, vec!["first".to_string(), "second".to_string()]);
        let next = trace.span("next").unwrap();
        assert!(trace.span("slow").unwrap().end <= next.start);
        assert!(trace.span("fast").unwrap().end <= next.start);
        assert_eq!(events.stages_for("stage.completed").len(), 3);
        assert!(ctx.store().is_registered("sub-01", &ArtifactKey::custom("c")));
    }

    #[tokio::test]
    async fn test_failure_stops_later_waves_and_drains_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(CollectingEventSink::new());
        let ctx = context(dir.path(), Arc::clone(&events));

        let plan = WavePlan::new("plan")
            .with_wave(
                Wave::new("first")
                    .with_stage(Arc::new(FailingStage::new("broken", keys(&["a"]))))
                    .with_stage(Arc::new(
                        RecordingStage::new("sibling", keys(&[]), keys(&["b"])).with_delay(Duration::from_millis(30)),
                    )),
            )
            .with_wave(Wave::new("second").with_stage(Arc::new(RecordingStage::new(
                "never",
                keys(&["a"]),
                keys(&["c"]),
            ))));

        let report = WaveScheduler::new(ResourceBudget::new(4, 4.0)).run(&plan, &ctx).await;

        assert!(!report.success());
        assert_eq!(report.failed, vec!["broken".to_string()]);
        assert!(report.completed_waves.is_empty());
        assert!(report.output("sibling").is_some());
        assert!(!events.stages_for("stage.started").contains(&"never".to_string()));
        assert_eq!(report.into_result().unwrap_err().stage(), Some("broken"));
    }

    #[tokio::test]
    async fn test_barrier_mismatch_stops_plan() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(CollectingEventSink::new());
        let ctx = context(dir.path(), Arc::clone(&events));

        let plan = WavePlan::new("plan")
            .with_wave(
                Wave::new("surfaces")
                    .with_stage(Arc::new(ReportingStage::new(
                        "lh",
                        keys(&["lh.white"]),
                        SharedState::new(dir.path(), "sub-01"),
                    )))
                    .with_stage(Arc::new(ReportingStage::new(
                        "rh",
                        keys(&["rh.white"]),
                        SharedState::new("/elsewhere", "sub-01"),
                    )))
                    .with_barrier("surfaces_join"),
            )
            .with_wave(Wave::new("after").with_stage(Arc::new(RecordingStage::new(
                "ribbon",
                keys(&["lh.white", "rh.white"]),
                keys(&["ribbon"]),
            ))));

        let report = WaveScheduler::new(ResourceBudget::new(4, 4.0)).run(&plan, &ctx).await;

        assert!(matches!(report.error, Some(ReconflowError::JoinBarrierMismatch(_))));
        assert!(report.output("ribbon").is_none());
        assert!(events.events_of_type("barrier.passed").is_empty());
        assert_eq!(events.events_of_type("wave.started").len(), 1);
    }

    #[tokio::test]
    async fn test_existing_outputs_skip_resumable_stage() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub-01")).unwrap();
        std::fs::write(dir.path().join("sub-01/done"), b"x").unwrap();
        std::fs::write(dir.path().join("sub-01/forced"), b"x").unwrap();
        let events = Arc::new(CollectingEventSink::new());
        let ctx = context(dir.path(), Arc::clone(&events));

        let plan = WavePlan::new("plan").with_wave(
            Wave::new("only")
                .with_stage(Arc::new(RecordingStage::new("resumable", keys(&[]), keys(&["done"]))))
                .with_stage(Arc::new(
                    RecordingStage::new("forced", keys(&[]), keys(&["forced"])).always_run(),
                )),
        );

        let report = WaveScheduler::new(ResourceBudget::new(2, 2.0)).run(&plan, &ctx).await;

        assert!(report.output("resumable").unwrap().is_skipped());
        assert!(!report.output("forced").unwrap().is_skipped());
        assert_eq!(events.stages_for("stage.skipped"), vec!["resumable".to_string()]);
        assert_eq!(report.produced().len(), 2);
    }

    #[tokio::test]
    async fn test_budget_serializes_heavy_stages() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), Arc::new(CollectingEventSink::new()));
        let trace = StageTrace::new();

        let heavy = |name: &str, out: &str| {
            Arc::new(
                RecordingStage::new(name, keys(&[]), keys(&[out]))
                    .with_resources(crate::stages::ResourceHint::new(2, 1.0))
                    .with_delay(Duration::from_millis(25))
                    .with_trace(trace.clone()),
            ) as Arc<dyn RunnableStage>
        };
        let plan = WavePlan::new("plan").with_wave(
            Wave::new("only")
                .with_stage(heavy("one", "x"))
                .with_stage(heavy("two", "y")),
        );

        let report = WaveScheduler::new(ResourceBudget::new(2, 8.0)).run(&plan, &ctx).await;
        assert!(report.success());

        let one = trace.span("one").unwrap();
        let two = trace.span("two").unwrap();
        assert!(one.end <= two.start || two.end <= one.start);
    }
}
