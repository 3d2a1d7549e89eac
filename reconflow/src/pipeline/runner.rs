//! Subject-level pipeline: engine selection, graph assembly and execution.

use super::{GraphBuilder, StageGraph};
use crate::config::PipelineConfig;
use crate::core::{ArtifactKey, StageStatus};
use crate::engines::{output_contract, ClassicalEngine, LearnedEngine, PathSelector, ReconEngine, ReconPath};
use crate::errors::ReconflowError;
use crate::events::{EventSink, NoOpEventSink};
use crate::refine::{FileVolumeCodec, RefineMaskStage, VolumeCodec};
use crate::scheduler::{ResourceBudget, ScheduleReport, WavePlan, WaveScheduler};
use crate::stages::StageContext;
use crate::store::ArtifactStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Summary of one stage in a [`PipelineReport`].
#[derive(Debug, Clone, Serialize)]
pub struct StageSummary {
    /// Stage name.
    pub name: String,
    /// Final status.
    pub status: StageStatus,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: f64,
    /// Why the stage was skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    /// Stage metadata, such as the refinement confidence.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Outcome of a subject's reconstruction.
///
/// On failure `last_completed_wave` names where a manual resume would start.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    /// Unique id of this run.
    pub run_id: Uuid,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Subject id.
    pub subject: String,
    /// Reconstruction path that ran.
    pub path: ReconPath,
    /// Labels of completed graph waves.
    pub completed_waves: Vec<String>,
    /// Label of the last completed graph wave.
    pub last_completed_wave: Option<String>,
    /// Stages that finished, in execution order.
    pub stages: Vec<StageSummary>,
    /// Produced artifacts by key.
    pub artifacts: BTreeMap<String, PathBuf>,
    /// Stages that failed.
    pub failed_stages: Vec<String>,
    /// The error that stopped the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: f64,
}

impl PipelineReport {
    /// Returns true if every stage completed.
    #[must_use]
    pub fn success(&self) -> bool {
        self.error.is_none() && self.stages.iter().all(|s| s.status.is_success())
    }

    fn from_schedule(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        subject: &str,
        path: ReconPath,
        report: ScheduleReport,
    ) -> Self {
        let artifacts = report
            .produced()
            .into_iter()
            .map(|(key, path)| (key.to_string(), path))
            .collect();
        let stages = report
            .outputs
            .iter()
            .map(|(name, out)| StageSummary {
                name: name.clone(),
                status: out.status,
                duration_ms: out.duration_ms,
                skip_reason: out.skip_reason.clone(),
                metadata: out.metadata.clone(),
            })
            .collect();
        Self {
            run_id,
            started_at,
            subject: subject.to_string(),
            path,
            last_completed_wave: report.last_completed_wave().map(str::to_string),
            completed_waves: report.completed_waves,
            stages,
            artifacts,
            failed_stages: report.failed,
            error: report.error.map(|e| e.to_string()),
            duration_ms: report.duration_ms,
        }
    }

    fn status_counts(&self) -> HashMap<String, usize> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for stage in &self.stages {
            *counts.entry(stage.status.to_string()).or_insert(0) += 1;
        }
        if !self.failed_stages.is_empty() {
            counts.insert(StageStatus::Fail.to_string(), self.failed_stages.len());
        }
        counts
    }
}

/// A graph ready to run, with the store it resolves against.
struct Prepared {
    path: ReconPath,
    store: Arc<ArtifactStore>,
    graph: StageGraph,
    scheduler: WaveScheduler,
}

/// Reconstructs one subject with the configured engine, then refines the
/// brain mask.
pub struct ReconPipeline {
    config: PipelineConfig,
    codec: Arc<dyn VolumeCodec>,
    events: Arc<dyn EventSink>,
}

impl fmt::Debug for ReconPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconPipeline")
            .field("subject", &self.config.subject_id)
            .field("use_learned", &self.config.use_learned)
            .finish_non_exhaustive()
    }
}

impl ReconPipeline {
    /// Creates a pipeline with the file-name dispatching volume codec and no event sink.
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            codec: Arc::new(FileVolumeCodec::new()),
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the codec the refinement stage reads and writes volumes with.
    #[must_use]
    pub fn with_codec(mut self, codec: Arc<dyn VolumeCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn register_inputs(&self, store: &ArtifactStore) -> Result<Vec<ArtifactKey>, ReconflowError> {
        let subject = self.config.subject_id.as_str();
        let inputs = &self.config.inputs;
        let mut supplied = vec![
            (ArtifactKey::T1w, inputs.t1w.clone()),
            (ArtifactKey::SkullStrippedT1w, inputs.skull_stripped_t1w.clone()),
            (ArtifactKey::CorrectedT1w, inputs.corrected_t1w.clone()),
            (ArtifactKey::ExternalMask, inputs.external_mask.clone()),
        ];
        if let Some(t2w) = &inputs.t2w {
            supplied.push((ArtifactKey::T2w, t2w.clone()));
        }
        if let Some(flair) = &inputs.flair {
            supplied.push((ArtifactKey::Flair, flair.clone()));
        }

        let mut keys = Vec::with_capacity(supplied.len());
        for (key, path) in supplied {
            store.register(subject, key.clone(), path)?;
            keys.push(key);
        }
        Ok(keys)
    }

    fn prepare(&self) -> Result<Prepared, ReconflowError> {
        self.config.validate()?;

        let mut selector = PathSelector::new();
        let path = selector.select(self.config.use_learned, self.config.effective_hires())?;
        let scheduler = WaveScheduler::new(ResourceBudget::from_config(&self.config.resources));
        let engine: Box<dyn ReconEngine> = match path {
            ReconPath::Classical => Box::new(ClassicalEngine::new(
                self.config.clone(),
                selector.hires(),
                scheduler.clone(),
            )),
            ReconPath::Learned => Box::new(LearnedEngine::new(self.config.clone())),
        };

        let store = Arc::new(ArtifactStore::new(&self.config.subjects_dir));
        for (key, relative) in engine.layout() {
            store.set_layout(key, relative);
        }
        let external = self.register_inputs(&store)?;

        let mut builder = GraphBuilder::new(format!("recon_{path}")).with_externals(external);
        for stage in engine.stages() {
            builder.add_stage(stage);
        }
        builder.add_stage(Arc::new(RefineMaskStage::new(
            Arc::clone(&self.codec),
            self.config.refine.clone(),
        )));
        let graph = builder.build()?;
        graph.check_contract(&output_contract())?;

        Ok(Prepared {
            path,
            store,
            graph,
            scheduler,
        })
    }

    /// Builds the stage graph without running anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the graph does
    /// not validate.
    pub fn graph(&self) -> Result<StageGraph, ReconflowError> {
        Ok(self.prepare()?.graph)
    }

    /// Returns the waves [`Self::run`] would execute.
    ///
    /// # Errors
    ///
    /// Same as [`Self::graph`].
    pub fn plan(&self) -> Result<WavePlan, ReconflowError> {
        Ok(self.prepare()?.graph.waves())
    }

    /// Runs the pipeline.
    ///
    /// Configuration and graph errors are returned as `Err`; failures while
    /// running are recorded in the report.
    ///
    /// # Errors
    ///
    /// Same as [`Self::graph`].
    pub async fn run(&self) -> Result<PipelineReport, ReconflowError> {
        let prepared = self.prepare()?;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let subject = self.config.subject_id.clone();
        let plan = prepared.graph.waves();

        info!(
            run_id = %run_id,
            subject = %subject,
            path = %prepared.path,
            stages = prepared.graph.len(),
            waves = plan.len(),
            "starting reconstruction"
        );
        self.events
            .emit(
                "pipeline.started",
                Some(json!({
                    "run_id": run_id.to_string(),
                    "subject": subject,
                    "path": prepared.path,
                    "waves": plan.len(),
                })),
            )
            .await;

        let ctx = StageContext::new(
            prepared.store.subject(subject.clone()),
            prepared.store,
            Arc::clone(&self.events),
        );
        let schedule = prepared.scheduler.run(&plan, &ctx).await;
        let report = PipelineReport::from_schedule(run_id, started_at, &subject, prepared.path, schedule);

        let payload = json!({
            "run_id": run_id.to_string(),
            "subject": subject,
            "status_counts": report.status_counts(),
            "last_completed_wave": report.last_completed_wave,
            "duration_ms": report.duration_ms,
        });
        if let Some(err) = &report.error {
            error!(
                run_id = %run_id,
                subject = %subject,
                failed = ?report.failed_stages,
                last_completed_wave = report.last_completed_wave.as_deref().unwrap_or("none"),
                error = %err,
                "reconstruction failed"
            );
            self.events.emit("pipeline.failed", Some(payload)).await;
        } else {
            info!(run_id = %run_id, subject = %subject, duration_ms = report.duration_ms, "reconstruction finished");
            self.events.emit("pipeline.completed", Some(payload)).await;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InputPaths;
    use pretty_assertions::assert_eq;

    fn config(use_learned: bool) -> PipelineConfig {
        let mut config = PipelineConfig::new(
            "/fs",
            "sub-01",
            InputPaths {
                t1w: "/bids/T1w.nii.gz".into(),
                t2w: None,
                flair: None,
                skull_stripped_t1w: "/work/brain.nii.gz".into(),
                corrected_t1w: "/work/desc-preproc_T1w.nii.gz".into(),
                external_mask: "/work/desc-brain_mask.nii.gz".into(),
                min_voxel_mm: None,
            },
        );
        config.use_learned = use_learned;
        config
    }

    #[test]
    fn test_classical_graph() {
        let graph = ReconPipeline::new(config(false)).graph().unwrap();

        assert_eq!(graph.name(), "recon_classical");
        assert_eq!(graph.dependencies("autorecon_resume"), vec!["skull_strip_extern"]);
        assert_eq!(graph.dependencies("refine"), vec!["aseg_to_native"]);
        assert_eq!(graph.producer_of(&ArtifactKey::ReconAseg), Some("autorecon_resume"));
    }

    #[test]
    fn test_classical_waves() {
        let plan = ReconPipeline::new(config(false)).plan().unwrap();
        let waves: Vec<Vec<&str>> = plan.waves().iter().map(|w| w.stage_names()).collect();

        assert_eq!(waves[0], vec!["autorecon1"]);
        assert_eq!(waves[1], vec!["skull_strip_extern", "fsnative2t1w_xfm"]);
        assert_eq!(waves[2], vec!["autorecon_resume", "t1w2fsnative_xfm"]);
        assert!(waves[3].contains(&"aseg_to_native"));
        assert!(waves[3].contains(&"midthickness_lh"));
        assert!(waves[4].contains(&"refine"));
        assert!(waves[4].contains(&"gifti_rh_midthickness"));
        assert_eq!(waves.len(), 5);
    }

    #[test]
    fn test_learned_graph() {
        let graph = ReconPipeline::new(config(true)).graph().unwrap();

        assert_eq!(graph.producer_of(&ArtifactKey::ReconAparcAseg), Some("fastsurfer"));
        assert!(graph.stage("skull_strip_extern").is_none());
        assert_eq!(graph.dependencies("fsnative2t1w_xfm"), vec!["fastsurfer"]);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = config(false);
        config.subject_id = String::new();
        let err = ReconPipeline::new(config).graph().unwrap_err();
        assert!(matches!(err, ReconflowError::Config(_)));
    }

    #[test]
    fn test_status_counts() {
        let report = PipelineReport {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            subject: "sub-01".to_string(),
            path: ReconPath::Classical,
            completed_waves: vec!["level_0".to_string()],
            last_completed_wave: Some("level_0".to_string()),
            stages: vec![StageSummary {
                name: "autorecon1".to_string(),
                status: StageStatus::Ok,
                duration_ms: 1.0,
                skip_reason: None,
                metadata: HashMap::new(),
            }],
            artifacts: BTreeMap::new(),
            failed_stages: vec!["fsnative2t1w_xfm".to_string()],
            error: Some("boom".to_string()),
            duration_ms: 2.0,
        };

        let counts = report.status_counts();
        assert_eq!(counts.get(&StageStatus::Ok.to_string()), Some(&1));
        assert_eq!(counts.get(&StageStatus::Fail.to_string()), Some(&1));
        assert!(!report.success());
        assert!(serde_json::to_value(&report).is_ok());
    }
}
