//! # Reconflow
//!
//! Staged orchestration of anatomical surface reconstruction.
//!
//! Reconflow reconstructs one subject's cortical surfaces with an external
//! engine and refines the brain mask against the result:
//!
//! - **Dependency graphs**: stages declare the artifacts they consume and
//!   produce; the graph links them and rejects cycles and dangling inputs
//! - **Wave scheduling**: waves run in order against an explicit thread and
//!   memory budget, with join barriers after per-hemisphere stages
//! - **Engine selection**: classical (`recon-all`) or learned (FastSurfer),
//!   chosen once and exposing identical outputs
//! - **Mask refinement**: segmentation closing, hole filling and a
//!   likelihood-gated search band around the result
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use reconflow::prelude::*;
//!
//! let config = PipelineConfig::from_json_file("sub-01.json")?;
//! let report = ReconPipeline::new(config)
//!     .with_events(Arc::new(LoggingEventSink::default()))
//!     .run()
//!     .await?;
//! println!("{}", report.last_completed_wave.unwrap_or_default());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod core;
pub mod engines;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod refine;
pub mod scheduler;
pub mod stages;
pub mod store;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{InputPaths, PipelineConfig, ResourceConfig, ToolPaths};
    pub use crate::core::{ArtifactKey, Frame, Hemisphere, SharedState, StageOutput, StageStatus, SurfaceKind};
    pub use crate::engines::{PathSelector, ReconEngine, ReconPath};
    pub use crate::errors::{
        ContractErrorInfo, CycleError, ExternalToolFailure, FrameMismatchError, JoinBarrierMismatchError,
        OutputOverlapError, PipelineValidationError, ReconflowError, UnsatisfiedInputError,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::pipeline::{GraphBuilder, PipelineReport, ReconPipeline, StageGraph};
    pub use crate::refine::{refine_brain_mask, Confidence, FileVolumeCodec, RefineConfig, RefineMaskStage, VolumeCodec};
    pub use crate::scheduler::{JoinBarrier, ResourceBudget, Wave, WavePlan, WaveScheduler};
    pub use crate::stages::{CommandStage, ResourceHint, RunnableStage, StageContext, StageDescriptor};
    pub use crate::store::{ArtifactStore, Subject};
}
