//! Testing utilities for reconflow pipelines.
//!
//! Mock stages create placeholder files for their declared outputs so that
//! graphs and wave plans can be exercised without the reconstruction tools.

mod mocks;

pub use mocks::{FailingStage, RecordingStage, ReportingStage, StageSpan, StageTrace};
