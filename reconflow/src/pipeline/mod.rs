//! Stage graphs and the subject-level pipeline.
//!
//! [`GraphBuilder`] links stages through the artifacts they declare and
//! rejects cycles, unsatisfied inputs and overlapping outputs. A valid
//! [`StageGraph`] partitions into dependency levels that the wave scheduler
//! runs. [`ReconPipeline`] assembles the graph for one subject.

mod builder;
mod graph;
mod runner;

pub use builder::GraphBuilder;
pub use graph::StageGraph;
pub use runner::{PipelineReport, ReconPipeline, StageSummary};

pub(crate) use graph::StageNode;
