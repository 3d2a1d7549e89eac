//! Core domain model types for reconflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Artifact keys, hemispheres and coordinate frames
//! - Stage status
//! - Stage output and shared subject state

mod artifact;
mod output;
mod status;

pub use artifact::{ArtifactKey, Frame, Hemisphere, SurfaceKind};
pub use output::{SharedState, StageOutput};
pub use status::StageStatus;
