//! Reconstruction engines.
//!
//! Exactly one engine runs per subject. Both expose the same outputs
//! through the same artifact keys, so stages downstream of reconstruction
//! never know which engine ran.

mod classical;
mod common;
mod learned;
mod selector;

pub use classical::ClassicalEngine;
pub use common::{common_stages, output_contract};
pub use learned::LearnedEngine;
pub use selector::{PathSelector, ReconPath, SelectorState};

use crate::core::ArtifactKey;
use crate::stages::RunnableStage;
use std::fmt::Debug;
use std::sync::Arc;

/// A reconstruction engine contributes its stages to the subject graph.
pub trait ReconEngine: Send + Sync + Debug {
    /// Returns the path this engine implements.
    fn path(&self) -> ReconPath;

    /// Returns subject-relative locations overriding the default layout.
    fn layout(&self) -> Vec<(ArtifactKey, &'static str)> {
        Vec::new()
    }

    /// Returns the engine's stages, shared post-processing included.
    fn stages(&self) -> Vec<Arc<dyn RunnableStage>>;
}
