//! Join barriers between waves of partitioned stages.

use crate::core::{SharedState, StageOutput};
use crate::errors::JoinBarrierMismatchError;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Checks that every branch of a partitioned wave reports the same subject state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinBarrier {
    name: String,
}

impl JoinBarrier {
    /// Creates a named barrier.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Returns the barrier name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deduplicates the shared state of all branches.
    ///
    /// Returns `None` when there are no branches.
    ///
    /// # Errors
    ///
    /// Returns a [`JoinBarrierMismatchError`] when `subjects_dir` or
    /// `subject_id` differ between branches, or a branch reported no state.
    pub fn check(&self, branches: &[(&str, &StageOutput)]) -> Result<Option<SharedState>, JoinBarrierMismatchError> {
        let mut states = Vec::with_capacity(branches.len());
        for (stage, output) in branches {
            let Some(state) = &output.shared else {
                debug!(barrier = %self.name, stage = %stage, "branch reported no shared state");
                return Err(JoinBarrierMismatchError::new(
                    self.name.clone(),
                    "shared_state",
                    branches
                        .iter()
                        .map(|(name, out)| {
                            let seen = if out.shared.is_some() { "reported" } else { "missing" };
                            format!("{name}: {seen}")
                        })
                        .collect(),
                ));
            };
            states.push(state);
        }

        let Some(first) = states.first() else {
            return Ok(None);
        };

        if states.iter().any(|s| s.subjects_dir != first.subjects_dir) {
            return Err(JoinBarrierMismatchError::new(
                self.name.clone(),
                "subjects_dir",
                states.iter().map(|s| s.subjects_dir.display().to_string()).collect(),
            ));
        }
        if states.iter().any(|s| s.subject_id != first.subject_id) {
            return Err(JoinBarrierMismatchError::new(
                self.name.clone(),
                "subject_id",
                states.iter().map(|s| s.subject_id.clone()).collect(),
            ));
        }
        Ok(Some((*first).clone()))
    }
}
