//! Exclusive choice between the reconstruction engines.

use crate::errors::PathSelectionError;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

/// A reconstruction path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconPath {
    /// FreeSurfer `recon-all`.
    Classical,
    /// FastSurfer `run_fastsurfer.sh`.
    Learned,
}

impl fmt::Display for ReconPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Classical => f.write_str("classical"),
            Self::Learned => f.write_str("learned"),
        }
    }
}

/// Selector state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectorState {
    /// No path chosen yet.
    #[default]
    Unselected,
    /// The classical engine was chosen.
    Classical,
    /// The learned engine was chosen.
    Learned,
}

/// Chooses the reconstruction path once, at configuration time.
#[derive(Debug, Clone, Default)]
pub struct PathSelector {
    state: SelectorState,
    hires: bool,
}

impl PathSelector {
    /// Creates an unselected selector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> SelectorState {
        self.state
    }

    /// Returns the chosen path, if any.
    #[must_use]
    pub const fn path(&self) -> Option<ReconPath> {
        match self.state {
            SelectorState::Unselected => None,
            SelectorState::Classical => Some(ReconPath::Classical),
            SelectorState::Learned => Some(ReconPath::Learned),
        }
    }

    /// Returns true when the chosen path reconstructs at high resolution.
    #[must_use]
    pub const fn hires(&self) -> bool {
        self.hires
    }

    /// Makes the one allowed transition.
    ///
    /// The learned engine has no high-resolution mode; the flag is accepted
    /// and ignored with a warning.
    ///
    /// # Errors
    ///
    /// Returns a [`PathSelectionError`] if a path was already selected.
    pub fn select(&mut self, use_learned: bool, hires: bool) -> Result<ReconPath, PathSelectionError> {
        let requested = if use_learned { ReconPath::Learned } else { ReconPath::Classical };
        if let Some(current) = self.path() {
            return Err(PathSelectionError {
                current: current.to_string(),
                requested: requested.to_string(),
            });
        }

        match requested {
            ReconPath::Classical => {
                self.state = SelectorState::Classical;
                self.hires = hires;
            }
            ReconPath::Learned => {
                if hires {
                    warn!("high-resolution reconstruction is not supported by the learned engine, ignoring");
                }
                self.state = SelectorState::Learned;
                self.hires = false;
            }
        }
        info!(path = %requested, hires = self.hires, "reconstruction path selected");
        Ok(requested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_transition() {
        let mut selector = PathSelector::new();
        assert_eq!(selector.state(), SelectorState::Unselected);
        assert_eq!(selector.path(), None);

        assert_eq!(selector.select(false, true).unwrap(), ReconPath::Classical);
        assert!(selector.hires());

        let err = selector.select(true, false).unwrap_err();
        assert_eq!(err.current, "classical");
        assert_eq!(err.requested, "learned");
        assert_eq!(selector.state(), SelectorState::Classical);
    }

    #[test]
    fn test_reselecting_same_path_fails() {
        let mut selector = PathSelector::new();
        selector.select(true, false).unwrap();
        assert!(selector.select(true, false).is_err());
    }

    #[test]
    fn test_learned_ignores_hires() {
        let mut selector = PathSelector::new();
        assert_eq!(selector.select(true, true).unwrap(), ReconPath::Learned);
        assert!(!selector.hires());
        assert_eq!(selector.state(), SelectorState::Learned);
    }
}
