//! Stage status enum.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The outcome of a stage that the scheduler has finished with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage completed successfully.
    Ok,
    /// Stage was skipped because its outputs were already present.
    Skip,
    /// Stage failed.
    Fail,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Skip => write!(f, "skip"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

impl StageStatus {
    /// Returns true if the status indicates success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Ok | Self::Skip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_status_display() {
        assert_eq!(StageStatus::Ok.to_string(), "ok");
        assert_eq!(StageStatus::Skip.to_string(), "skip");
        assert_eq!(StageStatus::Fail.to_string(), "fail");
    }

    #[test]
    fn test_stage_status_is_success() {
        assert!(StageStatus::Ok.is_success());
        assert!(StageStatus::Skip.is_success());
        assert!(!StageStatus::Fail.is_success());
    }

    #[test]
    fn test_stage_status_serialize() {
        let json = serde_json::to_string(&StageStatus::Skip).unwrap();
        assert_eq!(json, r#""skip""#);

        let deserialized: StageStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, StageStatus::Skip);
        assert!(serde_json::from_str::<StageStatus>(r#""pending""#).is_err());
    }
}
