//! Staged wave scheduling.
//!
//! A [`WavePlan`] is an explicit list of waves; [`WaveScheduler`] runs it
//! against a [`ResourceBudget`], checking [`JoinBarrier`]s between waves of
//! per-hemisphere stages. The classical engine's resume phase is the fixed
//! plan built by [`resume_plan`].

mod barrier;
mod budget;
mod executor;
mod resume;
mod wave;

pub use barrier::JoinBarrier;
pub use budget::{ResourceBudget, ResourceLease};
pub use executor::{ScheduleReport, WaveScheduler};
pub use resume::{resume_plan, ResumeOptions, ResumeStage};
pub use wave::{Wave, WavePlan};
