//! Pipeline configuration.
//!
//! Loaded from a JSON file; every field except the subject and inputs has a
//! default. `RECONFLOW_SUBJECTS_DIR` and `RECONFLOW_OMP_NTHREADS` override
//! the file.

use crate::errors::ConfigError;
use crate::observability::LogFormat;
use crate::refine::RefineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable overriding [`PipelineConfig::subjects_dir`].
pub const ENV_SUBJECTS_DIR: &str = "RECONFLOW_SUBJECTS_DIR";

/// Environment variable overriding [`ResourceConfig::omp_nthreads`].
pub const ENV_OMP_NTHREADS: &str = "RECONFLOW_OMP_NTHREADS";

/// Root configuration of one subject's reconstruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Directory holding all subject directories.
    pub subjects_dir: PathBuf,
    /// Subject identifier.
    pub subject_id: String,
    /// Run the learned engine instead of the classical one.
    #[serde(default)]
    pub use_learned: bool,
    /// Request sub-millimetre reconstruction.
    #[serde(default)]
    pub hires: bool,
    /// Input field of view exceeds 256 mm.
    #[serde(default)]
    pub large_fov: bool,
    /// Externally supplied images.
    pub inputs: InputPaths,
    /// Thread and memory budget.
    #[serde(default)]
    pub resources: ResourceConfig,
    /// External tool commands.
    #[serde(default)]
    pub tools: ToolPaths,
    /// Mask refinement parameters.
    #[serde(default)]
    pub refine: RefineConfig,
    /// Options for the learned engine.
    #[serde(default)]
    pub fastsurfer: FastSurferOptions,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Externally supplied images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputPaths {
    /// Raw T1w image.
    pub t1w: PathBuf,
    /// Optional T2w image for pial refinement.
    #[serde(default)]
    pub t2w: Option<PathBuf>,
    /// Optional FLAIR image for pial refinement; ignored when a T2w is given.
    #[serde(default)]
    pub flair: Option<PathBuf>,
    /// Skull-stripped T1w injected into the classical engine.
    pub skull_stripped_t1w: PathBuf,
    /// Bias-corrected T1w used as refinement intensity reference.
    pub corrected_t1w: PathBuf,
    /// Brain mask from the external skull stripping.
    pub external_mask: PathBuf,
    /// Smallest voxel size of the T1w in mm, when known.
    #[serde(default)]
    pub min_voxel_mm: Option<f64>,
}

/// Thread and memory budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Threads per multithreaded stage.
    #[serde(default = "default_threads")]
    pub omp_nthreads: u32,
    /// Threads available to the whole run.
    #[serde(default = "default_threads")]
    pub nprocs: u32,
    /// Memory available to the whole run, in GB.
    #[serde(default = "default_mem_gb")]
    pub mem_gb: f64,
}

const fn default_threads() -> u32 {
    8
}

const fn default_mem_gb() -> f64 {
    16.0
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            omp_nthreads: default_threads(),
            nprocs: default_threads(),
            mem_gb: default_mem_gb(),
        }
    }
}

/// Commands used to launch external tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    /// Classical engine driver.
    pub recon_all: PathBuf,
    /// Learned engine driver.
    pub fastsurfer: PathBuf,
    /// Robust rigid registration.
    pub robust_register: PathBuf,
    /// LTA transform converter.
    pub lta_convert: PathBuf,
    /// Volume resampler.
    pub vol2vol: PathBuf,
    /// Surface format converter.
    pub mris_convert: PathBuf,
    /// Surface expansion (midthickness).
    pub mris_expand: PathBuf,
    /// Volume format converter.
    pub mri_convert: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            recon_all: "recon-all".into(),
            fastsurfer: "run_fastsurfer.sh".into(),
            robust_register: "mri_robust_register".into(),
            lta_convert: "lta_convert".into(),
            vol2vol: "mri_vol2vol".into(),
            mris_convert: "mris_convert".into(),
            mris_expand: "mris_expand".into(),
            mri_convert: "mri_convert".into(),
        }
    }
}

/// Options for the learned engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastSurferOptions {
    /// Run spherical registration (`--surfreg`).
    #[serde(default = "default_true")]
    pub surfreg: bool,
    /// Process hemispheres in parallel (`--parallel`).
    #[serde(default = "default_true")]
    pub parallel: bool,
    /// FreeSurfer license file (`--fs_license`).
    #[serde(default)]
    pub fs_license: Option<PathBuf>,
}

const fn default_true() -> bool {
    true
}

impl Default for FastSurferOptions {
    fn default() -> Self {
        Self {
            surfreg: true,
            parallel: true,
            fs_license: None,
        }
    }
}

impl PipelineConfig {
    /// Creates a configuration with defaults for everything but the subject and inputs.
    #[must_use]
    pub fn new(subjects_dir: impl Into<PathBuf>, subject_id: impl Into<String>, inputs: InputPaths) -> Self {
        Self {
            subjects_dir: subjects_dir.into(),
            subject_id: subject_id.into(),
            use_learned: false,
            hires: false,
            large_fov: false,
            inputs,
            resources: ResourceConfig::default(),
            tools: ToolPaths::default(),
            refine: RefineConfig::default(),
            fastsurfer: FastSurferOptions::default(),
            log_format: LogFormat::default(),
        }
    }

    /// Loads a configuration file, applies environment overrides and validates.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or fails validation.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies overrides from a variable lookup (normally the process environment).
    ///
    /// # Errors
    ///
    /// Returns an error if an override cannot be parsed.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_SUBJECTS_DIR).filter(|d| !d.is_empty()) {
            self.subjects_dir = PathBuf::from(dir);
        }
        if let Some(threads) = lookup(ENV_OMP_NTHREADS) {
            self.resources.omp_nthreads = threads
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid(ENV_OMP_NTHREADS, format!("'{threads}' is not a thread count")))?;
        }
        Ok(())
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subject_id.trim().is_empty() {
            return Err(ConfigError::invalid("subject_id", "cannot be empty"));
        }
        if self.subject_id.contains(['/', '\\']) {
            return Err(ConfigError::invalid("subject_id", "must not contain path separators"));
        }
        if self.subjects_dir.as_os_str().is_empty() {
            return Err(ConfigError::invalid("subjects_dir", "cannot be empty"));
        }
        if self.resources.omp_nthreads == 0 {
            return Err(ConfigError::invalid("resources.omp_nthreads", "must be at least 1"));
        }
        if self.resources.nprocs < self.resources.omp_nthreads {
            return Err(ConfigError::invalid(
                "resources.nprocs",
                "must be at least resources.omp_nthreads",
            ));
        }
        if !(self.resources.mem_gb.is_finite() && self.resources.mem_gb > 0.0) {
            return Err(ConfigError::invalid("resources.mem_gb", "must be a positive number"));
        }
        self.refine.validate()
    }

    /// Returns true when sub-millimetre reconstruction applies.
    ///
    /// The flag only takes effect for inputs finer than 1 mm; an unknown voxel
    /// size defers to the flag.
    #[must_use]
    pub fn effective_hires(&self) -> bool {
        self.hires && self.inputs.min_voxel_mm.map_or(true, |v| v < 1.0)
    }
}
