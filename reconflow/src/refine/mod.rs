//! Consensus brain-mask refinement.
//!
//! The engine's anatomical segmentation is turned into a closed, hole-free
//! brain mask. Voxels in a thin band around it are then grown back in when
//! either the external mask claims them or their intensity is plausible gray
//! matter given the local cortical intensity distribution.

mod affine;
mod codec;
mod morphology;
mod nifti;
mod stage;
mod stats;
mod volume;

pub use affine::{Affine, AFFINE_TOLERANCE};
pub use codec::{FileVolumeCodec, RawVolumeCodec, VolumeCodec};
pub use morphology::{close, dilate, erode, fill_holes, Ball};
pub use nifti::{is_nifti, NiftiVolumeCodec};
pub use stage::RefineMaskStage;
pub use stats::{WindowStats, MIN_SIGMA};
pub use volume::{IntensityVolume, LabelSet, LabelVolume, Mask, Volume};

#[cfg(test)]
pub use codec::MockVolumeCodec;

use crate::errors::{ConfigError, ReconflowError, VolumeError};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Largest closing or band radius accepted, in voxels.
pub const MAX_BALL_RADIUS: usize = 32;

/// Largest statistics window half-width accepted, in voxels.
pub const MAX_WINDOW: usize = 64;

/// Refinement parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefineConfig {
    /// Radius of the closing ball.
    #[serde(default = "default_radius")]
    pub closing_radius: usize,
    /// Radius of the ball defining the search band.
    #[serde(default = "default_radius")]
    pub band_radius: usize,
    /// Half-width of the local statistics window.
    #[serde(default = "default_window")]
    pub window: usize,
    /// z-score threshold for accepting a band voxel.
    #[serde(default = "default_zval")]
    pub zval: f64,
    /// Labels treated as gray matter.
    #[serde(default = "default_gm_labels")]
    pub gm_labels: Vec<u16>,
}

const fn default_radius() -> usize {
    4
}

const fn default_window() -> usize {
    7
}

const fn default_zval() -> f64 {
    2.0
}

fn default_gm_labels() -> Vec<u16> {
    vec![3, 42]
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            closing_radius: default_radius(),
            band_radius: default_radius(),
            window: default_window(),
            zval: default_zval(),
            gm_labels: default_gm_labels(),
        }
    }
}

impl RefineConfig {
    /// Validates the parameters.
    ///
    /// # Errors
    ///
    /// Returns an error for a non-positive threshold, an empty gray-matter
    /// set, or a radius or window beyond [`MAX_BALL_RADIUS`] / [`MAX_WINDOW`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [("refine.closing_radius", self.closing_radius), ("refine.band_radius", self.band_radius)] {
            if value > MAX_BALL_RADIUS {
                return Err(ConfigError::invalid(field, format!("{value} exceeds {MAX_BALL_RADIUS} voxels")));
            }
        }
        if self.window > MAX_WINDOW {
            return Err(ConfigError::invalid(
                "refine.window",
                format!("{} exceeds {MAX_WINDOW} voxels", self.window),
            ));
        }
        if !(self.zval.is_finite() && self.zval > 0.0) {
            return Err(ConfigError::invalid("refine.zval", "must be a positive number"));
        }
        if self.gm_labels.is_empty() {
            return Err(ConfigError::invalid("refine.gm_labels", "must name at least one label"));
        }
        Ok(())
    }
}

/// How much evidence backed a refined mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// The search band was evaluated against the external mask.
    High,
    /// The external mask was empty; only the segmentation-derived mask is returned.
    Low,
}

/// Result of one refinement.
#[derive(Debug, Clone)]
pub struct RefineOutcome {
    /// The consensus mask.
    pub mask: Mask,
    /// Confidence of the result.
    pub confidence: Confidence,
    /// Voxels in the search band.
    pub band_voxels: usize,
    /// Band voxels accepted because the external mask claims them.
    pub accepted_external: usize,
    /// Band voxels accepted on local gray-matter likelihood.
    pub accepted_likelihood: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BandVoxel {
    Outside,
    External,
    Likely,
    Rejected,
}

/// Closes the non-zero labels of a segmentation and fills enclosed holes.
#[must_use]
pub fn segmentation_mask(labels: &LabelVolume, closing_radius: usize) -> Mask {
    let brain = labels.map(|label| label != 0);
    fill_holes(&close(&brain, &Ball::new(closing_radius)))
}

/// Computes the consensus brain mask.
///
/// All three inputs must share frame, shape and affine.
///
/// # Errors
///
/// Returns a frame mismatch naming the first input off the anatomical grid,
/// or [`VolumeError::EmptyMask`] when the segmentation labels no brain voxel.
pub fn refine_brain_mask(
    external: &Mask,
    labels: &LabelVolume,
    anat: &IntensityVolume,
    config: &RefineConfig,
) -> Result<RefineOutcome, ReconflowError> {
    anat.check_grid("labels", labels)?;
    anat.check_grid("external_mask", external)?;

    let refined = segmentation_mask(labels, config.closing_radius);
    if refined.is_blank() {
        return Err(VolumeError::EmptyMask {
            name: "segmentation".to_string(),
        }
        .into());
    }

    if external.is_blank() {
        warn!(
            voxels = refined.count(),
            "external brain mask is empty, returning segmentation mask without band growth"
        );
        return Ok(RefineOutcome {
            mask: refined,
            confidence: Confidence::Low,
            band_voxels: 0,
            accepted_external: 0,
            accepted_likelihood: 0,
        });
    }

    let grown = dilate(&refined, &Ball::new(config.band_radius));
    let stats = WindowStats::build(labels, anat, &config.gm_labels);

    let decisions: Vec<BandVoxel> = (0..refined.len())
        .into_par_iter()
        .map(|i| {
            if !grown.data()[i] || refined.data()[i] {
                BandVoxel::Outside
            } else if external.data()[i] {
                BandVoxel::External
            } else {
                match stats.window(refined.coords(i), config.window) {
                    Some((mean, sigma)) if (f64::from(anat.data()[i]) - mean).abs() / sigma < config.zval => {
                        BandVoxel::Likely
                    }
                    _ => BandVoxel::Rejected,
                }
            }
        })
        .collect();

    let mut out = refined.data().to_vec();
    let mut band_voxels = 0;
    let mut accepted_external = 0;
    let mut accepted_likelihood = 0;
    for (i, decision) in decisions.into_iter().enumerate() {
        match decision {
            BandVoxel::Outside => continue,
            BandVoxel::External => accepted_external += 1,
            BandVoxel::Likely => accepted_likelihood += 1,
            BandVoxel::Rejected => {}
        }
        band_voxels += 1;
        out[i] |= decision != BandVoxel::Rejected;
    }

    debug!(band_voxels, accepted_external, accepted_likelihood, "search band evaluated");
    Ok(RefineOutcome {
        mask: refined.regrid(out),
        confidence: Confidence::High,
        band_voxels,
        accepted_external,
        accepted_likelihood,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Frame;
    use pretty_assertions::assert_eq;

    const SHAPE: [usize; 3] = [12, 12, 12];

    fn grid<T: Copy>(value: T) -> Volume<T> {
        Volume::filled(SHAPE, Frame::Native, Affine::identity(), value)
    }

    fn labelled_cube(lo: usize, hi: usize, label: u16) -> LabelVolume {
        let mut v = grid(0u16);
        for z in lo..hi {
            for y in lo..hi {
                for x in lo..hi {
                    v.set(x, y, z, label);
                }
            }
        }
        v
    }

    #[test]
    fn test_external_mask_voxels_join() {
        let labels = labelled_cube(4, 8, 3);
        let anat = labels.map(|l| if l == 3 { 100.0f32 } else { 0.0 });
        let mut external = grid(false);
        external.set(3, 5, 5, true);
        external.set(0, 0, 0, true);

        let outcome = refine_brain_mask(&external, &labels, &anat, &RefineConfig::default()).unwrap();

        assert_eq!(outcome.confidence, Confidence::High);
        assert!(outcome.mask.get(3, 5, 5));
        // Outside the band: external claims are ignored.
        assert!(!outcome.mask.get(0, 0, 0));
        assert_eq!(outcome.accepted_external, 1);
        assert_eq!(outcome.accepted_likelihood, 0);
        assert_eq!(outcome.mask.count(), 65);
    }

    #[test]
    fn test_likelihood_acceptance() {
        let labels = labelled_cube(4, 8, 3);
        let mut anat = grid(0.0f32);
        for (i, &label) in labels.data().iter().enumerate() {
            if label == 3 {
                let [x, y, z] = labels.coords(i);
                anat.set(x, y, z, if x % 2 == 0 { 90.0 } else { 110.0 });
            }
        }
        // Plausible gray matter next to the cube, implausible on the far side.
        anat.set(8, 5, 5, 100.0);
        anat.set(3, 5, 5, 400.0);
        let mut external = grid(false);
        external.set(11, 11, 11, true);

        let outcome = refine_brain_mask(&external, &labels, &anat, &RefineConfig::default()).unwrap();

        assert!(outcome.mask.get(8, 5, 5));
        assert!(!outcome.mask.get(3, 5, 5));
        assert!(outcome.accepted_likelihood > 0);
    }

    #[test]
    fn test_empty_external_mask_is_low_confidence() {
        let labels = labelled_cube(4, 8, 17);
        let outcome = refine_brain_mask(&grid(false), &labels, &grid(1.0f32), &RefineConfig::default()).unwrap();

        assert_eq!(outcome.confidence, Confidence::Low);
        assert_eq!(outcome.mask.count(), 64);
        assert_eq!(outcome.band_voxels, 0);
    }

    #[test]
    fn test_frame_mismatch() {
        let labels = labelled_cube(4, 8, 3);
        let native = grid(false);
        let recon = Volume::filled(SHAPE, Frame::Reconstruction, Affine::identity(), 0.0f32);

        let err = refine_brain_mask(&native, &labels, &recon, &RefineConfig::default()).unwrap_err();
        match err {
            ReconflowError::FrameMismatch(e) => {
                assert_eq!(e.input, "labels");
                assert_eq!(e.found_frame, Frame::Native);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unlabelled_segmentation_is_rejected() {
        let mut external = grid(false);
        for x in 4..10 {
            external.set(x, 5, 5, true);
        }

        let err = refine_brain_mask(&external, &grid(0u16), &grid(50.0f32), &RefineConfig::default()).unwrap_err();

        assert!(matches!(err, ReconflowError::Volume(VolumeError::EmptyMask { ref name }) if name == "segmentation"));
    }

    #[test]
    fn test_config_defaults_and_validation() {
        let config: RefineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, RefineConfig::default());
        assert_eq!(config.window, 7);

        let bad = RefineConfig {
            zval: 0.0,
            ..RefineConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_config_rejects_oversized_neighbourhoods() {
        let at_limit = RefineConfig {
            closing_radius: MAX_BALL_RADIUS,
            window: MAX_WINDOW,
            ..RefineConfig::default()
        };
        assert!(at_limit.validate().is_ok());

        for config in [
            RefineConfig {
                closing_radius: MAX_BALL_RADIUS + 1,
                ..RefineConfig::default()
            },
            RefineConfig {
                band_radius: usize::MAX,
                ..RefineConfig::default()
            },
            RefineConfig {
                window: usize::MAX / 2,
                ..RefineConfig::default()
            },
        ] {
            assert!(config.validate().is_err(), "{config:?}");
        }
    }
}
