//! Artifact keys, hemispheres and coordinate frames.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A cortical hemisphere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Hemisphere {
    /// Left hemisphere (`lh`).
    #[serde(rename = "lh")]
    Left,
    /// Right hemisphere (`rh`).
    #[serde(rename = "rh")]
    Right,
}

impl Hemisphere {
    /// Both hemispheres, left first.
    pub const BOTH: [Self; 2] = [Self::Left, Self::Right];

    /// Returns the FreeSurfer prefix (`lh` or `rh`).
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Left => "lh",
            Self::Right => "rh",
        }
    }
}

impl fmt::Display for Hemisphere {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Surfaces exposed by both reconstruction engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceKind {
    /// Gray/white matter boundary.
    White,
    /// Pial surface.
    Pial,
    /// Inflated surface.
    Inflated,
    /// Surface halfway between white and pial.
    Midthickness,
}

impl SurfaceKind {
    /// All surface kinds in output order.
    pub const ALL: [Self; 4] = [Self::White, Self::Pial, Self::Inflated, Self::Midthickness];

    /// Returns the FreeSurfer file suffix.
    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::White => "white",
            Self::Pial => "pial",
            Self::Inflated => "inflated",
            Self::Midthickness => "midthickness",
        }
    }
}

impl fmt::Display for SurfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Identifies one artifact of a subject in the artifact store.
///
/// Keys are the unit of linkage between stages: an edge exists from the
/// stage producing a key to every stage consuming it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKey {
    /// Raw T1-weighted image (native space).
    T1w,
    /// Optional T2-weighted image used for pial refinement.
    T2w,
    /// Optional FLAIR image used for pial refinement.
    Flair,
    /// Externally skull-stripped T1w.
    SkullStrippedT1w,
    /// Bias-corrected T1w, the intensity reference for refinement.
    CorrectedT1w,
    /// Brain mask computed by the external skull-stripping tool.
    ExternalMask,
    /// The subject directory handle inside the subjects directory.
    SubjectDir,
    /// The conformed T1 in reconstruction space.
    ReconT1,
    /// The external brain mask injected into the subject directory.
    InjectedBrainmask,
    /// Anatomical segmentation in reconstruction space.
    ReconAseg,
    /// Cortical parcellation merged into the segmentation, reconstruction space.
    ReconAparcAseg,
    /// A surface in the engine's native file format.
    ReconSurface(Hemisphere, SurfaceKind),
    /// Reconstruction-to-native affine.
    FsnativeToT1w,
    /// Native-to-reconstruction affine (inverse of [`Self::FsnativeToT1w`]).
    T1wToFsnative,
    /// A surface converted for downstream consumers.
    Surface(Hemisphere, SurfaceKind),
    /// Anatomical segmentation resampled into native space.
    Aseg,
    /// Parcellation segmentation resampled into native space.
    AparcAseg,
    /// Consensus brain mask in native space.
    Brainmask,
    /// Any other artifact, named by its path relative to the subject directory.
    Custom(String),
}

impl ArtifactKey {
    /// Creates a custom key from a subject-relative path.
    #[must_use]
    pub fn custom(relative: impl Into<String>) -> Self {
        Self::Custom(relative.into())
    }

    /// Returns true for artifacts that are supplied from outside the subject tree.
    #[must_use]
    pub const fn is_external_input(&self) -> bool {
        matches!(
            self,
            Self::T1w
                | Self::T2w
                | Self::Flair
                | Self::SkullStrippedT1w
                | Self::CorrectedT1w
                | Self::ExternalMask
        )
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::T1w => f.write_str("t1w"),
            Self::T2w => f.write_str("t2w"),
            Self::Flair => f.write_str("flair"),
            Self::SkullStrippedT1w => f.write_str("skullstripped_t1w"),
            Self::CorrectedT1w => f.write_str("corrected_t1w"),
            Self::ExternalMask => f.write_str("external_mask"),
            Self::SubjectDir => f.write_str("subject_dir"),
            Self::ReconT1 => f.write_str("recon_t1"),
            Self::InjectedBrainmask => f.write_str("injected_brainmask"),
            Self::ReconAseg => f.write_str("recon_aseg"),
            Self::ReconAparcAseg => f.write_str("recon_aparc_aseg"),
            Self::ReconSurface(h, k) => write!(f, "recon_surface:{h}.{k}"),
            Self::FsnativeToT1w => f.write_str("fsnative2t1w_xfm"),
            Self::T1wToFsnative => f.write_str("t1w2fsnative_xfm"),
            Self::Surface(h, k) => write!(f, "surface:{h}.{k}"),
            Self::Aseg => f.write_str("aseg"),
            Self::AparcAseg => f.write_str("aparc_aseg"),
            Self::Brainmask => f.write_str("brainmask"),
            Self::Custom(rel) => write!(f, "custom:{rel}"),
        }
    }
}

/// The coordinate frame a raster or transform endpoint lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frame {
    /// The reconstruction engine's conformed space.
    Reconstruction,
    /// The subject's native T1w space.
    Native,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reconstruction => f.write_str("reconstruction"),
            Self::Native => f.write_str("native"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_key_display() {
        assert_eq!(ArtifactKey::FsnativeToT1w.to_string(), "fsnative2t1w_xfm");
        assert_eq!(
            ArtifactKey::ReconSurface(Hemisphere::Right, SurfaceKind::White).to_string(),
            "recon_surface:rh.white"
        );
        assert_eq!(ArtifactKey::custom("mri/ribbon.mgz").to_string(), "custom:mri/ribbon.mgz");
    }

    #[test]
    fn test_external_inputs() {
        assert!(ArtifactKey::ExternalMask.is_external_input());
        assert!(!ArtifactKey::SubjectDir.is_external_input());
        assert!(!ArtifactKey::Brainmask.is_external_input());
    }

    #[test]
    fn test_hemisphere_serialize() {
        let json = serde_json::to_string(&Hemisphere::Left).unwrap();
        assert_eq!(json, r#""lh""#);
    }
}
