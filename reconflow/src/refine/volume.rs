//! Dense 3D rasters in an explicit coordinate frame.

use super::affine::{Affine, AFFINE_TOLERANCE};
use crate::core::Frame;
use crate::errors::{FrameMismatchError, VolumeError};
use std::collections::BTreeSet;

/// A dense 3D raster, x fastest.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume<T> {
    shape: [usize; 3],
    frame: Frame,
    affine: Affine,
    data: Vec<T>,
}

/// A binary raster.
pub type Mask = Volume<bool>;

/// A labelled segmentation raster.
pub type LabelVolume = Volume<u16>;

/// An anatomical intensity raster.
pub type IntensityVolume = Volume<f32>;

impl<T: Copy> Volume<T> {
    /// Creates a volume from raw data.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::ShapeMismatch`] if `data` does not fill `shape`.
    pub fn new(shape: [usize; 3], frame: Frame, affine: Affine, data: Vec<T>) -> Result<Self, VolumeError> {
        let expected = shape.iter().product();
        if data.len() != expected {
            return Err(VolumeError::ShapeMismatch {
                shape,
                expected,
                found: data.len(),
            });
        }
        Ok(Self {
            shape,
            frame,
            affine,
            data,
        })
    }

    /// Creates a volume filled with one value.
    #[must_use]
    pub fn filled(shape: [usize; 3], frame: Frame, affine: Affine, value: T) -> Self {
        Self {
            shape,
            frame,
            affine,
            data: vec![value; shape.iter().product()],
        }
    }

    /// Creates a volume on the same grid as `self` with new data.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::ShapeMismatch`] if `data` does not fill the grid.
    pub fn with_data<U: Copy>(&self, data: Vec<U>) -> Result<Volume<U>, VolumeError> {
        Volume::new(self.shape, self.frame, self.affine, data)
    }

    /// Builds a volume on this grid from data of matching length.
    pub(crate) fn regrid<U>(&self, data: Vec<U>) -> Volume<U> {
        debug_assert_eq!(data.len(), self.data.len());
        Volume {
            shape: self.shape,
            frame: self.frame,
            affine: self.affine,
            data,
        }
    }

    /// Returns the grid shape.
    #[must_use]
    pub const fn shape(&self) -> [usize; 3] {
        self.shape
    }

    /// Returns the coordinate frame.
    #[must_use]
    pub const fn frame(&self) -> Frame {
        self.frame
    }

    /// Returns the voxel-to-world affine.
    #[must_use]
    pub const fn affine(&self) -> &Affine {
        &self.affine
    }

    /// Returns the voxel data.
    #[must_use]
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Consumes the volume and returns the voxel data.
    #[must_use]
    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Returns the number of voxels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true for a zero-sized grid.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the linear index of a voxel.
    #[must_use]
    pub const fn index(&self, x: usize, y: usize, z: usize) -> usize {
        x + self.shape[0] * (y + self.shape[1] * z)
    }

    /// Returns the voxel coordinates of a linear index.
    #[must_use]
    pub const fn coords(&self, index: usize) -> [usize; 3] {
        let x = index % self.shape[0];
        let rest = index / self.shape[0];
        [x, rest % self.shape[1], rest / self.shape[1]]
    }

    /// Returns the value at a voxel.
    #[must_use]
    pub fn get(&self, x: usize, y: usize, z: usize) -> T {
        self.data[self.index(x, y, z)]
    }

    /// Sets the value at a voxel.
    pub fn set(&mut self, x: usize, y: usize, z: usize, value: T) {
        let i = self.index(x, y, z);
        self.data[i] = value;
    }

    /// Maps every voxel onto a new volume on the same grid.
    #[must_use]
    pub fn map<U, F: Fn(T) -> U>(&self, f: F) -> Volume<U> {
        Volume {
            shape: self.shape,
            frame: self.frame,
            affine: self.affine,
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    /// Returns true if both volumes share shape, frame and affine.
    #[must_use]
    pub fn same_grid<U>(&self, other: &Volume<U>) -> bool {
        self.shape == other.shape
            && self.frame == other.frame
            && self.affine.approx_eq(&other.affine, AFFINE_TOLERANCE)
    }

    /// Checks that `other` lies on the grid of `self`.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameMismatchError`] naming `input` otherwise.
    pub fn check_grid<U>(&self, input: &str, other: &Volume<U>) -> Result<(), FrameMismatchError> {
        if self.same_grid(other) {
            return Ok(());
        }
        Err(FrameMismatchError {
            input: input.to_string(),
            expected_frame: self.frame,
            expected_shape: self.shape,
            found_frame: other.frame,
            found_shape: other.shape,
            affine_differs: !self.affine.approx_eq(&other.affine, AFFINE_TOLERANCE),
        })
    }
}

impl Mask {
    /// Returns the number of foreground voxels.
    #[must_use]
    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&v| v).count()
    }

    /// Returns true if no voxel is foreground.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        !self.data.iter().any(|&v| v)
    }

    /// Returns true if every foreground voxel of `self` is foreground in `other`.
    #[must_use]
    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.data.iter().zip(&other.data).all(|(&a, &b)| !a || b)
    }
}

/// A closed set of segmentation labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSet {
    name: String,
    labels: BTreeSet<u16>,
}

impl LabelSet {
    /// Creates a label set.
    #[must_use]
    pub fn new(name: impl Into<String>, labels: impl IntoIterator<Item = u16>) -> Self {
        Self {
            name: name.into(),
            labels: labels.into_iter().collect(),
        }
    }

    /// FreeSurfer `aseg`/`aparc+aseg` labels, including cortical parcels.
    #[must_use]
    pub fn freesurfer() -> Self {
        let subcortical: [u16; 45] = [
            0, 2, 3, 4, 5, 7, 8, 10, 11, 12, 13, 14, 15, 16, 17, 18, 24, 26, 28, 30, 31, 41, 42, 43, 44,
            46, 47, 49, 50, 51, 52, 53, 54, 58, 60, 62, 63, 72, 77, 80, 85, 251, 252, 253, 254,
        ];
        let labels = subcortical
            .into_iter()
            .chain([255])
            .chain(1000..=1035)
            .chain(2000..=2035);
        Self::new("freesurfer", labels)
    }

    /// Returns the set name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if `label` belongs to the set.
    #[must_use]
    pub fn contains(&self, label: u16) -> bool {
        self.labels.contains(&label)
    }

    /// Checks every voxel of a segmentation against the set.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::UnknownLabel`] for the first foreign label.
    pub fn validate(&self, volume: &LabelVolume) -> Result<(), VolumeError> {
        match volume.data().iter().position(|&l| !self.contains(l)) {
            None => Ok(()),
            Some(i) => Err(VolumeError::UnknownLabel {
                label: volume.data()[i],
                voxel: volume.coords(i),
                set: self.name.clone(),
            }),
        }
    }
}
