//! 4x4 voxel-to-world and frame-to-frame affine transforms.

use crate::errors::TransformError;
use serde::{Deserialize, Serialize};

const SINGULAR_EPS: f64 = 1e-12;

/// Default tolerance for [`Affine::approx_eq`].
pub const AFFINE_TOLERANCE: f64 = 1e-4;

/// A homogeneous 4x4 affine transform, row-major.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "[[f64; 4]; 4]", into = "[[f64; 4]; 4]")]
pub struct Affine([[f64; 4]; 4]);

impl Affine {
    /// The identity transform.
    #[must_use]
    pub const fn identity() -> Self {
        Self([
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ])
    }

    /// Creates an affine from rows.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::NotAffine`] if the bottom row is not `[0, 0, 0, 1]`.
    pub fn from_rows(rows: [[f64; 4]; 4]) -> Result<Self, TransformError> {
        let bottom = rows[3];
        if bottom != [0.0, 0.0, 0.0, 1.0] {
            return Err(TransformError::NotAffine { row: bottom });
        }
        Ok(Self(rows))
    }

    /// Creates a scaling and translation transform.
    #[must_use]
    pub const fn from_zooms(zooms: [f64; 3], origin: [f64; 3]) -> Self {
        Self([
            [zooms[0], 0.0, 0.0, origin[0]],
            [0.0, zooms[1], 0.0, origin[1]],
            [0.0, 0.0, zooms[2], origin[2]],
            [0.0, 0.0, 0.0, 1.0],
        ])
    }

    /// Returns the rows.
    #[must_use]
    pub const fn rows(&self) -> &[[f64; 4]; 4] {
        &self.0
    }

    /// Returns the voxel sizes encoded in the linear part.
    #[must_use]
    pub fn zooms(&self) -> [f64; 3] {
        let m = &self.0;
        let mut zooms = [0.0; 3];
        for (col, zoom) in zooms.iter_mut().enumerate() {
            *zoom = (0..3).map(|row| m[row][col] * m[row][col]).sum::<f64>().sqrt();
        }
        zooms
    }

    /// Returns the determinant of the linear part.
    #[must_use]
    pub fn determinant(&self) -> f64 {
        let m = &self.0;
        m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
    }

    /// Returns the inverse transform.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::Singular`] if the linear part is not invertible.
    pub fn inverse(&self) -> Result<Self, TransformError> {
        let determinant = self.determinant();
        if determinant.abs() < SINGULAR_EPS {
            return Err(TransformError::Singular { determinant });
        }

        // Gauss-Jordan with partial pivoting on [M | I].
        let mut a = self.0;
        let mut inv = Self::identity().0;
        for col in 0..4 {
            let pivot = (col..4)
                .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
                .unwrap_or(col);
            if a[pivot][col].abs() < SINGULAR_EPS {
                return Err(TransformError::Singular { determinant });
            }
            a.swap(col, pivot);
            inv.swap(col, pivot);

            let p = a[col][col];
            for k in 0..4 {
                a[col][k] /= p;
                inv[col][k] /= p;
            }
            for row in 0..4 {
                if row == col {
                    continue;
                }
                let factor = a[row][col];
                if factor == 0.0 {
                    continue;
                }
                for k in 0..4 {
                    a[row][k] -= factor * a[col][k];
                    inv[row][k] -= factor * inv[col][k];
                }
            }
        }
        Ok(Self(inv))
    }

    /// Returns `self * other`: apply `other` first, then `self`.
    #[must_use]
    pub fn compose(&self, other: &Self) -> Self {
        let mut out = [[0.0; 4]; 4];
        for (i, row) in out.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = (0..4).map(|k| self.0[i][k] * other.0[k][j]).sum();
            }
        }
        Self(out)
    }

    /// Applies the transform to a point.
    #[must_use]
    pub fn apply(&self, point: [f64; 3]) -> [f64; 3] {
        let m = &self.0;
        let mut out = [0.0; 3];
        for (i, value) in out.iter_mut().enumerate() {
            *value = m[i][0] * point[0] + m[i][1] * point[1] + m[i][2] * point[2] + m[i][3];
        }
        out
    }

    /// Returns true if every element differs by at most `tolerance`.
    #[must_use]
    pub fn approx_eq(&self, other: &Self, tolerance: f64) -> bool {
        self.0
            .iter()
            .flatten()
            .zip(other.0.iter().flatten())
            .all(|(a, b)| (a - b).abs() <= tolerance)
    }
}

impl Default for Affine {
    fn default() -> Self {
        Self::identity()
    }
}

impl TryFrom<[[f64; 4]; 4]> for Affine {
    type Error = TransformError;

    fn try_from(rows: [[f64; 4]; 4]) -> Result<Self, Self::Error> {
        Self::from_rows(rows)
    }
}

impl From<Affine> for [[f64; 4]; 4] {
    fn from(affine: Affine) -> Self {
        affine.0
    }
}
