//! Binary morphology on [`Mask`] volumes.

use super::volume::Mask;
use rayon::prelude::*;
use std::collections::VecDeque;

/// Offsets of a discrete ball structuring element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ball {
    radius: usize,
    offsets: Vec<[isize; 3]>,
}

impl Ball {
    /// Creates a ball of the given radius: all offsets with `|o|^2 <= r^2`.
    #[must_use]
    pub fn new(radius: usize) -> Self {
        let r = isize::try_from(radius).unwrap_or(isize::MAX / 4);
        let r2 = r * r;
        let mut offsets = Vec::new();
        for dz in -r..=r {
            for dy in -r..=r {
                for dx in -r..=r {
                    if dx * dx + dy * dy + dz * dz <= r2 {
                        offsets.push([dx, dy, dz]);
                    }
                }
            }
        }
        Self { radius, offsets }
    }

    /// Returns the radius.
    #[must_use]
    pub const fn radius(&self) -> usize {
        self.radius
    }

    /// Returns the offsets.
    #[must_use]
    pub fn offsets(&self) -> &[[isize; 3]] {
        &self.offsets
    }
}

const FACES: [[isize; 3]; 6] = [[1, 0, 0], [-1, 0, 0], [0, 1, 0], [0, -1, 0], [0, 0, 1], [0, 0, -1]];

fn shift(shape: [usize; 3], at: [usize; 3], offset: [isize; 3]) -> Option<usize> {
    let mut out = [0usize; 3];
    for axis in 0..3 {
        let moved = at[axis].checked_add_signed(offset[axis])?;
        if moved >= shape[axis] {
            return None;
        }
        out[axis] = moved;
    }
    Some(out[0] + shape[0] * (out[1] + shape[1] * out[2]))
}

/// Dilates a mask. Voxels outside the grid are ignored.
#[must_use]
pub fn dilate(mask: &Mask, ball: &Ball) -> Mask {
    let shape = mask.shape();
    let data = mask.data();
    // The ball is symmetric, so gathering from neighbours equals scattering to them.
    let out: Vec<bool> = (0..mask.len())
        .into_par_iter()
        .map(|i| {
            data[i] || {
                let at = mask.coords(i);
                ball.offsets()
                    .iter()
                    .any(|&offset| shift(shape, at, offset).is_some_and(|j| data[j]))
            }
        })
        .collect();
    mask.regrid(out)
}

/// Erodes a mask. Voxels outside the grid count as background.
#[must_use]
pub fn erode(mask: &Mask, ball: &Ball) -> Mask {
    let shape = mask.shape();
    let data = mask.data();
    let out: Vec<bool> = (0..mask.len())
        .into_par_iter()
        .map(|i| {
            data[i] && {
                let at = mask.coords(i);
                ball.offsets()
                    .iter()
                    .all(|&offset| shift(shape, at, offset).is_some_and(|j| data[j]))
            }
        })
        .collect();
    mask.regrid(out)
}

/// Returns the mask embedded in a zero border of `margin` voxels on every side.
fn pad(mask: &Mask, margin: usize) -> Mask {
    let [nx, ny, nz] = mask.shape();
    let padded = [nx + 2 * margin, ny + 2 * margin, nz + 2 * margin];
    let mut out = Mask::filled(padded, mask.frame(), *mask.affine(), false);
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                if mask.get(x, y, z) {
                    out.set(x + margin, y + margin, z + margin, true);
                }
            }
        }
    }
    out
}

/// Cuts the central region of shape `like` out of a padded mask.
fn crop(padded: &Mask, like: &Mask, margin: usize) -> Mask {
    let [nx, ny, nz] = like.shape();
    let mut out = like.map(|_| false);
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                out.set(x, y, z, padded.get(x + margin, y + margin, z + margin));
            }
        }
    }
    out
}

/// Morphological closing (dilation followed by erosion).
///
/// Computed on a domain extended by the ball radius so the result is
/// extensive and convex blobs touching the border are preserved.
#[must_use]
pub fn close(mask: &Mask, ball: &Ball) -> Mask {
    let margin = ball.radius() + 1;
    let padded = pad(mask, margin);
    let closed = erode(&dilate(&padded, ball), ball);
    crop(&closed, mask, margin)
}

/// Fills background regions not 6-connected to the grid border.
#[must_use]
pub fn fill_holes(mask: &Mask) -> Mask {
    let shape = mask.shape();
    let data = mask.data();
    let mut outside = vec![false; mask.len()];
    let mut queue = VecDeque::new();

    for (i, &fg) in data.iter().enumerate() {
        let [x, y, z] = mask.coords(i);
        let on_border = x == 0
            || y == 0
            || z == 0
            || x + 1 == shape[0]
            || y + 1 == shape[1]
            || z + 1 == shape[2];
        if on_border && !fg {
            outside[i] = true;
            queue.push_back(i);
        }
    }

    while let Some(i) = queue.pop_front() {
        let at = mask.coords(i);
        for offset in FACES {
            if let Some(j) = shift(shape, at, offset) {
                if !data[j] && !outside[j] {
                    outside[j] = true;
                    queue.push_back(j);
                }
            }
        }
    }

    mask.regrid(outside.into_iter().map(|o| !o).collect())
}
