//! Summed-volume tables for local gray-matter intensity statistics.

use super::volume::{IntensityVolume, LabelVolume};

/// Minimum standard deviation of a window.
pub const MIN_SIGMA: f64 = 1e-5;

/// Count, sum and sum of squares of gray-matter intensities, as 3D prefix sums.
///
/// Any axis-aligned window can then be summarised in constant time.
#[derive(Debug, Clone)]
pub struct WindowStats {
    dims: [usize; 3],
    count: Vec<f64>,
    sum: Vec<f64>,
    sumsq: Vec<f64>,
}

impl WindowStats {
    /// Builds the tables from voxels whose label is in `gm_labels`.
    #[must_use]
    pub fn build(labels: &LabelVolume, anat: &IntensityVolume, gm_labels: &[u16]) -> Self {
        let [nx, ny, nz] = labels.shape();
        let dims = [nx + 1, ny + 1, nz + 1];
        let size = dims.iter().product();
        let mut stats = Self {
            dims,
            count: vec![0.0; size],
            sum: vec![0.0; size],
            sumsq: vec![0.0; size],
        };

        for (i, (&label, &value)) in labels.data().iter().zip(anat.data()).enumerate() {
            if !gm_labels.contains(&label) {
                continue;
            }
            let [x, y, z] = labels.coords(i);
            let j = stats.at(x + 1, y + 1, z + 1);
            let value = f64::from(value);
            stats.count[j] = 1.0;
            stats.sum[j] = value;
            stats.sumsq[j] = value * value;
        }

        for table in [&mut stats.count, &mut stats.sum, &mut stats.sumsq] {
            accumulate(table, dims);
        }
        stats
    }

    const fn at(&self, x: usize, y: usize, z: usize) -> usize {
        x + self.dims[0] * (y + self.dims[1] * z)
    }

    fn box_sum(&self, table: &[f64], lo: [usize; 3], hi: [usize; 3]) -> f64 {
        let [x0, y0, z0] = lo;
        let [x1, y1, z1] = hi;
        table[self.at(x1, y1, z1)] - table[self.at(x0, y1, z1)] - table[self.at(x1, y0, z1)]
            - table[self.at(x1, y1, z0)]
            + table[self.at(x0, y0, z1)]
            + table[self.at(x0, y1, z0)]
            + table[self.at(x1, y0, z0)]
            - table[self.at(x0, y0, z0)]
    }

    /// Returns the mean and standard deviation of gray-matter intensities in
    /// the window of half-width `half_width` around `center`, clipped to the grid.
    ///
    /// Returns `None` when the window holds no gray-matter voxel.
    #[must_use]
    pub fn window(&self, center: [usize; 3], half_width: usize) -> Option<(f64, f64)> {
        let mut lo = [0; 3];
        let mut hi = [0; 3];
        for axis in 0..3 {
            lo[axis] = center[axis].saturating_sub(half_width);
            hi[axis] = (center[axis] + half_width + 1).min(self.dims[axis] - 1);
        }

        let n = self.box_sum(&self.count, lo, hi).round();
        if n < 0.5 {
            return None;
        }
        let mean = self.box_sum(&self.sum, lo, hi) / n;
        let variance = (self.box_sum(&self.sumsq, lo, hi) / n - mean * mean).max(0.0);
        Some((mean, variance.sqrt().max(MIN_SIGMA)))
    }
}

/// In-place prefix sums along each axis in turn.
fn accumulate(table: &mut [f64], dims: [usize; 3]) {
    let [dx, dy, dz] = dims;
    let idx = |x: usize, y: usize, z: usize| x + dx * (y + dy * z);
    for z in 0..dz {
        for y in 0..dy {
            for x in 1..dx {
                table[idx(x, y, z)] += table[idx(x - 1, y, z)];
            }
        }
    }
    for z in 0..dz {
        for y in 1..dy {
            for x in 0..dx {
                table[idx(x, y, z)] += table[idx(x, y - 1, z)];
            }
        }
    }
    for z in 1..dz {
        for y in 0..dy {
            for x in 0..dx {
                table[idx(x, y, z)] += table[idx(x, y, z - 1)];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Frame;
    use crate::refine::affine::Affine;
    use crate::refine::volume::Volume;

    fn naive(labels: &LabelVolume, anat: &IntensityVolume, c: [usize; 3], ww: usize) -> Option<(f64, f64)> {
        let [nx, ny, nz] = labels.shape();
        let mut samples = Vec::new();
        for z in c[2].saturating_sub(ww)..(c[2] + ww + 1).min(nz) {
            for y in c[1].saturating_sub(ww)..(c[1] + ww + 1).min(ny) {
                for x in c[0].saturating_sub(ww)..(c[0] + ww + 1).min(nx) {
                    if matches!(labels.get(x, y, z), 3 | 42) {
                        samples.push(f64::from(anat.get(x, y, z)));
                    }
                }
            }
        }
        if samples.is_empty() {
            return None;
        }
        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let var = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Some((mean, var.sqrt().max(MIN_SIGMA)))
    }

    #[test]
    fn test_window_matches_direct_computation() {
        let shape = [9, 7, 6];
        let n: usize = shape.iter().product();
        let labels: Vec<u16> = (0..n).map(|i| [0, 3, 2, 42, 3][i % 5]).collect();
        let anat: Vec<f32> = (0..n).map(|i| ((i * 37) % 101) as f32).collect();
        let labels = Volume::new(shape, Frame::Native, Affine::identity(), labels).unwrap();
        let anat = Volume::new(shape, Frame::Native, Affine::identity(), anat).unwrap();

        let stats = WindowStats::build(&labels, &anat, &[3, 42]);
        for center in [[0, 0, 0], [4, 3, 2], [8, 6, 5], [2, 5, 1]] {
            for ww in [0, 1, 2, 7] {
                let (m1, s1) = stats.window(center, ww).unwrap_or((-1.0, -1.0));
                let (m2, s2) = naive(&labels, &anat, center, ww).unwrap_or((-1.0, -1.0));
                assert!((m1 - m2).abs() < 1e-6, "mean at {center:?} ww={ww}");
                assert!((s1 - s2).abs() < 1e-6, "std at {center:?} ww={ww}");
            }
        }
    }

    #[test]
    fn test_window_without_gray_matter() {
        let labels = Volume::filled([4, 4, 4], Frame::Native, Affine::identity(), 2u16);
        let anat = Volume::filled([4, 4, 4], Frame::Native, Affine::identity(), 50.0f32);

        let stats = WindowStats::build(&labels, &anat, &[3, 42]);
        assert!(stats.window([1, 1, 1], 7).is_none());
    }

    #[test]
    fn test_constant_window_floors_sigma() {
        let labels = Volume::filled([3, 3, 3], Frame::Native, Affine::identity(), 3u16);
        let anat = Volume::filled([3, 3, 3], Frame::Native, Affine::identity(), 80.0f32);

        let (mean, sigma) = WindowStats::build(&labels, &anat, &[3]).window([1, 1, 1], 1).unwrap();
        assert!((mean - 80.0).abs() < 1e-9);
        assert!((sigma - MIN_SIGMA).abs() < 1e-12);
    }
}
