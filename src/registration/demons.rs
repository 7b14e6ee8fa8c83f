use ndarray::{Array3, Zip};

use crate::interpolator::Interpolator;
use crate::processing::gaussian_blur;

/// Per-voxel displacement on the fixed grid, in millimetres.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplacementField {
    pub x: Array3<f32>,
    pub y: Array3<f32>,
    pub z: Array3<f32>,
}

impl DisplacementField {
    pub fn zeros(dim: (usize, usize, usize)) -> Self {
        Self {
            x: Array3::zeros(dim),
            y: Array3::zeros(dim),
            z: Array3::zeros(dim),
        }
    }

    pub fn dim(&self) -> (usize, usize, usize) {
        self.x.dim()
    }

    /// Displacement `[x, y, z]` at voxel `[z, y, x]`.
    pub fn at(&self, z: usize, y: usize, x: usize) -> [f64; 3] {
        [
            self.x[[z, y, x]] as f64,
            self.y[[z, y, x]] as f64,
            self.z[[z, y, x]] as f64,
        ]
    }

    pub fn max_magnitude(&self) -> f64 {
        Zip::from(&self.x)
            .and(&self.y)
            .and(&self.z)
            .fold(0.0f64, |acc, &x, &y, &z| {
                acc.max(((x * x + y * y + z * z) as f64).sqrt())
            })
    }
}

pub(crate) struct Demons<'a> {
    pub fixed: &'a Array3<f32>,
    /// Moving intensities already resampled onto the fixed grid.
    pub moving: &'a Array3<f32>,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub smoothing_sigma: f64,
}

pub(crate) struct DemonsResult {
    /// Displacement in voxels, `[dz, dy, dx]` per component array.
    pub field: [Array3<f32>; 3],
    pub warped: Array3<f32>,
    pub iterations: usize,
    pub converged: bool,
}

impl Demons<'_> {
    /// Thirion's demons with passive (fixed-image gradient) forces and a
    /// Gaussian-regularised field. Stops when the mean update length in
    /// voxels drops below `tolerance`.
    pub fn run(&self, mut on_iteration: impl FnMut(usize)) -> DemonsResult {
        let dim = self.fixed.raw_dim();
        let gradient = central_gradient(self.fixed);
        let gradient_sq = Zip::from(&gradient[0])
            .and(&gradient[1])
            .and(&gradient[2])
            .par_map_collect(|&gz, &gy, &gx| gz * gz + gy * gy + gx * gx);
        let voxels = self.fixed.len().max(1) as f64;

        let mut field = [
            Array3::zeros(dim.clone()),
            Array3::zeros(dim.clone()),
            Array3::zeros(dim),
        ];
        let mut warped = self.moving.clone();
        let mut iterations = 0;
        let mut converged = false;

        while iterations < self.max_iterations {
            iterations += 1;
            let scale = Zip::from(self.fixed)
                .and(&warped)
                .and(&gradient_sq)
                .par_map_collect(|&f, &m, &g2| {
                    let difference = f - m;
                    let denominator = g2 + difference * difference;
                    if denominator > 1e-9 { difference / denominator } else { 0.0 }
                });

            for (component, gradient) in field.iter_mut().zip(&gradient) {
                Zip::from(&mut *component)
                    .and(&scale)
                    .and(gradient)
                    .par_for_each(|d, &s, &g| *d += s * g);
                *component = gaussian_blur(component, self.smoothing_sigma);
            }
            warped = warp(self.moving, &field);

            let mean_update = Zip::from(&scale)
                .and(&gradient_sq)
                .fold(0.0f64, |acc, &s, &g2| acc + (s.abs() * g2.sqrt()) as f64)
                / voxels;
            on_iteration(iterations);
            if mean_update < self.tolerance {
                converged = true;
                break;
            }
        }

        DemonsResult {
            field,
            warped,
            iterations,
            converged,
        }
    }
}

/// Samples `image` at `x + d(x)`; samples falling outside read 0.
pub(crate) fn warp(image: &Array3<f32>, field: &[Array3<f32>; 3]) -> Array3<f32> {
    let mut out = Array3::zeros(image.raw_dim());
    Zip::indexed(&mut out).par_for_each(|(z, y, x), o| {
        let sz = z as f64 + field[0][[z, y, x]] as f64;
        let sy = y as f64 + field[1][[z, y, x]] as f64;
        let sx = x as f64 + field[2][[z, y, x]] as f64;
        *o = Interpolator::trilinear_interpolate(image, sz, sy, sx).unwrap_or(0.0);
    });
    out
}

/// Central differences `[d/dz, d/dy, d/dx]` in voxel units, one-sided at
/// the borders.
fn central_gradient(data: &Array3<f32>) -> [Array3<f32>; 3] {
    let (depth, height, width) = data.dim();
    let derivative = |index: [usize; 3], axis: usize, len: usize| -> f32 {
        if len < 2 {
            return 0.0;
        }
        let mut lo = index;
        let mut hi = index;
        lo[axis] = index[axis].saturating_sub(1);
        hi[axis] = (index[axis] + 1).min(len - 1);
        (data[hi] - data[lo]) / (hi[axis] - lo[axis]) as f32
    };
    let along = |axis: usize, len: usize| {
        let mut out = Array3::zeros(data.raw_dim());
        Zip::indexed(&mut out).par_for_each(|(z, y, x), o| *o = derivative([z, y, x], axis, len));
        out
    };
    [along(0, depth), along(1, height), along(2, width)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn gradient_of_a_ramp_is_constant() {
        let data = Array3::from_shape_fn((3, 4, 5), |(_, _, x)| 2.0 * x as f32);
        let [gz, gy, gx] = central_gradient(&data);
        assert!(gx.iter().all(|&g| (g - 2.0).abs() < 1e-6));
        assert!(gy.iter().all(|&g| g == 0.0));
        assert!(gz.iter().all(|&g| g == 0.0));
    }

    #[test]
    fn zero_field_warp_is_identity() {
        let data = Array3::from_shape_fn((3, 3, 3), |(z, y, x)| (z + y + x) as f32);
        let field = DisplacementField::zeros((3, 3, 3));
        let out = warp(&data, &[field.z, field.y, field.x]);
        assert_eq!(out, data);
    }

    #[test]
    fn max_magnitude_is_euclidean() {
        let mut field = DisplacementField::zeros((1, 1, 2));
        field.x[[0, 0, 1]] = 3.0;
        field.y[[0, 0, 1]] = 4.0;
        assert_relative_eq!(field.max_magnitude(), 5.0);
        assert_eq!(field.at(0, 0, 1), [3.0, 4.0, 0.0]);
    }
}
