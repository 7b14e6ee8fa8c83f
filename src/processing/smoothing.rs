use ndarray::{Array3, Axis, Zip};
use rayon::prelude::*;

use super::{convolve_axis, gaussian_kernel};

/// Largest stable explicit step for the 6-neighbour scheme.
pub(super) const MAX_DIFFUSION_STEP: f64 = 1.0 / 6.0;

/// Conductance scale as a fraction of the intensity range.
const CONDUCTANCE_FRACTION: f32 = 0.05;

pub(super) fn gaussian(
    data: &Array3<f32>,
    sigma: f64,
    progress: &mut dyn FnMut(u8),
) -> Array3<f32> {
    let kernel = gaussian_kernel(sigma);
    let mut out = convolve_axis(data, Axis(0), &kernel);
    progress(33);
    out = convolve_axis(&out, Axis(1), &kernel);
    progress(66);
    convolve_axis(&out, Axis(2), &kernel)
}

/// Gaussian blur without progress reporting.
pub(crate) fn gaussian_blur(data: &Array3<f32>, sigma: f64) -> Array3<f32> {
    gaussian(data, sigma, &mut |_| {})
}

/// Median of the cube of half-width `radius` around each voxel, clamped at
/// the borders.
pub(super) fn median(data: &Array3<f32>, radius: usize) -> Array3<f32> {
    if radius == 0 {
        return data.clone();
    }
    let (depth, height, width) = data.dim();
    let window = |center: usize, len: usize| {
        let r = radius as isize;
        (-r..=r).map(move |d| (center as isize + d).clamp(0, len as isize - 1) as usize)
    };

    let mut out = Array3::zeros(data.raw_dim());
    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(z, mut plane)| {
            let side = 2 * radius + 1;
            let mut samples = Vec::with_capacity(side * side * side);
            for ((y, x), o) in plane.indexed_iter_mut() {
                samples.clear();
                for zz in window(z, depth) {
                    for yy in window(y, height) {
                        for xx in window(x, width) {
                            samples.push(data[[zz, yy, xx]]);
                        }
                    }
                }
                let mid = samples.len() / 2;
                let (_, median, _) = samples.select_nth_unstable_by(mid, f32::total_cmp);
                *o = *median;
            }
        });
    out
}

/// Perona-Malik diffusion with exponential conductance. Voxels outside the
/// volume contribute no flux.
pub(super) fn anisotropic_diffusion(
    data: &Array3<f32>,
    iterations: usize,
    time_step: f32,
    progress: &mut dyn FnMut(u8),
) -> Array3<f32> {
    let (min, max) = data
        .iter()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let k = (max - min) * CONDUCTANCE_FRACTION;
    if !(k > 0.0) || iterations == 0 {
        return data.clone();
    }
    let conductance = |gradient: f32| (-(gradient / k).powi(2)).exp();

    let (depth, height, width) = data.dim();
    let mut current = data.clone();
    let mut next = Array3::zeros(data.raw_dim());
    for iteration in 0..iterations {
        Zip::indexed(&mut next).par_for_each(|(z, y, x), o| {
            let center = current[[z, y, x]];
            let mut flux = 0.0;
            let mut add = |neighbour: f32| {
                let gradient = neighbour - center;
                flux += conductance(gradient) * gradient;
            };
            if z > 0 {
                add(current[[z - 1, y, x]]);
            }
            if z + 1 < depth {
                add(current[[z + 1, y, x]]);
            }
            if y > 0 {
                add(current[[z, y - 1, x]]);
            }
            if y + 1 < height {
                add(current[[z, y + 1, x]]);
            }
            if x > 0 {
                add(current[[z, y, x - 1]]);
            }
            if x + 1 < width {
                add(current[[z, y, x + 1]]);
            }
            *o = center + time_step * flux;
        });
        std::mem::swap(&mut current, &mut next);
        progress((100 * (iteration + 1) / iterations) as u8);
    }
    current
}

pub(super) fn sharpen(
    data: &Array3<f32>,
    amount: f32,
    progress: &mut dyn FnMut(u8),
) -> Array3<f32> {
    let mut out = gaussian(data, 1.0, progress);
    Zip::from(&mut out).and(data).par_for_each(|blurred, &v| {
        *blurred = v + amount * (v - *blurred);
    });
    out
}
