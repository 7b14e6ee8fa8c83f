use std::collections::VecDeque;

use ndarray::{Array2, Array3, ArrayView2, Axis, Zip};
use rayon::prelude::*;

use super::{convolve_axis, gaussian_kernel};

const DERIVATIVE: [f32; 3] = [-1.0, 0.0, 1.0];
const SMOOTH: [f32; 3] = [1.0, 2.0, 1.0];

/// Sobel derivative along `along`, smoothed along the `others`.
fn sobel_axis(data: &Array3<f32>, along: Axis, others: &[Axis]) -> Array3<f32> {
    let mut out = convolve_axis(data, along, &DERIVATIVE);
    for &axis in others {
        out = convolve_axis(&out, axis, &SMOOTH);
    }
    out
}

pub(super) fn sobel_magnitude(data: &Array3<f32>) -> Array3<f32> {
    let gz = sobel_axis(data, Axis(0), &[Axis(1), Axis(2)]);
    let gy = sobel_axis(data, Axis(1), &[Axis(0), Axis(2)]);
    let mut out = sobel_axis(data, Axis(2), &[Axis(0), Axis(1)]);
    Zip::from(&mut out)
        .and(&gy)
        .and(&gz)
        .par_for_each(|gx, &gy, &gz| *gx = (*gx * *gx + gy * gy + gz * gz).sqrt());
    out
}

/// Canny on each axial slice. Output voxels are 1 on edges, 0 elsewhere.
pub(super) fn canny(
    data: &Array3<f32>,
    low: f32,
    high: f32,
    progress: &mut dyn FnMut(u8),
) -> Array3<f32> {
    let kernel = gaussian_kernel(1.0);
    let smoothed = convolve_axis(&convolve_axis(data, Axis(1), &kernel), Axis(2), &kernel);
    progress(25);
    let gy = sobel_axis(&smoothed, Axis(1), &[Axis(2)]);
    let gx = sobel_axis(&smoothed, Axis(2), &[Axis(1)]);
    progress(50);

    let mut out = Array3::zeros(data.raw_dim());
    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(gx.axis_iter(Axis(0)).into_par_iter())
        .zip(gy.axis_iter(Axis(0)).into_par_iter())
        .for_each(|((mut plane, gx), gy)| {
            let thinned = suppress_non_maxima(gx, gy);
            plane.assign(&hysteresis(&thinned, low, high));
        });
    out
}

/// Keeps gradient magnitudes that are maximal across the edge, with the
/// gradient direction quantised to 0, 45, 90 or 135 degrees.
fn suppress_non_maxima(gx: ArrayView2<'_, f32>, gy: ArrayView2<'_, f32>) -> Array2<f32> {
    let (height, width) = gx.dim();
    let magnitude = Zip::from(&gx).and(&gy).map_collect(|&x, &y| x.hypot(y));
    let at = |y: isize, x: isize| {
        if y < 0 || x < 0 || y >= height as isize || x >= width as isize {
            0.0
        } else {
            magnitude[[y as usize, x as usize]]
        }
    };

    Array2::from_shape_fn((height, width), |(y, x)| {
        let m = magnitude[[y, x]];
        if m <= 0.0 {
            return 0.0;
        }
        let mut angle = gy[[y, x]].atan2(gx[[y, x]]).to_degrees();
        if angle < 0.0 {
            angle += 180.0;
        }
        let (dy, dx) = match angle {
            a if !(22.5..157.5).contains(&a) => (0, 1),
            a if a < 67.5 => (1, 1),
            a if a < 112.5 => (1, 0),
            _ => (1, -1),
        };
        let (y, x) = (y as isize, x as isize);
        if m >= at(y + dy, x + dx) && m >= at(y - dy, x - dx) {
            m
        } else {
            0.0
        }
    })
}

/// Marks strong pixels (>= `high`) and the weak pixels (>= `low`)
/// 8-connected to them.
fn hysteresis(magnitude: &Array2<f32>, low: f32, high: f32) -> Array2<f32> {
    let (height, width) = magnitude.dim();
    let mut edges = Array2::zeros((height, width));
    let mut queue: VecDeque<(usize, usize)> = magnitude
        .indexed_iter()
        .filter(|&(_, &m)| m > 0.0 && m >= high)
        .map(|(index, _)| index)
        .collect();
    for &index in &queue {
        edges[index] = 1.0;
    }

    while let Some((y, x)) = queue.pop_front() {
        for ny in y.saturating_sub(1)..=(y + 1).min(height - 1) {
            for nx in x.saturating_sub(1)..=(x + 1).min(width - 1) {
                let m = magnitude[[ny, nx]];
                if edges[[ny, nx]] == 0.0 && m > 0.0 && m >= low {
                    edges[[ny, nx]] = 1.0;
                    queue.push_back((ny, nx));
                }
            }
        }
    }
    edges
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(width: usize) -> Array3<f32> {
        Array3::from_shape_fn((3, 8, width), |(_, _, x)| if x < width / 2 { 0.0 } else { 100.0 })
    }

    #[test]
    fn sobel_is_zero_on_flat_regions() {
        let out = sobel_magnitude(&step(10));
        assert_eq!(out[[1, 4, 1]], 0.0);
        assert!(out[[1, 4, 4]] > 0.0);
        assert!(out[[1, 4, 5]] > 0.0);
        assert_eq!(out[[1, 4, 8]], 0.0);
    }

    #[test]
    fn canny_finds_a_thin_vertical_edge() {
        let out = canny(&step(12), 10.0, 50.0, &mut |_| {});
        for y in 1..7 {
            let row: Vec<f32> = (0..12).map(|x| out[[1, y, x]]).collect();
            let count = row.iter().filter(|&&v| v == 1.0).count();
            assert!((1..=2).contains(&count), "row {y}: {row:?}");
            assert!(row[5] == 1.0 || row[6] == 1.0);
        }
        assert_eq!(out[[1, 4, 0]], 0.0);
    }

    #[test]
    fn weak_pixels_need_a_strong_neighbour() {
        let magnitude = Array2::from_shape_vec(
            (3, 5),
            vec![
                0.0, 0.0, 0.0, 0.0, 0.0, //
                9.0, 5.0, 0.0, 5.0, 0.0, //
                0.0, 0.0, 0.0, 0.0, 0.0,
            ],
        )
        .unwrap();
        let edges = hysteresis(&magnitude, 4.0, 8.0);
        assert_eq!(edges[[1, 0]], 1.0);
        assert_eq!(edges[[1, 1]], 1.0);
        assert_eq!(edges[[1, 3]], 0.0);
    }
}
