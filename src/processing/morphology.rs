//! Grey-level morphology with a cubic structuring element, applied as
//! three one-dimensional passes.

use ndarray::{Array3, Axis};

use super::rank_axis;

fn separable(data: &Array3<f32>, radius: usize, pick: fn(f32, f32) -> f32) -> Array3<f32> {
    if radius == 0 {
        return data.clone();
    }
    let out = rank_axis(data, Axis(0), radius, pick);
    let out = rank_axis(&out, Axis(1), radius, pick);
    rank_axis(&out, Axis(2), radius, pick)
}

pub(super) fn erode(data: &Array3<f32>, radius: usize) -> Array3<f32> {
    separable(data, radius, f32::min)
}

pub(super) fn dilate(data: &Array3<f32>, radius: usize) -> Array3<f32> {
    separable(data, radius, f32::max)
}
