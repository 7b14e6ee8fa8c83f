//! Geometric and intensity measurements. Points are continuous voxel
//! coordinates `[z, y, x]`; results are in millimetres via the spacing.

use std::fmt;

use rayon::prelude::*;
use serde::Serialize;

use crate::enums::{MeasurementTool, Orientation};
use crate::volume::Volume;

pub type VoxelPoint = [f64; 3];

fn to_mm(spacing: (f32, f32, f32), p: VoxelPoint) -> [f64; 3] {
    let (sx, sy, sz) = spacing;
    [p[2] * sx as f64, p[1] * sy as f64, p[0] * sz as f64]
}

pub fn distance_mm(spacing: (f32, f32, f32), a: VoxelPoint, b: VoxelPoint) -> f64 {
    let (a, b) = (to_mm(spacing, a), to_mm(spacing, b));
    a.iter()
        .zip(&b)
        .map(|(p, q)| (q - p) * (q - p))
        .sum::<f64>()
        .sqrt()
}

/// Angle at `vertex` between the rays to `a` and `b`, in degrees. `None`
/// when either ray has zero length.
pub fn angle_degrees(
    spacing: (f32, f32, f32),
    a: VoxelPoint,
    vertex: VoxelPoint,
    b: VoxelPoint,
) -> Option<f64> {
    let (a, v, b) = (to_mm(spacing, a), to_mm(spacing, vertex), to_mm(spacing, b));
    let u = [a[0] - v[0], a[1] - v[1], a[2] - v[2]];
    let w = [b[0] - v[0], b[1] - v[1], b[2] - v[2]];
    let norm = |r: [f64; 3]| (r[0] * r[0] + r[1] * r[1] + r[2] * r[2]).sqrt();
    let (nu, nw) = (norm(u), norm(w));
    if nu <= f64::EPSILON || nw <= f64::EPSILON {
        return None;
    }
    let cos = (u[0] * w[0] + u[1] * w[1] + u[2] * w[2]) / (nu * nw);
    Some(cos.clamp(-1.0, 1.0).acos().to_degrees())
}

/// Shoelace area of a polygon drawn on a slice of `orientation`. Vertices
/// are `[row, column]` pixel positions of that slice.
pub fn polygon_area_mm2(
    spacing: (f32, f32, f32),
    orientation: Orientation,
    vertices: &[[f64; 2]],
) -> f64 {
    if vertices.len() < 3 {
        return 0.0;
    }
    let (sx, sy, sz) = spacing;
    let (row_mm, col_mm) = match orientation {
        Orientation::Axial => (sy, sx),
        Orientation::Coronal => (sz, sx),
        Orientation::Sagittal => (sz, sy),
    };
    let twice_area: f64 = vertices
        .iter()
        .zip(vertices.iter().cycle().skip(1))
        .map(|(p, q)| p[1] * q[0] - q[1] * p[0])
        .sum();
    twice_area.abs() / 2.0 * row_mm as f64 * col_mm as f64
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VolumeStatistics {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub voxel_count: usize,
    /// Volume of the voxels above zero, in mm³.
    pub above_zero_mm3: f64,
}

impl VolumeStatistics {
    /// Statistics over the finite voxels; `None` when there are none.
    pub fn compute(volume: &Volume) -> Option<Self> {
        let (count, sum, sum_sq, min, max, positive) = volume
            .data()
            .par_iter()
            .filter(|v| v.is_finite())
            .map(|&v| {
                let v = v as f64;
                (1usize, v, v * v, v, v, usize::from(v > 0.0))
            })
            .reduce(
                || (0, 0.0, 0.0, f64::INFINITY, f64::NEG_INFINITY, 0),
                |a, b| (a.0 + b.0, a.1 + b.1, a.2 + b.2, a.3.min(b.3), a.4.max(b.4), a.5 + b.5),
            );
        if count == 0 {
            return None;
        }
        let mean = sum / count as f64;
        let variance = (sum_sq / count as f64 - mean * mean).max(0.0);
        let (sx, sy, sz) = volume.spacing();
        Some(Self {
            min,
            max,
            mean,
            std_dev: variance.sqrt(),
            voxel_count: count,
            above_zero_mm3: positive as f64 * sx as f64 * sy as f64 * sz as f64,
        })
    }
}

/// One measurement result as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub tool: MeasurementTool,
    pub value: f64,
}

impl Measurement {
    pub fn unit(&self) -> &'static str {
        match self.tool {
            MeasurementTool::Distance => "mm",
            MeasurementTool::Angle => "°",
            MeasurementTool::Area => "mm²",
        }
    }

    pub fn result_text(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} {}", self.value, self.unit())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array3;

    const ANISOTROPIC: (f32, f32, f32) = (0.5, 0.5, 2.0);

    #[test]
    fn distance_uses_spacing_per_axis() {
        assert_relative_eq!(distance_mm(ANISOTROPIC, [0.0, 0.0, 0.0], [0.0, 0.0, 6.0]), 3.0);
        assert_relative_eq!(distance_mm(ANISOTROPIC, [0.0, 0.0, 0.0], [2.0, 0.0, 0.0]), 4.0);
    }

    #[test]
    fn right_angle_and_degenerate_rays() {
        let angle = angle_degrees(ANISOTROPIC, [0.0, 4.0, 0.0], [0.0, 0.0, 0.0], [0.0, 0.0, 4.0]);
        assert_relative_eq!(angle.unwrap(), 90.0, epsilon = 1e-9);
        assert_eq!(angle_degrees(ANISOTROPIC, [1.0; 3], [1.0; 3], [0.0; 3]), None);
    }

    #[test]
    fn polygon_area_scales_with_in_plane_spacing() {
        let square = [[0.0, 0.0], [0.0, 10.0], [10.0, 10.0], [10.0, 0.0]];
        assert_relative_eq!(polygon_area_mm2(ANISOTROPIC, Orientation::Axial, &square), 25.0);
        assert_relative_eq!(polygon_area_mm2(ANISOTROPIC, Orientation::Coronal, &square), 100.0);
        assert_eq!(polygon_area_mm2(ANISOTROPIC, Orientation::Axial, &square[..2]), 0.0);
    }

    #[test]
    fn statistics_of_a_small_volume() {
        let data = Array3::from_shape_vec((1, 2, 2), vec![-1.0, 1.0, 3.0, f32::NAN]).unwrap();
        let stats = VolumeStatistics::compute(&Volume::new(data, (1.0, 1.0, 2.0))).unwrap();
        assert_eq!(stats.voxel_count, 3);
        assert_relative_eq!(stats.mean, 1.0);
        assert_relative_eq!(stats.std_dev, (8.0f64 / 3.0).sqrt());
        assert_eq!((stats.min, stats.max), (-1.0, 3.0));
        assert_relative_eq!(stats.above_zero_mm3, 4.0);
    }

    #[test]
    fn result_text_carries_the_unit() {
        let m = Measurement {
            tool: MeasurementTool::Area,
            value: 12.346,
        };
        assert_eq!(m.result_text(), "12.35 mm²");
    }

    #[test]
    fn statistics_cover_strided_storage() {
        let full = Array3::from_shape_fn((2, 3, 8), |(_, _, x)| x as f32);
        let strided = full.slice_move(ndarray::s![.., .., ..;2]);
        assert!(strided.as_slice_memory_order().is_none());

        let stats = VolumeStatistics::compute(&Volume::new(strided, (1.0, 1.0, 1.0))).unwrap();
        assert_eq!(stats.voxel_count, 24);
        assert_relative_eq!(stats.min, 0.0);
        assert_relative_eq!(stats.max, 6.0);
        assert_relative_eq!(stats.mean, 3.0);
    }
}
