use crate::enums::Interpolation;
use crate::enums::Orientation;
use crate::interpolator::Interpolator;
use crate::render::WindowLevel;

use image::GrayImage;
use image::ImageBuffer;
use ndarray::Array2;
use ndarray::Array3;
use ndarray::ArrayView2;
use ndarray::Axis;
use ndarray::s;
use rayon::prelude::*;

/// A scalar volume on an axis-aligned grid.
///
/// Voxels are indexed `[z, y, x]`. Spacing and origin are given as
/// `(x, y, z)` in millimetres.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Volume {
    pub data: Array3<f32>,
    pub spacing: (f32, f32, f32),
    pub origin: (f32, f32, f32),
    pub interpolated_dim: (u32, u32, u32),
}

impl Volume {
    pub fn new(data: Array3<f32>, spacing: (f32, f32, f32)) -> Self {
        let original_dim = data.dim();
        Self {
            data,
            spacing,
            origin: (0.0, 0.0, 0.0),
            interpolated_dim: Interpolator::get_isotropic_dimensions(spacing, original_dim),
        }
    }

    pub fn with_origin(mut self, origin: (f32, f32, f32)) -> Self {
        self.origin = origin;
        self
    }

    /// A volume sharing this one's geometry but holding `data`. Returns
    /// `None` when the shapes differ.
    pub fn with_data(&self, data: Array3<f32>) -> Option<Self> {
        if data.dim() != self.data.dim() {
            return None;
        }
        Some(Self {
            data,
            spacing: self.spacing,
            origin: self.origin,
            interpolated_dim: self.interpolated_dim,
        })
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    /// Get a mutable reference to the underlying data
    pub fn data_mut(&mut self) -> &mut Array3<f32> {
        &mut self.data
    }

    pub fn spacing(&self) -> (f32, f32, f32) {
        self.spacing
    }

    pub fn origin(&self) -> (f32, f32, f32) {
        self.origin
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn voxel_count(&self) -> usize {
        self.data.len()
    }

    /// Number of slices along `orientation`.
    pub fn slice_count(&self, orientation: Orientation) -> usize {
        let (depth, height, width) = self.dim();
        match orientation {
            Orientation::Axial => depth,
            Orientation::Coronal => height,
            Orientation::Sagittal => width,
        }
    }

    /// Smallest and largest voxel value, ignoring NaNs.
    pub fn scalar_range(&self) -> Option<(f32, f32)> {
        self.data
            .as_slice_memory_order()
            .map(|values| {
                values
                    .par_iter()
                    .filter(|v| !v.is_nan())
                    .fold(
                        || (f32::INFINITY, f32::NEG_INFINITY),
                        |(lo, hi), &v| (lo.min(v), hi.max(v)),
                    )
                    .reduce(
                        || (f32::INFINITY, f32::NEG_INFINITY),
                        |a, b| (a.0.min(b.0), a.1.max(b.1)),
                    )
            })
            .unwrap_or_else(|| {
                self.data
                    .iter()
                    .filter(|v| !v.is_nan())
                    .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                        (lo.min(v), hi.max(v))
                    })
            })
            .into_finite()
    }

    /// Window covering the full intensity range, centred on it.
    pub fn optimal_window_level(&self) -> WindowLevel {
        match self.scalar_range() {
            Some((min, max)) => WindowLevel::from_range(min as f64, max as f64),
            None => WindowLevel::new(1.0, 0.5),
        }
    }

    pub fn voxel_to_world(&self, z: f64, y: f64, x: f64) -> [f64; 3] {
        let (sx, sy, sz) = self.spacing;
        let (ox, oy, oz) = self.origin;
        [
            ox as f64 + x * sx as f64,
            oy as f64 + y * sy as f64,
            oz as f64 + z * sz as f64,
        ]
    }

    /// Continuous voxel coordinates `[z, y, x]` of a world point.
    pub fn world_to_voxel(&self, p: [f64; 3]) -> [f64; 3] {
        let (sx, sy, sz) = self.spacing;
        let (ox, oy, oz) = self.origin;
        [
            (p[2] - oz as f64) / sz as f64,
            (p[1] - oy as f64) / sy as f64,
            (p[0] - ox as f64) / sx as f64,
        ]
    }

    /// World coordinates of the geometric centre of the grid.
    pub fn center(&self) -> [f64; 3] {
        let (depth, height, width) = self.dim();
        self.voxel_to_world(
            (depth.max(1) - 1) as f64 / 2.0,
            (height.max(1) - 1) as f64 / 2.0,
            (width.max(1) - 1) as f64 / 2.0,
        )
    }

    /// Intensity-weighted centre in world coordinates. Intensities are
    /// shifted so the minimum weighs zero; a flat volume yields the
    /// geometric centre.
    pub fn center_of_mass(&self) -> [f64; 3] {
        let Some((min, _)) = self.scalar_range() else {
            return self.center();
        };
        let (total, sz, sy, sx) = self
            .data
            .indexed_iter()
            .map(|((z, y, x), &v)| {
                let w = if v.is_nan() { 0.0 } else { (v - min) as f64 };
                (w, w * z as f64, w * y as f64, w * x as f64)
            })
            .fold((0.0, 0.0, 0.0, 0.0), |a, b| {
                (a.0 + b.0, a.1 + b.1, a.2 + b.2, a.3 + b.3)
            });
        if total <= f64::EPSILON {
            return self.center();
        }
        self.voxel_to_world(sz / total, sy / total, sx / total)
    }

    pub fn get_slice_from_axis(
        &self,
        index: usize,
        orientation: &Orientation,
    ) -> Option<ArrayView2<'_, f32>> {
        if !self.is_valid_index(index, orientation) {
            return None;
        }
        let slice_result = match orientation {
            Orientation::Axial => self.data().slice(s![index, .., ..]),
            Orientation::Coronal => self.data().slice(s![.., index, ..]),
            Orientation::Sagittal => self.data().slice(s![.., .., index]),
        };
        Some(slice_result)
    }

    /// Maximum along the axis perpendicular to `orientation`, laid out like
    /// a slice of that orientation.
    pub fn maximum_intensity_projection(&self, orientation: Orientation) -> Option<Array2<f32>> {
        if self.is_empty() {
            return None;
        }
        let axis = match orientation {
            Orientation::Axial => Axis(0),
            Orientation::Coronal => Axis(1),
            Orientation::Sagittal => Axis(2),
        };
        Some(
            self.data
                .map_axis(axis, |lane| lane.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v))),
        )
    }

    fn get_output_dimensions(&self, orientation: &Orientation) -> (u32, u32) {
        // Always return (width, height) - standard image convention
        match orientation {
            Orientation::Axial => {
                // Looking down Z-axis: X is width, Y is height
                (self.interpolated_dim.2, self.interpolated_dim.1)
            }
            Orientation::Coronal => {
                // Looking down Y-axis: X is width, Z is height
                (self.interpolated_dim.2, self.interpolated_dim.0)
            }
            Orientation::Sagittal => {
                // Looking down X-axis: Y is width, Z is height
                (self.interpolated_dim.1, self.interpolated_dim.0)
            }
        }
    }

    // Extract slice to image conversion
    pub(crate) fn slice_to_image(
        slice: &ArrayView2<'_, f32>,
        window_level: WindowLevel,
    ) -> Option<GrayImage> {
        let (height, width) = slice.dim();
        let pixel_data: Vec<u8> = slice
            .into_par_iter()
            .map(|&v| window_level.map(v))
            .collect();
        ImageBuffer::from_raw(width as u32, height as u32, pixel_data)
    }

    /// Renders slice `index` of `orientation` to 8 bits through
    /// `window_level`. With bilinear interpolation the coronal and sagittal
    /// planes are resampled to the isotropic aspect ratio.
    pub fn get_image_from_axis(
        &self,
        index: usize,
        orientation: Orientation,
        interpolation: Interpolation,
        window_level: WindowLevel,
    ) -> Option<GrayImage> {
        let slice = self.get_slice_from_axis(index, &orientation)?;
        self.plane_to_image(&slice, orientation, interpolation, window_level)
    }

    /// Like [`Volume::get_image_from_axis`] for an arbitrary plane laid out
    /// as a slice of `orientation`, e.g. a projection.
    pub(crate) fn plane_to_image(
        &self,
        plane: &ArrayView2<'_, f32>,
        orientation: Orientation,
        interpolation: Interpolation,
        window_level: WindowLevel,
    ) -> Option<GrayImage> {
        match interpolation {
            Interpolation::None => Self::slice_to_image(plane, window_level),
            Interpolation::Bilinear => {
                // Axial doesn't need interpolation (already isotropic in-plane)
                if matches!(orientation, Orientation::Axial) {
                    return Self::slice_to_image(plane, window_level);
                }
                let (width, height) = self.get_output_dimensions(&orientation);
                Self::interpolate_slice(plane, width, height, window_level)
            }
        }
    }

    fn interpolate_slice(
        slice: &ArrayView2<'_, f32>,
        width: u32,
        height: u32,
        window_level: WindowLevel,
    ) -> Option<GrayImage> {
        let (slice_height, slice_width) = slice.dim();
        if slice_height == 0 || slice_width == 0 {
            return None;
        }

        let pixel_data: Vec<u8> = (0..height)
            .into_par_iter()
            .flat_map(|y| {
                (0..width)
                    .map(|x| {
                        // Normalized coordinates with half-pixel offset
                        let norm_x = (x as f32 + 0.5) / width as f32;
                        let norm_y = (y as f32 + 0.5) / height as f32;

                        // Convert back to source coordinates
                        let src_x = norm_x * slice_width as f32 - 0.5;
                        let src_y = norm_y * slice_height as f32 - 0.5;

                        // Clamp to valid range
                        let src_x = src_x.max(0.0).min((slice_width - 1) as f32);
                        let src_y = src_y.max(0.0).min((slice_height - 1) as f32);

                        let value = Interpolator::bilinear_interpolate(slice, src_y, src_x);
                        window_level.map(value)
                    })
                    .collect::<Vec<u8>>()
            })
            .collect();

        ImageBuffer::from_raw(width, height, pixel_data)
    }

    pub fn is_valid_index(&self, index: usize, orientation: &Orientation) -> bool {
        index < self.slice_count(*orientation)
    }
}

trait FiniteRange {
    fn into_finite(self) -> Option<(f32, f32)>;
}

impl FiniteRange for (f32, f32) {
    fn into_finite(self) -> Option<(f32, f32)> {
        (self.0 <= self.1).then_some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ramp(depth: usize, height: usize, width: usize) -> Volume {
        let data = Array3::from_shape_fn((depth, height, width), |(z, y, x)| {
            (z * 100 + y * 10 + x) as f32
        });
        Volume::new(data, (1.0, 1.0, 1.0))
    }

    #[test]
    fn slices_follow_orientation() {
        let volume = ramp(3, 4, 5);
        let axial = volume.get_slice_from_axis(2, &Orientation::Axial).unwrap();
        assert_eq!(axial.dim(), (4, 5));
        assert_relative_eq!(axial[[1, 3]], 213.0);

        let coronal = volume.get_slice_from_axis(1, &Orientation::Coronal).unwrap();
        assert_eq!(coronal.dim(), (3, 5));

        let sagittal = volume.get_slice_from_axis(4, &Orientation::Sagittal).unwrap();
        assert_eq!(sagittal.dim(), (3, 4));
        assert!(volume.get_slice_from_axis(5, &Orientation::Sagittal).is_none());
    }

    #[test]
    fn range_and_optimal_window() {
        let volume = ramp(2, 2, 2);
        assert_eq!(volume.scalar_range(), Some((0.0, 111.0)));
        let wl = volume.optimal_window_level();
        assert_relative_eq!(wl.window, 111.0);
        assert_relative_eq!(wl.level, 55.5);
    }

    #[test]
    fn empty_volume_has_default_window() {
        let volume = Volume::default();
        assert!(volume.scalar_range().is_none());
        let wl = volume.optimal_window_level();
        assert_relative_eq!(wl.window, 1.0);
        assert_relative_eq!(wl.level, 0.5);
    }

    #[test]
    fn world_voxel_round_trip_respects_spacing_and_origin() {
        let volume = Volume::new(Array3::zeros((4, 4, 4)), (0.5, 2.0, 3.0))
            .with_origin((10.0, 0.0, -5.0));
        let world = volume.voxel_to_world(1.0, 2.0, 3.0);
        assert_relative_eq!(world[0], 11.5);
        assert_relative_eq!(world[1], 4.0);
        assert_relative_eq!(world[2], -2.0);
        let voxel = volume.world_to_voxel(world);
        assert_relative_eq!(voxel[0], 1.0);
        assert_relative_eq!(voxel[1], 2.0);
        assert_relative_eq!(voxel[2], 3.0);
    }

    #[test]
    fn center_of_mass_finds_bright_voxel() {
        let mut data = Array3::zeros((5, 5, 5));
        data[[1, 2, 3]] = 10.0;
        let volume = Volume::new(data, (2.0, 1.0, 1.0));
        let com = volume.center_of_mass();
        assert_relative_eq!(com[0], 6.0);
        assert_relative_eq!(com[1], 2.0);
        assert_relative_eq!(com[2], 1.0);
    }

    #[test]
    fn mip_takes_maximum_along_view_axis() {
        let volume = ramp(3, 2, 2);
        let mip = volume.maximum_intensity_projection(Orientation::Axial).unwrap();
        assert_eq!(mip.dim(), (2, 2));
        assert_relative_eq!(mip[[1, 1]], 211.0);
    }

    #[test]
    fn bilinear_coronal_image_uses_isotropic_height() {
        let volume = Volume::new(Array3::zeros((4, 8, 8)), (1.0, 1.0, 2.0));
        let image = volume
            .get_image_from_axis(
                0,
                Orientation::Coronal,
                Interpolation::Bilinear,
                WindowLevel::new(1.0, 0.0),
            )
            .unwrap();
        assert_eq!(image.dimensions(), (8, 8));

        let plain = volume
            .get_image_from_axis(
                0,
                Orientation::Coronal,
                Interpolation::None,
                WindowLevel::new(1.0, 0.0),
            )
            .unwrap();
        assert_eq!(plain.dimensions(), (8, 4));
    }

    #[test]
    fn with_data_rejects_other_shapes() {
        let volume = ramp(2, 2, 2);
        assert!(volume.with_data(Array3::zeros((2, 2, 3))).is_none());
        let copy = volume.with_data(Array3::ones((2, 2, 2))).unwrap();
        assert_eq!(copy.spacing(), volume.spacing());
    }
}
