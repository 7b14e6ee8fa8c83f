use ndarray::{Array3, ArrayView2};

pub(crate) struct Interpolator;

impl Interpolator {
    /// Dimensions (depth, height, width) a volume would have when
    /// resampled to its smallest spacing on every axis.
    pub(crate) fn get_isotropic_dimensions(
        spacing: (f32, f32, f32),
        original_dim: (usize, usize, usize),
    ) -> (u32, u32, u32) {
        let (x_spacing, y_spacing, z_spacing) = spacing;
        let min_spacing = x_spacing.min(y_spacing).min(z_spacing);
        if !(min_spacing > 0.0) {
            return (
                original_dim.0 as u32,
                original_dim.1 as u32,
                original_dim.2 as u32,
            );
        }
        let inv_min_spacing = 1.0 / min_spacing;

        // original_dim is (depth, height, width) corresponding to (z, y, x)
        let new_x = (original_dim.2 as f32 * x_spacing * inv_min_spacing) as u32;
        let new_y = (original_dim.1 as f32 * y_spacing * inv_min_spacing) as u32;
        let new_z = (original_dim.0 as f32 * z_spacing * inv_min_spacing) as u32;

        (new_z.max(1), new_y.max(1), new_x.max(1))
    }

    #[inline]
    pub(crate) fn bilinear_interpolate(slice: &ArrayView2<f32>, y: f32, x: f32) -> f32 {
        let (height, width) = slice.dim();

        let y0 = y.floor() as usize;
        let x0 = x.floor() as usize;
        let y1 = (y0 + 1).min(height - 1);
        let x1 = (x0 + 1).min(width - 1);

        let dy = y - y0 as f32;
        let dx = x - x0 as f32;
        let one_minus_dx = 1.0 - dx;
        let one_minus_dy = 1.0 - dy;

        let v00 = slice[[y0, x0]];
        let v01 = slice[[y0, x1]];
        let v10 = slice[[y1, x0]];
        let v11 = slice[[y1, x1]];

        let v0 = v00.mul_add(one_minus_dx, v01 * dx);
        let v1 = v10.mul_add(one_minus_dx, v11 * dx);

        v0.mul_add(one_minus_dy, v1 * dy)
    }

    /// Samples `data` at continuous voxel coordinates. Points further than
    /// half a voxel outside the grid yield `None`; points inside that
    /// margin are clamped to the border.
    #[inline]
    pub(crate) fn trilinear_interpolate(data: &Array3<f32>, z: f64, y: f64, x: f64) -> Option<f32> {
        let (depth, height, width) = data.dim();
        if depth == 0 || height == 0 || width == 0 {
            return None;
        }
        let inside = |v: f64, n: usize| v >= -0.5 && v <= n as f64 - 0.5;
        if !(inside(z, depth) && inside(y, height) && inside(x, width)) {
            return None;
        }

        let z = z.clamp(0.0, (depth - 1) as f64);
        let y = y.clamp(0.0, (height - 1) as f64);
        let x = x.clamp(0.0, (width - 1) as f64);

        let z0 = z.floor() as usize;
        let y0 = y.floor() as usize;
        let x0 = x.floor() as usize;
        let z1 = (z0 + 1).min(depth - 1);
        let y1 = (y0 + 1).min(height - 1);
        let x1 = (x0 + 1).min(width - 1);

        let dz = (z - z0 as f64) as f32;
        let dy = (y - y0 as f64) as f32;
        let dx = (x - x0 as f64) as f32;

        let lerp = |a: f32, b: f32, t: f32| a.mul_add(1.0 - t, b * t);

        let c00 = lerp(data[[z0, y0, x0]], data[[z0, y0, x1]], dx);
        let c01 = lerp(data[[z0, y1, x0]], data[[z0, y1, x1]], dx);
        let c10 = lerp(data[[z1, y0, x0]], data[[z1, y0, x1]], dx);
        let c11 = lerp(data[[z1, y1, x0]], data[[z1, y1, x1]], dx);

        let c0 = lerp(c00, c01, dy);
        let c1 = lerp(c10, c11, dy);

        Some(lerp(c0, c1, dz))
    }
}
