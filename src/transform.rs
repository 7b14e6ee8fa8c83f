//! 4x4 homogeneous transforms on top of `nalgebra`.
//!
//! Matrices act on column vectors, so `a * b` applies `b` first. Angles
//! are radians.

use std::fmt;
use std::ops::Mul;

use nalgebra::{Matrix3, Matrix4, Point3, Rotation3, Vector3};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "Rows", into = "Rows")]
pub struct Transform {
    matrix: Matrix4<f64>,
}

/// Row-major wire form.
#[derive(Serialize, Deserialize)]
struct Rows {
    rows: [[f64; 4]; 4],
}

impl From<Rows> for Transform {
    fn from(value: Rows) -> Self {
        Self::from_rows(value.rows)
    }
}

impl From<Transform> for Rows {
    fn from(value: Transform) -> Self {
        Self { rows: value.rows() }
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

impl Transform {
    pub fn identity() -> Self {
        Self::from_matrix(Matrix4::identity())
    }

    pub fn from_matrix(matrix: Matrix4<f64>) -> Self {
        Self { matrix }
    }

    pub fn from_rows(rows: [[f64; 4]; 4]) -> Self {
        Self::from_matrix(Matrix4::from_fn(|r, c| rows[r][c]))
    }

    /// Builds an affine transform from a 3x3 linear part and a translation.
    pub fn from_linear(linear: [[f64; 3]; 3], translation: [f64; 3]) -> Self {
        let linear = Matrix3::from_fn(|r, c| linear[r][c]);
        let mut matrix = linear.to_homogeneous();
        matrix
            .fixed_view_mut::<3, 1>(0, 3)
            .copy_from(&Vector3::from(translation));
        Self::from_matrix(matrix)
    }

    pub fn translation(x: f64, y: f64, z: f64) -> Self {
        Self::from_matrix(Matrix4::new_translation(&Vector3::new(x, y, z)))
    }

    pub fn scale(sx: f64, sy: f64, sz: f64) -> Self {
        Self::from_matrix(Matrix4::new_nonuniform_scaling(&Vector3::new(sx, sy, sz)))
    }

    /// Rotation about the x, y and z axes, composed as `Rz * Ry * Rx`.
    pub fn rotation(rx: f64, ry: f64, rz: f64) -> Self {
        Self::from_matrix(Rotation3::from_euler_angles(rx, ry, rz).to_homogeneous())
    }

    /// `T * R * S`: scale first, then rotate, then translate.
    pub fn from_components(translation: [f64; 3], rotation: [f64; 3], scale: [f64; 3]) -> Self {
        Self::translation(translation[0], translation[1], translation[2])
            * Self::rotation(rotation[0], rotation[1], rotation[2])
            * Self::scale(scale[0], scale[1], scale[2])
    }

    /// Conjugates `self` so that it acts about `center` instead of the origin.
    pub fn about_center(self, center: [f64; 3]) -> Self {
        Self::translation(center[0], center[1], center[2])
            * self
            * Self::translation(-center[0], -center[1], -center[2])
    }

    pub fn element(&self, row: usize, col: usize) -> f64 {
        self.matrix[(row, col)]
    }

    pub fn set_element(&mut self, row: usize, col: usize, value: f64) {
        self.matrix[(row, col)] = value;
    }

    pub fn matrix(&self) -> &Matrix4<f64> {
        &self.matrix
    }

    pub fn rows(&self) -> [[f64; 4]; 4] {
        std::array::from_fn(|r| std::array::from_fn(|c| self.matrix[(r, c)]))
    }

    pub fn linear_part(&self) -> [[f64; 3]; 3] {
        std::array::from_fn(|r| std::array::from_fn(|c| self.matrix[(r, c)]))
    }

    pub fn translation_part(&self) -> [f64; 3] {
        [self.matrix[(0, 3)], self.matrix[(1, 3)], self.matrix[(2, 3)]]
    }

    pub fn apply_point(&self, p: [f64; 3]) -> [f64; 3] {
        let h = self.matrix * Point3::from(p).to_homogeneous();
        let w = h[3];
        if w != 0.0 && w != 1.0 {
            [h[0] / w, h[1] / w, h[2] / w]
        } else {
            [h[0], h[1], h[2]]
        }
    }

    pub fn apply_vector(&self, v: [f64; 3]) -> [f64; 3] {
        let out = self.matrix.fixed_view::<3, 3>(0, 0) * Vector3::from(v);
        [out.x, out.y, out.z]
    }

    pub fn determinant(&self) -> f64 {
        self.matrix.determinant()
    }

    /// `None` when the matrix is singular.
    pub fn inverse(&self) -> Option<Self> {
        if self.determinant().abs() < 1e-12 {
            return None;
        }
        self.matrix.try_inverse().map(Self::from_matrix)
    }

    pub fn is_identity(&self, epsilon: f64) -> bool {
        (self.matrix - Matrix4::identity()).amax() <= epsilon
    }
}

impl Mul for Transform {
    type Output = Transform;

    fn mul(self, rhs: Transform) -> Transform {
        Transform::from_matrix(self.matrix * rhs.matrix)
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in self.rows() {
            writeln!(
                f,
                "[{:>10.4} {:>10.4} {:>10.4} {:>10.4}]",
                row[0], row[1], row[2], row[3]
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::FRAC_PI_2;

    fn assert_point_eq(a: [f64; 3], b: [f64; 3]) {
        for i in 0..3 {
            assert_abs_diff_eq!(a[i], b[i], epsilon = 1e-9);
        }
    }

    #[test]
    fn default_is_identity() {
        assert!(Transform::default().is_identity(0.0));
    }

    #[test]
    fn rotation_about_z_turns_x_into_y() {
        let r = Transform::rotation(0.0, 0.0, FRAC_PI_2);
        assert_point_eq(r.apply_point([1.0, 0.0, 0.0]), [0.0, 1.0, 0.0]);
    }

    #[test]
    fn components_apply_scale_before_translation() {
        let t = Transform::from_components([1.0, 2.0, 3.0], [0.0; 3], [2.0, 2.0, 2.0]);
        assert_point_eq(t.apply_point([1.0, 1.0, 1.0]), [3.0, 4.0, 5.0]);
    }

    #[test]
    fn about_center_keeps_center_fixed() {
        let center = [10.0, -4.0, 2.5];
        let t = Transform::rotation(0.3, -0.2, 1.1).about_center(center);
        assert_point_eq(t.apply_point(center), center);
    }

    #[test]
    fn inverse_undoes_transform() {
        let t = Transform::from_components([5.0, -3.0, 1.0], [0.1, 0.2, 0.3], [1.5, 0.5, 2.0]);
        let inv = t.inverse().unwrap();
        assert!((t * inv).is_identity(1e-9));
        let p = [0.7, 1.9, -8.0];
        assert_point_eq(inv.apply_point(t.apply_point(p)), p);
    }

    #[test]
    fn singular_matrix_has_no_inverse() {
        assert!(Transform::scale(1.0, 0.0, 1.0).inverse().is_none());
    }

    #[test]
    fn rotation_matches_explicit_zyx_composition() {
        let (rx, ry, rz) = (0.4, -0.7, 1.2);
        let composed = Transform::rotation(0.0, 0.0, rz)
            * Transform::rotation(0.0, ry, 0.0)
            * Transform::rotation(rx, 0.0, 0.0);
        let direct = Transform::rotation(rx, ry, rz);
        assert!((composed * direct.inverse().unwrap()).is_identity(1e-9));
    }

    #[test]
    fn serializes_as_row_major_rows() {
        let t = Transform::translation(1.0, 2.0, 3.0);
        let json = serde_json::to_value(t).unwrap();
        assert_eq!(json["rows"][0][3], serde_json::json!(1.0));
        assert_eq!(json["rows"][2][3], serde_json::json!(3.0));
        let back: Transform = serde_json::from_value(json).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn vectors_ignore_translation() {
        let t = Transform::translation(4.0, 4.0, 4.0);
        assert_point_eq(t.apply_vector([1.0, 2.0, 3.0]), [1.0, 2.0, 3.0]);
    }
}
