//! Intensity-based registration of a moving volume onto a fixed one.
//!
//! The estimated [`Transform`] maps world points of the fixed image to world
//! points of the moving image, so the registered image is the moving image
//! sampled through that transform on the fixed grid.

mod demons;
mod optimizer;

pub use demons::DisplacementField;

use log::{debug, info};
use ndarray::{Array3, Zip};
use rayon::prelude::*;
use thiserror::Error;
use web_time::Instant;

use crate::enums::RegistrationKind;
use crate::interpolator::Interpolator;
use crate::signal::Signal;
use crate::transform::Transform;
use crate::volume::Volume;
use demons::Demons;
use optimizer::PatternSearch;

const INITIAL_STEP: f64 = 4.0;
const ROTATION_SCALE: f64 = 0.02;
const MATRIX_SCALE: f64 = 0.02;
const FIELD_SIGMA: f64 = 1.0;

#[derive(Debug, Error, PartialEq)]
pub enum RegistrationError {
    #[error("the {0} image is empty")]
    EmptyImage(&'static str),

    #[error("the images do not overlap")]
    NoOverlap,

    #[error("invalid setting: {0}")]
    InvalidSettings(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegistrationSettings {
    /// Optimiser sweeps, or demons iterations.
    pub max_iterations: usize,
    pub tolerance: f64,
    /// Only every n-th fixed voxel along each axis enters the metric.
    pub sampling_stride: usize,
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-6,
            sampling_stride: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegistrationSummary {
    pub kind: RegistrationKind,
    pub iterations: usize,
    /// Mean squared difference after registration.
    pub final_metric: f64,
    pub converged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationEvent {
    Started(RegistrationKind),
    Progress(u8),
    Finished(RegistrationKind),
}

#[derive(Debug, Default)]
pub struct RegistrationManager {
    settings: RegistrationSettings,
    transform: Transform,
    registered: Option<Volume>,
    field: Option<DisplacementField>,
    pub events: Signal<RegistrationEvent>,
}

impl RegistrationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settings(&self) -> &RegistrationSettings {
        &self.settings
    }

    pub fn set_max_iterations(&mut self, iterations: usize) {
        self.settings.max_iterations = iterations;
    }

    pub fn set_tolerance(&mut self, tolerance: f64) {
        self.settings.tolerance = tolerance;
    }

    pub fn set_sampling_stride(&mut self, stride: usize) {
        self.settings.sampling_stride = stride;
    }

    pub fn transform_matrix(&self) -> &Transform {
        &self.transform
    }

    pub fn registered_image(&self) -> Option<&Volume> {
        self.registered.as_ref()
    }

    /// Only set by deformable registration.
    pub fn displacement_field(&self) -> Option<&DisplacementField> {
        self.field.as_ref()
    }

    /// Back to the identity with no results.
    pub fn reset(&mut self) {
        self.transform = Transform::identity();
        self.registered = None;
        self.field = None;
    }

    pub fn perform(
        &mut self,
        kind: RegistrationKind,
        fixed: &Volume,
        moving: &Volume,
    ) -> Result<RegistrationSummary, RegistrationError> {
        match kind {
            RegistrationKind::Rigid => self.perform_rigid_registration(fixed, moving),
            RegistrationKind::Affine => self.perform_affine_registration(fixed, moving),
            RegistrationKind::Deformable => self.perform_deformable_registration(fixed, moving),
        }
    }

    /// Three rotations and three translations about the fixed centre.
    pub fn perform_rigid_registration(
        &mut self,
        fixed: &Volume,
        moving: &Volume,
    ) -> Result<RegistrationSummary, RegistrationError> {
        let (sx, sy, sz) = fixed.spacing();
        let step = sx.max(sy).max(sz) as f64;
        let scales = [ROTATION_SCALE, ROTATION_SCALE, ROTATION_SCALE, step, step, step];
        self.linear_registration(RegistrationKind::Rigid, fixed, moving, &scales, |center, p| {
            Transform::from_components([p[3], p[4], p[5]], [p[0], p[1], p[2]], [1.0; 3])
                .about_center(center)
        })
    }

    /// Full 3x3 matrix and translation about the fixed centre.
    pub fn perform_affine_registration(
        &mut self,
        fixed: &Volume,
        moving: &Volume,
    ) -> Result<RegistrationSummary, RegistrationError> {
        let (sx, sy, sz) = fixed.spacing();
        let step = sx.max(sy).max(sz) as f64;
        let mut scales = [MATRIX_SCALE; 12];
        scales[9..].fill(step);
        self.linear_registration(RegistrationKind::Affine, fixed, moving, &scales, |center, p| {
            let identity = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
            let mut linear = [[0.0; 3]; 3];
            for (r, row) in linear.iter_mut().enumerate() {
                for (c, value) in row.iter_mut().enumerate() {
                    *value = identity[r][c] + p[3 * r + c];
                }
            }
            Transform::from_linear(linear, [p[9], p[10], p[11]]).about_center(center)
        })
    }

    /// Demons on top of the current linear transform.
    pub fn perform_deformable_registration(
        &mut self,
        fixed: &Volume,
        moving: &Volume,
    ) -> Result<RegistrationSummary, RegistrationError> {
        self.validate(fixed, moving)?;
        let kind = RegistrationKind::Deformable;
        self.events.emit(&RegistrationEvent::Started(kind));
        let start = Instant::now();

        let resampled = resample(fixed, moving, &self.transform);
        let max_iterations = self.settings.max_iterations;
        let events = &self.events;
        let result = Demons {
            fixed: fixed.data(),
            moving: resampled.data(),
            max_iterations,
            tolerance: self.settings.tolerance,
            smoothing_sigma: FIELD_SIGMA,
        }
        .run(|iteration| {
            events.emit(&RegistrationEvent::Progress(percent(iteration, max_iterations)))
        });

        let (sx, sy, sz) = fixed.spacing();
        let [dz, dy, dx] = result.field;
        let field = DisplacementField {
            x: dx * sx,
            y: dy * sy,
            z: dz * sz,
        };
        let final_metric = mean_squared_difference(fixed.data(), &result.warped);
        debug!(
            "demons: {} iterations, max displacement {:.3} mm",
            result.iterations,
            field.max_magnitude()
        );

        self.field = Some(field);
        self.registered =
            Some(Volume::new(result.warped, fixed.spacing()).with_origin(fixed.origin()));
        self.finish(kind, start);
        Ok(RegistrationSummary {
            kind,
            iterations: result.iterations,
            final_metric,
            converged: result.converged,
        })
    }

    fn validate(&self, fixed: &Volume, moving: &Volume) -> Result<(), RegistrationError> {
        if fixed.is_empty() {
            return Err(RegistrationError::EmptyImage("fixed"));
        }
        if moving.is_empty() {
            return Err(RegistrationError::EmptyImage("moving"));
        }
        if self.settings.max_iterations == 0 {
            return Err(RegistrationError::InvalidSettings(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if !(self.settings.tolerance.is_finite() && self.settings.tolerance > 0.0) {
            return Err(RegistrationError::InvalidSettings(format!(
                "tolerance {} must be positive",
                self.settings.tolerance
            )));
        }
        if self.settings.sampling_stride == 0 {
            return Err(RegistrationError::InvalidSettings(
                "sampling_stride must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn linear_registration(
        &mut self,
        kind: RegistrationKind,
        fixed: &Volume,
        moving: &Volume,
        scales: &[f64],
        build: impl Fn([f64; 3], &[f64]) -> Transform,
    ) -> Result<RegistrationSummary, RegistrationError> {
        self.validate(fixed, moving)?;
        let center = fixed.center();
        let stride = self.settings.sampling_stride;

        // centre-of-mass alignment seeds the translation
        let (fixed_com, moving_com) = (fixed.center_of_mass(), moving.center_of_mass());
        let mut start_params = vec![0.0; scales.len()];
        let n = start_params.len();
        for axis in 0..3 {
            start_params[n - 3 + axis] = moving_com[axis] - fixed_com[axis];
        }

        let cost = |params: &[f64]| {
            sampled_metric(fixed, moving, &build(center, params), stride).unwrap_or(f64::INFINITY)
        };
        if !cost(&start_params).is_finite() {
            return Err(RegistrationError::NoOverlap);
        }

        self.events.emit(&RegistrationEvent::Started(kind));
        let start = Instant::now();
        let max_iterations = self.settings.max_iterations;
        let events = &self.events;
        let search = PatternSearch {
            initial_step: INITIAL_STEP,
            min_step: self.settings.tolerance,
            max_sweeps: max_iterations,
        };
        let result = search.minimize(start_params, scales, cost, |sweep| {
            events.emit(&RegistrationEvent::Progress(percent(sweep, max_iterations)))
        });

        let transform = build(center, &result.params);
        debug!(
            "{} registration: {} sweeps, metric {:.6}, converged {}",
            kind.name(),
            result.sweeps,
            result.value,
            result.converged
        );
        self.transform = transform;
        self.registered = Some(resample(fixed, moving, &transform));
        self.field = None;
        self.finish(kind, start);

        Ok(RegistrationSummary {
            kind,
            iterations: result.sweeps,
            final_metric: result.value,
            converged: result.converged,
        })
    }

    fn finish(&self, kind: RegistrationKind, start: Instant) {
        self.events.emit(&RegistrationEvent::Progress(100));
        self.events.emit(&RegistrationEvent::Finished(kind));
        info!("{} registration finished in {:?}", kind.name(), start.elapsed());
    }
}

fn percent(done: usize, total: usize) -> u8 {
    ((100 * done) / total.max(1)).min(99) as u8
}

fn sample_moving(moving: &Volume, transform: &Transform, fixed_point: [f64; 3]) -> Option<f32> {
    let [z, y, x] = moving.world_to_voxel(transform.apply_point(fixed_point));
    Interpolator::trilinear_interpolate(moving.data(), z, y, x)
}

/// The moving image on the fixed grid; samples outside it read 0.
pub fn resample(fixed: &Volume, moving: &Volume, transform: &Transform) -> Volume {
    let mut data = Array3::zeros(fixed.data().raw_dim());
    Zip::indexed(&mut data).par_for_each(|(z, y, x), o| {
        let p = fixed.voxel_to_world(z as f64, y as f64, x as f64);
        *o = sample_moving(moving, transform, p).unwrap_or(0.0);
    });
    Volume::new(data, fixed.spacing()).with_origin(fixed.origin())
}

/// Mean squared difference over every `stride`-th fixed voxel that maps
/// inside the moving image. `None` without any overlap.
fn sampled_metric(
    fixed: &Volume,
    moving: &Volume,
    transform: &Transform,
    stride: usize,
) -> Option<f64> {
    let (depth, height, width) = fixed.dim();
    let zs: Vec<usize> = (0..depth).step_by(stride).collect();
    let (sum, count) = zs
        .into_par_iter()
        .map(|z| {
            let mut sum = 0.0f64;
            let mut count = 0usize;
            for y in (0..height).step_by(stride) {
                for x in (0..width).step_by(stride) {
                    let p = fixed.voxel_to_world(z as f64, y as f64, x as f64);
                    if let Some(m) = sample_moving(moving, transform, p) {
                        let d = (fixed.data()[[z, y, x]] - m) as f64;
                        sum += d * d;
                        count += 1;
                    }
                }
            }
            (sum, count)
        })
        .reduce(|| (0.0, 0), |a, b| (a.0 + b.0, a.1 + b.1));
    (count > 0).then(|| sum / count as f64)
}

fn mean_squared_difference(a: &Array3<f32>, b: &Array3<f32>) -> f64 {
    let sum = Zip::from(a).and(b).fold(0.0f64, |acc, &x, &y| {
        let d = (x - y) as f64;
        acc + d * d
    });
    sum / a.len().max(1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::EventLog;
    use approx::assert_abs_diff_eq;

    fn blob(center: [f64; 3]) -> Volume {
        let data = Array3::from_shape_fn((20, 24, 28), |(z, y, x)| {
            let d2 = (x as f64 - center[0]).powi(2) / 16.0
                + (y as f64 - center[1]).powi(2) / 9.0
                + (z as f64 - center[2]).powi(2) / 4.0;
            (100.0 * (-d2 / 2.0).exp()) as f32
        });
        Volume::new(data, (1.0, 1.0, 1.0))
    }

    #[test]
    fn rigid_recovers_a_translation() {
        let fixed = blob([13.5, 11.5, 9.5]);
        let moving = blob([15.5, 10.5, 10.5]);
        let mut manager = RegistrationManager::new();
        let log = EventLog::new();
        log.attach(&mut manager.events);

        let summary = manager.perform_rigid_registration(&fixed, &moving).unwrap();
        let mapped = manager.transform_matrix().apply_point(fixed.center());
        let expected = [fixed.center()[0] + 2.0, fixed.center()[1] - 1.0, fixed.center()[2] + 1.0];
        for axis in 0..3 {
            assert_abs_diff_eq!(mapped[axis], expected[axis], epsilon = 0.1);
        }
        assert!(summary.final_metric < 1.0);
        assert!(manager.registered_image().is_some());

        let events = log.drain();
        assert_eq!(events.first(), Some(&RegistrationEvent::Started(RegistrationKind::Rigid)));
        assert_eq!(events.last(), Some(&RegistrationEvent::Finished(RegistrationKind::Rigid)));
    }

    #[test]
    fn affine_keeps_identity_for_identical_images() {
        let fixed = blob([13.5, 11.5, 9.5]);
        let mut manager = RegistrationManager::new();
        manager.set_max_iterations(30);
        let summary = manager.perform_affine_registration(&fixed, &fixed).unwrap();
        assert!(manager.transform_matrix().is_identity(1e-6));
        assert_abs_diff_eq!(summary.final_metric, 0.0, epsilon = 1e-9);
        assert!(summary.converged);
    }

    #[test]
    fn deformable_reduces_the_difference() {
        let fixed = blob([13.5, 11.5, 9.5]);
        let moving = blob([14.5, 11.5, 9.5]);
        let before = mean_squared_difference(fixed.data(), moving.data());

        let mut manager = RegistrationManager::new();
        manager.set_max_iterations(30);
        let summary = manager.perform_deformable_registration(&fixed, &moving).unwrap();

        assert!(summary.final_metric < before / 2.0, "{} vs {before}", summary.final_metric);
        let field = manager.displacement_field().unwrap();
        assert_eq!(field.dim(), fixed.dim());
        assert!(field.max_magnitude() > 0.1);
    }

    #[test]
    fn empty_inputs_are_rejected_before_started() {
        let mut manager = RegistrationManager::new();
        let log = EventLog::new();
        log.attach(&mut manager.events);
        let err = manager
            .perform(RegistrationKind::Rigid, &Volume::default(), &blob([1.0; 3]))
            .unwrap_err();
        assert_eq!(err, RegistrationError::EmptyImage("fixed"));
        assert!(log.drain().is_empty());
    }

    #[test]
    fn reset_restores_identity() {
        let fixed = blob([13.5, 11.5, 9.5]);
        let moving = blob([14.5, 11.5, 9.5]);
        let mut manager = RegistrationManager::new();
        manager.set_max_iterations(5);
        manager.perform_rigid_registration(&fixed, &moving).unwrap();
        manager.reset();
        assert!(manager.transform_matrix().is_identity(0.0));
        assert!(manager.registered_image().is_none());
    }

    #[test]
    fn resample_with_identity_reproduces_the_image() {
        let fixed = blob([13.5, 11.5, 9.5]);
        let out = resample(&fixed, &fixed, &Transform::identity());
        assert_eq!(out.data(), fixed.data());
    }
}
