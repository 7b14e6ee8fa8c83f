//! Voxel filters over [`Volume`]s.
//!
//! Every operation on [`ImageProcessor`] checks its parameters first and
//! then reports `Started`, one or more `Progress` values and `Finished`
//! through [`ImageProcessor::events`]. The returned volume shares the
//! input's geometry.

mod edges;
mod morphology;
mod smoothing;
mod threshold;

pub(crate) use smoothing::gaussian_blur;
pub use threshold::otsu_threshold;

use std::fmt;
use std::ops::RangeInclusive;

use log::debug;
use ndarray::{Array3, Axis, Zip};
use thiserror::Error;
use web_time::Instant;

use crate::signal::Signal;
use crate::volume::Volume;

#[derive(Debug, Error, PartialEq)]
pub enum ProcessingError {
    #[error("the input volume is empty")]
    EmptyVolume,

    #[error("invalid {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

/// Accepted Gaussian sigma, in voxels.
pub const SIGMA_RANGE: RangeInclusive<f64> = 0.1..=10.0;

fn invalid(name: &'static str, reason: impl Into<String>) -> ProcessingError {
    ProcessingError::InvalidParameter {
        name,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    GaussianSmoothing,
    MedianFilter,
    AnisotropicDiffusion,
    Erosion,
    Dilation,
    Opening,
    Closing,
    Sobel,
    Canny,
    Threshold,
    OtsuThreshold,
    Sharpen,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::GaussianSmoothing => "gaussian smoothing",
            Operation::MedianFilter => "median filter",
            Operation::AnisotropicDiffusion => "anisotropic diffusion",
            Operation::Erosion => "erosion",
            Operation::Dilation => "dilation",
            Operation::Opening => "opening",
            Operation::Closing => "closing",
            Operation::Sobel => "sobel",
            Operation::Canny => "canny",
            Operation::Threshold => "threshold",
            Operation::OtsuThreshold => "otsu threshold",
            Operation::Sharpen => "sharpen",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingEvent {
    Started(Operation),
    /// Percent complete, 0..=100.
    Progress(u8),
    Finished(Operation),
}

/// A filter and its parameters, as chosen on the parameter panel or the
/// command line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterRequest {
    Gaussian { sigma: f64 },
    Median { kernel_size: usize },
    AnisotropicDiffusion { iterations: usize, time_step: f64 },
    Erosion { radius: usize },
    Dilation { radius: usize },
    Opening { radius: usize },
    Closing { radius: usize },
    Sobel,
    Canny { threshold1: f64, threshold2: f64 },
    Threshold { lower: f64, upper: f64 },
    Otsu,
    Sharpen { amount: f64 },
}

#[derive(Debug, Default)]
pub struct ImageProcessor {
    pub events: Signal<ProcessingEvent>,
}

impl ImageProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(
        &self,
        volume: &Volume,
        request: FilterRequest,
    ) -> Result<Volume, ProcessingError> {
        match request {
            FilterRequest::Gaussian { sigma } => self.apply_gaussian_smoothing(volume, sigma),
            FilterRequest::Median { kernel_size } => self.apply_median_filter(volume, kernel_size),
            FilterRequest::AnisotropicDiffusion {
                iterations,
                time_step,
            } => self.apply_anisotropic_diffusion(volume, iterations, time_step),
            FilterRequest::Erosion { radius } => self.apply_erosion(volume, radius),
            FilterRequest::Dilation { radius } => self.apply_dilation(volume, radius),
            FilterRequest::Opening { radius } => self.apply_opening(volume, radius),
            FilterRequest::Closing { radius } => self.apply_closing(volume, radius),
            FilterRequest::Sobel => self.apply_sobel_filter(volume),
            FilterRequest::Canny {
                threshold1,
                threshold2,
            } => self.apply_canny_edge_detector(volume, threshold1, threshold2),
            FilterRequest::Threshold { lower, upper } => self.apply_threshold(volume, lower, upper),
            FilterRequest::Otsu => self.apply_otsu_threshold(volume),
            FilterRequest::Sharpen { amount } => self.apply_sharpen(volume, amount),
        }
    }

    /// Separable Gaussian with `sigma` in voxels.
    pub fn apply_gaussian_smoothing(
        &self,
        volume: &Volume,
        sigma: f64,
    ) -> Result<Volume, ProcessingError> {
        if !SIGMA_RANGE.contains(&sigma) {
            return Err(invalid(
                "sigma",
                format!("{sigma} outside {}..={}", SIGMA_RANGE.start(), SIGMA_RANGE.end()),
            ));
        }
        self.run(volume, Operation::GaussianSmoothing, |data, progress| {
            smoothing::gaussian(data, sigma, progress)
        })
    }

    pub fn apply_median_filter(
        &self,
        volume: &Volume,
        kernel_size: usize,
    ) -> Result<Volume, ProcessingError> {
        if kernel_size == 0 || kernel_size % 2 == 0 {
            return Err(invalid("kernel size", format!("{kernel_size} must be odd")));
        }
        self.run(volume, Operation::MedianFilter, |data, _| {
            smoothing::median(data, kernel_size / 2)
        })
    }

    pub fn apply_anisotropic_diffusion(
        &self,
        volume: &Volume,
        iterations: usize,
        time_step: f64,
    ) -> Result<Volume, ProcessingError> {
        if !(time_step > 0.0 && time_step <= smoothing::MAX_DIFFUSION_STEP) {
            return Err(invalid(
                "time step",
                format!("{time_step} must lie in (0, 1/6]"),
            ));
        }
        self.run(volume, Operation::AnisotropicDiffusion, |data, progress| {
            smoothing::anisotropic_diffusion(data, iterations, time_step as f32, progress)
        })
    }

    pub fn apply_erosion(&self, volume: &Volume, radius: usize) -> Result<Volume, ProcessingError> {
        self.run(volume, Operation::Erosion, |data, _| morphology::erode(data, radius))
    }

    pub fn apply_dilation(
        &self,
        volume: &Volume,
        radius: usize,
    ) -> Result<Volume, ProcessingError> {
        self.run(volume, Operation::Dilation, |data, _| morphology::dilate(data, radius))
    }

    pub fn apply_opening(&self, volume: &Volume, radius: usize) -> Result<Volume, ProcessingError> {
        self.run(volume, Operation::Opening, |data, progress| {
            let eroded = morphology::erode(data, radius);
            progress(50);
            morphology::dilate(&eroded, radius)
        })
    }

    pub fn apply_closing(&self, volume: &Volume, radius: usize) -> Result<Volume, ProcessingError> {
        self.run(volume, Operation::Closing, |data, progress| {
            let dilated = morphology::dilate(data, radius);
            progress(50);
            morphology::erode(&dilated, radius)
        })
    }

    /// Gradient magnitude of the 3D Sobel operator.
    pub fn apply_sobel_filter(&self, volume: &Volume) -> Result<Volume, ProcessingError> {
        self.run(volume, Operation::Sobel, |data, _| edges::sobel_magnitude(data))
    }

    /// Slice-wise Canny edges; the two thresholds may come in either order.
    pub fn apply_canny_edge_detector(
        &self,
        volume: &Volume,
        threshold1: f64,
        threshold2: f64,
    ) -> Result<Volume, ProcessingError> {
        if !(threshold1.is_finite() && threshold2.is_finite()) {
            return Err(invalid("canny thresholds", "must be finite"));
        }
        let low = threshold1.min(threshold2) as f32;
        let high = threshold1.max(threshold2) as f32;
        self.run(volume, Operation::Canny, |data, progress| {
            edges::canny(data, low, high, progress)
        })
    }

    /// 1 inside `[lower, upper]`, 0 elsewhere.
    pub fn apply_threshold(
        &self,
        volume: &Volume,
        lower: f64,
        upper: f64,
    ) -> Result<Volume, ProcessingError> {
        if lower.is_nan() || upper.is_nan() || lower > upper {
            return Err(invalid(
                "threshold",
                format!("lower {lower} exceeds upper {upper}"),
            ));
        }
        self.run(volume, Operation::Threshold, |data, _| {
            threshold::band(data, lower as f32, upper as f32)
        })
    }

    /// Mask of the voxels above the Otsu threshold.
    pub fn apply_otsu_threshold(&self, volume: &Volume) -> Result<Volume, ProcessingError> {
        self.run(volume, Operation::OtsuThreshold, |data, _| {
            let level = threshold::otsu_level(data);
            debug!("otsu threshold {level}");
            threshold::above(data, level)
        })
    }

    /// Unsharp mask: `v + amount * (v - gaussian(v, 1))`.
    pub fn apply_sharpen(&self, volume: &Volume, amount: f64) -> Result<Volume, ProcessingError> {
        if !(amount.is_finite() && amount >= 0.0) {
            return Err(invalid("amount", format!("{amount} must be non-negative")));
        }
        self.run(volume, Operation::Sharpen, |data, progress| {
            smoothing::sharpen(data, amount as f32, progress)
        })
    }

    fn run<F>(&self, volume: &Volume, op: Operation, body: F) -> Result<Volume, ProcessingError>
    where
        F: FnOnce(&Array3<f32>, &mut dyn FnMut(u8)) -> Array3<f32>,
    {
        if volume.is_empty() {
            return Err(ProcessingError::EmptyVolume);
        }
        self.events.emit(&ProcessingEvent::Started(op));
        let start = Instant::now();

        let mut last = 0;
        let mut report = |percent: u8| {
            let percent = percent.min(99);
            if percent > last {
                last = percent;
                self.events.emit(&ProcessingEvent::Progress(percent));
            }
        };
        let data = body(volume.data(), &mut report);

        self.events.emit(&ProcessingEvent::Progress(100));
        self.events.emit(&ProcessingEvent::Finished(op));
        debug!("{op} on {:?} took {:?}", volume.dim(), start.elapsed());

        Ok(Volume::new(data, volume.spacing()).with_origin(volume.origin()))
    }
}

/// Correlates every lane along `axis` with `kernel` (odd length, centred),
/// clamping reads at the borders.
pub(crate) fn convolve_axis(data: &Array3<f32>, axis: Axis, kernel: &[f32]) -> Array3<f32> {
    let radius = (kernel.len() / 2) as isize;
    let last = data.len_of(axis) as isize - 1;
    let mut out = Array3::zeros(data.raw_dim());
    Zip::indexed(&mut out).par_for_each(|(z, y, x), o| {
        let mut index = [z, y, x];
        let center = index[axis.index()] as isize;
        let mut acc = 0.0;
        for (k, weight) in kernel.iter().enumerate() {
            index[axis.index()] = (center + k as isize - radius).clamp(0, last) as usize;
            acc += weight * data[index];
        }
        *o = acc;
    });
    out
}

/// Folds every `2 * radius + 1` window along `axis` with `pick`. Windows
/// are truncated at the borders.
pub(crate) fn rank_axis(
    data: &Array3<f32>,
    axis: Axis,
    radius: usize,
    pick: fn(f32, f32) -> f32,
) -> Array3<f32> {
    let len = data.len_of(axis);
    let mut out = Array3::zeros(data.raw_dim());
    Zip::indexed(&mut out).par_for_each(|(z, y, x), o| {
        let mut index = [z, y, x];
        let center = index[axis.index()];
        let lo = center.saturating_sub(radius);
        let hi = (center + radius).min(len - 1);
        index[axis.index()] = lo;
        let mut acc = data[index];
        for p in lo + 1..=hi {
            index[axis.index()] = p;
            acc = pick(acc, data[index]);
        }
        *o = acc;
    });
    out
}

pub(crate) fn gaussian_kernel(sigma: f64) -> Vec<f32> {
    let radius = (3.0 * sigma).ceil().max(1.0) as isize;
    let denom = 2.0 * sigma * sigma;
    let weights: Vec<f64> = (-radius..=radius)
        .map(|i| (-(i * i) as f64 / denom).exp())
        .collect();
    let total: f64 = weights.iter().sum();
    weights.iter().map(|w| (w / total) as f32).collect()
}
