use image::RgbImage;
use ndarray::Axis;

use super::{
    ImageProcessingPlugin, MeasurementPlugin, Plugin, PluginError, PluginKind, PluginMetadata,
    VisualizationPlugin,
};
use crate::enums::{Interpolation, Orientation};
use crate::measurement::VolumeStatistics;
use crate::processing::{ImageProcessor, SIGMA_RANGE};
use crate::render::DisplaySettings;
use crate::volume::Volume;

const AUTHOR: &str = "medimg";

fn metadata(name: &str, description: &str, kind: PluginKind) -> PluginMetadata {
    PluginMetadata {
        name: name.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        description: description.to_string(),
        author: AUTHOR.to_string(),
        kind,
    }
}

fn ensure_ready(plugin: &dyn Plugin, volume: &Volume) -> Result<(), PluginError> {
    let name = plugin.metadata().name;
    if !plugin.is_initialized() {
        return Err(PluginError::NotInitialized(name));
    }
    if !plugin.can_process(volume) {
        return Err(PluginError::CannotProcess(name));
    }
    Ok(())
}

/// Gaussian smoothing with a fixed sigma.
#[derive(Debug)]
pub struct GaussianSmoothingPlugin {
    sigma: f64,
    processor: ImageProcessor,
    initialized: bool,
}

impl GaussianSmoothingPlugin {
    pub const NAME: &'static str = "gaussian-smoothing";

    pub fn new(sigma: f64) -> Self {
        Self {
            sigma,
            processor: ImageProcessor::new(),
            initialized: false,
        }
    }
}

impl Default for GaussianSmoothingPlugin {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl Plugin for GaussianSmoothingPlugin {
    fn metadata(&self) -> PluginMetadata {
        metadata(
            Self::NAME,
            "separable Gaussian smoothing",
            PluginKind::Processing,
        )
    }

    fn initialize(&mut self) -> Result<(), PluginError> {
        if !SIGMA_RANGE.contains(&self.sigma) {
            return Err(PluginError::InitializationFailed {
                name: Self::NAME.to_string(),
                reason: format!("sigma {} out of range", self.sigma),
            });
        }
        self.initialized = true;
        Ok(())
    }

    fn finalize(&mut self) {
        self.initialized = false;
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn process(&mut self, volume: &Volume) -> Result<Volume, PluginError> {
        ensure_ready(&*self, volume)?;
        Ok(self.processor.apply_gaussian_smoothing(volume, self.sigma)?)
    }

    fn as_processing(&self) -> Option<&dyn ImageProcessingPlugin> {
        Some(self)
    }
}

impl ImageProcessingPlugin for GaussianSmoothingPlugin {
    fn supported_formats(&self) -> Vec<String> {
        ["DICOM", "NIfTI", "MetaImage"].map(String::from).to_vec()
    }

    fn has_preview(&self) -> bool {
        true
    }

    /// Smooths only the middle axial slice.
    fn generate_preview(&self, volume: &Volume) -> Result<Volume, PluginError> {
        ensure_ready(&*self, volume)?;
        let middle = volume.dim().0 / 2;
        let slice = volume
            .data()
            .index_axis(Axis(0), middle)
            .insert_axis(Axis(0))
            .to_owned();
        let origin = volume.voxel_to_world(middle as f64, 0.0, 0.0);
        let single = Volume::new(slice, volume.spacing())
            .with_origin((origin[0] as f32, origin[1] as f32, origin[2] as f32));
        Ok(self.processor.apply_gaussian_smoothing(&single, self.sigma)?)
    }
}

/// Axial maximum intensity projection.
#[derive(Debug, Default)]
pub struct MipPlugin {
    initialized: bool,
}

impl MipPlugin {
    pub const NAME: &'static str = "mip";
}

impl Plugin for MipPlugin {
    fn metadata(&self) -> PluginMetadata {
        metadata(
            Self::NAME,
            "axial maximum intensity projection",
            PluginKind::Visualization,
        )
    }

    fn initialize(&mut self) -> Result<(), PluginError> {
        self.initialized = true;
        Ok(())
    }

    fn finalize(&mut self) {
        self.initialized = false;
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// The projection as a one-slice volume.
    fn process(&mut self, volume: &Volume) -> Result<Volume, PluginError> {
        ensure_ready(&*self, volume)?;
        let projection = volume
            .maximum_intensity_projection(Orientation::Axial)
            .ok_or_else(|| PluginError::CannotProcess(Self::NAME.to_string()))?;
        Ok(Volume::new(projection.insert_axis(Axis(0)), volume.spacing())
            .with_origin(volume.origin()))
    }

    fn as_visualization(&self) -> Option<&dyn VisualizationPlugin> {
        Some(self)
    }
}

impl VisualizationPlugin for MipPlugin {
    fn rendering_type(&self) -> &str {
        "maximum-intensity-projection"
    }

    fn supports_interaction(&self) -> bool {
        false
    }

    fn update_visualization(
        &self,
        volume: &Volume,
        display: &DisplaySettings,
    ) -> Result<RgbImage, PluginError> {
        ensure_ready(&*self, volume)?;
        let cannot = || PluginError::CannotProcess(Self::NAME.to_string());
        let projection = volume
            .maximum_intensity_projection(Orientation::Axial)
            .ok_or_else(cannot)?;
        let gray = volume
            .plane_to_image(
                &projection.view(),
                Orientation::Axial,
                Interpolation::None,
                display.window_level,
            )
            .ok_or_else(cannot)?;
        Ok(display.colorize(&gray))
    }
}

/// Intensity statistics over the whole volume.
#[derive(Debug, Default)]
pub struct StatisticsPlugin {
    initialized: bool,
    last: Option<(String, f64)>,
}

impl StatisticsPlugin {
    pub const NAME: &'static str = "statistics";
    const TYPES: [&'static str; 5] = ["mean", "std-dev", "min", "max", "volume"];
}

impl Plugin for StatisticsPlugin {
    fn metadata(&self) -> PluginMetadata {
        metadata(
            Self::NAME,
            "intensity statistics and foreground volume",
            PluginKind::Measurement,
        )
    }

    fn initialize(&mut self) -> Result<(), PluginError> {
        self.initialized = true;
        Ok(())
    }

    fn finalize(&mut self) {
        self.initialized = false;
        self.last = None;
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Measurements leave the image untouched.
    fn process(&mut self, volume: &Volume) -> Result<Volume, PluginError> {
        ensure_ready(&*self, volume)?;
        Ok(volume.clone())
    }

    fn as_measurement(&self) -> Option<&dyn MeasurementPlugin> {
        Some(self)
    }

    fn as_measurement_mut(&mut self) -> Option<&mut dyn MeasurementPlugin> {
        Some(self)
    }
}

impl MeasurementPlugin for StatisticsPlugin {
    fn measurement_types(&self) -> Vec<String> {
        Self::TYPES.map(String::from).to_vec()
    }

    fn unit(&self) -> &str {
        match self.last.as_ref() {
            Some((kind, _)) if kind == "volume" => "mm³",
            _ => "",
        }
    }

    fn perform_measurement(&mut self, kind: &str, volume: &Volume) -> Result<f64, PluginError> {
        ensure_ready(&*self, volume)?;
        let stats = VolumeStatistics::compute(volume)
            .ok_or_else(|| PluginError::CannotProcess(Self::NAME.to_string()))?;
        let value = match kind {
            "mean" => stats.mean,
            "std-dev" => stats.std_dev,
            "min" => stats.min,
            "max" => stats.max,
            "volume" => stats.above_zero_mm3,
            other => return Err(PluginError::UnknownMeasurement(other.to_string())),
        };
        self.last = Some((kind.to_string(), value));
        Ok(value)
    }

    fn result_text(&self) -> String {
        match &self.last {
            Some((kind, value)) => format!("{kind}: {value:.2} {}", self.unit())
                .trim_end()
                .to_string(),
            None => String::new(),
        }
    }
}
