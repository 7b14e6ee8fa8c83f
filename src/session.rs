//! One open viewer: the image, its view state and the services acting on it.
//!
//! A [`Session`] is what a front end drives. Every user action maps onto
//! one method here, which updates the data model and keeps the viewport
//! and the parameter state in step.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::RgbImage;
use log::{info, warn};
use rayon::{ThreadPool, ThreadPoolBuilder};
use thiserror::Error;

use crate::config::{Config, ConfigError};
use crate::data_model::DataModel;
use crate::enums::{Interpolation, MeasurementTool, Orientation, RegistrationKind, ViewType};
use crate::measurement::{self, Measurement, VolumeStatistics, VoxelPoint};
use crate::parameters::{FilterKind, ParameterId, ParameterState};
use crate::plugins::{PluginError, PluginKind, PluginManager};
use crate::processing::{FilterRequest, ImageProcessor, ProcessingError};
use crate::registration::{RegistrationError, RegistrationManager, RegistrationSummary};
use crate::render::{RenderError, Renderer};
use crate::transform::Transform;
use crate::viewport::Viewport;
use crate::volume::Volume;
use crate::volume_loader::{ImageFormat, VolumeLoader, VolumeLoaderError};

/// Unsharp-mask strength used by the parameter panel's sharpen filter.
const SHARPEN_AMOUNT: f64 = 1.0;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no image is loaded")]
    NoImage,

    #[error("slice {index} is outside 0..{count}")]
    SliceOutOfRange { index: usize, count: usize },

    #[error("zoom factor {0} must be positive")]
    InvalidZoom(f64),

    #[error("registration needs both a fixed and a moving image")]
    MissingRegistrationInput,

    #[error("{tool:?} needs {expected} points, got {found}")]
    MeasurementPoints {
        tool: MeasurementTool,
        expected: &'static str,
        found: usize,
    },

    #[error(transparent)]
    Loader(#[from] VolumeLoaderError),

    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to write image: {0}")]
    Image(#[from] image::ImageError),

    #[error("failed to build the worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub struct Session {
    config: Config,
    pool: ThreadPool,
    current_path: Option<PathBuf>,
    pub data_model: DataModel,
    pub processor: ImageProcessor,
    pub registration: RegistrationManager,
    pub viewport: Viewport,
    pub parameters: ParameterState,
    pub renderer: Renderer,
    pub plugins: PluginManager,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("current_path", &self.current_path)
            .field("has_image", &self.data_model.has_image())
            .field("view_type", &self.viewport.view_type())
            .field("plugins", &self.plugins.loaded_plugins())
            .finish()
    }
}

impl Session {
    /// Builds a session from `config`, with the built-in plugins loaded.
    pub fn new(config: Config) -> Result<Self, SessionError> {
        let processing = config.image_processing_settings();
        let rendering = config.rendering_settings();

        let pool = ThreadPoolBuilder::new()
            .num_threads(processing.worker_threads)
            .thread_name(|i| format!("medimg-worker-{i}"))
            .build()?;

        let mut renderer = Renderer::new();
        let [r, g, b] = rendering.background;
        renderer.set_background_color(r, g, b);
        renderer.set_max_texture_size(rendering.max_texture_size);
        renderer.set_interpolation(if rendering.interpolate {
            Interpolation::Bilinear
        } else {
            Interpolation::None
        });
        renderer.initialize();

        let mut viewport = Viewport::new();
        viewport.set_window_level(processing.default_window_width, processing.default_window_level);
        viewport.set_colormap(processing.default_colormap);

        let mut parameters = ParameterState::new();
        parameters.set_colormap(processing.default_colormap);

        let mut plugins = PluginManager::with_builtin_providers();
        for name in plugins.providers() {
            if let Err(err) = plugins.load(&name) {
                warn!("built-in plugin {name} unavailable: {err}");
            }
        }
        plugins.refresh();

        Ok(Self {
            config,
            pool,
            current_path: None,
            data_model: DataModel::new(),
            processor: ImageProcessor::new(),
            registration: RegistrationManager::new(),
            viewport,
            parameters,
            renderer,
            plugins,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn current_path(&self) -> Option<&Path> {
        self.current_path.as_deref()
    }

    pub fn image(&self) -> Result<Arc<Volume>, SessionError> {
        self.data_model.image().cloned().ok_or(SessionError::NoImage)
    }

    /// Loads `path`, makes it the current image and fits the view to it.
    pub fn open_file(&mut self, path: impl AsRef<Path>) -> Result<ImageFormat, SessionError> {
        let path = path.as_ref();
        let loaded = VolumeLoader::open(path)?;
        self.data_model.set_transform(Transform::identity());
        self.data_model.set_metadata(loaded.metadata);
        self.publish(loaded.volume, true);
        self.registration.reset();
        self.current_path = Some(path.to_path_buf());
        if let Err(err) = self.config.add_recent_file(&path.display().to_string()) {
            warn!("could not record {} as a recent file: {err}", path.display());
        }
        Ok(loaded.format)
    }

    pub fn close_image(&mut self) {
        self.data_model.clear();
        self.viewport.clear_volume();
        self.registration.reset();
        self.current_path = None;
    }

    pub fn save_file(&self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        let image = self.image()?;
        VolumeLoader::save(&image, path)?;
        Ok(())
    }

    /// Writes the current view as a PNG.
    pub fn export_image(&self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        let frame = self.render()?;
        frame.save_with_format(path.as_ref(), image::ImageFormat::Png)?;
        info!("exported view to {}", path.as_ref().display());
        Ok(())
    }

    pub fn render(&self) -> Result<RgbImage, SessionError> {
        let image = self.image()?;
        Ok(self.renderer.render(&image, &self.viewport)?)
    }

    /// Middle slice at zoom 1.
    pub fn reset_view(&mut self) {
        self.viewport.reset_view();
        self.parameters.reset_zoom();
        self.parameters
            .set_value(ParameterId::Slice, self.viewport.current_slice() as f64);
        self.renderer.reset_camera();
    }

    /// Restores the parameter defaults and applies them to the view.
    pub fn reset_parameters(&mut self) {
        self.parameters.reset_parameters();
        let (window, level) = self.parameters.window_level();
        self.viewport.set_window_level(window, level);
        self.viewport.set_zoom(self.parameters.zoom());
        self.viewport.set_colormap(self.parameters.colormap());
        self.viewport.set_inverted(self.parameters.invert_colors());
        self.viewport
            .set_brightness(self.parameters.value(ParameterId::Brightness) as i32);
        self.viewport
            .set_contrast(self.parameters.value(ParameterId::Contrast) as i32);
        self.viewport.set_view_type(self.parameters.view_type());
        if self.data_model.has_image() {
            let slice = self.parameters.slice();
            self.sync_slice_range();
            self.viewport.set_slice_position(slice);
            self.parameters.set_value(ParameterId::Slice, slice as f64);
        }
    }

    pub fn set_window_level(&mut self, window: f64, level: f64) {
        self.viewport.set_window_level(window, level);
        let applied = self.viewport.window_level();
        self.parameters.set_window_level(applied.window, applied.level);
    }

    pub fn set_slice(&mut self, index: usize) -> Result<(), SessionError> {
        self.image()?;
        if !self.viewport.set_slice_position(index) {
            return Err(SessionError::SliceOutOfRange {
                index,
                count: self.viewport.slice_count(),
            });
        }
        self.parameters.set_value(ParameterId::Slice, index as f64);
        Ok(())
    }

    pub fn set_zoom(&mut self, zoom: f64) -> Result<(), SessionError> {
        if !self.viewport.set_zoom(zoom) {
            return Err(SessionError::InvalidZoom(zoom));
        }
        self.parameters.set_value(ParameterId::Zoom, zoom);
        Ok(())
    }

    pub fn set_view_type(&mut self, view_type: ViewType) {
        self.viewport.set_view_type(view_type);
        self.parameters.set_view_type(view_type);
        self.sync_slice_range();
    }

    /// Runs `request` on the current image and publishes the result.
    pub fn apply_filter(&mut self, request: FilterRequest) -> Result<(), SessionError> {
        let image = self.image()?;
        let processor = &self.processor;
        let filtered = self.pool.install(|| processor.apply(&image, request))?;
        self.publish(filtered, false);
        Ok(())
    }

    /// Applies the filter selected in the parameter state.
    pub fn apply_selected_filter(&mut self) -> Result<(), SessionError> {
        let request = match self.parameters.filter_type() {
            FilterKind::Gaussian => FilterRequest::Gaussian {
                sigma: self.parameters.sigma(),
            },
            FilterKind::Median => FilterRequest::Median {
                kernel_size: self.parameters.kernel_size(),
            },
            FilterKind::Sharpen => FilterRequest::Sharpen {
                amount: SHARPEN_AMOUNT,
            },
        };
        self.parameters.request_filter();
        self.apply_filter(request)
    }

    /// Binary mask of the threshold bounds in the parameter state.
    pub fn apply_threshold_from_parameters(&mut self) -> Result<(), SessionError> {
        let (lower, upper) = self.parameters.threshold();
        self.apply_filter(FilterRequest::Threshold { lower, upper })
    }

    /// Registers the moving file onto the fixed file. The registered image
    /// replaces the current one.
    pub fn register(
        &mut self,
        kind: RegistrationKind,
        fixed: impl AsRef<Path>,
        moving: impl AsRef<Path>,
    ) -> Result<RegistrationSummary, SessionError> {
        let (fixed, moving) = (fixed.as_ref(), moving.as_ref());
        self.parameters.set_fixed_image(fixed);
        self.parameters.set_moving_image(moving);
        self.parameters.set_registration_algorithm(kind);
        let fixed_image = VolumeLoader::open(fixed)?;
        let moving_image = VolumeLoader::open(moving)?;
        self.data_model.set_metadata(fixed_image.metadata);
        self.current_path = Some(fixed.to_path_buf());
        self.register_volumes(kind, &fixed_image.volume, &moving_image.volume)
    }

    /// Uses the paths and algorithm chosen in the parameter state.
    pub fn register_from_parameters(&mut self) -> Result<RegistrationSummary, SessionError> {
        let selection = self.parameters.registration().clone();
        let (Some(fixed), Some(moving)) = (selection.fixed_image, selection.moving_image) else {
            return Err(SessionError::MissingRegistrationInput);
        };
        let kind = selection.algorithm.unwrap_or(RegistrationKind::Rigid);
        self.parameters.request_registration();
        self.register(kind, fixed, moving)
    }

    pub fn register_volumes(
        &mut self,
        kind: RegistrationKind,
        fixed: &Volume,
        moving: &Volume,
    ) -> Result<RegistrationSummary, SessionError> {
        let registration = &mut self.registration;
        let summary = self
            .pool
            .install(|| registration.perform(kind, fixed, moving))?;
        self.data_model
            .set_transform(*self.registration.transform_matrix());
        if let Some(registered) = self.registration.registered_image().cloned() {
            self.publish(registered, true);
        }
        Ok(summary)
    }

    /// Runs plugin `name` on the current image. Output of processing
    /// plugins becomes the current image.
    pub fn run_plugin(&mut self, name: &str) -> Result<Volume, SessionError> {
        let image = self.image()?;
        let plugin = self
            .plugins
            .plugin_mut(name)
            .ok_or_else(|| PluginError::NotLoaded(name.to_string()))?;
        let kind = plugin.metadata().kind;
        let output = self.pool.install(|| plugin.process(&image))?;
        if kind == PluginKind::Processing {
            self.publish(output.clone(), false);
        }
        Ok(output)
    }

    /// Performs `measurement` with a measurement plugin and returns its
    /// result text.
    pub fn measure_with_plugin(
        &mut self,
        name: &str,
        measurement: &str,
    ) -> Result<String, SessionError> {
        let image = self.image()?;
        let plugin = self
            .plugins
            .plugin_mut(name)
            .and_then(|plugin| plugin.as_measurement_mut())
            .ok_or_else(|| PluginError::NotLoaded(name.to_string()))?;
        plugin.perform_measurement(measurement, &image)?;
        Ok(plugin.result_text())
    }

    /// Renders the current image through a visualization plugin with the
    /// viewport's display settings.
    pub fn visualize_with_plugin(&self, name: &str) -> Result<RgbImage, SessionError> {
        let image = self.image()?;
        let plugin = self
            .plugins
            .plugin(name)
            .and_then(|plugin| plugin.as_visualization())
            .ok_or_else(|| PluginError::NotLoaded(name.to_string()))?;
        Ok(plugin.update_visualization(&image, self.viewport.display())?)
    }

    /// Measures with `tool` on the current image. Points are voxel
    /// coordinates `[z, y, x]`; areas are taken in the plane of the current
    /// view.
    pub fn measure(
        &self,
        tool: MeasurementTool,
        points: &[VoxelPoint],
    ) -> Result<Measurement, SessionError> {
        let spacing = self.image()?.spacing();
        let wrong_count = |expected| SessionError::MeasurementPoints {
            tool,
            expected,
            found: points.len(),
        };
        let value = match (tool, points) {
            (MeasurementTool::Distance, [a, b]) => measurement::distance_mm(spacing, *a, *b),
            (MeasurementTool::Distance, _) => return Err(wrong_count("2")),
            (MeasurementTool::Angle, [a, vertex, b]) => {
                measurement::angle_degrees(spacing, *a, *vertex, *b).unwrap_or(0.0)
            }
            (MeasurementTool::Angle, _) => return Err(wrong_count("3")),
            (MeasurementTool::Area, points) if points.len() >= 3 => {
                let orientation = self.viewport.view_type().orientation();
                let plane: Vec<[f64; 2]> = points
                    .iter()
                    .map(|&[z, y, x]| match orientation {
                        Orientation::Axial => [y, x],
                        Orientation::Coronal => [z, x],
                        Orientation::Sagittal => [z, y],
                    })
                    .collect();
                measurement::polygon_area_mm2(spacing, orientation, &plane)
            }
            (MeasurementTool::Area, _) => return Err(wrong_count("at least 3")),
        };
        Ok(Measurement { tool, value })
    }

    pub fn statistics(&self) -> Result<Option<VolumeStatistics>, SessionError> {
        let image = self.image()?;
        Ok(VolumeStatistics::compute(image.as_ref()))
    }

    pub fn about(&self) -> String {
        let plugins = self.plugins.loaded_plugins();
        format!(
            "{} {}\n{}\n\nformats: DICOM, NIfTI-1, MetaImage\n\
             registration: rigid, affine, deformable\nplugins: {}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            env!("CARGO_PKG_DESCRIPTION"),
            if plugins.is_empty() {
                "none".to_string()
            } else {
                plugins.join(", ")
            }
        )
    }

    /// Makes `volume` the current image. With `fit_view` the viewport and
    /// the window controls are refitted to it.
    fn publish(&mut self, volume: Volume, fit_view: bool) {
        let range = volume.scalar_range();
        let window_level = volume.optimal_window_level();
        let dims_changed = self
            .data_model
            .image()
            .is_none_or(|current| current.dim() != volume.dim());
        let volume = Arc::new(volume);
        self.data_model.set_image(Some(Arc::clone(&volume)));

        if let Some((min, max)) = range {
            self.parameters.set_threshold_range(min as f64, max as f64);
        }
        if fit_view || dims_changed {
            self.viewport.set_volume(&volume);
            self.viewport.reset_view();
            self.sync_slice_range();
            self.set_window_level(window_level.window, window_level.level);
        }
    }

    fn sync_slice_range(&mut self) {
        self.parameters
            .set_slice_range(self.viewport.slice_count().saturating_sub(1));
        self.parameters
            .set_value(ParameterId::Slice, self.viewport.current_slice() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array3;

    fn session() -> Session {
        Session::new(Config::in_memory()).unwrap()
    }

    fn ramp() -> Volume {
        Volume::new(
            Array3::from_shape_fn((4, 6, 8), |(z, y, x)| (z * 10 + y + x) as f32),
            (1.0, 1.0, 2.0),
        )
    }

    #[test]
    fn image_operations_need_an_image() {
        let mut session = session();
        assert!(matches!(session.render(), Err(SessionError::NoImage)));
        assert!(matches!(session.set_slice(0), Err(SessionError::NoImage)));
        assert!(matches!(
            session.apply_filter(FilterRequest::Sobel),
            Err(SessionError::NoImage)
        ));
        assert!(matches!(session.run_plugin("mip"), Err(SessionError::NoImage)));
    }

    #[test]
    fn builtin_plugins_are_loaded() {
        let session = session();
        assert_eq!(
            session.plugins.loaded_plugins(),
            vec!["gaussian-smoothing", "mip", "statistics"]
        );
        assert!(session.about().contains("plugins: gaussian-smoothing, mip, statistics"));
    }

    #[test]
    fn publishing_fits_the_view() {
        let mut session = session();
        session.publish(ramp(), true);
        assert_eq!(session.viewport.current_slice(), 2);
        assert_eq!(session.parameters.slice(), 2);
        let wl = session.viewport.window_level();
        assert_relative_eq!(wl.window, 42.0);
        assert_relative_eq!(wl.level, 21.0);

        assert!(matches!(
            session.set_slice(9),
            Err(SessionError::SliceOutOfRange { index: 9, count: 4 })
        ));
        session.set_view_type(ViewType::Sagittal);
        assert_eq!(session.viewport.slice_count(), 8);
        session.set_slice(7).unwrap();
        assert_eq!(session.parameters.slice(), 7);
    }

    #[test]
    fn filters_replace_the_image_but_keep_the_slice() {
        let mut session = session();
        session.publish(ramp(), true);
        session.set_slice(1).unwrap();
        session
            .apply_filter(FilterRequest::Threshold {
                lower: 20.0,
                upper: 100.0,
            })
            .unwrap();
        assert_eq!(session.viewport.current_slice(), 1);
        let image = session.image().unwrap();
        assert_eq!(image.data()[[1, 0, 0]], 0.0);
        assert_eq!(image.data()[[2, 0, 0]], 1.0);
    }

    #[test]
    fn zoom_and_reset() {
        let mut session = session();
        session.publish(ramp(), true);
        session.set_zoom(2.0).unwrap();
        assert!(matches!(session.set_zoom(0.0), Err(SessionError::InvalidZoom(_))));
        session.set_slice(0).unwrap();
        session.reset_view();
        assert_eq!(session.viewport.zoom(), 1.0);
        assert_eq!(session.viewport.current_slice(), 2);
    }

    #[test]
    fn reset_parameters_restores_the_defaults() {
        let mut session = session();
        session.set_window_level(10.0, 5.0);
        session.set_zoom(3.0).unwrap();
        session.reset_parameters();
        assert_eq!(session.parameters.window_level(), (400.0, 40.0));
        assert_eq!(session.viewport.window_level().window, 400.0);
        assert_eq!(session.viewport.zoom(), 1.0);
    }

    #[test]
    fn reset_parameters_ignores_the_image_intensity_span() {
        let mut session = session();
        session.publish(ramp(), true);
        assert_eq!(session.parameters.range(ParameterId::Window), (1.0, 2000.0));
        assert_eq!(session.parameters.range(ParameterId::Level), (-1000.0, 1000.0));
        session.reset_parameters();
        assert_eq!(session.parameters.window_level(), (400.0, 40.0));
        assert_eq!(session.viewport.window_level().window, 400.0);

        session.set_window_level(100.0, -500.0);
        assert_eq!(session.parameters.window_level(), (100.0, -500.0));
    }

    #[test]
    fn statistics_describe_the_current_image() {
        let mut session = session();
        assert!(matches!(session.statistics(), Err(SessionError::NoImage)));
        session.publish(ramp(), true);
        let stats = session.statistics().unwrap().unwrap();
        assert_eq!(stats.voxel_count, 4 * 6 * 8);
        assert_relative_eq!(stats.min, 0.0);
        assert_relative_eq!(stats.max, 42.0);
    }

    #[test]
    fn measurements_use_the_spacing() {
        let mut session = session();
        session.publish(ramp(), true);
        let distance = session
            .measure(MeasurementTool::Distance, &[[0.0, 0.0, 0.0], [3.0, 0.0, 0.0]])
            .unwrap();
        assert_relative_eq!(distance.value, 6.0);
        assert!(matches!(
            session.measure(MeasurementTool::Angle, &[[0.0; 3]]),
            Err(SessionError::MeasurementPoints { .. })
        ));
        let area = session
            .measure(
                MeasurementTool::Area,
                &[[0.0, 0.0, 0.0], [0.0, 0.0, 2.0], [0.0, 2.0, 2.0], [0.0, 2.0, 0.0]],
            )
            .unwrap();
        assert_relative_eq!(area.value, 4.0);
    }

    #[test]
    fn plugins_run_against_the_current_image() {
        let mut session = session();
        session.publish(ramp(), true);
        let projection = session.run_plugin("mip").unwrap();
        assert_eq!(projection.dim(), (1, 6, 8));
        assert_eq!(session.image().unwrap().dim(), (4, 6, 8));

        let text = session.measure_with_plugin("statistics", "max").unwrap();
        assert_eq!(text, "max: 42.00");
        let frame = session.visualize_with_plugin("mip").unwrap();
        assert_eq!(frame.dimensions(), (8, 6));

        session.run_plugin("gaussian-smoothing").unwrap();
        assert!(session.image().unwrap().data()[[0, 0, 0]] > 0.0);
        assert!(matches!(
            session.run_plugin("missing"),
            Err(SessionError::Plugin(PluginError::NotLoaded(_)))
        ));
    }

    #[test]
    fn registration_needs_paths() {
        let mut session = session();
        assert!(matches!(
            session.register_from_parameters(),
            Err(SessionError::MissingRegistrationInput)
        ));
    }
}
