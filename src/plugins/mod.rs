//! Plugin interfaces and the manager that owns plugin instances.
//!
//! Plugins are compiled into the binary and registered with the
//! [`PluginManager`] as named providers. Loading a plugin "file" looks up
//! the provider named after the file, so deployments can still enable
//! plugins by dropping marker libraries into a plugin directory.

mod builtin;
mod manager;

pub use builtin::{GaussianSmoothingPlugin, MipPlugin, StatisticsPlugin};
pub use manager::{PluginEvent, PluginFactory, PluginManager};

use std::fmt;
use std::path::PathBuf;

use image::RgbImage;
use serde::Serialize;
use thiserror::Error;

use crate::processing::ProcessingError;
use crate::render::DisplaySettings;
use crate::volume::Volume;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin file does not exist: {0}")]
    FileNotFound(PathBuf),

    #[error("plugin directory does not exist: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("no provider registered for plugin {0:?}")]
    UnknownProvider(String),

    #[error("plugin already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("plugin not loaded: {0}")]
    NotLoaded(String),

    #[error("plugin {name} failed to initialize: {reason}")]
    InitializationFailed { name: String, reason: String },

    #[error("plugin {0} is not initialized")]
    NotInitialized(String),

    #[error("plugin {0} cannot process this image")]
    CannotProcess(String),

    #[error("unknown measurement {0:?}")]
    UnknownMeasurement(String),

    #[error(transparent)]
    Processing(#[from] ProcessingError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PluginKind {
    Processing,
    Visualization,
    Measurement,
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PluginKind::Processing => "processing",
            PluginKind::Visualization => "visualization",
            PluginKind::Measurement => "measurement",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginMetadata {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub kind: PluginKind,
}

impl fmt::Display for PluginMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "name: {}\nversion: {}\nauthor: {}\ndescription: {}",
            self.name, self.version, self.author, self.description
        )
    }
}

/// Behaviour shared by every plugin.
pub trait Plugin: Send + Sync {
    fn metadata(&self) -> PluginMetadata;

    fn initialize(&mut self) -> Result<(), PluginError>;

    fn finalize(&mut self);

    fn is_initialized(&self) -> bool;

    fn can_process(&self, volume: &Volume) -> bool {
        !volume.is_empty()
    }

    fn process(&mut self, volume: &Volume) -> Result<Volume, PluginError>;

    fn as_processing(&self) -> Option<&dyn ImageProcessingPlugin> {
        None
    }

    fn as_visualization(&self) -> Option<&dyn VisualizationPlugin> {
        None
    }

    fn as_measurement(&self) -> Option<&dyn MeasurementPlugin> {
        None
    }

    fn as_measurement_mut(&mut self) -> Option<&mut dyn MeasurementPlugin> {
        None
    }
}

pub trait ImageProcessingPlugin: Plugin {
    fn supported_formats(&self) -> Vec<String>;

    fn has_preview(&self) -> bool;

    /// A cheap approximation of [`Plugin::process`].
    fn generate_preview(&self, volume: &Volume) -> Result<Volume, PluginError>;
}

pub trait VisualizationPlugin: Plugin {
    fn rendering_type(&self) -> &str;

    fn supports_interaction(&self) -> bool;

    fn update_visualization(
        &self,
        volume: &Volume,
        display: &DisplaySettings,
    ) -> Result<RgbImage, PluginError>;
}

pub trait MeasurementPlugin: Plugin {
    fn measurement_types(&self) -> Vec<String>;

    /// Unit of the last measurement.
    fn unit(&self) -> &str;

    fn perform_measurement(&mut self, kind: &str, volume: &Volume) -> Result<f64, PluginError>;

    fn result_text(&self) -> String;
}
