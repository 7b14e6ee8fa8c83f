//! Command-line front end for medimg.
//!
//! Each subcommand opens a session, performs one viewer action and writes
//! the result to disk or stdout.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use serde_json::{Value, json};
use thiserror::Error;

use medimg::config::{Config, ConfigError};
use medimg::logging::{self, LogLevel, LoggerOptions, LoggingError};
use medimg::measurement::VolumeStatistics;
use medimg::plugins::PluginError;
use medimg::{
    Colormap, FilterRequest, RegistrationKind, Session, SessionError, ViewType, VolumeLoader,
    VolumeLoaderError,
};

type Result<T> = std::result::Result<T, CliError>;

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Loader(#[from] VolumeLoaderError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Logging(#[from] LoggingError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no config path: set MEDIMG_CONFIG or HOME, or pass --config")]
    NoConfigPath,

    #[error("unknown config key {0:?}")]
    UnknownKey(String),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum View {
    Axial,
    Coronal,
    Sagittal,
    /// Maximum intensity projection
    Volume,
}

impl From<View> for ViewType {
    fn from(view: View) -> Self {
        match view {
            View::Axial => ViewType::Axial,
            View::Coronal => ViewType::Coronal,
            View::Sagittal => ViewType::Sagittal,
            View::Volume => ViewType::Volume3D,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColormapArg {
    Gray,
    Rainbow,
    Hot,
    CoolWarm,
}

impl From<ColormapArg> for Colormap {
    fn from(colormap: ColormapArg) -> Self {
        match colormap {
            ColormapArg::Gray => Colormap::Gray,
            ColormapArg::Rainbow => Colormap::Rainbow,
            ColormapArg::Hot => Colormap::Hot,
            ColormapArg::CoolWarm => Colormap::CoolWarm,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Filter {
    Gaussian,
    Median,
    Diffusion,
    Erosion,
    Dilation,
    Opening,
    Closing,
    Sobel,
    Canny,
    Threshold,
    Otsu,
    Sharpen,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Algorithm {
    Rigid,
    Affine,
    Deformable,
}

impl From<Algorithm> for RegistrationKind {
    fn from(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Rigid => RegistrationKind::Rigid,
            Algorithm::Affine => RegistrationKind::Affine,
            Algorithm::Deformable => RegistrationKind::Deformable,
        }
    }
}

/// Volumetric medical image viewer backend.
#[derive(Parser)]
#[command(name = "medimg")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file (defaults to $MEDIMG_CONFIG or the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level: debug, info, warning, error or critical
    #[arg(long, global = true, default_value = "warning")]
    log_level: String,

    /// Also append log records to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show metadata and intensity statistics of an image
    Info {
        /// DICOM file or directory, .nii, .mha or .mhd
        input: PathBuf,
    },

    /// Render one view of an image to PNG
    Render {
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        #[arg(long, value_enum, default_value = "axial")]
        view: View,

        /// Slice index (defaults to the middle slice)
        #[arg(long)]
        slice: Option<usize>,

        #[arg(long, requires = "level")]
        window: Option<f64>,

        #[arg(long, requires = "window")]
        level: Option<f64>,

        #[arg(long, default_value = "1.0")]
        zoom: f64,

        #[arg(long, value_enum, default_value = "gray")]
        colormap: ColormapArg,

        #[arg(long)]
        invert: bool,
    },

    /// Apply a filter and save the result (.nii, .mha or .mhd)
    Filter {
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        #[arg(short, long, value_enum)]
        filter: Filter,

        /// Gaussian sigma in voxels, 0.1 to 10
        #[arg(long, default_value = "1.0")]
        sigma: f64,

        /// Median kernel size (odd)
        #[arg(long, default_value = "3")]
        kernel_size: usize,

        /// Morphology radius in voxels
        #[arg(long, default_value = "1")]
        radius: usize,

        #[arg(long, default_value = "10")]
        iterations: usize,

        #[arg(long, default_value = "0.0625")]
        time_step: f64,

        /// Lower bound (threshold) or first hysteresis threshold (canny)
        #[arg(long, default_value = "0.0")]
        lower: f64,

        /// Upper bound (threshold) or second hysteresis threshold (canny)
        #[arg(long, default_value = "1.0")]
        upper: f64,

        /// Sharpening strength
        #[arg(long, default_value = "1.0")]
        amount: f64,
    },

    /// Register a moving image onto a fixed image
    Register {
        fixed: PathBuf,

        moving: PathBuf,

        #[arg(short, long, value_enum, default_value = "rigid")]
        algorithm: Algorithm,

        /// Where to save the registered image
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(long)]
        max_iterations: Option<usize>,
    },

    /// List plugins, optionally running one on an image
    Plugins {
        /// Extra directories to scan for plugin libraries
        #[arg(long)]
        directory: Vec<PathBuf>,

        /// Plugin to run
        #[arg(long, requires = "input")]
        run: Option<String>,

        #[arg(long)]
        input: Option<PathBuf>,

        /// Measurement to perform with a measurement plugin
        #[arg(long, requires = "run")]
        measure: Option<String>,

        /// Save the plugin output image here
        #[arg(short, long, requires = "run")]
        output: Option<PathBuf>,
    },

    /// Inspect or change settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print every setting
    Show,
    /// Print one setting
    Get { key: String },
    /// Set a setting; the value is parsed as JSON, else stored as text
    Set { key: String, value: String },
    /// Remove a setting
    Remove { key: String },
    /// Restore the defaults
    Reset,
    /// List recently opened files
    Recent,
}

fn filter_request(
    filter: Filter,
    sigma: f64,
    kernel_size: usize,
    radius: usize,
    iterations: usize,
    time_step: f64,
    lower: f64,
    upper: f64,
    amount: f64,
) -> FilterRequest {
    match filter {
        Filter::Gaussian => FilterRequest::Gaussian { sigma },
        Filter::Median => FilterRequest::Median { kernel_size },
        Filter::Diffusion => FilterRequest::AnisotropicDiffusion {
            iterations,
            time_step,
        },
        Filter::Erosion => FilterRequest::Erosion { radius },
        Filter::Dilation => FilterRequest::Dilation { radius },
        Filter::Opening => FilterRequest::Opening { radius },
        Filter::Closing => FilterRequest::Closing { radius },
        Filter::Sobel => FilterRequest::Sobel,
        Filter::Canny => FilterRequest::Canny {
            threshold1: lower,
            threshold2: upper,
        },
        Filter::Threshold => FilterRequest::Threshold { lower, upper },
        Filter::Otsu => FilterRequest::Otsu,
        Filter::Sharpen => FilterRequest::Sharpen { amount },
    }
}

fn open_config(path: Option<PathBuf>) -> Result<Config> {
    match path.or_else(Config::default_path) {
        Some(path) => Ok(Config::open(path)?),
        None => Ok(Config::in_memory()),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(&LoggerOptions {
        level: cli.log_level.parse::<LogLevel>()?,
        console: true,
        file: cli.log_file.clone(),
    })?;

    match cli.command {
        Commands::Info { input } => {
            let loaded = VolumeLoader::open(&input)?;
            let statistics = VolumeStatistics::compute(&loaded.volume);
            let report = json!({
                "metadata": loaded.metadata,
                "statistics": statistics,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Render {
            input,
            output,
            view,
            slice,
            window,
            level,
            zoom,
            colormap,
            invert,
        } => {
            let mut session = Session::new(open_config(cli.config)?)?;
            session.open_file(&input)?;
            session.set_view_type(view.into());
            if let Some(slice) = slice {
                session.set_slice(slice)?;
            }
            if let (Some(window), Some(level)) = (window, level) {
                session.set_window_level(window, level);
            }
            session.set_zoom(zoom)?;
            session.viewport.set_colormap(colormap.into());
            session.viewport.set_inverted(invert);
            session.export_image(&output)?;
            println!(
                "{} {} {} -> {}",
                session.viewport.slice_label(),
                session.viewport.window_level_label(),
                session.viewport.zoom_label(),
                output.display()
            );
        }

        Commands::Filter {
            input,
            output,
            filter,
            sigma,
            kernel_size,
            radius,
            iterations,
            time_step,
            lower,
            upper,
            amount,
        } => {
            let mut session = Session::new(open_config(cli.config)?)?;
            session.open_file(&input)?;
            let request = filter_request(
                filter,
                sigma,
                kernel_size,
                radius,
                iterations,
                time_step,
                lower,
                upper,
                amount,
            );
            session.apply_filter(request)?;
            session.save_file(&output)?;
            info!("{request:?} written to {}", output.display());
        }

        Commands::Register {
            fixed,
            moving,
            algorithm,
            output,
            max_iterations,
        } => {
            let mut session = Session::new(open_config(cli.config)?)?;
            if let Some(iterations) = max_iterations {
                session.registration.set_max_iterations(iterations);
            }
            let summary = session.register(algorithm.into(), &fixed, &moving)?;
            let report = json!({
                "algorithm": summary.kind.name(),
                "iterations": summary.iterations,
                "final_metric": summary.final_metric,
                "converged": summary.converged,
                "transform": session.registration.transform_matrix(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            if let Some(output) = output {
                session.save_file(&output)?;
            }
        }

        Commands::Plugins {
            directory,
            run,
            input,
            measure,
            output,
        } => {
            let mut session = Session::new(open_config(cli.config)?)?;
            for dir in directory {
                session.plugins.add_plugin_directory(dir);
            }
            session.plugins.refresh();
            for name in session.plugins.loaded_plugins() {
                if let Some(info) = session.plugins.plugin_info(&name) {
                    println!("{info}\n");
                }
            }
            if let Some(error) = session.plugins.last_error() {
                eprintln!("last plugin error: {error}");
            }

            if let (Some(name), Some(input)) = (run, input) {
                session.open_file(&input)?;
                match measure {
                    Some(measurement) => {
                        println!("{}", session.measure_with_plugin(&name, &measurement)?);
                    }
                    None => {
                        let result = session.run_plugin(&name)?;
                        if let Some(output) = output {
                            VolumeLoader::save(&result, &output)?;
                        }
                    }
                }
            }
        }

        Commands::Config { action } => {
            let path = cli.config.or_else(Config::default_path).ok_or(CliError::NoConfigPath)?;
            let config = Config::open(&path)?;
            match action {
                ConfigAction::Show => {
                    let all: serde_json::Map<String, Value> = config
                        .keys()
                        .into_iter()
                        .filter_map(|key| config.value(&key).map(|value| (key, value)))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&all)?);
                }
                ConfigAction::Get { key } => {
                    let value = config.value(&key).ok_or(CliError::UnknownKey(key))?;
                    println!("{value}");
                }
                ConfigAction::Set { key, value } => {
                    let value: Value = serde_json::from_str(&value).unwrap_or(Value::String(value));
                    config.set_value(&key, value)?;
                }
                ConfigAction::Remove { key } => config.remove(&key)?,
                ConfigAction::Reset => config.load_defaults()?,
                ConfigAction::Recent => {
                    for file in config.recent_files() {
                        println!("{file}");
                    }
                }
            }
            info!("config: {}", path.display());
        }
    }

    Ok(())
}
