//! # medimg
//!
//! A headless backend for a volumetric medical image viewer.
//!
//! Images are read from DICOM series, NIfTI-1 (`.nii`) and MetaImage
//! (`.mha`, `.mhd`) files into a [`Volume`], a scalar `f32` grid with
//! physical spacing and origin. DICOM files are decoded in parallel using
//! rayon. Volumes can be sliced along the three medical axes:
//!  - Axial
//!  - Coronal
//!  - Sagittal
//!
//! Coronal and Sagittal slices can be interpolated to preserve the aspect
//! ratio of anisotropic voxels. On top of the volume the crate provides:
//!  - window/level display with colormaps, zoom and a 3D MIP view
//!  - filters: Gaussian, median, anisotropic diffusion, morphology,
//!    Sobel, Canny, thresholds and sharpening
//!  - rigid, affine and deformable (demons) registration
//!  - measurements and volume statistics
//!  - an in-process plugin system, a JSON settings store and logging
//!
//! A [`Session`] ties these together the way a viewer window would.
//!
//! # Examples
//!
//! ## Rendering the middle coronal slice of a DICOM series
//!
//! ```no_run
//! # use medimg::{Config, Session, ViewType};
//! let mut session = Session::new(Config::in_memory())?;
//! session.open_file("dicom")?;
//! session.set_view_type(ViewType::Coronal);
//! session.export_image("coronal.png")?;
//! # Ok::<(), medimg::SessionError>(())
//! ```
//!
//! ## Reading a slice directly
//!
//! ```no_run
//! # use medimg::{Interpolation, Orientation, VolumeLoader};
//! let loaded = VolumeLoader::open("brain.nii")?;
//! let volume = loaded.volume;
//! let image = volume.get_image_from_axis(
//!     volume.dim().2 / 2,
//!     Orientation::Sagittal,
//!     Interpolation::Bilinear,
//!     volume.optimal_window_level(),
//! );
//! # Ok::<(), medimg::VolumeLoaderError>(())
//! ```

pub mod config;
pub mod data_model;
pub mod enums;
pub mod formats;
mod interpolator;
pub mod logging;
pub mod measurement;
pub mod parameters;
pub mod plugins;
pub mod processing;
pub mod registration;
pub mod render;
pub mod session;
pub mod signal;
pub mod transform;
pub mod viewport;
pub mod volume;
pub mod volume_loader;

pub use config::Config;
pub use data_model::DataModel;
pub use enums::{
    Colormap, Interpolation, MeasurementTool, Orientation, RegistrationKind, SortBy, ViewType,
};
pub use processing::{FilterRequest, ImageProcessor};
pub use registration::RegistrationManager;
pub use render::{DisplaySettings, Renderer, WindowLevel};
pub use session::{Session, SessionError};
pub use transform::Transform;
pub use viewport::Viewport;
pub use volume::Volume;
pub use volume_loader::{ImageFormat, LoadedImage, VolumeLoader, VolumeLoaderError};
