use crate::{
    data_model::Metadata,
    enums::SortBy,
    formats::{FormatError, metaimage, nifti},
    volume::Volume,
};

use dicom::{
    core::Tag,
    object::{FileDicomObject, InMemDicomObject, open_file},
    pixeldata::{ConvertOptions, PixelDecoder, VoiLutOption},
};
use dicom_dictionary_std::tags;
use log::{debug, info, warn};
use ndarray::{Array2, Array3, s};
use rayon::prelude::*;
use serde_json::json;
use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
};
use thiserror::Error;
use web_time::Instant;

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("No valid DICOM images found")]
    NoValidImages,

    #[error("Inconsistent image dimensions")]
    InconsistentDimensions,

    #[error("Missing spacing information")]
    MissingSpacing,

    #[error("unsupported image format: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),

    #[error(transparent)]
    Format(#[from] FormatError),
}

/// File formats [`VolumeLoader::open`] understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// A single DICOM file; its series siblings are loaded with it.
    Dicom,
    /// A directory of `.dcm` files.
    DicomSeries,
    Nifti,
    MetaImage,
}

impl ImageFormat {
    /// Guesses the format from the path. Files without a known extension
    /// are checked for the `DICM` preamble.
    pub fn detect(path: impl AsRef<Path>) -> Option<Self> {
        let path = path.as_ref();
        if path.is_dir() {
            return Some(ImageFormat::DicomSeries);
        }
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".nii") || name.ends_with(".nii.gz") {
            return Some(ImageFormat::Nifti);
        }
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("mha") || ext.eq_ignore_ascii_case("mhd") => {
                Some(ImageFormat::MetaImage)
            }
            Some(ext) if ext.eq_ignore_ascii_case("dcm") || ext.eq_ignore_ascii_case("dicom") => {
                Some(ImageFormat::Dicom)
            }
            _ => has_dicom_preamble(path).then_some(ImageFormat::Dicom),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ImageFormat::Dicom | ImageFormat::DicomSeries => "DICOM",
            ImageFormat::Nifti => "NIfTI",
            ImageFormat::MetaImage => "MetaImage",
        }
    }
}

fn has_dicom_preamble(path: &Path) -> bool {
    let mut head = [0u8; 132];
    fs::File::open(path)
        .and_then(|mut file| file.read_exact(&mut head))
        .is_ok_and(|()| &head[128..] == b"DICM")
}

/// A volume opened from disk together with what was learned about it.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub volume: Volume,
    pub metadata: Metadata,
    pub format: ImageFormat,
}

const METADATA_TAGS: [(&str, Tag); 7] = [
    ("PatientName", tags::PATIENT_NAME),
    ("PatientID", tags::PATIENT_ID),
    ("Modality", tags::MODALITY),
    ("StudyDate", tags::STUDY_DATE),
    ("SeriesDescription", tags::SERIES_DESCRIPTION),
    ("SeriesInstanceUID", tags::SERIES_INSTANCE_UID),
    ("Manufacturer", tags::MANUFACTURER),
];

struct DecodedSlice {
    order: Option<f32>,
    source: usize,
    image: Array2<f32>,
}

pub struct VolumeLoader;

impl VolumeLoader {
    /// Opens any supported image and collects its metadata.
    pub fn open(path: impl AsRef<Path>) -> Result<LoadedImage, VolumeLoaderError> {
        let path = path.as_ref();
        let format = ImageFormat::detect(path)
            .ok_or_else(|| VolumeLoaderError::UnsupportedFormat(path.to_path_buf()))?;
        let start = Instant::now();

        let (volume, mut metadata) = match format {
            ImageFormat::Dicom | ImageFormat::DicomSeries => {
                let objects = if format == ImageFormat::Dicom {
                    Self::open_series_of(path)?
                } else {
                    Self::open_directory(path)?
                };
                let volume =
                    Self::load_from_dicom_objects(&objects, SortBy::ImagePositionPatient)?;
                let mut metadata = dicom_metadata(&objects[0]);
                metadata.insert("slices".to_string(), json!(objects.len()));
                (volume, metadata)
            }
            ImageFormat::Nifti => {
                let (volume, header) = nifti::read_nifti(path)?;
                let mut metadata = Metadata::new();
                if !header.description.is_empty() {
                    metadata.insert("description".to_string(), json!(header.description));
                }
                metadata.insert("datatype".to_string(), json!(format!("{:?}", header.datatype)));
                (volume, metadata)
            }
            ImageFormat::MetaImage => {
                let (volume, header) = metaimage::read_metaimage(path)?;
                let mut metadata = Metadata::new();
                if let Some(element_type) = header.fields.get("ElementType") {
                    metadata.insert("datatype".to_string(), json!(element_type));
                }
                (volume, metadata)
            }
        };

        let (depth, height, width) = volume.dim();
        let (sx, sy, sz) = volume.spacing();
        let (ox, oy, oz) = volume.origin();
        metadata.insert("format".to_string(), json!(format.name()));
        metadata.insert("path".to_string(), json!(path.display().to_string()));
        metadata.insert("dimensions".to_string(), json!([width, height, depth]));
        metadata.insert("spacing".to_string(), json!([sx, sy, sz]));
        metadata.insert("origin".to_string(), json!([ox, oy, oz]));

        info!(
            "opened {} as {} ({width}x{height}x{depth}) in {:?}",
            path.display(),
            format.name(),
            start.elapsed()
        );
        Ok(LoadedImage {
            volume,
            metadata,
            format,
        })
    }

    /// Writes `volume` as NIfTI (`.nii`) or MetaImage (`.mha`, `.mhd`).
    pub fn save(volume: &Volume, path: impl AsRef<Path>) -> Result<(), VolumeLoaderError> {
        let path = path.as_ref();
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("nii") => {
                nifti::write_nifti(volume, path, "medimg")?
            }
            Some(ext) if ext.eq_ignore_ascii_case("mha") || ext.eq_ignore_ascii_case("mhd") => {
                metaimage::write_metaimage(volume, path)?
            }
            _ => return Err(VolumeLoaderError::UnsupportedFormat(path.to_path_buf())),
        }
        info!("saved {}", path.display());
        Ok(())
    }

    /// Load a volume from DICOM objects
    ///
    /// # Arguments
    ///
    /// * `dicom_objects` - Slice of DICOM file objects
    /// * `sort_by` - Method to sort the slices
    ///
    /// # Errors
    ///
    /// Returns error if no valid images found, dimensions are inconsistent
    /// or no object carries PixelSpacing
    pub fn load_from_dicom_objects(
        dicom_objects: &[FileDicomObject<InMemDicomObject>],
        sort_by: SortBy,
    ) -> Result<Volume, VolumeLoaderError> {
        let mut slices: Vec<_> = dicom_objects
            .par_iter()
            .enumerate()
            .filter_map(|(source, dicom_object)| {
                Self::extract_image_with_order(dicom_object, &sort_by).map(|(order, image)| {
                    DecodedSlice {
                        order,
                        source,
                        image,
                    }
                })
            })
            .collect();

        if slices.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }
        if slices.len() < dicom_objects.len() {
            warn!(
                "skipped {} of {} DICOM objects without usable pixel data",
                dicom_objects.len() - slices.len(),
                dicom_objects.len()
            );
        }

        Self::sort_images(&mut slices, sort_by);
        Self::validate_dimensions(&slices)?;

        let volume_array = Self::build_volume_array(&slices);
        let ordered: Vec<_> = slices.iter().map(|slice| &dicom_objects[slice.source]).collect();
        let spacing = Self::get_spacing(&ordered).ok_or(VolumeLoaderError::MissingSpacing)?;
        let origin = position(ordered[0]).map_or((0.0, 0.0, 0.0), |p| (p[0], p[1], p[2]));
        debug!("DICOM volume spacing {spacing:?}, origin {origin:?}");

        Ok(Volume::new(volume_array, spacing).with_origin(origin))
    }

    /// Load a volume from file paths
    pub fn load_from_file_paths(
        paths: &[impl AsRef<Path> + Sync],
        sort_by: SortBy,
    ) -> Result<Volume, VolumeLoaderError> {
        let objects: Result<Vec<_>, _> = paths
            .par_iter()
            .map(|path| open_file(path.as_ref()))
            .collect();

        Self::load_from_dicom_objects(&objects?, sort_by)
    }

    /// Load a volume from a directory containing .dcm files
    pub fn load_from_directory(
        path: impl AsRef<Path>,
        sort_by: SortBy,
    ) -> Result<Volume, VolumeLoaderError> {
        let paths = Self::dicom_paths(path.as_ref())?;
        Self::load_from_file_paths(&paths, sort_by)
    }

    fn dicom_paths(dir: &Path) -> Result<Vec<PathBuf>, VolumeLoaderError> {
        let paths: Vec<_> = fs::read_dir(dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
            })
            .collect();

        if paths.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }
        Ok(paths)
    }

    fn open_directory(
        dir: &Path,
    ) -> Result<Vec<FileDicomObject<InMemDicomObject>>, VolumeLoaderError> {
        let paths = Self::dicom_paths(dir)?;
        let objects: Result<Vec<_>, _> = paths.par_iter().map(open_file).collect();
        Ok(objects?)
    }

    /// Opens `path` and every `.dcm` next to it from the same series.
    fn open_series_of(
        path: &Path,
    ) -> Result<Vec<FileDicomObject<InMemDicomObject>>, VolumeLoaderError> {
        let selected = open_file(path)?;
        let (Some(series), Some(dir)) = (
            text(&selected, tags::SERIES_INSTANCE_UID),
            containing_directory(path),
        ) else {
            return Ok(vec![selected]);
        };

        let siblings: Vec<_> = Self::dicom_paths(dir)?
            .into_par_iter()
            .filter(|candidate| candidate.file_name() != path.file_name())
            .filter_map(|candidate| match open_file(&candidate) {
                Ok(object) => Some(object),
                Err(err) => {
                    warn!("skipping {}: {err}", candidate.display());
                    None
                }
            })
            .filter(|object| text(object, tags::SERIES_INSTANCE_UID).as_ref() == Some(&series))
            .collect();

        debug!("series {series}: {} sibling files", siblings.len());
        let mut objects = Vec::with_capacity(siblings.len() + 1);
        objects.push(selected);
        objects.extend(siblings);
        Ok(objects)
    }

    fn extract_image_with_order(
        dicom_object: &FileDicomObject<InMemDicomObject>,
        sort_by: &SortBy,
    ) -> Option<(Option<f32>, Array2<f32>)> {
        let order = Self::get_sort_order(dicom_object, sort_by)?;
        let image_2d = Self::decode_image(dicom_object)?;
        Some((order, image_2d))
    }

    fn get_sort_order(
        dicom_object: &FileDicomObject<InMemDicomObject>,
        sort_by: &SortBy,
    ) -> Option<Option<f32>> {
        match sort_by {
            SortBy::ImagePositionPatient => Some(position(dicom_object)?.get(2).copied()),
            SortBy::TablePosition => {
                let pos = dicom_object
                    .element(tags::TABLE_POSITION)
                    .ok()?
                    .to_float32()
                    .ok();
                Some(pos)
            }
            SortBy::InstanceNumber => {
                let num = dicom_object
                    .element(tags::INSTANCE_NUMBER)
                    .ok()?
                    .to_int::<i32>()
                    .ok()
                    .map(|n| n as f32);
                Some(num)
            }
            SortBy::None => Some(Some(0.0)),
        }
    }

    /// First frame in modality units (Rescale Slope/Intercept applied, no
    /// VOI transform).
    fn decode_image(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<Array2<f32>> {
        let pixel_data = dicom_object.decode_pixel_data().ok()?;
        let options = ConvertOptions::new().with_voi_lut(VoiLutOption::Identity);
        pixel_data
            .to_ndarray_with_options::<f32>(&options)
            .ok()
            .map(|arr| arr.slice_move(s![0, .., .., 0]))
    }

    fn sort_images(slices: &mut [DecodedSlice], sort_by: SortBy) {
        if !matches!(sort_by, SortBy::None) {
            slices.sort_by(|a, b| {
                a.order
                    .partial_cmp(&b.order)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
    }

    fn validate_dimensions(slices: &[DecodedSlice]) -> Result<(), VolumeLoaderError> {
        let first_dim = slices[0].image.dim();
        if slices.iter().any(|slice| slice.image.dim() != first_dim) {
            return Err(VolumeLoaderError::InconsistentDimensions);
        }
        Ok(())
    }

    fn build_volume_array(slices: &[DecodedSlice]) -> Array3<f32> {
        let (height, width) = slices[0].image.dim();
        let depth = slices.len();
        let mut volume = Array3::<f32>::zeros((depth, height, width));

        for (i, slice) in slices.iter().enumerate() {
            volume.slice_mut(s![i, .., ..]).assign(&slice.image);
        }

        volume
    }

    /// `(column spacing, row spacing, slice spacing)`. The slice spacing is
    /// the distance between the first two positions, else SliceThickness,
    /// else 1 mm.
    fn get_spacing(ordered: &[&FileDicomObject<InMemDicomObject>]) -> Option<(f32, f32, f32)> {
        let pixel_spacing = ordered.iter().find_map(|dicom_object| {
            let spacing = dicom_object
                .element(tags::PIXEL_SPACING)
                .ok()?
                .to_multi_float32()
                .ok()?;
            (spacing.len() >= 2).then(|| (spacing[0], spacing[1]))
        })?;

        let from_positions = match ordered {
            [first, second, ..] => position(first).zip(position(second)).map(|(a, b)| {
                let d: f32 = a.iter().zip(&b).map(|(p, q)| (q - p) * (q - p)).sum();
                d.sqrt()
            }),
            _ => None,
        };
        let from_thickness = || {
            ordered.iter().find_map(|dicom_object| {
                dicom_object
                    .element(tags::SLICE_THICKNESS)
                    .ok()?
                    .to_float32()
                    .ok()
            })
        };
        let slice_spacing = from_positions
            .filter(|d| *d > f32::EPSILON)
            .or_else(from_thickness)
            .filter(|d| *d > 0.0)
            .unwrap_or(1.0);

        Some((pixel_spacing.1, pixel_spacing.0, slice_spacing))
    }
}

fn position(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<Vec<f32>> {
    dicom_object
        .element(tags::IMAGE_POSITION_PATIENT)
        .ok()?
        .to_multi_float32()
        .ok()
        .filter(|pos| pos.len() >= 3)
}

fn text(dicom_object: &FileDicomObject<InMemDicomObject>, tag: Tag) -> Option<String> {
    dicom_object
        .element(tag)
        .ok()
        .and_then(|element| element.to_str().ok())
        .map(|value| value.trim_end_matches('\0').trim().to_string())
        .filter(|value| !value.is_empty())
}

/// The directory holding `path`; a bare file name lives in `.`.
fn containing_directory(path: &Path) -> Option<&Path> {
    match path.parent() {
        Some(dir) if dir.as_os_str().is_empty() => Some(Path::new(".")),
        other => other,
    }
}

fn dicom_metadata(dicom_object: &FileDicomObject<InMemDicomObject>) -> Metadata {
    METADATA_TAGS
        .iter()
        .filter_map(|(key, tag)| {
            text(dicom_object, *tag).map(|value| (key.to_string(), json!(value)))
        })
        .collect()
}
