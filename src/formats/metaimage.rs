//! MetaImage (`.mha` / `.mhd`) headers and voxel data.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use ndarray::Array3;

use super::{FormatError, ScalarType, decode_samples, encode_f32_le, voxel_count};
use crate::volume::Volume;

#[derive(Debug, Clone, PartialEq)]
pub struct MetaHeader {
    /// (nx, ny, nz); nz is 1 for 2D images.
    pub dims: (usize, usize, usize),
    pub spacing: (f32, f32, f32),
    pub origin: (f32, f32, f32),
    pub element_type: ScalarType,
    pub big_endian: bool,
    /// `None` for inline (`LOCAL`) data.
    pub data_file: Option<PathBuf>,
    /// Every `key = value` pair as written.
    pub fields: BTreeMap<String, String>,
}

fn element_type(name: &str) -> Result<ScalarType, FormatError> {
    Ok(match name {
        "MET_UCHAR" => ScalarType::U8,
        "MET_CHAR" => ScalarType::I8,
        "MET_USHORT" => ScalarType::U16,
        "MET_SHORT" => ScalarType::I16,
        "MET_UINT" => ScalarType::U32,
        "MET_INT" => ScalarType::I32,
        "MET_FLOAT" => ScalarType::F32,
        "MET_DOUBLE" => ScalarType::F64,
        other => return Err(FormatError::UnsupportedDataType(other.to_string())),
    })
}

fn numbers<T: std::str::FromStr>(key: &str, value: &str) -> Result<Vec<T>, FormatError> {
    value
        .split_whitespace()
        .map(|token| {
            token
                .parse()
                .map_err(|_| FormatError::InvalidHeader(format!("{key}: cannot parse {token:?}")))
        })
        .collect()
}

fn is_true(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}

/// Parses the text header. Returns the header and the byte offset right
/// after the `ElementDataFile` line, where inline data starts.
pub fn parse_header(bytes: &[u8]) -> Result<(MetaHeader, usize), FormatError> {
    let mut fields = BTreeMap::new();
    let mut offset = 0;
    let mut data_file = None;

    while offset < bytes.len() {
        let end = bytes[offset..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(bytes.len(), |p| offset + p + 1);
        let line = String::from_utf8_lossy(&bytes[offset..end]);
        offset = end;

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(FormatError::InvalidHeader(format!("malformed line {line:?}")));
        };
        let (key, value) = (key.trim().to_string(), value.trim().to_string());
        if key == "ElementDataFile" {
            data_file = Some(value.clone());
            fields.insert(key, value);
            break;
        }
        fields.insert(key, value);
    }

    let data_file = data_file
        .ok_or_else(|| FormatError::InvalidHeader("missing ElementDataFile".to_string()))?;

    if fields.get("CompressedData").is_some_and(|v| is_true(v)) {
        return Err(FormatError::UnsupportedCompression("CompressedData = True".to_string()));
    }
    if let Some(channels) = fields.get("ElementNumberOfChannels") {
        if channels.trim() != "1" {
            return Err(FormatError::UnsupportedDataType(format!(
                "{channels} channels per element"
            )));
        }
    }

    let ndims: usize = fields
        .get("NDims")
        .ok_or_else(|| FormatError::InvalidHeader("missing NDims".to_string()))?
        .parse()
        .map_err(|_| FormatError::InvalidHeader("NDims is not an integer".to_string()))?;
    if !(2..=3).contains(&ndims) {
        return Err(FormatError::InvalidHeader(format!("NDims = {ndims}")));
    }

    let dim_size: Vec<usize> = numbers(
        "DimSize",
        fields
            .get("DimSize")
            .ok_or_else(|| FormatError::InvalidHeader("missing DimSize".to_string()))?,
    )?;
    if dim_size.len() < ndims || dim_size.iter().take(ndims).any(|&d| d == 0) {
        return Err(FormatError::InvalidHeader(format!("DimSize {dim_size:?}")));
    }
    let dims = (dim_size[0], dim_size[1], if ndims == 3 { dim_size[2] } else { 1 });

    let triple = |key: &str, default: f32| -> Result<(f32, f32, f32), FormatError> {
        match fields.get(key) {
            Some(value) => {
                let values: Vec<f32> = numbers(key, value)?;
                let at = |i: usize| values.get(i).copied().unwrap_or(default);
                Ok((at(0), at(1), at(2)))
            }
            None => Ok((default, default, default)),
        }
    };

    let spacing = match fields.get("ElementSpacing") {
        Some(_) => triple("ElementSpacing", 1.0)?,
        None => triple("ElementSize", 1.0)?,
    };
    let origin_key = ["Offset", "Position", "Origin"]
        .into_iter()
        .find(|k| fields.contains_key(*k))
        .unwrap_or("Offset");
    let origin = triple(origin_key, 0.0)?;

    let element_type = element_type(
        fields
            .get("ElementType")
            .ok_or_else(|| FormatError::InvalidHeader("missing ElementType".to_string()))?,
    )?;
    let big_endian = ["ElementByteOrderMSB", "BinaryDataByteOrderMSB"]
        .iter()
        .any(|k| fields.get(*k).is_some_and(|v| is_true(v)));

    let data_file = (data_file != "LOCAL").then(|| PathBuf::from(data_file));

    Ok((
        MetaHeader {
            dims,
            spacing,
            origin,
            element_type,
            big_endian,
            data_file,
            fields,
        },
        offset,
    ))
}

pub fn read_metaimage(path: impl AsRef<Path>) -> Result<(Volume, MetaHeader), FormatError> {
    let path = path.as_ref();
    let bytes = fs::read(path)?;
    let (header, data_start) = parse_header(&bytes)?;

    let (nx, ny, nz) = header.dims;
    let count = voxel_count(header.dims)?;
    let values = match &header.data_file {
        None => decode_samples(
            &bytes[data_start..],
            header.element_type,
            header.big_endian,
            count,
        )?,
        Some(file) => {
            let raw_path = match path.parent() {
                Some(dir) if file.is_relative() => dir.join(file),
                _ => file.clone(),
            };
            let raw = fs::read(&raw_path)?;
            decode_samples(&raw, header.element_type, header.big_endian, count)?
        }
    };

    let data = Array3::from_shape_vec((nz, ny, nx), values)
        .map_err(|e| FormatError::InvalidHeader(e.to_string()))?;
    debug!("read MetaImage {} ({nx}x{ny}x{nz})", path.display());
    let volume = Volume::new(data, header.spacing).with_origin(header.origin);
    Ok((volume, header))
}

fn header_text(volume: &Volume, data_file: &str) -> String {
    let (depth, height, width) = volume.dim();
    let (sx, sy, sz) = volume.spacing();
    let (ox, oy, oz) = volume.origin();
    format!(
        "ObjectType = Image\n\
         NDims = 3\n\
         BinaryData = True\n\
         BinaryDataByteOrderMSB = False\n\
         CompressedData = False\n\
         TransformMatrix = 1 0 0 0 1 0 0 0 1\n\
         Offset = {ox} {oy} {oz}\n\
         ElementSpacing = {sx} {sy} {sz}\n\
         DimSize = {width} {height} {depth}\n\
         ElementType = MET_FLOAT\n\
         ElementDataFile = {data_file}\n"
    )
}

fn voxel_bytes(volume: &Volume) -> Vec<u8> {
    match volume.data().as_slice() {
        Some(values) => encode_f32_le(values),
        None => encode_f32_le(volume.data().iter()),
    }
}

/// Writes a `.mha` with inline data, or a `.mhd` header next to a `.raw`
/// file of the same stem.
pub fn write_metaimage(volume: &Volume, path: impl AsRef<Path>) -> Result<(), FormatError> {
    let path = path.as_ref();
    let detached = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("mhd"));

    if detached {
        let raw_path = path.with_extension("raw");
        let raw_name = raw_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| FormatError::InvalidHeader(format!("bad path {}", path.display())))?;
        fs::write(path, header_text(volume, &raw_name))?;
        fs::write(&raw_path, voxel_bytes(volume))?;
    } else {
        let mut bytes = header_text(volume, "LOCAL").into_bytes();
        bytes.extend(voxel_bytes(volume));
        fs::write(path, bytes)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_dimensional_inline_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plane.mha");
        let mut bytes = b"NDims = 2\nDimSize = 3 2\nElementSpacing = 0.5 0.25\n\
Position = 1 2\nElementType = MET_SHORT\nElementByteOrderMSB = True\n\
ElementDataFile = LOCAL\n"
            .to_vec();
        for v in [-3i16, -2, -1, 0, 1, 300] {
            bytes.extend(v.to_be_bytes());
        }
        fs::write(&path, bytes).unwrap();

        let (volume, header) = read_metaimage(&path).unwrap();
        assert_eq!(volume.dim(), (1, 2, 3));
        assert_eq!(volume.spacing(), (0.5, 0.25, 1.0));
        assert_eq!(volume.origin(), (1.0, 2.0, 0.0));
        assert!(header.big_endian);
        assert_eq!(volume.data()[[0, 1, 2]], 300.0);
    }

    #[test]
    fn compressed_data_is_rejected() {
        let header = b"NDims = 3\nDimSize = 1 1 1\nElementType = MET_UCHAR\n\
CompressedData = True\nElementDataFile = LOCAL\n";
        let err = parse_header(header).unwrap_err();
        assert!(matches!(err, FormatError::UnsupportedCompression(_)));
    }

    #[test]
    fn multi_channel_is_rejected() {
        let header = b"NDims = 3\nDimSize = 1 1 1\nElementType = MET_UCHAR\n\
ElementNumberOfChannels = 3\nElementDataFile = LOCAL\n";
        assert!(matches!(
            parse_header(header).unwrap_err(),
            FormatError::UnsupportedDataType(_)
        ));
    }

    #[test]
    fn detached_header_writes_raw_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("brain.mhd");
        let data = Array3::from_shape_fn((2, 3, 4), |(z, y, x)| (z * 12 + y * 4 + x) as f32);
        let volume = Volume::new(data, (1.0, 1.5, 2.0)).with_origin((5.0, -5.0, 0.5));

        write_metaimage(&volume, &path).unwrap();
        assert!(dir.path().join("brain.raw").exists());

        let (loaded, header) = read_metaimage(&path).unwrap();
        assert_eq!(header.data_file, Some(PathBuf::from("brain.raw")));
        assert_eq!(loaded.data(), volume.data());
        assert_eq!(loaded.spacing(), volume.spacing());
        assert_eq!(loaded.origin(), volume.origin());
    }

    #[test]
    fn truncated_inline_data_is_reported() {
        let header = b"NDims = 3\nDimSize = 2 2 2\nElementType = MET_FLOAT\n\
ElementDataFile = LOCAL\n\x00\x00";
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.mha");
        fs::write(&path, header).unwrap();
        assert!(matches!(
            read_metaimage(&path).unwrap_err(),
            FormatError::Truncated { expected: 32, found: 2 }
        ));
    }

    #[test]
    fn oversized_dimensions_are_rejected() {
        let header = b"NDims = 3\nDimSize = 4294967296 4294967296 2\nElementType = MET_UCHAR\n\
ElementDataFile = LOCAL\n\x00";
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.mha");
        fs::write(&path, header).unwrap();
        assert!(matches!(
            read_metaimage(&path).unwrap_err(),
            FormatError::InvalidHeader(_)
        ));
    }
}
