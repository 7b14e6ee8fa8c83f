//! NIfTI-1 single-file (`.nii`) images.
//!
//! Only the axis-aligned part of the geometry is kept: spacing comes from
//! `pixdim`, the origin from the sform translation when present and the
//! qform offset otherwise. Rotations in the header are ignored.

use std::fs;
use std::path::Path;

use log::debug;
use ndarray::Array3;

use super::{FormatError, ScalarType, decode_samples, encode_f32_le, voxel_count};
use crate::volume::Volume;

const HEADER_SIZE: usize = 348;
const SINGLE_FILE_OFFSET: usize = 352;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

const DT_UINT8: i16 = 2;
const DT_INT16: i16 = 4;
const DT_INT32: i16 = 8;
const DT_FLOAT32: i16 = 16;
const DT_FLOAT64: i16 = 64;
const DT_INT8: i16 = 256;
const DT_UINT16: i16 = 512;
const DT_UINT32: i16 = 768;

#[derive(Debug, Clone, PartialEq)]
pub struct NiftiHeader {
    /// (nx, ny, nz)
    pub dims: (usize, usize, usize),
    pub spacing: (f32, f32, f32),
    pub origin: (f32, f32, f32),
    pub datatype: ScalarType,
    pub vox_offset: usize,
    pub scl_slope: f32,
    pub scl_inter: f32,
    pub description: String,
    pub big_endian: bool,
}

struct Fields<'a> {
    bytes: &'a [u8],
    big_endian: bool,
}

impl Fields<'_> {
    fn i16_at(&self, offset: usize) -> i16 {
        let raw = [self.bytes[offset], self.bytes[offset + 1]];
        if self.big_endian {
            i16::from_be_bytes(raw)
        } else {
            i16::from_le_bytes(raw)
        }
    }

    fn i32_at(&self, offset: usize) -> i32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[offset..offset + 4]);
        if self.big_endian {
            i32::from_be_bytes(raw)
        } else {
            i32::from_le_bytes(raw)
        }
    }

    fn f32_at(&self, offset: usize) -> f32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[offset..offset + 4]);
        if self.big_endian {
            f32::from_be_bytes(raw)
        } else {
            f32::from_le_bytes(raw)
        }
    }

    fn text_at(&self, offset: usize, len: usize) -> String {
        let raw = &self.bytes[offset..offset + len];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(len);
        String::from_utf8_lossy(&raw[..end]).trim().to_string()
    }
}

pub fn read_header(bytes: &[u8]) -> Result<NiftiHeader, FormatError> {
    if bytes.starts_with(&GZIP_MAGIC) {
        return Err(FormatError::UnsupportedCompression(
            "gzip-compressed NIfTI".to_string(),
        ));
    }
    if bytes.len() < HEADER_SIZE {
        return Err(FormatError::InvalidHeader(format!(
            "file is {} bytes, shorter than the {HEADER_SIZE}-byte header",
            bytes.len()
        )));
    }

    let little = Fields {
        bytes,
        big_endian: false,
    };
    let fields = if little.i32_at(0) == HEADER_SIZE as i32 {
        little
    } else {
        let big = Fields {
            bytes,
            big_endian: true,
        };
        if big.i32_at(0) != HEADER_SIZE as i32 {
            return Err(FormatError::InvalidHeader(
                "sizeof_hdr is not 348 in either byte order".to_string(),
            ));
        }
        big
    };

    let magic = &bytes[344..348];
    if magic != b"n+1\0" {
        return Err(FormatError::InvalidHeader(format!(
            "expected single-file magic \"n+1\", found {:?}",
            String::from_utf8_lossy(&magic[..3])
        )));
    }

    let ndim = fields.i16_at(40);
    if !(1..=7).contains(&ndim) {
        return Err(FormatError::InvalidHeader(format!("dim[0] = {ndim}")));
    }
    let dim = |i: usize| -> usize {
        if i as i16 <= ndim {
            fields.i16_at(40 + 2 * i).max(1) as usize
        } else {
            1
        }
    };
    let dims = (dim(1), dim(2), dim(3));

    let datatype = match fields.i16_at(70) {
        DT_UINT8 => ScalarType::U8,
        DT_INT8 => ScalarType::I8,
        DT_INT16 => ScalarType::I16,
        DT_UINT16 => ScalarType::U16,
        DT_INT32 => ScalarType::I32,
        DT_UINT32 => ScalarType::U32,
        DT_FLOAT32 => ScalarType::F32,
        DT_FLOAT64 => ScalarType::F64,
        other => {
            return Err(FormatError::UnsupportedDataType(format!(
                "NIfTI datatype code {other}"
            )));
        }
    };

    // the sign of pixdim belongs to qfac, not the spacing
    let positive = |v: f32| if v.is_finite() && v != 0.0 { v.abs() } else { 1.0 };
    let spacing = (
        positive(fields.f32_at(80)),
        positive(fields.f32_at(84)),
        positive(fields.f32_at(88)),
    );

    let vox_offset = fields.f32_at(108).max(SINGLE_FILE_OFFSET as f32) as usize;

    let origin = if fields.i16_at(254) > 0 {
        (fields.f32_at(292), fields.f32_at(308), fields.f32_at(324))
    } else {
        (fields.f32_at(268), fields.f32_at(272), fields.f32_at(276))
    };

    Ok(NiftiHeader {
        dims,
        spacing,
        origin,
        datatype,
        vox_offset,
        scl_slope: fields.f32_at(112),
        scl_inter: fields.f32_at(116),
        description: fields.text_at(148, 80),
        big_endian: fields.big_endian,
    })
}

pub fn read_nifti(path: impl AsRef<Path>) -> Result<(Volume, NiftiHeader), FormatError> {
    let path = path.as_ref();
    if path
        .to_str()
        .is_some_and(|p| p.to_ascii_lowercase().ends_with(".nii.gz"))
    {
        return Err(FormatError::UnsupportedCompression(path.display().to_string()));
    }
    let bytes = fs::read(path)?;
    let header = read_header(&bytes)?;
    let (nx, ny, nz) = header.dims;
    let count = voxel_count(header.dims)?;

    let payload = bytes.get(header.vox_offset..).unwrap_or(&[]);
    let mut values = decode_samples(payload, header.datatype, header.big_endian, count)?;

    // slope 0 means "no scaling" per the NIfTI-1 standard
    if header.scl_slope != 0.0 && header.scl_slope.is_finite() {
        let (slope, inter) = (header.scl_slope, header.scl_inter);
        if slope != 1.0 || inter != 0.0 {
            values.iter_mut().for_each(|v| *v = v.mul_add(slope, inter));
        }
    }

    let data = Array3::from_shape_vec((nz, ny, nx), values)
        .map_err(|e| FormatError::InvalidHeader(e.to_string()))?;
    debug!(
        "read NIfTI {} ({}x{}x{}, {:?})",
        path.display(),
        nx,
        ny,
        nz,
        header.datatype
    );
    let volume = Volume::new(data, header.spacing).with_origin(header.origin);
    Ok((volume, header))
}

/// Writes `volume` as little-endian float32 NIfTI-1.
pub fn write_nifti(
    volume: &Volume,
    path: impl AsRef<Path>,
    description: &str,
) -> Result<(), FormatError> {
    let (depth, height, width) = volume.dim();
    let to_dim = |n: usize, name: &str| {
        i16::try_from(n).map_err(|_| {
            FormatError::InvalidHeader(format!("{name} dimension {n} exceeds NIfTI-1 limits"))
        })
    };
    let dims = [3, to_dim(width, "x")?, to_dim(height, "y")?, to_dim(depth, "z")?, 1, 1, 1, 1];

    let mut header = vec![0u8; SINGLE_FILE_OFFSET];
    let mut put =
        |offset: usize, raw: &[u8]| header[offset..offset + raw.len()].copy_from_slice(raw);

    put(0, &(HEADER_SIZE as i32).to_le_bytes());
    for (i, d) in dims.iter().enumerate() {
        put(40 + 2 * i, &d.to_le_bytes());
    }
    put(70, &DT_FLOAT32.to_le_bytes());
    put(72, &32i16.to_le_bytes());

    let (sx, sy, sz) = volume.spacing();
    let pixdim = [1.0f32, sx, sy, sz, 0.0, 0.0, 0.0, 0.0];
    for (i, p) in pixdim.iter().enumerate() {
        put(76 + 4 * i, &p.to_le_bytes());
    }
    put(108, &(SINGLE_FILE_OFFSET as f32).to_le_bytes());
    put(112, &1.0f32.to_le_bytes());
    put(116, &0.0f32.to_le_bytes());
    // xyzt_units: millimetres
    put(123, &[2]);

    let description = description.as_bytes();
    put(148, &description[..description.len().min(79)]);

    // qform_code = scanner, no rotation
    put(252, &1i16.to_le_bytes());
    let (ox, oy, oz) = volume.origin();
    put(268, &ox.to_le_bytes());
    put(272, &oy.to_le_bytes());
    put(276, &oz.to_le_bytes());
    put(344, b"n+1\0");

    let mut bytes = header;
    match volume.data().as_slice() {
        Some(values) => bytes.extend(encode_f32_le(values)),
        None => bytes.extend(encode_f32_le(volume.data().iter())),
    }
    fs::write(path.as_ref(), bytes)?;
    Ok(())
}
