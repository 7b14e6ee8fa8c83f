//! Readers and writers for the single-file volume formats: NIfTI-1 and
//! MetaImage. DICOM series live in [`crate::volume_loader`].

pub mod metaimage;
pub mod nifti;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("unsupported data type: {0}")]
    UnsupportedDataType(String),

    #[error("unsupported compression in {0}")]
    UnsupportedCompression(String),

    #[error("expected {expected} bytes of voxel data, found {found}")]
    Truncated { expected: usize, found: usize },
}

/// Primitive voxel encodings shared by the formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
}

impl ScalarType {
    pub fn size(self) -> usize {
        match self {
            ScalarType::U8 | ScalarType::I8 => 1,
            ScalarType::U16 | ScalarType::I16 => 2,
            ScalarType::U32 | ScalarType::I32 | ScalarType::F32 => 4,
            ScalarType::F64 => 8,
        }
    }
}

/// Converts raw samples to `f32`.
/// Number of voxels in a `(nx, ny, nz)` grid read from an untrusted header.
pub fn voxel_count((nx, ny, nz): (usize, usize, usize)) -> Result<usize, FormatError> {
    nx.checked_mul(ny)
        .and_then(|n| n.checked_mul(nz))
        .ok_or_else(|| FormatError::InvalidHeader(format!("dimensions {nx}x{ny}x{nz} overflow")))
}

pub fn decode_samples(
    bytes: &[u8],
    scalar: ScalarType,
    big_endian: bool,
    count: usize,
) -> Result<Vec<f32>, FormatError> {
    let size = scalar.size();
    let expected = count
        .checked_mul(size)
        .ok_or_else(|| FormatError::InvalidHeader(format!("{count} samples overflow")))?;
    if bytes.len() < expected {
        return Err(FormatError::Truncated {
            expected,
            found: bytes.len(),
        });
    }

    macro_rules! read {
        ($ty:ty, $n:literal) => {
            bytes[..expected]
                .chunks_exact($n)
                .map(|chunk| {
                    let mut raw = [0u8; $n];
                    raw.copy_from_slice(chunk);
                    let value = if big_endian {
                        <$ty>::from_be_bytes(raw)
                    } else {
                        <$ty>::from_le_bytes(raw)
                    };
                    value as f32
                })
                .collect()
        };
    }

    let values = match scalar {
        ScalarType::U8 => bytes[..expected].iter().map(|&b| b as f32).collect(),
        ScalarType::I8 => bytes[..expected].iter().map(|&b| b as i8 as f32).collect(),
        ScalarType::U16 => read!(u16, 2),
        ScalarType::I16 => read!(i16, 2),
        ScalarType::U32 => read!(u32, 4),
        ScalarType::I32 => read!(i32, 4),
        ScalarType::F32 => read!(f32, 4),
        ScalarType::F64 => read!(f64, 8),
    };
    Ok(values)
}

/// Little-endian `f32` bytes, the encoding both writers use.
pub fn encode_f32_le<'a>(values: impl IntoIterator<Item = &'a f32>) -> Vec<u8> {
    values.into_iter().flat_map(|v| v.to_le_bytes()).collect()
}
