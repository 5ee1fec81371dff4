//! Frames: N-dimensional numeric arrays as they travel through a pipeline.
//!
//! A frame is an element type, a shape, and the little-endian element bytes.
//! Nothing else identifies a frame; its position in the source sequence is
//! its only identity.

use bytes::Bytes;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Element type of a frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    U8 = 1,
    U16 = 2,
    I16 = 3,
    U32 = 4,
    I32 = 5,
    F32 = 6,
    F64 = 7,
}

impl DType {
    pub const ALL: [DType; 7] = [
        DType::U8,
        DType::U16,
        DType::I16,
        DType::U32,
        DType::I32,
        DType::F32,
        DType::F64,
    ];

    /// Bytes per element.
    pub fn size(&self) -> usize {
        match self {
            DType::U8 => 1,
            DType::U16 | DType::I16 => 2,
            DType::U32 | DType::I32 | DType::F32 => 4,
            DType::F64 => 8,
        }
    }

    /// Short name used in config and on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            DType::U8 => "u8",
            DType::U16 => "u16",
            DType::I16 => "i16",
            DType::U32 => "u32",
            DType::I32 => "i32",
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }

    /// numpy array-interface type string, always little-endian.
    pub fn typestr(&self) -> &'static str {
        match self {
            DType::U8 => "|u1",
            DType::U16 => "<u2",
            DType::I16 => "<i2",
            DType::U32 => "<u4",
            DType::I32 => "<i4",
            DType::F32 => "<f4",
            DType::F64 => "<f8",
        }
    }

    pub fn from_typestr(s: &str) -> Option<Self> {
        DType::ALL.into_iter().find(|d| d.typestr() == s)
    }

    /// One-byte tag for binary headers.
    pub fn tag(&self) -> u8 {
        *self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        DType::ALL.into_iter().find(|d| d.tag() == tag)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DType {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DType::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .or_else(|| DType::from_typestr(s))
            .ok_or_else(|| FrameError::UnknownDType(s.to_string()))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Unknown dtype: {0}")]
    UnknownDType(String),
    #[error("Byte length {actual} does not match shape {shape:?} of {dtype} (expected {expected})")]
    LengthMismatch {
        dtype: DType,
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },
}

/// One N-dimensional array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    dtype: DType,
    shape: Vec<usize>,
    data: Bytes,
}

impl Frame {
    /// Build a frame, checking that `data` holds exactly `shape` elements.
    pub fn new(dtype: DType, shape: Vec<usize>, data: impl Into<Bytes>) -> Result<Self, FrameError> {
        let data = data.into();
        let expected = shape.iter().product::<usize>() * dtype.size();
        if data.len() != expected {
            return Err(FrameError::LengthMismatch {
                dtype,
                shape,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { dtype, shape, data })
    }

    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self, FrameError> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(DType::F32, shape, bytes)
    }

    pub fn from_u16(shape: Vec<usize>, values: &[u16]) -> Result<Self, FrameError> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(DType::U16, shape, bytes)
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn nbytes(&self) -> usize {
        self.data.len()
    }

    /// Decode the elements as `f32`. `None` for any other dtype.
    pub fn to_f32_vec(&self) -> Option<Vec<f32>> {
        if self.dtype != DType::F32 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_tags_roundtrip() {
        for dtype in DType::ALL {
            assert_eq!(DType::from_tag(dtype.tag()), Some(dtype));
            assert_eq!(DType::from_typestr(dtype.typestr()), Some(dtype));
            assert_eq!(dtype.as_str().parse::<DType>(), Ok(dtype));
        }
        assert_eq!(DType::from_tag(0), None);
    }

    #[test]
    fn test_dtype_parse_accepts_typestr() {
        assert_eq!("<f4".parse::<DType>(), Ok(DType::F32));
        assert!("complex64".parse::<DType>().is_err());
    }

    #[test]
    fn test_frame_length_checked() {
        let err = Frame::new(DType::U16, vec![2, 2], vec![0u8; 6]).unwrap_err();
        assert!(matches!(err, FrameError::LengthMismatch { expected: 8, actual: 6, .. }));

        let frame = Frame::new(DType::U16, vec![2, 2], vec![0u8; 8]).unwrap();
        assert_eq!(frame.len(), 4);
        assert_eq!(frame.nbytes(), 8);
    }

    #[test]
    fn test_zero_sized_frame_allowed() {
        let frame = Frame::new(DType::F32, vec![0, 16], Vec::new()).unwrap();
        assert!(frame.is_empty());
    }

    #[test]
    fn test_f32_values() {
        let frame = Frame::from_f32(vec![3], &[1.0, -2.5, 0.0]).unwrap();
        assert_eq!(frame.to_f32_vec(), Some(vec![1.0, -2.5, 0.0]));
    }
}
