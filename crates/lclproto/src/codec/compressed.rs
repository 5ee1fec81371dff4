//! Single-frame compressed encoding.
//!
//! ## Wire Format
//!
//! ```text
//! magic   "LCZ1"            4 bytes
//! dtype   tag               1 byte
//! keep    mantissa bits     1 byte (0 = lossless)
//! ndim                      1 byte
//! shape   ndim x u32 LE
//! body    zstd frame of the little-endian element bytes
//! ```
//!
//! ## Lossy floats
//!
//! With `keep = k` the low mantissa bits of every `f32`/`f64` element are
//! zeroed before compression, leaving `k` significant mantissa bits. For
//! normal values the relative error is below `2^-k`. Zero and infinities are
//! exact and NaN stays NaN. Integer frames ignore `keep` and are always
//! written lossless with `keep = 0` in the header.

use super::CodecError;
use crate::frame::{DType, Frame};
use bytes::{BufMut, Bytes, BytesMut};

pub const MAGIC: &[u8; 4] = b"LCZ1";

/// Largest decoded frame accepted from the wire.
pub const MAX_FRAME_BYTES: usize = 1 << 30;

const F32_MANTISSA_BITS: u8 = 23;
const F64_MANTISSA_BITS: u8 = 52;

/// Compress one frame.
pub fn encode(frame: &Frame, level: i32, keep_bits: u8) -> Result<Bytes, CodecError> {
    if frame.is_empty() {
        return Err(CodecError::ZeroSized);
    }
    if frame.shape().len() > u8::MAX as usize {
        return Err(CodecError::Malformed(format!(
            "{} dimensions exceed header limit",
            frame.shape().len()
        )));
    }

    let keep = if frame.dtype().is_float() { keep_bits } else { 0 };
    let body = match (frame.dtype(), keep) {
        (_, 0) => zstd::bulk::compress(frame.data(), level)?,
        (DType::F32, k) if k <= F32_MANTISSA_BITS => {
            zstd::bulk::compress(&truncate_f32(frame.data(), k), level)?
        }
        (DType::F64, k) if k <= F64_MANTISSA_BITS => {
            zstd::bulk::compress(&truncate_f64(frame.data(), k), level)?
        }
        (dtype, keep) => return Err(CodecError::InvalidKeepBits { dtype, keep }),
    };

    let mut out = BytesMut::with_capacity(7 + 4 * frame.shape().len() + body.len());
    out.put_slice(MAGIC);
    out.put_u8(frame.dtype().tag());
    out.put_u8(keep);
    out.put_u8(frame.shape().len() as u8);
    for &dim in frame.shape() {
        let dim = u32::try_from(dim)
            .map_err(|_| CodecError::Malformed(format!("dimension {} exceeds u32", dim)))?;
        out.put_u32_le(dim);
    }
    out.put_slice(&body);
    Ok(out.freeze())
}

pub fn decode(bytes: &[u8]) -> Result<Frame, CodecError> {
    let header = bytes
        .get(..7)
        .ok_or_else(|| CodecError::Malformed("truncated header".to_string()))?;
    if &header[..4] != MAGIC {
        return Err(CodecError::Malformed("missing LCZ1 magic".to_string()));
    }
    let dtype = DType::from_tag(header[4])
        .ok_or_else(|| CodecError::Malformed(format!("unknown dtype tag {}", header[4])))?;
    let ndim = header[6] as usize;

    let shape_end = 7 + 4 * ndim;
    let shape_bytes = bytes
        .get(7..shape_end)
        .ok_or_else(|| CodecError::Malformed("truncated shape".to_string()))?;
    let shape: Vec<usize> = shape_bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]) as usize)
        .collect();

    let expected = shape
        .iter()
        .try_fold(dtype.size(), |acc, &dim| acc.checked_mul(dim))
        .filter(|&n| n <= MAX_FRAME_BYTES)
        .ok_or_else(|| CodecError::Malformed(format!("shape {:?} is too large", shape)))?;

    // Check the size the zstd frame declares before allocating for it
    let body = &bytes[shape_end..];
    match zstd::zstd_safe::get_frame_content_size(body) {
        Ok(Some(declared)) if declared == expected as u64 => {}
        Ok(Some(declared)) => {
            return Err(CodecError::Malformed(format!(
                "body declares {} bytes, shape needs {}",
                declared, expected
            )))
        }
        Ok(None) => return Err(CodecError::Malformed("body has no content size".to_string())),
        Err(_) => return Err(CodecError::Malformed("body is not a zstd frame".to_string())),
    }

    let data = zstd::bulk::decompress(body, expected)
        .map_err(|e| CodecError::Malformed(format!("zstd body: {}", e)))?;
    if data.len() != expected {
        return Err(CodecError::Malformed(format!(
            "body is {} bytes, shape needs {}",
            data.len(),
            expected
        )));
    }

    Ok(Frame::new(dtype, shape, data)?)
}

fn truncate_f32(data: &[u8], keep: u8) -> Vec<u8> {
    let mask: u32 = !((1u32 << (F32_MANTISSA_BITS - keep)) - 1);
    data.chunks_exact(4)
        .flat_map(|c| {
            let bits = u32::from_le_bytes([c[0], c[1], c[2], c[3]]);
            let out = if f32::from_bits(bits).is_nan() { bits } else { bits & mask };
            out.to_le_bytes()
        })
        .collect()
}

fn truncate_f64(data: &[u8], keep: u8) -> Vec<u8> {
    let mask: u64 = !((1u64 << (F64_MANTISSA_BITS - keep)) - 1);
    data.chunks_exact(8)
        .flat_map(|c| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(c);
            let bits = u64::from_le_bytes(raw);
            let out = if f64::from_bits(bits).is_nan() { bits } else { bits & mask };
            out.to_le_bytes()
        })
        .collect()
}
