//! Multi-frame container encoding.
//!
//! ## Wire Format
//!
//! A MessagePack map with exactly two entries:
//!
//! ```text
//! "data" -> {"dtype": "<f4", "shape": [n, h, w], "bytes": <bin, little-endian>}
//! "pid"  -> [producer pid]
//! ```
//!
//! The array layout mirrors numpy's array interface, so a Python receiver can
//! rebuild it with `np.frombuffer(bytes, dtype).reshape(shape)`.

use super::CodecError;
use crate::frame::{DType, Frame};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

#[derive(Debug, Serialize, Deserialize)]
struct WireArray {
    dtype: String,
    shape: Vec<u64>,
    bytes: ByteBuf,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireMessage {
    data: WireArray,
    pid: Vec<u32>,
}

/// A decoded container message.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerMessage {
    pub frames: Vec<Frame>,
    pub pid: u32,
}

/// Stack `batch` into one `[n, *shape]` array and pack it with `pid`.
pub fn encode(batch: &[Frame], pid: u32) -> Result<Bytes, CodecError> {
    let first = batch.first().ok_or(CodecError::EmptyBatch)?;
    if batch
        .iter()
        .any(|f| f.shape() != first.shape() || f.dtype() != first.dtype())
    {
        return Err(CodecError::MixedBatch);
    }

    let mut shape = Vec::with_capacity(first.shape().len() + 1);
    shape.push(batch.len() as u64);
    shape.extend(first.shape().iter().map(|&d| d as u64));

    let mut bytes = Vec::with_capacity(first.nbytes() * batch.len());
    for frame in batch {
        bytes.extend_from_slice(frame.data());
    }

    let msg = WireMessage {
        data: WireArray {
            dtype: first.dtype().typestr().to_string(),
            shape,
            bytes: ByteBuf::from(bytes),
        },
        pid: vec![pid],
    };

    // Named so the map keys are "data" and "pid" rather than a positional array
    Ok(Bytes::from(rmp_serde::to_vec_named(&msg)?))
}

pub fn decode(bytes: &[u8]) -> Result<ContainerMessage, CodecError> {
    let msg: WireMessage = rmp_serde::from_slice(bytes)?;

    let dtype = DType::from_typestr(&msg.data.dtype)
        .ok_or_else(|| CodecError::Malformed(format!("unknown dtype {}", msg.data.dtype)))?;
    let pid = match msg.pid.as_slice() {
        [pid] => *pid,
        other => {
            return Err(CodecError::Malformed(format!(
                "pid must have one element, got {}",
                other.len()
            )))
        }
    };

    let too_large = || CodecError::Malformed(format!("shape {:?} is too large", msg.data.shape));
    let dims = msg
        .data
        .shape
        .iter()
        .map(|&d| usize::try_from(d).map_err(|_| too_large()))
        .collect::<Result<Vec<usize>, _>>()?;
    let (count, frame_shape) = match dims.split_first() {
        Some((&n, rest)) if n > 0 => (n, rest.to_vec()),
        _ => return Err(CodecError::Malformed("data holds no frames".to_string())),
    };

    let frame_bytes = frame_shape
        .iter()
        .try_fold(dtype.size(), |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(too_large)?;
    if frame_bytes == 0 && count > 1 {
        return Err(CodecError::Malformed(format!(
            "{} frames of zero size",
            count
        )));
    }
    let total = frame_bytes.checked_mul(count).ok_or_else(too_large)?;

    let payload = Bytes::from(msg.data.bytes.into_vec());
    if payload.len() != total {
        return Err(CodecError::Malformed(format!(
            "{} bytes for {} frames of {} bytes",
            payload.len(),
            count,
            frame_bytes
        )));
    }

    let frames = (0..count)
        .map(|i| {
            Frame::new(
                dtype,
                frame_shape.clone(),
                payload.slice(i * frame_bytes..(i + 1) * frame_bytes),
            )
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ContainerMessage { frames, pid })
}
