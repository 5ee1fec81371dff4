//! Message codecs: frame batches to self-describing byte blobs and back.
//!
//! Two encodings share one wire:
//!
//! - **Container**: a MessagePack map `{"data": <array>, "pid": [pid]}` carrying
//!   `n` same-shaped frames stacked into one `[n, *shape]` array.
//! - **Compressed**: a single frame behind an `LCZ1` header, zstd-compressed,
//!   optionally with float mantissas truncated first.
//!
//! Receivers call [`decode`], which tells the two apart by their first bytes.

pub mod compressed;
pub mod container;

use crate::frame::{DType, Frame, FrameError};
use bytes::Bytes;
use lclconf::{CodecKind, PipelineConfig};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Cannot encode an empty batch")]
    EmptyBatch,

    #[error("Cannot encode a zero-sized frame")]
    ZeroSized,

    #[error("Batch frames differ in shape or dtype")]
    MixedBatch,

    #[error("Compressed codec encodes one frame per message, got {0}")]
    NotSingleFrame(usize),

    #[error("keep_bits {keep} out of range for {dtype}")]
    InvalidKeepBits { dtype: DType, keep: u8 },

    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    #[error("zstd error: {0}")]
    Zstd(#[from] std::io::Error),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl CodecError {
    /// True for failures on the receiving side.
    pub fn is_decode(&self) -> bool {
        matches!(
            self,
            CodecError::MsgPackDecode(_) | CodecError::Malformed(_) | CodecError::Frame(_)
        )
    }
}

/// Encoder settings for one pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCodec {
    Container { pid: u32 },
    Compressed { level: i32, keep_bits: u8 },
}

impl MessageCodec {
    /// Codec for this process, as configured.
    pub fn from_config(config: &PipelineConfig) -> Self {
        match config.codec {
            CodecKind::Container => MessageCodec::Container {
                pid: std::process::id(),
            },
            CodecKind::Compressed => MessageCodec::Compressed {
                level: config.compression_level,
                keep_bits: config.lossy_keep_bits,
            },
        }
    }

    pub fn kind(&self) -> CodecKind {
        match self {
            MessageCodec::Container { .. } => CodecKind::Container,
            MessageCodec::Compressed { .. } => CodecKind::Compressed,
        }
    }

    /// Frames packed into each message for a requested batch size.
    pub fn frames_per_message(&self, batch_size: usize) -> usize {
        match self {
            MessageCodec::Container { .. } => batch_size,
            MessageCodec::Compressed { .. } => 1,
        }
    }

    pub fn encode(&self, batch: &[Frame]) -> Result<Bytes, CodecError> {
        match self {
            MessageCodec::Container { pid } => container::encode(batch, *pid),
            MessageCodec::Compressed { level, keep_bits } => match batch {
                [frame] => compressed::encode(frame, *level, *keep_bits),
                [] => Err(CodecError::EmptyBatch),
                many => Err(CodecError::NotSingleFrame(many.len())),
            },
        }
    }
}

/// A decoded message of either encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub kind: CodecKind,
    pub frames: Vec<Frame>,
    /// Producer process id; container messages only.
    pub pid: Option<u32>,
}

/// Decode a message, detecting its encoding.
pub fn decode(bytes: &[u8]) -> Result<Decoded, CodecError> {
    if bytes.starts_with(compressed::MAGIC) {
        let frame = compressed::decode(bytes)?;
        Ok(Decoded {
            kind: CodecKind::Compressed,
            frames: vec![frame],
            pid: None,
        })
    } else {
        let msg = container::decode(bytes)?;
        Ok(Decoded {
            kind: CodecKind::Container,
            frames: msg.frames,
            pid: Some(msg.pid),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(v: f32) -> Frame {
        Frame::from_f32(vec![2, 2], &[v, v + 1.0, v + 2.0, v + 3.0]).unwrap()
    }

    #[test]
    fn test_decode_detects_encoding() {
        let batch = vec![frame(0.0), frame(4.0)];

        let container = MessageCodec::Container { pid: 42 }.encode(&batch).unwrap();
        let decoded = decode(&container).unwrap();
        assert_eq!(decoded.kind, CodecKind::Container);
        assert_eq!(decoded.frames, batch);
        assert_eq!(decoded.pid, Some(42));

        let codec = MessageCodec::Compressed { level: 3, keep_bits: 0 };
        let single = codec.encode(&batch[..1]).unwrap();
        let decoded = decode(&single).unwrap();
        assert_eq!(decoded.kind, CodecKind::Compressed);
        assert_eq!(decoded.frames, batch[..1].to_vec());
    }

    #[test]
    fn test_compressed_rejects_batches() {
        let codec = MessageCodec::Compressed { level: 3, keep_bits: 0 };
        assert!(matches!(codec.encode(&[frame(0.0), frame(1.0)]), Err(CodecError::NotSingleFrame(2))));
        assert!(matches!(codec.encode(&[]), Err(CodecError::EmptyBatch)));
        assert_eq!(codec.frames_per_message(20), 1);
    }

    #[test]
    fn test_from_config() {
        let mut config = PipelineConfig::default();
        assert_eq!(MessageCodec::from_config(&config).kind(), CodecKind::Container);

        config.codec = CodecKind::Compressed;
        config.lossy_keep_bits = 10;
        assert_eq!(
            MessageCodec::from_config(&config),
            MessageCodec::Compressed { level: 3, keep_bits: 10 }
        );
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let err = decode(b"\x00\x01not a message").unwrap_err();
        assert!(err.is_decode());
    }
}
