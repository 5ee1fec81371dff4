//! lclproto - wire-level pieces of lclstream.
//!
//! - [`frame`]: `Frame` and `DType`
//! - [`batcher`]: fixed-size batching of frame sequences
//! - [`codec`]: container and compressed message encodings
//! - [`channel`]: ZMQ push/pull channels with backpressure and peer tracking
//! - [`address`]: endpoint helpers

pub mod address;
pub mod batcher;
pub mod channel;
pub mod codec;
pub mod frame;

pub use address::{has_transport_scheme, with_port_offset};
pub use batcher::{BatchError, FrameBatcher};
pub use channel::{ChannelConfig, ChannelError, PullChannel, PushChannel, Role};
pub use codec::{decode, CodecError, Decoded, MessageCodec};
pub use frame::{DType, Frame, FrameError};
