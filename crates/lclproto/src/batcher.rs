//! Groups a frame sequence into fixed-size batches.
//!
//! Consumes its input lazily: a batch is pulled from the source only when
//! the caller asks for it. A source error is passed through as-is and ends
//! the sequence.

use crate::frame::{DType, Frame};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchError<E> {
    #[error("Batch size must be at least 1")]
    ZeroBatchSize,

    #[error("Frame {index} in batch has {found_dtype} {found:?}, expected {expected_dtype} {expected:?}")]
    ShapeMismatch {
        index: usize,
        expected: Vec<usize>,
        expected_dtype: DType,
        found: Vec<usize>,
        found_dtype: DType,
    },

    #[error("{0}")]
    Source(E),
}

/// Iterator adaptor yielding `Vec<Frame>` batches of exactly `size` frames.
///
/// With `emit_partial` the last batch may be shorter; without it, leftover
/// frames are discarded.
pub struct FrameBatcher<I> {
    inner: I,
    size: usize,
    emit_partial: bool,
    done: bool,
}

impl<I, E> FrameBatcher<I>
where
    I: Iterator<Item = Result<Frame, E>>,
{
    pub fn new(inner: I, size: usize, emit_partial: bool) -> Result<Self, BatchError<E>> {
        if size == 0 {
            return Err(BatchError::ZeroBatchSize);
        }
        Ok(Self {
            inner,
            size,
            emit_partial,
            done: false,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.size
    }
}

impl<I, E> Iterator for FrameBatcher<I>
where
    I: Iterator<Item = Result<Frame, E>>,
{
    type Item = Result<Vec<Frame>, BatchError<E>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut batch: Vec<Frame> = Vec::with_capacity(self.size);
        while batch.len() < self.size {
            match self.inner.next() {
                Some(Ok(frame)) => {
                    if let Some(first) = batch.first() {
                        if first.shape() != frame.shape() || first.dtype() != frame.dtype() {
                            self.done = true;
                            return Some(Err(BatchError::ShapeMismatch {
                                index: batch.len(),
                                expected: first.shape().to_vec(),
                                expected_dtype: first.dtype(),
                                found: frame.shape().to_vec(),
                                found_dtype: frame.dtype(),
                            }));
                        }
                    }
                    batch.push(frame);
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(BatchError::Source(e)));
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }

        if batch.len() == self.size || (self.emit_partial && !batch.is_empty()) {
            Some(Ok(batch))
        } else {
            None
        }
    }
}
