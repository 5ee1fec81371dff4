//! Frame sources.
//!
//! A source is opened in two steps. A [`SourceDescriptor`] is built straight
//! from the request and costs nothing. The backend handle behind it is opened
//! on first use by [`LazySource`] and kept for the rest of the pipeline.
//!
//! The only built-in backend is [`SyntheticSource`]: smooth, reproducible
//! noise frames that stand in for detector data in tests and demos.

use crate::models::{AccessMode, DataRequest, RetrievalMode};
use bytes::Bytes;
use lclconf::{SourceBackend, SourceConfig};
use lclproto::{DType, Frame, FrameError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::debug;

/// Default chunk size for [`FileChunks`].
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Lattice spacing of the synthetic noise, in pixels.
const FEATURE_SIZE: usize = 16;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Retrieval mode '{0}' is not supported, only raw, calib and image are")]
    UnsupportedMode(RetrievalMode),

    #[error("Failed to open {source_id}: {reason}")]
    Open { source_id: String, reason: String },

    #[error("Malformed frame: {0}")]
    Frame(#[from] FrameError),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type FrameIter = Box<dyn Iterator<Item = Result<Frame, SourceError>> + Send>;

/// An opened backend.
pub trait FrameSource: Send + Sync {
    /// Number of events, known only for indexed access.
    fn len(&self) -> Option<usize>;

    /// A fresh pass over the run's frames in `mode`. Each call starts over.
    fn frames(&self, mode: RetrievalMode) -> Result<FrameIter, SourceError>;
}

/// Where the frames come from. Built eagerly, opens nothing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceDescriptor {
    pub experiment: String,
    pub run: u32,
    pub access_mode: AccessMode,
    pub detector_name: String,
}

impl SourceDescriptor {
    pub fn from_request(request: &DataRequest) -> Self {
        Self {
            experiment: request.experiment.clone(),
            run: request.run,
            access_mode: request.access_mode,
            detector_name: request.detector_name.clone(),
        }
    }

    /// Data source id in the facility's `exp=..:run=..:mode` form.
    pub fn source_id(&self) -> String {
        format!(
            "exp={}:run={}:{}",
            self.experiment,
            self.run,
            self.access_mode.as_str()
        )
    }

    /// Open the configured backend.
    pub fn open(&self, config: &SourceConfig) -> Result<Arc<dyn FrameSource>, SourceError> {
        match config.backend {
            SourceBackend::Synthetic => Ok(Arc::new(SyntheticSource::new(self, config)?)),
        }
    }
}

/// Opens its backend on first use and keeps it.
///
/// A failed open is not remembered; the next call tries again.
pub struct LazySource {
    descriptor: SourceDescriptor,
    config: SourceConfig,
    handle: OnceLock<Arc<dyn FrameSource>>,
}

impl LazySource {
    pub fn new(descriptor: SourceDescriptor, config: SourceConfig) -> Self {
        Self {
            descriptor,
            config,
            handle: OnceLock::new(),
        }
    }

    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    pub fn is_open(&self) -> bool {
        self.handle.get().is_some()
    }

    /// The backend handle, opening it if needed.
    pub fn handle(&self) -> Result<&Arc<dyn FrameSource>, SourceError> {
        if let Some(handle) = self.handle.get() {
            return Ok(handle);
        }
        let opened = self.descriptor.open(&self.config)?;
        debug!("opened source {}", self.descriptor.source_id());
        Ok(self.handle.get_or_init(|| opened))
    }

    /// Length of the run, or the error that kept the backend from opening.
    pub fn try_len(&self) -> Result<Option<usize>, SourceError> {
        Ok(self.handle()?.len())
    }
}

impl FrameSource for LazySource {
    /// `None` also when the backend fails to open; [`LazySource::try_len`]
    /// reports that error instead.
    fn len(&self) -> Option<usize> {
        self.try_len().ok().flatten()
    }

    fn frames(&self, mode: RetrievalMode) -> Result<FrameIter, SourceError> {
        self.handle()?.frames(mode)
    }
}

/// Reproducible smooth noise frames.
///
/// Each event is seeded from the descriptor and the event index, so two
/// passes over the same run give identical frames. `raw` yields `u16` counts;
/// `calib` and `image` yield the configured dtype. `mask` is rejected.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    seed: u64,
    access_mode: AccessMode,
    events: usize,
    shape: Vec<usize>,
    dtype: DType,
}

impl SyntheticSource {
    pub fn new(descriptor: &SourceDescriptor, config: &SourceConfig) -> Result<Self, SourceError> {
        let dtype: DType = config.dtype.parse().map_err(|e: FrameError| SourceError::Open {
            source_id: descriptor.source_id(),
            reason: e.to_string(),
        })?;
        if config.shape.is_empty() || config.shape.contains(&0) {
            return Err(SourceError::Open {
                source_id: descriptor.source_id(),
                reason: format!("frame shape {:?} has no elements", config.shape),
            });
        }

        let seed = fnv1a(descriptor.source_id().as_bytes())
            ^ fnv1a(descriptor.detector_name.as_bytes()).rotate_left(17);

        Ok(Self {
            seed,
            access_mode: descriptor.access_mode,
            events: config.events,
            shape: config.shape.clone(),
            dtype,
        })
    }

    fn render(&self, event: usize, dtype: DType) -> Result<Frame, SourceError> {
        let cols = self.shape[self.shape.len() - 1];
        let rows = self.shape[..self.shape.len() - 1].iter().product::<usize>();
        let values = smooth_noise(self.seed ^ (event as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15), rows, cols);
        Ok(Frame::new(dtype, self.shape.clone(), cast(&values, dtype))?)
    }
}

impl FrameSource for SyntheticSource {
    fn len(&self) -> Option<usize> {
        match self.access_mode {
            AccessMode::Indexed => Some(self.events),
            AccessMode::Sequential => None,
        }
    }

    fn frames(&self, mode: RetrievalMode) -> Result<FrameIter, SourceError> {
        let dtype = match mode {
            RetrievalMode::Raw => DType::U16,
            RetrievalMode::Calibrated | RetrievalMode::AssembledImage => self.dtype,
            RetrievalMode::BadPixelMask => return Err(SourceError::UnsupportedMode(mode)),
        };
        let source = self.clone();
        Ok(Box::new(
            (0..self.events).map(move |event| source.render(event, dtype)),
        ))
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Bilinear interpolation of a coarse random lattice, values in [-1, 1].
fn smooth_noise(seed: u64, rows: usize, cols: usize) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let lattice_rows = rows / FEATURE_SIZE + 2;
    let lattice_cols = cols / FEATURE_SIZE + 2;
    let lattice: Vec<f64> = (0..lattice_rows * lattice_cols)
        .map(|_| rng.gen_range(-1.0..=1.0))
        .collect();

    let at = |r: usize, c: usize| lattice[r * lattice_cols + c];
    let step = FEATURE_SIZE as f64;

    let mut out = Vec::with_capacity(rows * cols);
    for i in 0..rows {
        let y = i as f64 / step;
        let r0 = y.floor() as usize;
        let fy = y - r0 as f64;
        for j in 0..cols {
            let x = j as f64 / step;
            let c0 = x.floor() as usize;
            let fx = x - c0 as f64;
            let top = at(r0, c0) * (1.0 - fx) + at(r0, c0 + 1) * fx;
            let bottom = at(r0 + 1, c0) * (1.0 - fx) + at(r0 + 1, c0 + 1) * fx;
            out.push(top * (1.0 - fy) + bottom * fy);
        }
    }
    out
}

/// Little-endian element bytes. Integer types map [-1, 1] onto a
/// detector-like range.
fn cast(values: &[f64], dtype: DType) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * dtype.size());
    for &v in values {
        let unit = (v + 1.0) * 0.5;
        match dtype {
            DType::U8 => out.push((unit * 255.0).round() as u8),
            DType::U16 => out.extend_from_slice(&((unit * 4095.0).round() as u16).to_le_bytes()),
            DType::I16 => out.extend_from_slice(&((v * 1000.0).round() as i16).to_le_bytes()),
            DType::U32 => out.extend_from_slice(&((unit * 65535.0).round() as u32).to_le_bytes()),
            DType::I32 => out.extend_from_slice(&((v * 32767.0).round() as i32).to_le_bytes()),
            DType::F32 => out.extend_from_slice(&(v as f32).to_le_bytes()),
            DType::F64 => out.extend_from_slice(&v.to_le_bytes()),
        }
    }
    out
}

/// A file read as fixed-size chunks. The last chunk may be shorter.
pub struct FileChunks {
    path: PathBuf,
    reader: BufReader<File>,
    chunk_size: usize,
    done: bool,
}

impl FileChunks {
    pub fn open(path: impl AsRef<Path>, chunk_size: usize) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| SourceError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            path,
            reader: BufReader::new(file),
            chunk_size: chunk_size.max(1),
            done: false,
        })
    }
}

impl Iterator for FileChunks {
    type Item = Result<Bytes, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut buf = Vec::with_capacity(self.chunk_size);
        match (&mut self.reader)
            .take(self.chunk_size as u64)
            .read_to_end(&mut buf)
        {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(_) => Some(Ok(Bytes::from(buf))),
            Err(source) => {
                self.done = true;
                Some(Err(SourceError::Io {
                    path: self.path.clone(),
                    source,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn descriptor(access_mode: AccessMode) -> SourceDescriptor {
        SourceDescriptor {
            experiment: "xpptut15".into(),
            run: 580,
            access_mode,
            detector_name: "jungfrau4M".into(),
        }
    }

    fn small_config() -> SourceConfig {
        SourceConfig {
            events: 5,
            shape: vec![2, 24, 40],
            ..SourceConfig::default()
        }
    }

    #[test]
    fn test_source_id() {
        assert_eq!(descriptor(AccessMode::Indexed).source_id(), "exp=xpptut15:run=580:idx");
        assert_eq!(descriptor(AccessMode::Sequential).source_id(), "exp=xpptut15:run=580:smd");
    }

    #[test]
    fn test_synthetic_frames_are_reproducible() {
        let source = descriptor(AccessMode::Indexed).open(&small_config()).unwrap();
        assert_eq!(source.len(), Some(5));

        let first: Vec<Frame> = source
            .frames(RetrievalMode::Calibrated)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        let second: Vec<Frame> = source
            .frames(RetrievalMode::Calibrated)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(first.len(), 5);
        assert_eq!(first, second);
        assert_ne!(first[0], first[1]);
        assert_eq!(first[0].shape(), &[2, 24, 40]);
        assert_eq!(first[0].dtype(), DType::F32);

        let values = first[0].to_f32_vec().unwrap();
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_synthetic_modes() {
        let source = descriptor(AccessMode::Sequential).open(&small_config()).unwrap();
        assert_eq!(source.len(), None);

        let raw = source.frames(RetrievalMode::Raw).unwrap().next().unwrap().unwrap();
        assert_eq!(raw.dtype(), DType::U16);

        let image = source
            .frames(RetrievalMode::AssembledImage)
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(image.dtype(), DType::F32);

        assert!(matches!(
            source.frames(RetrievalMode::BadPixelMask),
            Err(SourceError::UnsupportedMode(RetrievalMode::BadPixelMask))
        ));
    }

    #[test]
    fn test_bad_dtype_fails_open() {
        let config = SourceConfig {
            dtype: "complex64".into(),
            ..small_config()
        };
        let lazy = LazySource::new(descriptor(AccessMode::Indexed), config);
        assert!(matches!(lazy.handle(), Err(SourceError::Open { .. })));
        assert!(matches!(lazy.try_len(), Err(SourceError::Open { .. })));
        assert_eq!(lazy.len(), None);
        assert!(!lazy.is_open());
    }

    #[test]
    fn test_lazy_source_opens_once() {
        let lazy = LazySource::new(descriptor(AccessMode::Indexed), small_config());
        assert!(!lazy.is_open());
        assert_eq!(lazy.try_len().unwrap(), Some(5));
        assert_eq!(lazy.len(), Some(5));
        assert!(lazy.is_open());

        let a = Arc::as_ptr(lazy.handle().unwrap()) as *const ();
        let b = Arc::as_ptr(lazy.handle().unwrap()) as *const ();
        assert_eq!(a, b);
    }

    #[test]
    fn test_file_chunks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let contents: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        file.write_all(&contents).unwrap();
        file.flush().unwrap();

        let chunks: Vec<Bytes> = FileChunks::open(file.path(), 1000)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        let sizes: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
        assert_eq!(chunks.concat(), contents);
    }

    #[test]
    fn test_missing_file() {
        let result = FileChunks::open("/nonexistent/lclstream/input.bin", DEFAULT_CHUNK_SIZE);
        assert!(matches!(result, Err(SourceError::Io { .. })));
    }
}
