//! Transfer requests as they arrive on the control plane.
//!
//! Field and enum spellings accept the aliases older Python clients send
//! (`exp`, `addr`, `mode`, `indexed`, `calibrated`, ...). Serialization
//! always writes the canonical names.

use lclproto::has_transport_scheme;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How events are read from the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    /// Random access by event index. The length is known up front.
    #[serde(rename = "idx", alias = "indexed")]
    Indexed,
    /// Small-data sequential stream. Length unknown until exhausted.
    #[serde(rename = "smd", alias = "sequential")]
    Sequential,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::Indexed => "idx",
            AccessMode::Sequential => "smd",
        }
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AccessMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idx" | "indexed" => Ok(AccessMode::Indexed),
            "smd" | "sequential" => Ok(AccessMode::Sequential),
            other => Err(ValidationError::UnknownValue {
                field: "access_mode",
                value: other.to_string(),
            }),
        }
    }
}

/// Which representation of the detector data to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RetrievalMode {
    #[serde(rename = "raw")]
    Raw,
    #[default]
    #[serde(rename = "calib", alias = "calibrated")]
    Calibrated,
    #[serde(rename = "image", alias = "assembled-image")]
    AssembledImage,
    #[serde(rename = "mask", alias = "bad-pixel-mask")]
    BadPixelMask,
}

impl RetrievalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalMode::Raw => "raw",
            RetrievalMode::Calibrated => "calib",
            RetrievalMode::AssembledImage => "image",
            RetrievalMode::BadPixelMask => "mask",
        }
    }
}

impl std::fmt::Display for RetrievalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RetrievalMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(RetrievalMode::Raw),
            "calib" | "calibrated" => Ok(RetrievalMode::Calibrated),
            "image" | "assembled-image" => Ok(RetrievalMode::AssembledImage),
            "mask" | "bad-pixel-mask" => Ok(RetrievalMode::BadPixelMask),
            other => Err(ValidationError::UnknownValue {
                field: "retrieval_mode",
                value: other.to_string(),
            }),
        }
    }
}

/// Rejections raised before a transfer exists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("destination_address {0:?} must start with tcp://, ipc:// or inproc://")]
    BadAddress(String),

    #[error("unknown {field}: {value}")]
    UnknownValue { field: &'static str, value: String },
}

/// One streaming request: what to read and where to send it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequest {
    #[serde(alias = "exp")]
    pub experiment: String,

    pub run: u32,

    pub access_mode: AccessMode,

    pub detector_name: String,

    #[serde(default, alias = "mode")]
    pub retrieval_mode: RetrievalMode,

    #[serde(alias = "addr")]
    pub destination_address: String,
}

impl DataRequest {
    /// Checks serde cannot express: non-empty names and a transport scheme.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.experiment.trim().is_empty() {
            return Err(ValidationError::Empty("experiment"));
        }
        if self.detector_name.trim().is_empty() {
            return Err(ValidationError::Empty("detector_name"));
        }
        if self.destination_address.trim().is_empty() {
            return Err(ValidationError::Empty("destination_address"));
        }
        if !has_transport_scheme(&self.destination_address) {
            return Err(ValidationError::BadAddress(
                self.destination_address.clone(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sample() -> DataRequest {
        DataRequest {
            experiment: "xpptut15".into(),
            run: 580,
            access_mode: AccessMode::Indexed,
            detector_name: "jungfrau4M".into(),
            retrieval_mode: RetrievalMode::Calibrated,
            destination_address: "tcp://127.0.0.1:5000".into(),
        }
    }

    #[test]
    fn test_canonical_json() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(
            value,
            json!({
                "experiment": "xpptut15",
                "run": 580,
                "access_mode": "idx",
                "detector_name": "jungfrau4M",
                "retrieval_mode": "calib",
                "destination_address": "tcp://127.0.0.1:5000",
            })
        );
    }

    #[test]
    fn test_aliases_accepted() {
        let request: DataRequest = serde_json::from_value(json!({
            "exp": "xpptut15",
            "run": 580,
            "access_mode": "indexed",
            "detector_name": "jungfrau4M",
            "mode": "assembled-image",
            "addr": "ipc:///tmp/frames",
        }))
        .unwrap();
        assert_eq!(request.experiment, "xpptut15");
        assert_eq!(request.retrieval_mode, RetrievalMode::AssembledImage);
        assert_eq!(request.destination_address, "ipc:///tmp/frames");
    }

    #[test]
    fn test_retrieval_mode_defaults_to_calib() {
        let request: DataRequest = serde_json::from_value(json!({
            "experiment": "xpptut15",
            "run": 1,
            "access_mode": "smd",
            "detector_name": "epix",
            "destination_address": "tcp://host:5000",
        }))
        .unwrap();
        assert_eq!(request.retrieval_mode, RetrievalMode::Calibrated);
        assert_eq!(request.access_mode, AccessMode::Sequential);
    }

    #[test]
    fn test_unknown_enum_value_rejected() {
        let result = serde_json::from_value::<DataRequest>(json!({
            "experiment": "xpptut15",
            "run": 1,
            "access_mode": "random",
            "detector_name": "epix",
            "destination_address": "tcp://host:5000",
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate() {
        assert_eq!(sample().validate(), Ok(()));

        let mut empty = sample();
        empty.detector_name = "  ".into();
        assert_eq!(empty.validate(), Err(ValidationError::Empty("detector_name")));

        let mut http = sample();
        http.destination_address = "http://host:5000".into();
        assert!(matches!(http.validate(), Err(ValidationError::BadAddress(_))));
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("calibrated".parse::<RetrievalMode>(), Ok(RetrievalMode::Calibrated));
        assert_eq!("mask".parse::<RetrievalMode>(), Ok(RetrievalMode::BadPixelMask));
        assert!("dark".parse::<RetrievalMode>().is_err());
        assert_eq!("sequential".parse::<AccessMode>(), Ok(AccessMode::Sequential));
    }
}
