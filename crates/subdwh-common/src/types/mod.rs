//! Shared domain types
//!
//! Types in this module cross crate boundaries or have a wire representation
//! that must stay stable: the upload-state metadata written on output files,
//! and the block range reported by the package binary.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SubdwhError};

// ============================================================================
// Wire Constants
// ============================================================================

/// Object metadata key carrying an output file's [`UploadState`].
pub const UPLOAD_STATE_METADATA_KEY: &str = "substreams_data";

/// Block ranges strictly larger than this get "extended processing" notices.
pub const EXTENDED_PROCESSING_BLOCK_THRESHOLD: u64 = 10_000;

/// A failure notification younger than this marks the next run as a retry.
pub const RECENT_FAILURE_WINDOW_SECS: i64 = 60 * 30;

/// How far back notification history is searched.
pub const NOTIFICATION_LOOKBACK_SECS: i64 = 60 * 60 * 24;

// ============================================================================
// Upload State
// ============================================================================

/// Warehouse-load state of an output file
///
/// Transitions only ever go `AwaitingUpload -> Uploaded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UploadState {
    #[serde(rename = "AWAITING_UPLOAD_TO_SNOWFLAKE")]
    AwaitingUpload,
    #[serde(rename = "UPLOADED_TO_SNOWFLAKE")]
    Uploaded,
}

impl UploadState {
    pub const fn as_str(self) -> &'static str {
        match self {
            UploadState::AwaitingUpload => "AWAITING_UPLOAD_TO_SNOWFLAKE",
            UploadState::Uploaded => "UPLOADED_TO_SNOWFLAKE",
        }
    }

    /// Whether moving from `self` to `next` respects the one-way lifecycle.
    pub fn can_transition_to(self, next: UploadState) -> bool {
        !(self == UploadState::Uploaded && next == UploadState::AwaitingUpload)
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadState {
    type Err = SubdwhError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "AWAITING_UPLOAD_TO_SNOWFLAKE" => Ok(UploadState::AwaitingUpload),
            "UPLOADED_TO_SNOWFLAKE" => Ok(UploadState::Uploaded),
            other => Err(SubdwhError::UnknownUploadState(other.to_string())),
        }
    }
}

// ============================================================================
// Block Range
// ============================================================================

/// Span of blocks a processing run covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub start_block: u64,
    pub stop_block: u64,
}

impl BlockRange {
    pub fn new(start_block: u64, stop_block: u64) -> Result<Self> {
        if stop_block < start_block {
            return Err(SubdwhError::InvertedRange {
                start: start_block,
                stop: stop_block,
            });
        }
        Ok(Self {
            start_block,
            stop_block,
        })
    }

    /// Parse the JSON object printed by `block-range-info`
    ///
    /// Both `start_block` and `stop_block` must be present; each may be a JSON
    /// integer or a string holding one.
    pub fn from_response(response: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(response.trim())?;
        let start_block = block_field(&value, "start_block")?;
        let stop_block = block_field(&value, "stop_block")?;
        Self::new(start_block, stop_block)
    }

    pub fn size(&self) -> u64 {
        self.stop_block - self.start_block
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn is_extended(&self) -> bool {
        self.size() > EXTENDED_PROCESSING_BLOCK_THRESHOLD
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start_block, self.stop_block)
    }
}

fn block_field(value: &Value, field: &'static str) -> Result<u64> {
    let raw = value.get(field).ok_or(SubdwhError::MissingField(field))?;

    let parsed = match raw {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };

    parsed.ok_or_else(|| SubdwhError::InvalidBlockNumber {
        field,
        value: raw.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_state_wire_format() {
        assert_eq!(
            UploadState::AwaitingUpload.to_string(),
            "AWAITING_UPLOAD_TO_SNOWFLAKE"
        );
        assert_eq!(
            "UPLOADED_TO_SNOWFLAKE".parse::<UploadState>().unwrap(),
            UploadState::Uploaded
        );
        assert!("uploaded".parse::<UploadState>().is_err());

        let json = serde_json::to_string(&UploadState::Uploaded).unwrap();
        assert_eq!(json, "\"UPLOADED_TO_SNOWFLAKE\"");
    }

    #[test]
    fn test_upload_state_is_one_way() {
        assert!(UploadState::AwaitingUpload.can_transition_to(UploadState::Uploaded));
        assert!(UploadState::Uploaded.can_transition_to(UploadState::Uploaded));
        assert!(!UploadState::Uploaded.can_transition_to(UploadState::AwaitingUpload));
    }

    #[test]
    fn test_block_range_accepts_strings_and_integers() {
        let range = BlockRange::from_response(r#"{"start_block": "12", "stop_block": 40}"#).unwrap();
        assert_eq!(range, BlockRange::new(12, 40).unwrap());
        assert_eq!(range.size(), 28);
    }

    #[test]
    fn test_block_range_missing_start() {
        let err = BlockRange::from_response(r#"{"stop_block": 200}"#).unwrap_err();
        assert!(matches!(err, SubdwhError::MissingField("start_block")));
    }

    #[test]
    fn test_block_range_missing_stop() {
        let err = BlockRange::from_response(r#"{"start_block": 200}"#).unwrap_err();
        assert!(matches!(err, SubdwhError::MissingField("stop_block")));
    }

    #[test]
    fn test_block_range_rejects_garbage() {
        assert!(BlockRange::from_response("not json").is_err());
        assert!(matches!(
            BlockRange::from_response(r#"{"start_block": "abc", "stop_block": 1}"#),
            Err(SubdwhError::InvalidBlockNumber { field: "start_block", .. })
        ));
        assert!(matches!(
            BlockRange::from_response(r#"{"start_block": 10, "stop_block": 1}"#),
            Err(SubdwhError::InvertedRange { .. })
        ));
    }

    #[test]
    fn test_extended_threshold_is_exclusive() {
        assert!(!BlockRange::new(0, EXTENDED_PROCESSING_BLOCK_THRESHOLD).unwrap().is_extended());
        assert!(BlockRange::new(0, EXTENDED_PROCESSING_BLOCK_THRESHOLD + 1).unwrap().is_extended());
        assert!(BlockRange::new(100, 100).unwrap().is_empty());
    }
}
