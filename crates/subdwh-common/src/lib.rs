//! subdwh common library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared vocabulary for the substreams data-warehouse pipeline.
//!
//! - **Error handling**: [`SubdwhError`] and the [`Result`] alias
//! - **Logging**: tracing subscriber setup used by every binary
//! - **Types**: [`UploadState`], [`BlockRange`] and the wire constants they use
//!
//! # Example
//!
//! ```
//! use subdwh_common::{BlockRange, UploadState};
//!
//! let range = BlockRange::from_response(r#"{"start_block": "100", "stop_block": 20100}"#)?;
//! assert!(range.is_extended());
//! assert_eq!("UPLOADED_TO_SNOWFLAKE".parse::<UploadState>()?, UploadState::Uploaded);
//! # Ok::<(), subdwh_common::SubdwhError>(())
//! ```

pub mod error;
pub mod logging;
pub mod types;

pub use error::{Result, SubdwhError};
pub use types::{BlockRange, UploadState};
