//! Runstage Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the runstage workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`RunstageError`] and the [`Result`] alias
//! - **Checksums**: streamed MD5 / SHA-256 file digests
//! - **Process**: external command execution with captured output
//! - **Size**: human size parsing and formatting
//! - **Merge**: recursive merge of structured (JSON) values
//! - **Types**: batch, dataset and progress records shared by every step
//!
//! # Example
//!
//! ```no_run
//! use runstage_common::checksum::compute_file_checksum;
//! use runstage_common::types::ChecksumAlgorithm;
//!
//! fn digest(path: &str) -> runstage_common::Result<String> {
//!     compute_file_checksum(path, ChecksumAlgorithm::Md5)
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod merge;
pub mod process;
pub mod size;
pub mod types;

// Re-export commonly used types
pub use error::{Result, RunstageError};
