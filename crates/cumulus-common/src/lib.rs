//! Cumulus Common Library
//!
//! Shared domain types for the Cumulus aggregation pipeline.
//!
//! # Overview
//!
//! This crate holds everything that is pure (no network or object-store I/O)
//! and shared by the pipeline workers and the read API:
//!
//! - **Keys**: canonical encoding/decoding of object-store keys per subbucket
//! - **Files**: classification of uploaded children by filename
//! - **Metadata**: the canonical metadata document shapes and the deep-merge
//!   policy applied by the metadata coalescer
//! - **Error Handling**: the pipeline error taxonomy
//! - **Logging**: tracing subscriber initialisation shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use cumulus_common::keys::{self, PackageMetadata, Subbucket};
//!
//! fn route(key: &str) -> cumulus_common::Result<()> {
//!     let decoded = keys::decode(key)?;
//!     let aggregate = PackageMetadata::aggregate(
//!         &decoded.meta.study,
//!         decoded.meta.data_package()?,
//!         &decoded.meta.version,
//!     );
//!     println!("{}", keys::encode(Subbucket::Aggregates, &aggregate)?);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod files;
pub mod keys;
pub mod logging;
pub mod metadata;

// Re-export commonly used types
pub use error::{CumulusError, Result};
pub use files::FileCategory;
pub use keys::{PackageMetadata, Subbucket};
pub use metadata::{ColumnType, MetadataDelta};
