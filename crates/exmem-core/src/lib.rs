//! # exmem-core
//!
//! Out-of-core data processing: block-cached files, streaming pipeline
//! components with memory-budget negotiation, and external merge sort.
//!
//! Datasets larger than memory live in block files; computations are built
//! as push/pull pipelines whose stages agree on a memory budget before any
//! I/O; sorting forms memory-sized sorted runs on disk and k-way merges
//! them back into a single ordered stream.
//!
//! ## Modules
//!
//! - [`block`] - Block-cached files of fixed-size records and their cursors
//! - [`varfile`] - Files of variable-length `[header][payload]` records
//! - [`streaming`] - Push/pull stage protocol and memory negotiation
//! - [`sort`] - External merge sort for fixed and variable records

#![warn(missing_docs)]

pub mod block;
pub mod sort;
pub mod streaming;
pub mod varfile;

pub use exmem_common::{Error, Result};
