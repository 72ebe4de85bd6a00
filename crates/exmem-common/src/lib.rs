//! # exmem-common
//!
//! Foundation layer for exmem: error types, the process-wide memory-limit
//! registry, and the temp-file naming service.
//!
//! This crate has no internal dependencies and should be kept minimal.
//!
//! ## Modules
//!
//! - [`error`] - The [`Error`] type shared by every exmem crate
//! - [`memory`] - Memory-limit registry and allocation-overhead accounting
//! - [`temp`] - Unique temp-file naming with delete-on-drop ownership

#![warn(missing_docs)]

pub mod error;
pub mod memory;
pub mod temp;

pub use error::{Error, Result};
pub use memory::MemoryRegistry;
pub use temp::{TempFile, TempPolicy};
