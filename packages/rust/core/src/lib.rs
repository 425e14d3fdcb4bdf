//! Pipeline orchestration for subst.
//!
//! This crate loads a manifest tree ([`source`]) and drives the build
//! ([`build`]): substitution discovery and bootstrap, then concurrent
//! application of the mapping to every document.

pub mod build;
pub mod source;

pub use build::{Build, BuildReport, WORKER_COUNT};
pub use source::{DirectorySource, ManifestSource};
