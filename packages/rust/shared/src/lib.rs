//! Shared types, error model, and configuration for subst.
//!
//! This crate is the foundation depended on by all other subst crates.
//! It provides:
//! - [`SubstError`]: the unified error type
//! - The document model ([`Node`], [`Scalar`], [`Document`])
//! - Configuration ([`AppConfig`], [`BuildConfig`], config loading)

pub mod config;
pub mod document;
pub mod error;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BuildConfig, DecryptionConfig, SecretConfig, SubstitutionConfig, config_dir,
    config_file_path, init_config, load_config, load_config_from,
};
pub use document::{Document, Mapping, Node, Scalar};
pub use error::{Result, SubstError};
