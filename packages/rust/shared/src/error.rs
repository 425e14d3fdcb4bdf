//! Error types for subst.
//!
//! Library crates use [`SubstError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all subst operations.
#[derive(Debug, thiserror::Error)]
pub enum SubstError {
    /// Configuration, root directory, or manifest source load error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Local key material could not be turned into a decryptor.
    #[error("decryptor init error: {message}")]
    DecryptorInit { message: String },

    /// Key material could not be loaded from the external secret store.
    #[error("secret seed error: {message}")]
    SecretSeed { message: String },

    /// Transport error while talking to the cluster API.
    #[error("network error: {0}")]
    Network(String),

    /// Malformed structured content.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Decryption of an encrypted payload failed.
    #[error("decrypt error: {message}")]
    Decrypt { message: String },

    /// A placeholder chain revisits a path that is still being resolved.
    #[error("cyclic reference: {}", chain.join(" -> "))]
    CyclicReference { chain: Vec<String> },

    /// A placeholder names a path that exists neither in the mapping nor the environment.
    #[error("unresolved reference: (( {path} ))")]
    UnresolvedReference { path: String },

    /// A structured value was referenced from inside a longer string.
    #[error("cannot interpolate non-scalar value of (( {path} )) into a string")]
    Interpolation { path: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, SubstError>;

impl SubstError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a decryptor init error from any displayable message.
    pub fn decryptor_init(msg: impl Into<String>) -> Self {
        Self::DecryptorInit {
            message: msg.into(),
        }
    }

    /// Create a secret seed error from any displayable message.
    pub fn secret_seed(msg: impl Into<String>) -> Self {
        Self::SecretSeed {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a decrypt error from any displayable message.
    pub fn decrypt(msg: impl Into<String>) -> Self {
        Self::Decrypt {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
