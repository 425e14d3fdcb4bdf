//! Application configuration for subst.
//!
//! User config lives at `~/.subst/subst.toml`.
//! CLI flags override config file values, which override defaults.

use std::fmt;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SubstError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "subst.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".subst";

/// Placeholder printed instead of key material.
const REDACTED: &str = "<redacted>";

// ---------------------------------------------------------------------------
// Config structs (matching subst.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Which environment variables and files feed the substitution mapping.
    #[serde(default)]
    pub substitution: SubstitutionConfig,

    /// Local decryption settings.
    #[serde(default)]
    pub decryption: DecryptionConfig,

    /// External secret store settings.
    #[serde(default)]
    pub secret: SecretConfig,
}

/// `[substitution]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubstitutionConfig {
    /// Environment variable names eligible as substitution sources.
    #[serde(default = "default_env_regex")]
    pub env_regex: String,

    /// File paths treated as substitution-definition files.
    #[serde(default = "default_file_regex")]
    pub file_regex: String,
}

impl Default for SubstitutionConfig {
    fn default() -> Self {
        Self {
            env_regex: default_env_regex(),
            file_regex: default_file_regex(),
        }
    }
}

fn default_env_regex() -> String {
    "^ARGOCD_ENV_.*$".into()
}
fn default_file_regex() -> String {
    r"(.*subst\.ya?ml|.*\.(ejson|vars))$".into()
}

/// `[decryption]` section.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct DecryptionConfig {
    /// Leave encrypted values untouched.
    #[serde(default)]
    pub skip_decrypt: bool,

    /// Hex-encoded local keys.
    #[serde(default)]
    pub keys: Vec<String>,
}

impl fmt::Debug for DecryptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptionConfig")
            .field("skip_decrypt", &self.skip_decrypt)
            .field("keys", &self.keys.len())
            .finish()
    }
}

/// `[secret]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretConfig {
    /// Never consult the secret store.
    #[serde(default)]
    pub skip: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Explicit cluster API endpoint (wins over the kube-config server).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_api: Option<String>,

    /// Path to a kube-config file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,
}

impl AppConfig {
    /// Copy with key material masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.decryption.keys = copy.decryption.keys.iter().map(|_| REDACTED.into()).collect();
        copy
    }
}

// ---------------------------------------------------------------------------
// Build config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime configuration consumed by the build pipeline.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Root of the manifest tree.
    pub root_directory: PathBuf,
    pub substitution: SubstitutionConfig,
    pub decryption: DecryptionConfig,
    pub secret: SecretConfig,
}

impl BuildConfig {
    /// Build a runtime config for `root` from the file-level config.
    pub fn new(root: impl Into<PathBuf>, config: &AppConfig) -> Self {
        Self {
            root_directory: root.into(),
            substitution: config.substitution.clone(),
            decryption: config.decryption.clone(),
            secret: config.secret.clone(),
        }
    }

    /// Compiled `env_regex`.
    pub fn env_regex(&self) -> Result<Regex> {
        compile_regex("env_regex", &self.substitution.env_regex)
    }

    /// Compiled `file_regex`.
    pub fn file_regex(&self) -> Result<Regex> {
        compile_regex("file_regex", &self.substitution.file_regex)
    }

    /// Secret name and namespace, when both are configured.
    pub fn secret_ref(&self) -> Option<(&str, &str)> {
        match (&self.secret.name, &self.secret.namespace) {
            (Some(name), Some(namespace)) if !name.is_empty() && !namespace.is_empty() => {
                Some((name, namespace))
            }
            _ => None,
        }
    }

    /// Kube-config path: configured, else `$KUBECONFIG`, else `~/.kube/config`.
    pub fn kubeconfig_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.secret.kubeconfig {
            return Some(path.clone());
        }
        if let Some(first) = std::env::var_os("KUBECONFIG")
            .as_deref()
            .and_then(|v| std::env::split_paths(v).next())
            .filter(|p| !p.as_os_str().is_empty())
        {
            return Some(first);
        }
        dirs::home_dir().map(|home| home.join(".kube").join("config"))
    }
}

fn compile_regex(field: &str, pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| SubstError::config(format!("invalid {field} '{pattern}': {e}")))
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.subst/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| SubstError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.subst/subst.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| SubstError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| SubstError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| SubstError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| SubstError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| SubstError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
