//! Pluggable decryption for manifests and substitution files.
//!
//! This crate provides:
//! - [`Decryptor`]: the capability trait every decryption backend implements
//! - [`DecryptorChain`]: an ordered chain consulted per payload, plus its cleanups
//! - [`sealed`]: the baseline local-key decryptor
//! - [`secret`]: the external secret store used to seed key material

pub mod sealed;
pub mod secret;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, instrument, warn};

use subst_shared::{BuildConfig, Result};

pub use sealed::{KEY_FIELD, KeyRing, SealedDecryptor, seal_document};
pub use secret::{ClusterConnection, KubeSecretStore, SecretRef, SecretStore};

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A decryption backend.
///
/// Instances are shared read-only across workers once the chain is built;
/// `seed_keys_from_secret` is only called during chain construction.
#[async_trait]
pub trait Decryptor: Send + Sync {
    /// Human-readable name for tracing.
    fn name(&self) -> &str;

    /// Whether `bytes` are encrypted for this backend.
    fn is_encrypted(&self, bytes: &[u8]) -> Result<bool>;

    /// Decrypt `bytes`, returning the plaintext document.
    fn decrypt(&self, bytes: &[u8]) -> Result<Vec<u8>>;

    /// Load additional key material from an external secret.
    async fn seed_keys_from_secret(&self, secret: &SecretRef, store: &dyn SecretStore)
    -> Result<()>;
}

/// Callback releasing resources held by a decryptor.
pub type Cleanup = Box<dyn FnOnce() + Send + Sync>;

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

/// Decryptors in registration order. Cleanups run when the chain is dropped.
#[derive(Default)]
pub struct DecryptorChain {
    decryptors: Vec<Arc<dyn Decryptor>>,
    cleanups: Vec<Cleanup>,
}

impl DecryptorChain {
    /// An empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the chain for `config`, reaching the cluster secret store when configured.
    pub async fn build(config: &BuildConfig) -> Result<Self> {
        Self::build_with(config, |config| {
            KubeSecretStore::connect(config).map(|s| Box::new(s) as Box<dyn SecretStore>)
        })
        .await
    }

    /// Build the chain with a caller-supplied secret store factory.
    ///
    /// Only a malformed local key fails construction. Failing to reach or read
    /// the secret store leaves the chain on local keys.
    #[instrument(skip_all, fields(root = %config.root_directory.display()))]
    pub async fn build_with<F>(config: &BuildConfig, connect: F) -> Result<Self>
    where
        F: FnOnce(&BuildConfig) -> Result<Box<dyn SecretStore>>,
    {
        let mut chain = Self::new();

        let sealed = SealedDecryptor::new(config.decryption.skip_decrypt, &config.decryption.keys)?;
        let ring = sealed.key_ring();
        chain.register(Arc::new(sealed));
        chain.on_cleanup(move || ring.wipe());

        if config.secret.skip {
            debug!("secret store disabled");
            return Ok(chain);
        }

        if config.decryption.skip_decrypt {
            return Ok(chain);
        }

        let Some((name, namespace)) = config.secret_ref() else {
            return Ok(chain);
        };
        let secret = SecretRef::new(name, namespace);

        let store = match connect(config) {
            Ok(store) => store,
            Err(e) => {
                debug!(error = %e, "could not load cluster client");
                return Ok(chain);
            }
        };

        for decryptor in &chain.decryptors {
            if let Err(e) = decryptor.seed_keys_from_secret(&secret, store.as_ref()).await {
                warn!(
                    decryptor = decryptor.name(),
                    %secret,
                    error = %e,
                    "failed to load keys from secret"
                );
            }
        }

        Ok(chain)
    }

    /// Append a decryptor; earlier registrations take precedence.
    pub fn register(&mut self, decryptor: Arc<dyn Decryptor>) {
        self.decryptors.push(decryptor);
    }

    /// Register a callback to run after the chain's last use.
    pub fn on_cleanup(&mut self, cleanup: impl FnOnce() + Send + Sync + 'static) {
        self.cleanups.push(Box::new(cleanup));
    }

    pub fn len(&self) -> usize {
        self.decryptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decryptors.is_empty()
    }

    /// First decryptor claiming `bytes`. Classification errors count as "no".
    pub fn detect(&self, bytes: &[u8]) -> Option<&dyn Decryptor> {
        for decryptor in &self.decryptors {
            match decryptor.is_encrypted(bytes) {
                Ok(true) => return Some(decryptor.as_ref()),
                Ok(false) => {}
                Err(e) => {
                    error!(decryptor = decryptor.name(), error = %e, "error checking encryption");
                }
            }
        }
        None
    }

    /// Plaintext when some decryptor claims `bytes`, `None` when nobody does.
    pub fn open(&self, bytes: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.detect(bytes) {
            Some(decryptor) => {
                debug!(decryptor = decryptor.name(), "decrypting payload");
                decryptor.decrypt(bytes).map(Some)
            }
            None => Ok(None),
        }
    }
}

impl Drop for DecryptorChain {
    fn drop(&mut self) {
        for cleanup in self.cleanups.drain(..) {
            cleanup();
        }
    }
}

impl fmt::Debug for DecryptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptorChain")
            .field(
                "decryptors",
                &self.decryptors.iter().map(|d| d.name()).collect::<Vec<_>>(),
            )
            .field("cleanups", &self.cleanups.len())
            .finish()
    }
}
