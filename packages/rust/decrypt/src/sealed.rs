//! Sealed local-key decryptor.
//!
//! A sealed document is a mapping carrying a top-level `_seal_key` field with
//! the id of the key it was sealed with. Every sealed value is a string of the
//! form `SEAL[v1:<nonce>:<ciphertext>]` (XChaCha20-Poly1305, base64 parts).
//! Keys are 32 bytes, supplied hex-encoded; a key id is the first 16 hex
//! characters of the key's SHA-256.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use subst_shared::{Node, Result, Scalar, SubstError};

use crate::Decryptor;
use crate::secret::{SecretRef, SecretStore};

/// Top-level field naming the key a document was sealed with.
pub const KEY_FIELD: &str = "_seal_key";

const SEALED_PREFIX: &str = "SEAL[v1:";
const SEALED_SUFFIX: &str = "]";
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;

type KeyBytes = Zeroizing<[u8; KEY_LEN]>;

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Parse a hex-encoded 32-byte key.
pub fn parse_key(encoded: &str) -> Result<KeyBytes> {
    let raw = Zeroizing::new(
        hex::decode(encoded.trim())
            .map_err(|_| SubstError::decryptor_init("key is not valid hex"))?,
    );
    if raw.len() != KEY_LEN {
        return Err(SubstError::decryptor_init(format!(
            "key must be {KEY_LEN} bytes, got {}",
            raw.len()
        )));
    }
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&raw);
    Ok(key)
}

/// Short identifier stamped into sealed documents.
pub fn key_id(key: &[u8; KEY_LEN]) -> String {
    let digest = Sha256::digest(key);
    hex::encode(digest)[..16].to_string()
}

/// Key material shared between a decryptor and its cleanup callback.
#[derive(Default)]
pub struct KeyRing {
    keys: RwLock<BTreeMap<String, KeyBytes>>,
}

impl KeyRing {
    /// Add a key; returns its id.
    pub fn insert(&self, key: KeyBytes) -> String {
        let id = key_id(&key);
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), key);
        id
    }

    fn get(&self, id: &str) -> Option<KeyBytes> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop (and zero) every key.
    pub fn wipe(&self) {
        self.keys.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl std::fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRing").field("keys", &self.len()).finish()
    }
}

// ---------------------------------------------------------------------------
// Decryptor
// ---------------------------------------------------------------------------

/// Baseline decryptor backed by locally supplied keys.
#[derive(Debug)]
pub struct SealedDecryptor {
    skip_decrypt: bool,
    ring: Arc<KeyRing>,
}

impl SealedDecryptor {
    /// Build from hex-encoded local keys. Malformed keys are fatal.
    pub fn new(skip_decrypt: bool, keys: &[String]) -> Result<Self> {
        let ring = Arc::new(KeyRing::default());
        for (i, encoded) in keys.iter().enumerate() {
            let key = parse_key(encoded).map_err(|e| {
                SubstError::decryptor_init(format!("local key #{}: {e}", i + 1))
            })?;
            let id = ring.insert(key);
            debug!(key_id = %id, "loaded local key");
        }
        Ok(Self { skip_decrypt, ring })
    }

    /// Handle on the key material, used to wipe it on cleanup.
    pub fn key_ring(&self) -> Arc<KeyRing> {
        Arc::clone(&self.ring)
    }
}

#[async_trait]
impl Decryptor for SealedDecryptor {
    fn name(&self) -> &str {
        "sealed"
    }

    fn is_encrypted(&self, bytes: &[u8]) -> Result<bool> {
        let docs = Node::documents_from_yaml(bytes)?;
        Ok(match docs.as_slice() {
            [Node::Mapping(m)] => m.get(KEY_FIELD).and_then(Node::as_str).is_some(),
            _ => false,
        })
    }

    fn decrypt(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let mut node = Node::from_yaml_slice(bytes)?;
        let mapping = node
            .as_mapping_mut()
            .ok_or_else(|| SubstError::decrypt("sealed document is not a mapping"))?;
        let id = match mapping.remove(KEY_FIELD) {
            Some(Node::Scalar(Scalar::String(id))) => id,
            _ => return Err(SubstError::decrypt(format!("missing {KEY_FIELD} field"))),
        };

        if !self.skip_decrypt {
            let key = self
                .ring
                .get(&id)
                .ok_or_else(|| SubstError::decrypt(format!("no key loaded for id {id}")))?;
            let cipher = XChaCha20Poly1305::new(Key::from_slice(&key[..]));
            open_node(&mut node, &cipher)?;
        }

        node.to_json_vec()
    }

    async fn seed_keys_from_secret(
        &self,
        secret: &SecretRef,
        store: &dyn SecretStore,
    ) -> Result<()> {
        let data = store.fetch(secret).await?;
        let mut loaded = 0usize;
        for (entry, value) in &data {
            let Ok(text) = std::str::from_utf8(value) else {
                warn!(%secret, entry = %entry, "secret entry is not utf-8, skipping");
                continue;
            };
            match parse_key(text) {
                Ok(key) => {
                    let id = self.ring.insert(key);
                    debug!(%secret, entry = %entry, key_id = %id, "loaded key from secret");
                    loaded += 1;
                }
                Err(e) => warn!(%secret, entry = %entry, error = %e, "skipping secret entry"),
            }
        }

        if loaded == 0 {
            return Err(SubstError::secret_seed(format!(
                "secret {secret} holds no usable keys"
            )));
        }
        info!(%secret, keys = loaded, "seeded keys from secret");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sealing
// ---------------------------------------------------------------------------

/// Seal every string value of a mapping with `key` (hex-encoded).
///
/// Keys starting with `_` are left in clear text, as is structure.
pub fn seal_document(node: &Node, key: &str) -> Result<Node> {
    let key = parse_key(key)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key[..]));

    let Node::Mapping(mapping) = node else {
        return Err(SubstError::parse("only mappings can be sealed"));
    };

    let mut sealed = BTreeMap::new();
    for (k, v) in mapping {
        let value = if k.starts_with('_') {
            v.clone()
        } else {
            seal_node(v, &cipher)?
        };
        sealed.insert(k.clone(), value);
    }
    sealed.insert(KEY_FIELD.to_string(), Node::string(key_id(&key)));
    Ok(Node::Mapping(sealed))
}

fn seal_node(node: &Node, cipher: &XChaCha20Poly1305) -> Result<Node> {
    Ok(match node {
        Node::Scalar(Scalar::String(s)) => Node::string(seal_value(s, cipher)?),
        Node::Scalar(_) => node.clone(),
        Node::Sequence(items) => Node::Sequence(
            items
                .iter()
                .map(|n| seal_node(n, cipher))
                .collect::<Result<_>>()?,
        ),
        Node::Mapping(m) => Node::Mapping(
            m.iter()
                .map(|(k, v)| Ok((k.clone(), seal_node(v, cipher)?)))
                .collect::<Result<_>>()?,
        ),
    })
}

fn seal_value(plaintext: &str, cipher: &XChaCha20Poly1305) -> Result<String> {
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|_| SubstError::parse("encryption failed"))?;
    Ok(format!(
        "{SEALED_PREFIX}{}:{}{SEALED_SUFFIX}",
        STANDARD.encode(nonce),
        STANDARD.encode(ciphertext)
    ))
}

fn open_node(node: &mut Node, cipher: &XChaCha20Poly1305) -> Result<()> {
    match node {
        Node::Scalar(Scalar::String(s)) => {
            if let Some(plain) = open_value(s, cipher)? {
                *s = plain;
            }
        }
        Node::Scalar(_) => {}
        Node::Sequence(items) => {
            for item in items {
                open_node(item, cipher)?;
            }
        }
        Node::Mapping(m) => {
            for value in m.values_mut() {
                open_node(value, cipher)?;
            }
        }
    }
    Ok(())
}

/// `Ok(None)` when `value` is not a sealed string.
fn open_value(value: &str, cipher: &XChaCha20Poly1305) -> Result<Option<String>> {
    let Some(body) = value
        .strip_prefix(SEALED_PREFIX)
        .and_then(|rest| rest.strip_suffix(SEALED_SUFFIX))
    else {
        return Ok(None);
    };
    let (nonce_b64, ct_b64) = body
        .split_once(':')
        .ok_or_else(|| SubstError::decrypt("malformed sealed value"))?;

    let nonce = STANDARD
        .decode(nonce_b64)
        .map_err(|e| SubstError::decrypt(format!("bad nonce encoding: {e}")))?;
    if nonce.len() != NONCE_LEN {
        return Err(SubstError::decrypt("bad nonce length"));
    }
    let ciphertext = STANDARD
        .decode(ct_b64)
        .map_err(|e| SubstError::decrypt(format!("bad ciphertext encoding: {e}")))?;

    let plain = cipher
        .decrypt(XNonce::from_slice(&nonce), ciphertext.as_ref())
        .map_err(|_| SubstError::decrypt("authentication failed"))?;
    String::from_utf8(plain)
        .map(Some)
        .map_err(|_| SubstError::decrypt("plaintext is not utf-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
    const OTHER_KEY: &str = "ff0102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn secret_doc() -> Node {
        Node::from_yaml_slice(
            b"kind: Secret\nstringData:\n  password: hunter2\n  hosts: [a, b]\n_note: clear\n",
        )
        .unwrap()
    }

    #[test]
    fn malformed_local_key_is_fatal() {
        let err = SealedDecryptor::new(false, &["not-hex".into()]).unwrap_err();
        assert!(matches!(err, SubstError::DecryptorInit { .. }));

        let err = SealedDecryptor::new(false, &["abcd".into()]).unwrap_err();
        assert!(err.to_string().contains("32 bytes"));
    }

    #[test]
    fn seal_and_open() {
        let sealed = seal_document(&secret_doc(), KEY).unwrap();
        let password = sealed.get_path("stringData.password").and_then(Node::as_str).unwrap();
        assert!(password.starts_with(SEALED_PREFIX));
        assert_eq!(sealed.get_path("_note"), Some(&Node::string("clear")));

        let decryptor = SealedDecryptor::new(false, &[KEY.into()]).unwrap();
        let bytes = sealed.to_json_vec().unwrap();
        assert!(decryptor.is_encrypted(&bytes).unwrap());

        let plain = Node::from_json_slice(&decryptor.decrypt(&bytes).unwrap()).unwrap();
        assert_eq!(plain, secret_doc());
        assert!(plain.get_path(KEY_FIELD).is_none());
    }

    #[test]
    fn plain_documents_are_not_encrypted() {
        let decryptor = SealedDecryptor::new(false, &[]).unwrap();
        assert!(!decryptor.is_encrypted(b"kind: ConfigMap\n").unwrap());
        assert!(!decryptor.is_encrypted(b"a: 1\n---\nb: 2\n").unwrap());
        assert!(decryptor.is_encrypted(b"key: [broken").is_err());
    }

    #[test]
    fn unknown_key_id_fails() {
        let sealed = seal_document(&secret_doc(), OTHER_KEY).unwrap();
        let decryptor = SealedDecryptor::new(false, &[KEY.into()]).unwrap();
        let err = decryptor.decrypt(&sealed.to_json_vec().unwrap()).unwrap_err();
        assert!(err.to_string().contains("no key loaded"));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let sealed = seal_document(&secret_doc(), KEY).unwrap();
        let mut json = String::from_utf8(sealed.to_json_vec().unwrap()).unwrap();
        let pos = json.find(SEALED_PREFIX).unwrap() + SEALED_PREFIX.len() + 40;
        let flipped = if &json[pos..=pos] == "A" { "B" } else { "A" };
        json.replace_range(pos..=pos, flipped);

        let decryptor = SealedDecryptor::new(false, &[KEY.into()]).unwrap();
        assert!(matches!(
            decryptor.decrypt(json.as_bytes()),
            Err(SubstError::Decrypt { .. })
        ));
    }

    #[test]
    fn skip_decrypt_keeps_sealed_values() {
        let sealed = seal_document(&secret_doc(), KEY).unwrap();
        let decryptor = SealedDecryptor::new(true, &[]).unwrap();
        let out = Node::from_json_slice(&decryptor.decrypt(&sealed.to_json_vec().unwrap()).unwrap())
            .unwrap();
        assert!(out.get_path(KEY_FIELD).is_none());
        let password = out.get_path("stringData.password").and_then(Node::as_str).unwrap();
        assert!(password.starts_with(SEALED_PREFIX));
    }

    #[test]
    fn wipe_empties_the_ring() {
        let decryptor = SealedDecryptor::new(false, &[KEY.into(), OTHER_KEY.into()]).unwrap();
        let ring = decryptor.key_ring();
        assert_eq!(ring.len(), 2);
        ring.wipe();
        assert!(ring.is_empty());
    }
}
