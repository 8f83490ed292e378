//! Best-effort sensitive-field decryption. Field-level encryption is
//! managed outside this process; the engine only needs to undo it when
//! reading a connection config back.
//!
//! The engine treats the `config` blob opaquely. A field is considered
//! encrypted when its string value carries the `enc:` prefix (the
//! convention the control-plane's encryption helper writes); decrypting
//! it is a nicety, not a requirement — with no key material configured
//! the engine passes such fields through unchanged and logs once at
//! debug level rather than failing config load.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, NONCE_LEN};
use serde_json::Value;
use tracing::debug;

const ENCRYPTED_PREFIX: &str = "enc:";

/// An AES-256-GCM key loaded from `ENGINE_CONFIG_ENCRYPTION_KEY` (32
/// raw bytes, base64-encoded). Absent key material is represented by
/// `Decryptor::None` so callers never have to special-case "no key".
pub enum Decryptor {
    None,
    Aead(LessSafeKey),
}

impl Decryptor {
    /// Load from the environment; falls back to `None` (and logs once)
    /// when unset or malformed, never failing config load over it.
    pub fn from_env() -> Self {
        match std::env::var("ENGINE_CONFIG_ENCRYPTION_KEY") {
            Ok(b64) => match decode_key(&b64) {
                Some(key) => Decryptor::Aead(key),
                None => {
                    debug!("ENGINE_CONFIG_ENCRYPTION_KEY set but not a valid 32-byte base64 key; sensitive fields pass through unchanged");
                    Decryptor::None
                }
            },
            Err(_) => {
                debug!("no ENGINE_CONFIG_ENCRYPTION_KEY configured; sensitive fields pass through unchanged");
                Decryptor::None
            }
        }
    }

    /// Walk a connection config object, decrypting any string value
    /// carrying the `enc:` prefix. Non-decryptable values (wrong key,
    /// malformed ciphertext, or no key material) are left as-is — this
    /// must never be fatal to a dispatch.
    pub fn decrypt_config(&self, config: &Value) -> Value {
        match config {
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.decrypt_value(v));
                }
                Value::Object(out)
            }
            other => other.clone(),
        }
    }

    fn decrypt_value(&self, value: &Value) -> Value {
        let Value::String(s) = value else { return value.clone() };
        let Some(ciphertext_b64) = s.strip_prefix(ENCRYPTED_PREFIX) else {
            return value.clone();
        };
        let Decryptor::Aead(key) = self else { return value.clone() };
        match decrypt_field(key, ciphertext_b64) {
            Some(plaintext) => Value::String(plaintext),
            None => value.clone(),
        }
    }
}

fn decode_key(b64: &str) -> Option<LessSafeKey> {
    let bytes = BASE64.decode(b64.trim()).ok()?;
    let unbound = UnboundKey::new(&aead::AES_256_GCM, &bytes).ok()?;
    Some(LessSafeKey::new(unbound))
}

/// Ciphertext layout: `nonce (12 bytes) || ciphertext+tag`, base64-encoded
/// as one blob (the convention the control-plane's encrypt helper uses).
fn decrypt_field(key: &LessSafeKey, ciphertext_b64: &str) -> Option<String> {
    let raw = BASE64.decode(ciphertext_b64).ok()?;
    if raw.len() < NONCE_LEN {
        return None;
    }
    let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
    let nonce = Nonce::try_assume_unique_for_key(nonce_bytes).ok()?;
    let mut buf = ciphertext.to_vec();
    let plaintext = key.open_in_place(nonce, Aad::empty(), &mut buf).ok()?;
    String::from_utf8(plaintext.to_vec()).ok()
}
