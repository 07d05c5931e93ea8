//! Encryption at rest for private-store connection descriptors.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};

use crate::error::CloudError;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// AES-256-GCM sealing with a fresh nonce per value.
///
/// Sealed form is `base64(nonce || ciphertext)`.
#[derive(Clone)]
pub struct SecretBox {
    key: [u8; KEY_LEN],
}

impl std::fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretBox(..)")
    }
}

impl SecretBox {
    /// Accepts a base64-encoded 32-byte key, or any other non-empty string
    /// which is stretched with SHA-256.
    pub fn from_config_key(material: &str) -> anyhow::Result<Self> {
        let material = material.trim();
        if material.is_empty() {
            anyhow::bail!(
                "security.encryption_key is empty; set ERASURE_SECURITY__ENCRYPTION_KEY"
            );
        }
        if let Ok(bytes) = BASE64.decode(material) {
            if let Ok(key) = <[u8; KEY_LEN]>::try_from(bytes.as_slice()) {
                return Ok(Self { key });
            }
        }
        let key: [u8; KEY_LEN] = Sha256::digest(material.as_bytes()).into();
        Ok(Self { key })
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, CloudError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| CloudError::Crypto)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CloudError::Crypto)?;
        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    pub fn open(&self, sealed: &str) -> Result<String, CloudError> {
        let raw = BASE64.decode(sealed.trim()).map_err(|_| CloudError::Crypto)?;
        if raw.len() <= NONCE_LEN {
            return Err(CloudError::Crypto);
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| CloudError::Crypto)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CloudError::Crypto)?;
        String::from_utf8(plaintext).map_err(|_| CloudError::Crypto)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open() {
        let sb = SecretBox::from_config_key("correct horse battery staple").unwrap();
        let sealed = sb.seal("postgres://u:p@h/db").unwrap();
        assert!(!sealed.contains("postgres"));
        assert_eq!(sb.open(&sealed).unwrap(), "postgres://u:p@h/db");
    }

    #[test]
    fn nonces_differ_per_seal() {
        let sb = SecretBox::from_config_key("k").unwrap();
        assert_ne!(sb.seal("same").unwrap(), sb.seal("same").unwrap());
    }

    #[test]
    fn wrong_key_fails_closed() {
        let a = SecretBox::from_config_key("key-a").unwrap();
        let b = SecretBox::from_config_key("key-b").unwrap();
        let sealed = a.seal("secret").unwrap();
        assert!(matches!(b.open(&sealed), Err(CloudError::Crypto)));
        assert!(matches!(a.open("not base64!"), Err(CloudError::Crypto)));
        assert!(matches!(a.open(&BASE64.encode([0u8; 4])), Err(CloudError::Crypto)));
    }

    #[test]
    fn raw_base64_key_is_used_verbatim() {
        let encoded = BASE64.encode([7u8; 32]);
        let sb = SecretBox::from_config_key(&encoded).unwrap();
        assert_eq!(sb.key, [7u8; 32]);
    }

    #[test]
    fn empty_key_is_rejected() {
        assert!(SecretBox::from_config_key("   ").is_err());
    }
}
