use crate::error::SecurityError;
use aes_gcm::{
    aead::{Aead, NewAead}, // NewAead for 0.9/0.4
    Aes256Gcm,
    Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

const TAG_LEN: usize = 16;
const IV_LEN: usize = 12;
const SALT_LEN: usize = 16;

/// Hex-encoded AES-256-GCM components, same layout as the encrypted
/// wallet files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSecret {
    pub ciphertext: String,
    pub iv: String,
    pub salt: String,
    pub tag: String,
}

pub struct SecurityUtils;

impl SecurityUtils {
    fn derive_key(password: &str, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>, SecurityError> {
        // N=16384, r=8, p=1 to stay compatible with scryptSync-produced files
        let params = scrypt::Params::new(14, 8, 1, 32).map_err(|e| {
            SecurityError::CryptographyFailed {
                reason: format!("Invalid scrypt params: {}", e),
            }
        })?;
        let mut key = Zeroizing::new([0u8; 32]);
        scrypt::scrypt(password.as_bytes(), salt, &params, &mut key[..]).map_err(|e| {
            SecurityError::CryptographyFailed {
                reason: format!("Scrypt failed: {}", e),
            }
        })?;
        Ok(key)
    }

    fn decode(component: &str, value: &str) -> Result<Vec<u8>, SecurityError> {
        hex::decode(value).map_err(|e| SecurityError::InvalidComponent {
            component: component.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn decrypt_components(
        ciphertext_hex: &str,
        iv_hex: &str,
        salt_hex: &str,
        tag_hex: &str,
        password: &str,
    ) -> Result<Zeroizing<String>, SecurityError> {
        let ciphertext = Self::decode("ciphertext", ciphertext_hex)?;
        let iv = Self::decode("iv", iv_hex)?;
        let salt = Self::decode("salt", salt_hex)?;
        let mut tag = Self::decode("tag", tag_hex)?;
        if iv.len() != IV_LEN {
            return Err(SecurityError::InvalidComponent {
                component: "iv".to_string(),
                reason: format!("expected {} bytes, got {}", IV_LEN, iv.len()),
            });
        }

        let key = Self::derive_key(password, &salt)?;
        let cipher = Aes256Gcm::new(aes_gcm::Key::from_slice(&key[..]));
        let nonce = Nonce::from_slice(&iv);

        let mut full_payload = ciphertext;
        full_payload.append(&mut tag);

        let plaintext = cipher
            .decrypt(nonce, full_payload.as_ref())
            .map_err(|_| SecurityError::CryptographyFailed {
                reason: "Decryption failed (wrong password or corrupted data)".to_string(),
            })?;

        String::from_utf8(plaintext)
            .map(Zeroizing::new)
            .map_err(|_| SecurityError::CryptographyFailed {
                reason: "Decrypted data is not valid UTF-8".to_string(),
            })
    }

    pub fn encrypt_components(plaintext: &str, password: &str) -> Result<SealedSecret, SecurityError> {
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut iv);

        let key = Self::derive_key(password, &salt)?;
        let cipher = Aes256Gcm::new(aes_gcm::Key::from_slice(&key[..]));
        let mut sealed = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
            .map_err(|e| SecurityError::CryptographyFailed {
                reason: format!("Encryption failed: {}", e),
            })?;

        let tag = sealed.split_off(sealed.len() - TAG_LEN);
        Ok(SealedSecret {
            ciphertext: hex::encode(&sealed),
            iv: hex::encode(iv),
            salt: hex::encode(salt),
            tag: hex::encode(tag),
        })
    }
}

/// Seals recovery key material under one password.
pub struct KeySealer {
    password: Zeroizing<String>,
}

impl KeySealer {
    pub fn new(password: impl Into<String>) -> Result<Self, SecurityError> {
        let password = Zeroizing::new(password.into());
        if password.is_empty() {
            return Err(SecurityError::PasswordRequired);
        }
        Ok(Self { password })
    }

    pub fn seal(&self, secret: &str) -> Result<SealedSecret, SecurityError> {
        SecurityUtils::encrypt_components(secret, &self.password)
    }

    pub fn open(&self, sealed: &SealedSecret) -> Result<Zeroizing<String>, SecurityError> {
        SecurityUtils::decrypt_components(
            &sealed.ciphertext,
            &sealed.iv,
            &sealed.salt,
            &sealed.tag,
            &self.password,
        )
    }
}

impl std::fmt::Debug for KeySealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeySealer(***)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_then_open() {
        let sealer = KeySealer::new("hunter2").unwrap();
        let sealed = sealer.seal("5KQwrPbwdL6PhXujxW37FSSQZ1JiwsST4cqQzDeyXtP7").unwrap();
        assert_eq!(sealed.tag.len(), TAG_LEN * 2);
        assert_eq!(
            sealer.open(&sealed).unwrap().as_str(),
            "5KQwrPbwdL6PhXujxW37FSSQZ1JiwsST4cqQzDeyXtP7"
        );
    }

    #[test]
    fn test_wrong_password_fails() {
        let sealed = KeySealer::new("right").unwrap().seal("secret").unwrap();
        let err = KeySealer::new("wrong").unwrap().open(&sealed).unwrap_err();
        assert!(matches!(err, SecurityError::CryptographyFailed { .. }));
    }

    #[test]
    fn test_empty_password_rejected() {
        assert!(matches!(
            KeySealer::new(""),
            Err(SecurityError::PasswordRequired)
        ));
    }
}
