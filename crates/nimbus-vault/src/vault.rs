//! Vault file encryption
//!
//! A vault file is a one-line header followed by the base64 of
//! `salt(16) || nonce(12) || ciphertext+tag`. The AES-256-GCM key is
//! derived from the operator passphrase with PBKDF2-HMAC-SHA256, so a
//! wrong passphrase surfaces as an authentication failure rather than
//! garbage plaintext.

use crate::error::{Result, VaultError};
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose;
use base64::Engine as _;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

const HEADER: &str = "$NIMBUS_VAULT;1.0;AES256GCM";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const PBKDF2_ROUNDS: u32 = 600_000;

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

/// Encrypt `plaintext` under `passphrase` into the vault file format.
pub fn encrypt(plaintext: &str, passphrase: &str) -> Result<String> {
    let mut salt = [0u8; SALT_LEN];
    // The nonce generator is the AEAD's own CSPRNG; reuse it for the salt.
    let half = Aes256Gcm::generate_nonce(&mut OsRng);
    salt[..NONCE_LEN].copy_from_slice(&half);
    let rest = Aes256Gcm::generate_nonce(&mut OsRng);
    salt[NONCE_LEN..].copy_from_slice(&rest[..SALT_LEN - NONCE_LEN]);

    let key = derive_key(passphrase, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| VaultError::Malformed(format!("cipher init: {e}")))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|_| VaultError::Malformed("encryption failed".to_string()))?;

    let mut payload = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    payload.extend_from_slice(&salt);
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&ciphertext);

    Ok(format!(
        "{HEADER}\n{}\n",
        general_purpose::STANDARD.encode(payload)
    ))
}

/// Decrypt a vault file produced by [`encrypt`].
pub fn decrypt(vault: &str, passphrase: &str) -> Result<String> {
    let mut lines = vault.lines();
    match lines.next() {
        Some(h) if h.trim() == HEADER => {}
        Some(h) => return Err(VaultError::Malformed(format!("unexpected header {h:?}"))),
        None => return Err(VaultError::Malformed("empty file".to_string())),
    }
    let body: String = lines.collect();
    let payload = general_purpose::STANDARD
        .decode(body.trim())
        .map_err(|e| VaultError::Malformed(format!("base64: {e}")))?;
    if payload.len() < SALT_LEN + NONCE_LEN {
        return Err(VaultError::Malformed("payload too short".to_string()));
    }

    let (salt, rest) = payload.split_at(SALT_LEN);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);
    let key = derive_key(passphrase, salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| VaultError::Malformed(format!("cipher init: {e}")))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| VaultError::BadPassphrase)?;

    String::from_utf8(plaintext).map_err(|e| VaultError::Malformed(format!("utf-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let secret = "secrets:\n  github_token: ghp_x\n";
        let vault = encrypt(secret, "hunter2").unwrap();
        assert!(vault.starts_with(HEADER));
        assert_eq!(decrypt(&vault, "hunter2").unwrap(), secret);
    }

    #[test]
    fn test_encrypt_is_salted() {
        let a = encrypt("same", "pw").unwrap();
        let b = encrypt("same", "pw").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_passphrase_is_bad_passphrase() {
        let vault = encrypt("payload", "right").unwrap();
        assert!(matches!(
            decrypt(&vault, "wrong"),
            Err(VaultError::BadPassphrase)
        ));
    }

    #[test]
    fn test_missing_header_is_malformed() {
        assert!(matches!(
            decrypt("not a vault", "pw"),
            Err(VaultError::Malformed(_))
        ));
    }

    #[test]
    fn test_truncated_payload_is_malformed() {
        let vault = format!("{HEADER}\nc2hvcnQ=\n");
        assert!(matches!(
            decrypt(&vault, "pw"),
            Err(VaultError::Malformed(_))
        ));
    }
}
