//! The Secret Vault: at-rest encryption for hop private keys.
//!
//! Ported from the original prototype's `encryption.py`, which used
//! `cryptography`'s `AESGCM` + `PBKDF2HMAC`. Same construction here:
//! AES-256-GCM with a key derived by PBKDF2-HMAC-SHA256, at a much higher
//! iteration count than `dxid-wallet`'s own keystore used (it used 10,000;
//! the original prototype and this vault use 480,000).

use aes_gcm::aead::{Aead, KeyInit, OsRng as AeadOsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const KEY_LEN: usize = 32;
pub const ITERATIONS: u32 = 480_000;

/// Mirrors the original `EncryptionError`: callers only ever learn that a
/// decrypt failed, never why, so a corrupted blob can't be distinguished
/// from a wrong password by an attacker watching error text.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("encryption failed")]
    EncryptFailed,
    #[error("decryption failed - wrong password or corrupted data")]
    DecryptFailed,
    #[error("malformed vault blob")]
    Malformed,
}

/// A decrypted secret that zeroes its backing buffer on drop. Holds a WIF
/// private key or similar plaintext that must not linger in memory after
/// use.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

fn derive_key(password: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, ITERATIONS, &mut key);
    key
}

/// Encrypt `plaintext` under `password`, returning a base64 blob laid out
/// as `salt(16) || nonce(12) || ciphertext+tag`. Two calls with the same
/// plaintext and password never produce the same blob: salt and nonce are
/// both drawn fresh from the OS RNG every time.
pub fn encrypt(plaintext: &str, password: &str) -> Result<String, VaultError> {
    let mut salt = [0u8; SALT_LEN];
    AeadOsRng.fill_bytes(&mut salt);
    let mut nonce_bytes = [0u8; NONCE_LEN];
    AeadOsRng.fill_bytes(&mut nonce_bytes);

    let key = derive_key(password, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| VaultError::EncryptFailed)?;
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| VaultError::EncryptFailed)?;

    let mut blob = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(blob))
}

/// Decrypt a blob produced by [`encrypt`]. Returns a [`Secret`] that
/// zeroes itself when dropped.
pub fn decrypt(encrypted: &str, password: &str) -> Result<Secret, VaultError> {
    let data = BASE64.decode(encrypted).map_err(|_| VaultError::Malformed)?;
    if data.len() < SALT_LEN + NONCE_LEN {
        return Err(VaultError::Malformed);
    }
    let (salt, rest) = data.split_at(SALT_LEN);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

    let key = derive_key(password, salt);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| VaultError::DecryptFailed)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| VaultError::DecryptFailed)?;
    let plaintext = String::from_utf8(plaintext).map_err(|_| VaultError::DecryptFailed)?;
    Ok(Secret(plaintext))
}

/// Attempt-decrypt-and-discard: lets callers check a password without
/// having to handle the plaintext themselves.
pub fn verify_password(encrypted: &str, password: &str) -> bool {
    decrypt(encrypted, password).is_ok()
}

/// Derive a storable password verifier: `base64(salt || sha256(derived_key))`.
/// Used for the `settings.password_verifier` row, not for decrypting
/// anything — a dedicated KDF output so a leaked verifier can't be used
/// to decrypt real vault blobs.
pub fn generate_password_hash(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    AeadOsRng.fill_bytes(&mut salt);
    let key = derive_key(password, &salt);
    let digest = Sha256::digest(key);
    let mut out = Vec::with_capacity(SALT_LEN + digest.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&digest);
    BASE64.encode(out)
}

/// Constant-time: comparison never branches on how many leading bytes of
/// the digest match, so a timing side-channel can't narrow down the
/// password.
pub fn verify_password_hash(password: &str, stored_hash: &str) -> bool {
    let Ok(data) = BASE64.decode(stored_hash) else {
        return false;
    };
    if data.len() <= SALT_LEN {
        return false;
    }
    let (salt, stored_digest) = data.split_at(SALT_LEN);
    let key = derive_key(password, salt);
    let computed = Sha256::digest(key);
    computed.as_slice().ct_eq(stored_digest).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let blob = encrypt("cVZ2examplewifkey", "correct horse").unwrap();
        let secret = decrypt(&blob, "correct horse").unwrap();
        assert_eq!(secret.expose(), "cVZ2examplewifkey");
    }

    #[test]
    fn wrong_password_fails() {
        let blob = encrypt("cVZ2examplewifkey", "correct horse").unwrap();
        assert!(decrypt(&blob, "wrong password").is_err());
        assert!(!verify_password(&blob, "wrong password"));
        assert!(verify_password(&blob, "correct horse"));
    }

    #[test]
    fn two_encryptions_of_same_plaintext_differ() {
        let a = encrypt("same secret", "pw").unwrap();
        let b = encrypt("same secret", "pw").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn malformed_blob_rejected() {
        assert!(decrypt("not-base64!!", "pw").is_err());
        assert!(decrypt(&BASE64.encode("too short"), "pw").is_err());
    }

    #[test]
    fn password_hash_roundtrip() {
        let hash = generate_password_hash("hunter2");
        assert!(verify_password_hash("hunter2", &hash));
        assert!(!verify_password_hash("wrong", &hash));
    }
}
