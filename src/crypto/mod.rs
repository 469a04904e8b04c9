//! Encryption of stored connection passwords.
//!
//! Passwords in `conduit.toml` may be stored as `crypt:<base64>`, where the
//! payload is `nonce || AES-256-GCM(ciphertext || tag)`. The supervisor
//! decrypts them with its [`MasterKey`] right before a `connect` message is
//! sent, so plaintext never touches the settings file.

mod master_key;

pub use master_key::{MasterKey, MASTER_KEY_ENV};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

use crate::config::ENCRYPTED_PREFIX;

/// The length of an AES-256 key in bytes.
pub const KEY_LENGTH: usize = 32;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("invalid key length: expected {KEY_LENGTH} bytes")]
    InvalidKeyLength,

    #[error("invalid ciphertext")]
    InvalidCiphertext,

    #[error("system random generator failed")]
    RandomFailed,
}

/// Generate a random 32-byte key.
pub fn generate_key() -> CryptoResult<[u8; KEY_LENGTH]> {
    let mut key = [0u8; KEY_LENGTH];
    SystemRandom::new()
        .fill(&mut key)
        .map_err(|_| CryptoError::RandomFailed)?;
    Ok(key)
}

pub fn encode_key(key: &[u8; KEY_LENGTH]) -> String {
    BASE64.encode(key)
}

pub fn decode_key(encoded: &str) -> CryptoResult<[u8; KEY_LENGTH]> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|_| CryptoError::InvalidKeyLength)?;
    bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength)
}

fn aead_key(key: &[u8; KEY_LENGTH]) -> CryptoResult<LessSafeKey> {
    let unbound = UnboundKey::new(&AES_256_GCM, key).map_err(|_| CryptoError::InvalidKeyLength)?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt `plaintext`, returning base64 of `nonce || ciphertext || tag`.
pub fn encrypt(key: &[u8; KEY_LENGTH], plaintext: &[u8]) -> CryptoResult<String> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut sealed = plaintext.to_vec();
    aead_key(key)?
        .seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut sealed,
        )
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&sealed);
    Ok(BASE64.encode(out))
}

/// Reverse of [`encrypt`].
pub fn decrypt(key: &[u8; KEY_LENGTH], ciphertext: &str) -> CryptoResult<Vec<u8>> {
    let data = BASE64
        .decode(ciphertext)
        .map_err(|_| CryptoError::InvalidCiphertext)?;
    if data.len() <= NONCE_LEN {
        return Err(CryptoError::InvalidCiphertext);
    }

    let (nonce_bytes, sealed) = data.split_at(NONCE_LEN);
    let nonce: [u8; NONCE_LEN] = nonce_bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidCiphertext)?;

    let mut in_out = sealed.to_vec();
    let plaintext = aead_key(key)?
        .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    Ok(plaintext.to_vec())
}

/// Encrypt a password into its stored `crypt:` form.
pub fn encrypt_password(key: &MasterKey, password: &str) -> CryptoResult<String> {
    Ok(format!(
        "{ENCRYPTED_PREFIX}{}",
        encrypt(key.key(), password.as_bytes())?
    ))
}
