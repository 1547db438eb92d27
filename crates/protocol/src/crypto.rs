//! Symmetric payload encryption.
//!
//! Every structured payload that crosses a process boundary is serialized to
//! MessagePack, encrypted with [`PayloadCipher`] and, when it has to travel
//! inside a text transport (push events, query strings), base64-encoded.
//!
//! # Layout
//!
//! ```text
//! ┌──────────────┬────────────────────────────────────┐
//! │ IV (16 bytes)│ AES-256-CBC ciphertext (PKCS#7)    │
//! └──────────────┴────────────────────────────────────┘
//! ```
//!
//! A fresh random IV is generated for every call to [`PayloadCipher::encrypt`],
//! so encrypting the same plaintext twice never yields the same bytes.
//!
//! The key is the SHA-256 digest of a caller-supplied secret. The secret is
//! injected from configuration; nothing is compiled into the binary.

use base64::Engine;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{ProtocolError, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Length of the IV prepended to every ciphertext.
pub const IV_LENGTH: usize = 16;

/// Length of the derived key in bytes.
pub const KEY_LENGTH: usize = 32;

/// Cipher block size; ciphertexts are a non-zero multiple of it.
pub const BLOCK_SIZE: usize = 16;

/// Encrypts and decrypts binary payloads with a key derived from a shared secret.
#[derive(Clone)]
pub struct PayloadCipher {
    key: [u8; KEY_LENGTH],
}

impl PayloadCipher {
    /// Derives the key by hashing `secret` to the cipher's key size.
    pub fn from_secret(secret: impl AsRef<[u8]>) -> Self {
        Self {
            key: Sha256::digest(secret.as_ref()).into(),
        }
    }

    /// Encrypts `plaintext`, returning `IV || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut iv = [0u8; IV_LENGTH];
        OsRng.fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new_from_slices(&self.key, &iv)
            .map_err(|e| ProtocolError::Encryption(e.to_string()))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut output = Vec::with_capacity(IV_LENGTH + ciphertext.len());
        output.extend_from_slice(&iv);
        output.extend_from_slice(&ciphertext);
        Ok(output)
    }

    /// Splits the leading IV off `data` and decrypts the remainder.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < IV_LENGTH + BLOCK_SIZE {
            return Err(ProtocolError::Decryption(format!(
                "ciphertext too short: {} bytes",
                data.len()
            )));
        }

        let (iv, ciphertext) = data.split_at(IV_LENGTH);
        if ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(ProtocolError::Decryption(format!(
                "ciphertext is not a whole number of blocks: {} bytes",
                ciphertext.len()
            )));
        }
        Aes256CbcDec::new_from_slices(&self.key, iv)
            .map_err(|e| ProtocolError::Decryption(e.to_string()))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| ProtocolError::Decryption("bad padding".to_string()))
    }

    /// Encrypts and base64-encodes `plaintext` for text transports.
    pub fn encrypt_to_base64(&self, plaintext: &[u8]) -> Result<String> {
        let sealed = self.encrypt(plaintext)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(sealed))
    }

    /// Reverses [`PayloadCipher::encrypt_to_base64`].
    pub fn decrypt_from_base64(&self, encoded: &str) -> Result<Vec<u8>> {
        let sealed = base64::engine::general_purpose::STANDARD.decode(encoded.trim())?;
        self.decrypt(&sealed)
    }

    /// Serializes `value` to MessagePack and encrypts it.
    pub fn seal<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let bytes = rmp_serde::to_vec_named(value)?;
        self.encrypt(&bytes)
    }

    /// Decrypts `data` and deserializes the MessagePack payload inside.
    pub fn open<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        let bytes = self.decrypt(data)?;
        Ok(rmp_serde::from_slice(&bytes)?)
    }
}

impl std::fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCipher")
            .field("key", &"[REDACTED]")
            .finish()
    }
}
