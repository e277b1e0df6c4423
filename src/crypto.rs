//! PIN-derived session keys and AES-256-GCM packet protection.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use anyhow::{anyhow, bail, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};

/// Fixed salt shared by sender and receivers. Changing it breaks pairing with
/// every deployed peer.
pub const PIN_SALT: &[u8] = b"AuStreamSalt2024";

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Bytes added to a plaintext by [`SessionCipher::seal`]: nonce + GCM tag.
pub const SEALED_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

const PBKDF2_ROUNDS: u32 = 10_000;

/// Derive the 32-byte session key both peers use for the audio stream.
pub fn derive_key(pin: &str) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(pin.as_bytes(), PIN_SALT, PBKDF2_ROUNDS, &mut key);
    key
}

/// The hash a receiver presents during authentication:
/// base64(SHA-256(pin ‖ salt)), standard alphabet, no wrapping.
pub fn hash_pin(pin: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pin.as_bytes());
    hasher.update(PIN_SALT);
    STANDARD.encode(hasher.finalize())
}

pub struct SessionCipher {
    cipher: Aes256Gcm,
}

impl SessionCipher {
    pub fn new(key: &[u8; KEY_LEN]) -> SessionCipher {
        SessionCipher {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Encrypt one PCM frame. Output layout: nonce(12) ‖ ciphertext ‖ tag(16).
    /// The nonce comes from the OS CSPRNG on every call; it is never reused.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| anyhow!("AEAD encryption failed"))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(nonce.as_slice());
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt and authenticate a sealed payload. Fails on truncated input or
    /// any tag mismatch.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < SEALED_OVERHEAD {
            bail!("sealed payload too short ({} bytes)", sealed.len());
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("AEAD authentication failed"))
    }
}
