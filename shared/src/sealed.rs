//! Anonymous sealed boxes. A sender encrypts to a recipient's X25519
//! public key using a fresh ephemeral key pair, so no sender identity
//! is needed or revealed. Only the holder of the recipient's secret
//! key can open the box.
//!
//! Layout: `ephemeral public key (32 bytes) || ChaCha20Poly1305 ciphertext`.
//! The symmetric key is derived with HKDF-SHA256 over the shared secret,
//! salted with both public keys. Since every box uses a new ephemeral
//! key, the all-zero AEAD nonce is never used twice under one key.
//!
//! These boxes are not compatible with NaCl/libsodium sealed boxes
//! (`crypto_box_seal`, Go's `box.SealAnonymous`), which use
//! XSalsa20-Poly1305 with a Blake2b derived nonce. Both peers of a sync
//! must seal and open through this module.

use alloc::vec::Vec;

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use hkdf::Hkdf;
use rand_core::{CryptoRng, RngCore};
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret};

const KDF_INFO: &[u8] = b"keysync sealed box v1";

/// Bytes a box adds to its plaintext: ephemeral public key and AEAD tag
pub const SEAL_OVERHEAD: usize = 32 + 16;

#[derive(Error, Debug)]
pub enum SealError {
    #[error("Shared Secret was non-contributory. This suggests a man-in-the-middle attack.")]
    NonContributory,
    #[error("Could not encrypt message")]
    Encryption,
    #[error("Could not decrypt message")]
    Decryption,
    #[error("Sealed box of {0} bytes is too short")]
    Truncated(usize),
}

fn box_cipher(
    shared_secret: &SharedSecret,
    ephemeral_pk: &PublicKey,
    recipient_pk: &PublicKey,
) -> Result<ChaCha20Poly1305, SealError> {
    if !shared_secret.was_contributory() {
        return Err(SealError::NonContributory);
    }
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral_pk.as_bytes());
    salt[32..].copy_from_slice(recipient_pk.as_bytes());
    let hk = Hkdf::<Sha256>::new(Some(&salt), shared_secret.as_bytes());
    let mut key = [0u8; 32];
    hk.expand(KDF_INFO, &mut key)
        .map_err(|_| SealError::Encryption)?;
    Ok(ChaCha20Poly1305::new(Key::from_slice(&key)))
}

/// Encrypt `plaintext` so that only the holder of the secret key behind
/// `recipient` can decrypt it.
pub fn seal_anonymous<R: CryptoRng + RngCore>(
    plaintext: &[u8],
    recipient: &PublicKey,
    rng: R,
) -> Result<Vec<u8>, SealError> {
    let ephemeral_key = EphemeralSecret::random_from_rng(rng);
    let ephemeral_pk = PublicKey::from(&ephemeral_key);
    let shared_secret = ephemeral_key.diffie_hellman(recipient);
    let cipher = box_cipher(&shared_secret, &ephemeral_pk, recipient)?;
    let payload = cipher
        .encrypt(&Nonce::default(), plaintext)
        .map_err(|_| SealError::Encryption)?;

    let mut sealed = Vec::with_capacity(32 + payload.len());
    sealed.extend_from_slice(ephemeral_pk.as_bytes());
    sealed.extend(payload);
    Ok(sealed)
}

/// Open a box sealed to the public key of `secret`. Consumes the secret,
/// so each ephemeral key opens exactly one box.
pub fn open_anonymous(sealed: &[u8], secret: EphemeralSecret) -> Result<Vec<u8>, SealError> {
    if sealed.len() < SEAL_OVERHEAD {
        return Err(SealError::Truncated(sealed.len()));
    }
    let (pk_bytes, payload) = sealed.split_at(32);
    let mut ephemeral_bytes = [0u8; 32];
    ephemeral_bytes.copy_from_slice(pk_bytes);
    let ephemeral_pk = PublicKey::from(ephemeral_bytes);
    let recipient_pk = PublicKey::from(&secret);
    let shared_secret = secret.diffie_hellman(&ephemeral_pk);
    let cipher = box_cipher(&shared_secret, &ephemeral_pk, &recipient_pk)?;
    cipher
        .decrypt(&Nonce::default(), payload)
        .map_err(|_| SealError::Decryption)
}
