//! Single-use challenges that bind an attestation document to one
//! particular sync attempt.

use alloc::string::String;
use core::fmt::{self, Formatter};

use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::communication::HexBytes;

/// Length of a nonce in bytes
pub const NONCE_LEN: usize = 20;

#[derive(Error, Debug)]
#[error("Could not gather entropy for a nonce: {0}")]
pub struct EntropyError(pub rand_core::Error);

#[derive(Error, Debug)]
pub enum NonceParseError {
    #[error("Nonce was not valid hex")]
    Hex,
    #[error("Expected a nonce of {NONCE_LEN} bytes, got {0}")]
    Length(usize),
}

/// A random challenge. Equality is by value.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_LEN]);

impl Nonce {
    /// Draw a fresh nonce from a cryptographically secure source.
    ///
    /// An unavailable entropy source is reported rather than retried.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Result<Self, EntropyError> {
        let mut bytes = [0u8; NONCE_LEN];
        rng.try_fill_bytes(&mut bytes).map_err(EntropyError)?;
        Ok(Self(bytes))
    }

    /// Parse the hex form used in the attestation request query
    pub fn from_hex(s: &str) -> Result<Self, NonceParseError> {
        let bytes = hex::decode(s).map_err(|_| NonceParseError::Hex)?;
        let len = bytes.len();
        bytes
            .try_into()
            .map(Self)
            .map_err(|_| NonceParseError::Length(len))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }
}

impl From<[u8; NONCE_LEN]> for Nonce {
    fn from(bytes: [u8; NONCE_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({})", self.to_hex())
    }
}

impl fmt::LowerHex for Nonce {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Nonce {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        HexBytes(self.0).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Nonce {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        HexBytes::<NONCE_LEN>::deserialize(deserializer).map(|h| Self(h.0))
    }
}
