use alloc::string::String;
use alloc::vec::Vec;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::de::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::nonce::Nonce;

/// Upper limit for the length of an attestation body
pub const MAX_ATTESTATION_BODY_LEN: usize = 1 << 14;

/// The number of bytes a leader is willing to read when fetching
/// a worker's attestation: the base64 length of the largest body.
pub fn max_read_len() -> usize {
    base64::encoded_len(MAX_ATTESTATION_BODY_LEN, true).unwrap_or(usize::MAX)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HexBytes<const N: usize>(pub [u8; N]);

impl<const N: usize> From<[u8; N]> for HexBytes<N> {
    fn from(value: [u8; N]) -> Self {
        Self(value)
    }
}

macro_rules! impl_serde {
    ($n:literal) => {
        impl Serialize for HexBytes<$n> {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_str(&hex::encode(self.0))
            }
        }

        impl<'de> Deserialize<'de> for HexBytes<$n> {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Ok(Self(
                    hex::decode(s.as_bytes())
                        .map_err(|_| Error::custom("Invalid hex"))?
                        .try_into()
                        .map_err(|_| Error::custom("Bytes were of wrong size"))?,
                ))
            }
        }
    };
}

impl_serde!(20);
impl_serde!(32);

/// Bytes carried on the wire as a standard, padded base64 string
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Base64Bytes(pub Vec<u8>);

impl Serialize for Base64Bytes {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Base64Bytes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(s.as_bytes())
            .map(Self)
            .map_err(|_| Error::custom("Invalid base64"))
    }
}

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Failed to deserialize attestation message with: {0}")]
    Deserialize(serde_json::Error),
    #[error("Failed to serialize attestation message with: {0}")]
    Serialize(serde_json::Error),
}

/// The body exchanged between leader and worker.
///
/// When a worker answers an attestation request, only `document` is
/// set. When the leader delivers its keys, both fields are set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttestationMessage {
    pub document: Base64Bytes,
    #[serde(default)]
    pub encrypted_keys: Base64Bytes,
}

impl AttestationMessage {
    /// A worker's reply to an attestation request
    pub fn request_reply(document: Vec<u8>) -> Self {
        Self {
            document: Base64Bytes(document),
            encrypted_keys: Base64Bytes::default(),
        }
    }

    /// The leader's final message carrying the sealed keys
    pub fn key_delivery(document: Vec<u8>, encrypted_keys: Vec<u8>) -> Self {
        Self {
            document: Base64Bytes(document),
            encrypted_keys: Base64Bytes(encrypted_keys),
        }
    }

    pub fn has_keys(&self) -> bool {
        !self.encrypted_keys.0.is_empty()
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, MessageError> {
        serde_json::from_slice(bytes).map_err(MessageError::Deserialize)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(MessageError::Serialize)
    }
}

/// What a worker embeds in its attestation document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerAuxInfo {
    /// Challenge the worker expects echoed in the leader's reply
    pub workers_nonce: Nonce,
    /// Echo of the challenge in the leader's attestation request
    pub leaders_nonce: Nonce,
    /// Ephemeral X25519 key the leader seals its keys to
    pub public_key: HexBytes<32>,
}

/// What the leader embeds in its attestation document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderAuxInfo {
    /// Echo of the worker's own challenge
    pub workers_nonce: Nonce,
    /// SHA-256 of the exact sealed key bytes sent on the wire
    pub hash_of_encrypted: HexBytes<32>,
}

impl LeaderAuxInfo {
    /// Commit to a ciphertext on behalf of a worker
    pub fn commit(workers_nonce: Nonce, encrypted: &[u8]) -> Self {
        Self {
            workers_nonce,
            hash_of_encrypted: HexBytes(Sha256::digest(encrypted).into()),
        }
    }

    /// Check whether received ciphertext is the one the leader attested to
    pub fn commits_to(&self, encrypted: &[u8]) -> bool {
        let hash: [u8; 32] = Sha256::digest(encrypted).into();
        hash == self.hash_of_encrypted.0
    }
}

#[derive(Error, Debug)]
#[error("Expected {expected} auxiliary info, found {found}")]
pub struct AuxInfoError {
    pub expected: &'static str,
    pub found: &'static str,
}

/// Auxiliary information bound into an attestation document. Which
/// variant is present depends on who created the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum AuxInfo {
    Worker(WorkerAuxInfo),
    Leader(LeaderAuxInfo),
}

impl AuxInfo {
    fn role(&self) -> &'static str {
        match self {
            Self::Worker(_) => "worker",
            Self::Leader(_) => "leader",
        }
    }

    /// The nonce a verifier must have issued for this document to be fresh
    pub fn challenge(&self) -> &Nonce {
        match self {
            Self::Worker(aux) => &aux.leaders_nonce,
            Self::Leader(aux) => &aux.workers_nonce,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(MessageError::Serialize)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, MessageError> {
        serde_json::from_slice(bytes).map_err(MessageError::Deserialize)
    }
}

impl From<WorkerAuxInfo> for AuxInfo {
    fn from(aux: WorkerAuxInfo) -> Self {
        Self::Worker(aux)
    }
}

impl From<LeaderAuxInfo> for AuxInfo {
    fn from(aux: LeaderAuxInfo) -> Self {
        Self::Leader(aux)
    }
}

impl TryFrom<AuxInfo> for WorkerAuxInfo {
    type Error = AuxInfoError;

    fn try_from(aux: AuxInfo) -> Result<Self, Self::Error> {
        match aux {
            AuxInfo::Worker(aux) => Ok(aux),
            other => Err(AuxInfoError {
                expected: "worker",
                found: other.role(),
            }),
        }
    }
}

impl TryFrom<AuxInfo> for LeaderAuxInfo {
    type Error = AuxInfoError;

    fn try_from(aux: AuxInfo) -> Result<Self, Self::Error> {
        match aux {
            AuxInfo::Leader(aux) => Ok(aux),
            other => Err(AuxInfoError {
                expected: "leader",
                found: other.role(),
            }),
        }
    }
}
