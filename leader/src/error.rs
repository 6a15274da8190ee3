//! Error type for the leader side of a key sync

use reqwest::StatusCode;
use shared::nonce::EntropyError;
use shared::sealed::SealError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Ways in which a worker broke the protocol. Each of these is
/// treated as a trust failure.
#[derive(Error, Debug)]
pub enum ProtocolViolation {
    #[error("Attestation body exceeded {0} bytes")]
    BodyTooLarge(usize),
    #[error("Could not read attestation body: {0}")]
    UnreadableBody(reqwest::Error),
    #[error("Malformed attestation message: {0}")]
    MalformedMessage(String),
    #[error("Expected encrypted keys to be unset")]
    UnexpectedKeys,
    #[error("{0}")]
    UnexpectedAuxInfo(shared::AuxInfoError),
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("{0}")]
    Entropy(#[from] EntropyError),
    #[error(
        "Failed to get attestation document after {attempts} attempts: {}",
        describe_exhaustion(.status, .error)
    )]
    TransportExhausted {
        attempts: u32,
        status: Option<StatusCode>,
        error: Option<reqwest::Error>,
    },
    #[error("Worker violated the sync protocol: {0}")]
    ProtocolViolation(#[from] ProtocolViolation),
    #[error("Worker attestation is invalid: {0}")]
    AttestationInvalid(String),
    #[error("Failed to encrypt enclave keys: {0}")]
    Encryption(String),
    #[error("Failed to create attestation document: {0}")]
    AttestationCreate(String),
    #[error("{0}")]
    Serialization(shared::MessageError),
    #[error("Failed to deliver keys to {url}: {}", describe_exhaustion(.status, .error))]
    DeliveryFailed {
        url: String,
        status: Option<StatusCode>,
        error: Option<reqwest::Error>,
    },
}

impl SyncError {
    /// Whether the worker could not be trusted, as opposed to
    /// the sync failing for transport or local reasons.
    pub fn is_trust_failure(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation(_) | Self::AttestationInvalid(_)
        )
    }
}

impl From<SealError> for SyncError {
    fn from(err: SealError) -> Self {
        Self::Encryption(err.to_string())
    }
}

fn describe_exhaustion(status: &Option<StatusCode>, error: &Option<reqwest::Error>) -> String {
    match (status, error) {
        (_, Some(err)) => err.to_string(),
        (Some(status), None) => format!("expected status code 200 but got {status}"),
        (None, None) => "no request was made".to_string(),
    }
}
