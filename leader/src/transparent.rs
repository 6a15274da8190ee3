//! An attestation backend without a TEE. Documents are plain JSON
//! carrying a code measurement and the auxiliary information, and are
//! not signed. Suitable for development and testing only.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shared::tee::Attester;
use shared::{AuxInfo, HexBytes, Nonce};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransparentError {
    #[error("Could not parse attestation document: {0}")]
    Parse(serde_json::Error),
    #[error("Could not serialize attestation document: {0}")]
    Serialize(serde_json::Error),
    #[error("Unexpected measurement: \n Expected: {0} \n Got: {1}")]
    UnexpectedMeasurement(String, String),
    #[error("Expected nonce {0:x}, received nonce: {1:x}")]
    Nonce(Nonce, Nonce),
}

#[derive(Serialize, Deserialize)]
struct TransparentDocument {
    measurement: HexBytes<32>,
    aux: AuxInfo,
}

#[derive(Debug, Copy, Clone)]
pub struct TransparentAttester {
    measurement: [u8; 32],
}

impl TransparentAttester {
    /// An attester for enclaves running code with the given measurement
    pub fn new(measurement: [u8; 32]) -> Self {
        Self { measurement }
    }

    /// Measure a code image
    pub fn measure(code: &[u8]) -> [u8; 32] {
        Sha256::digest(code).into()
    }
}

impl Attester for TransparentAttester {
    type Error = TransparentError;

    fn verify_attestation(&self, document: &[u8], nonce: &Nonce) -> Result<AuxInfo, Self::Error> {
        let doc: TransparentDocument =
            serde_json::from_slice(document).map_err(TransparentError::Parse)?;
        if doc.measurement.0 != self.measurement {
            return Err(TransparentError::UnexpectedMeasurement(
                hex::encode(self.measurement),
                hex::encode(doc.measurement.0),
            ));
        }
        if doc.aux.challenge() != nonce {
            return Err(TransparentError::Nonce(*nonce, *doc.aux.challenge()));
        }
        Ok(doc.aux)
    }

    fn create_attestation(&self, aux: &AuxInfo) -> Result<Vec<u8>, Self::Error> {
        serde_json::to_vec(&TransparentDocument {
            measurement: self.measurement.into(),
            aux: aux.clone(),
        })
        .map_err(TransparentError::Serialize)
    }
}
