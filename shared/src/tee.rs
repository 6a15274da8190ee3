//! Traits to abstract away particular TEE implementations

use alloc::vec::Vec;

use crate::communication::AuxInfo;
use crate::nonce::Nonce;

/// The attestation capability of an enclave: vouching for auxiliary
/// information with its own identity, and checking documents made by
/// a peer enclave.
pub trait Attester {
    type Error: core::error::Error + core::fmt::Display;

    /// Verifies a peer's attestation document and returns the auxiliary
    /// information bound into it.
    ///
    /// Implementations must check the document's authenticity and the
    /// peer's measurements, and that [`AuxInfo::challenge`] equals `nonce`.
    /// The nonce check protects against replays and must not be skipped.
    fn verify_attestation(&self, document: &[u8], nonce: &Nonce) -> Result<AuxInfo, Self::Error>;

    /// Produce a document binding `aux` to this enclave's identity.
    fn create_attestation(&self, aux: &AuxInfo) -> Result<Vec<u8>, Self::Error>;
}
