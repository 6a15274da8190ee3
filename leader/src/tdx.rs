//! TDX specific implementation of attestation.
//!
//! A document is a CBOR encoded TDX quote together with the JSON
//! encoded auxiliary information. The quote's report data is the
//! SHA-512 hash of the auxiliary information, which binds the two.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use shared::tee::Attester;
use shared::{AuxInfo, MessageError, Nonce};
use tdx_quote::{Quote, QuoteParseError};
use thiserror::Error;

use crate::config::TdxMeasurements;

#[derive(Error, Debug)]
pub enum TdxError {
    #[error("Could not decode attestation document: {0}")]
    Document(serde_cbor::Error),
    #[error("Could not parse RA report: {0}")]
    QuoteParse(QuoteParseError),
    #[error("Unexpected {0} measurement: \n Expected: {1} \n Got: {2}")]
    UnexpectedMeasurement(&'static str, String, String),
    #[error("RA quote verification failed: {0}")]
    Verification(String),
    #[error("Report data of the quote does not match the auxiliary information")]
    ReportData,
    #[error("{0}")]
    AuxInfo(MessageError),
    #[error("Expected nonce {0:x}, received nonce: {1:x}")]
    Nonce(Nonce, Nonce),
    #[error("Could not obtain a quote: {0}")]
    Quote(std::io::Error),
}

#[derive(Serialize, Deserialize)]
struct TdxDocument {
    quote: Vec<u8>,
    aux: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct TdxAttester {
    expected: TdxMeasurements,
}

impl TdxAttester {
    /// An attester accepting peers whose measurements equal `expected`
    pub fn new(expected: TdxMeasurements) -> Self {
        Self { expected }
    }

    fn check_measurement(name: &'static str, expected: &str, got: &[u8]) -> Result<(), TdxError> {
        let got = hex::encode(got);
        if !got.eq_ignore_ascii_case(expected) {
            return Err(TdxError::UnexpectedMeasurement(
                name,
                expected.to_string(),
                got,
            ));
        }
        Ok(())
    }
}

fn report_data(aux: &[u8]) -> [u8; 64] {
    Sha512::digest(aux).into()
}

impl Attester for TdxAttester {
    type Error = TdxError;

    fn verify_attestation(&self, document: &[u8], nonce: &Nonce) -> Result<AuxInfo, Self::Error> {
        let doc: TdxDocument = serde_cbor::from_slice(document).map_err(TdxError::Document)?;
        let quote = Quote::from_bytes(&doc.quote).map_err(TdxError::QuoteParse)?;
        Self::check_measurement("MRTD", &self.expected.mrtd, &quote.mrtd())?;
        Self::check_measurement("RTMR0", &self.expected.rtmr0, &quote.rtmr0())?;
        Self::check_measurement("RTMR1", &self.expected.rtmr1, &quote.rtmr1())?;
        verify_signature(&quote)?;

        if quote.report_input_data() != report_data(&doc.aux) {
            return Err(TdxError::ReportData);
        }
        let aux = AuxInfo::from_json(&doc.aux).map_err(TdxError::AuxInfo)?;
        if aux.challenge() != nonce {
            return Err(TdxError::Nonce(*nonce, *aux.challenge()));
        }
        Ok(aux)
    }

    fn create_attestation(&self, aux: &AuxInfo) -> Result<Vec<u8>, Self::Error> {
        let aux = aux.to_json().map_err(TdxError::AuxInfo)?;
        let quote = get_quote(report_data(&aux)).map_err(TdxError::Quote)?;
        serde_cbor::to_vec(&TdxDocument { quote, aux }).map_err(TdxError::Document)
    }
}

/// Check the quote signature against the PCK certificate chain it carries
#[cfg(not(feature = "mock"))]
fn verify_signature(quote: &Quote) -> Result<(), TdxError> {
    quote
        .verify()
        .map(|_| ())
        .map_err(|e| TdxError::Verification(e.to_string()))
}

/// Mock quotes carry no certificate chain, they are checked against the
/// mock provisioning key instead
#[cfg(feature = "mock")]
fn verify_signature(quote: &Quote) -> Result<(), TdxError> {
    let (_, pck_key) = mock_keys().map_err(|e| TdxError::Verification(e.to_string()))?;
    quote
        .verify_with_pck(pck_key.verifying_key())
        .map_err(|e| TdxError::Verification(e.to_string()))
}

/// Attestation and provisioning certification keys of mock quotes
#[cfg(feature = "mock")]
fn mock_keys() -> std::io::Result<(tdx_quote::SigningKey, tdx_quote::SigningKey)> {
    use tdx_quote::SigningKey;

    let attestation_key =
        SigningKey::from_slice(&[1; 32]).map_err(|e| std::io::Error::other(e.to_string()))?;
    let pck_key =
        SigningKey::from_slice(&[2; 32]).map_err(|e| std::io::Error::other(e.to_string()))?;
    Ok((attestation_key, pck_key))
}

#[cfg(feature = "mock")]
fn get_quote(report_data: [u8; 64]) -> std::io::Result<Vec<u8>> {
    let (attestation_key, pck_key) = mock_keys()?;
    Ok(Quote::mock(attestation_key, pck_key, report_data, vec![]).as_bytes())
}

/// Request a quote from the TDX module through the kernel's configfs-tsm
/// interface.
#[cfg(not(feature = "mock"))]
fn get_quote(report_data: [u8; 64]) -> std::io::Result<Vec<u8>> {
    use std::path::Path;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Where the kernel exposes TDX quote generation
    const TSM_REPORT_DIR: &str = "/sys/kernel/config/tsm/report";

    static REPORT_ID: AtomicU64 = AtomicU64::new(0);
    let id = REPORT_ID.fetch_add(1, Ordering::Relaxed);
    let entry = Path::new(TSM_REPORT_DIR).join(format!("keysync-{}-{id}", std::process::id()));
    std::fs::create_dir(&entry)?;
    let quote = read_report(&entry, report_data);
    if let Err(e) = std::fs::remove_dir(&entry) {
        tracing::warn!("Could not remove report entry {}: {e}", entry.display());
    }
    quote
}

#[cfg(not(feature = "mock"))]
fn read_report(entry: &std::path::Path, report_data: [u8; 64]) -> std::io::Result<Vec<u8>> {
    std::fs::write(entry.join("inblob"), report_data)?;
    std::fs::read(entry.join("outblob"))
}
