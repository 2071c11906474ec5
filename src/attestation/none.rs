//! `none` attestation: the authenticator provides no provenance

use super::{AttestationType, VerifiedAttestation};
use crate::error::{Error, Result};
use ciborium::value::Value;

/// Accept an empty statement
///
/// # Errors
///
/// Returns `Error::Attestation` if the statement carries any entries.
pub fn verify(stmt: &Value) -> Result<VerifiedAttestation> {
    match stmt.as_map() {
        Some(entries) if entries.is_empty() => Ok(VerifiedAttestation {
            attestation_type: AttestationType::None,
            trust_path: Vec::new(),
        }),
        _ => Err(Error::Attestation(
            "'none' attestation statement must be empty".to_string(),
        )),
    }
}
