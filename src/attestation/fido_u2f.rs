//! `fido-u2f` attestation
//!
//! Legacy U2F authenticators sign a fixed registration message with a
//! single P-256 attestation certificate.

use super::{
    chain_attestation_type, credential, statement_x5c, AttestationContext, AttestationFormat,
    VerifiedAttestation,
};
use crate::authenticator_data::AuthenticatorData;
use crate::cbor;
use crate::certificate;
use crate::cose::{CoseAlgorithm, EcCurve, PublicKey};
use crate::crypto;
use crate::error::{Error, Result};
use ciborium::value::Value;
use log::debug;

/// Verify a `fido-u2f` attestation statement
///
/// # Errors
///
/// - `Error::Format` if `sig` or `x5c` are missing
/// - `Error::Attestation` if the chain is not exactly one P-256 certificate or
///   the credential key is not a P-256 key
/// - `Error::SignatureInvalid` if the registration signature does not verify
/// - chain validation errors from [`crate::certificate::validate`]
pub fn verify(
    stmt: &Value,
    auth_data: &AuthenticatorData,
    client_data_hash: &[u8; 32],
    ctx: &AttestationContext<'_>,
) -> Result<VerifiedAttestation> {
    let sig = cbor::required_bytes(stmt, "sig")?;
    let x5c = statement_x5c(stmt)?
        .ok_or_else(|| Error::Format("fido-u2f attestation requires x5c".to_string()))?;
    if x5c.len() != 1 {
        return Err(Error::Attestation(format!(
            "fido-u2f expects exactly one certificate, got {}",
            x5c.len()
        )));
    }

    let leaf = certificate::parse(&x5c[0])?;
    let leaf_key = certificate::public_key(&leaf)?;
    if !matches!(leaf_key, PublicKey::Ec2 { curve: EcCurve::P256, .. }) {
        return Err(Error::Attestation(
            "fido-u2f certificate key must be P-256".to_string(),
        ));
    }

    let attested = credential(auth_data)?;
    let PublicKey::Ec2 {
        curve: EcCurve::P256,
        x,
        y,
    } = &attested.public_key.key
    else {
        return Err(Error::Attestation(
            "fido-u2f credential key must be P-256".to_string(),
        ));
    };

    let mut message = Vec::with_capacity(1 + 32 + 32 + attested.credential_id.len() + 65);
    message.push(0x00);
    message.extend_from_slice(&auth_data.rp_id_hash);
    message.extend_from_slice(client_data_hash);
    message.extend_from_slice(&attested.credential_id);
    message.push(0x04);
    message.extend_from_slice(x);
    message.extend_from_slice(y);
    crypto::verify_signature(CoseAlgorithm::Es256, &leaf_key, &message, sig)?;
    debug!("✓ U2F registration signature verified");

    let outcome = ctx.validate_chain(AttestationFormat::FidoU2f, &x5c)?;
    Ok(VerifiedAttestation {
        attestation_type: chain_attestation_type(&outcome),
        trust_path: x5c,
    })
}
