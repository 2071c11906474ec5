//! `packed` attestation
//!
//! Either self attestation, signed by the credential key, or a certificate
//! chain in `x5c` whose leaf signed `authData || clientDataHash`.

use super::{
    chain_attestation_type, credential, signed_data, statement_alg, statement_x5c,
    AttestationContext, AttestationFormat, AttestationType, VerifiedAttestation,
};
use crate::authenticator_data::AuthenticatorData;
use crate::cbor;
use crate::certificate;
use crate::crypto;
use crate::error::{Error, Result};
use ciborium::value::Value;
use log::debug;

const ATTESTATION_OU: &str = "Authenticator Attestation";

/// Verify a `packed` attestation statement
///
/// # Errors
///
/// - `Error::UnsupportedAlgorithm` for ECDAA statements or unknown algorithms
/// - `Error::SignatureInvalid` if `sig` does not verify
/// - `Error::Attestation` if the self-attestation algorithm disagrees with the
///   credential key, or the leaf certificate fails the packed requirements
/// - chain validation errors from [`crate::certificate::validate`]
pub fn verify(
    stmt: &Value,
    auth_data: &AuthenticatorData,
    client_data_hash: &[u8; 32],
    ctx: &AttestationContext<'_>,
) -> Result<VerifiedAttestation> {
    if cbor::map_get_text(stmt, "ecdaaKeyId").is_some() {
        return Err(Error::UnsupportedAlgorithm(
            "ECDAA attestation is not supported".to_string(),
        ));
    }

    let alg = statement_alg(stmt)?;
    let sig = cbor::required_bytes(stmt, "sig")?;
    let attested = credential(auth_data)?;
    let message = signed_data(auth_data, client_data_hash);

    let Some(x5c) = statement_x5c(stmt)? else {
        if alg != attested.public_key.algorithm {
            return Err(Error::Attestation(format!(
                "self attestation uses {alg} but the credential key is {}",
                attested.public_key.algorithm
            )));
        }
        crypto::verify_signature(alg, &attested.public_key.key, &message, sig)?;
        debug!("✓ Packed self attestation verified");
        return Ok(VerifiedAttestation {
            attestation_type: AttestationType::Self_,
            trust_path: Vec::new(),
        });
    };

    let leaf = certificate::parse(&x5c[0])?;
    crypto::verify_signature(alg, &certificate::public_key(&leaf)?, &message, sig)?;

    if !certificate::is_v3(&leaf) {
        return Err(Error::Attestation(
            "packed attestation certificate must be X.509 v3".to_string(),
        ));
    }
    if certificate::is_ca(&leaf) {
        return Err(Error::UsageViolation(
            "packed attestation certificate must not be a CA".to_string(),
        ));
    }
    let has_attestation_ou = leaf
        .subject()
        .iter_organizational_unit()
        .any(|ou| ou.as_str().ok() == Some(ATTESTATION_OU));
    if !has_attestation_ou {
        return Err(Error::Attestation(format!(
            "packed attestation certificate subject OU must be '{ATTESTATION_OU}'"
        )));
    }
    if let Some(aaguid) = certificate::aaguid_extension(&leaf)? {
        if aaguid != attested.aaguid {
            return Err(Error::Attestation(
                "certificate AAGUID does not match the authenticator data".to_string(),
            ));
        }
    }

    let outcome = ctx.validate_chain(AttestationFormat::Packed, &x5c)?;
    debug!("✓ Packed attestation chain verified");
    Ok(VerifiedAttestation {
        attestation_type: chain_attestation_type(&outcome),
        trust_path: x5c,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::test_support::{
        auth_data, int, p256_public, p256_signing_key, sign_der, text,
    };
    use crate::attestation::{AttestationPolicy, TrustAnchors};
    use crate::error::ErrorKind;
    use chrono::Utc;

    fn verify_with_defaults(
        stmt: &Value,
        auth_data: &AuthenticatorData,
        hash: &[u8; 32],
    ) -> Result<VerifiedAttestation> {
        let anchors = TrustAnchors::default();
        let policy = AttestationPolicy::default();
        let ctx = AttestationContext {
            anchors: &anchors,
            policy: &policy,
            now: Utc::now(),
        };
        verify(stmt, auth_data, hash, &ctx)
    }

    #[test]
    fn test_self_attestation() {
        let key = p256_signing_key(3);
        let data = auth_data(&p256_public(&key), [0; 16]);
        let hash = [0x42; 32];
        let sig = sign_der(&key, &signed_data(&data, &hash));
        let stmt = Value::Map(vec![(text("alg"), int(-7)), (text("sig"), Value::Bytes(sig))]);

        let result = verify_with_defaults(&stmt, &data, &hash).unwrap();
        assert_eq!(result.attestation_type, AttestationType::Self_);
        assert!(result.trust_path.is_empty());
    }

    #[test]
    fn test_self_attestation_wrong_signer() {
        let key = p256_signing_key(3);
        let other = p256_signing_key(4);
        let data = auth_data(&p256_public(&key), [0; 16]);
        let hash = [0x42; 32];
        let sig = sign_der(&other, &signed_data(&data, &hash));
        let stmt = Value::Map(vec![(text("alg"), int(-7)), (text("sig"), Value::Bytes(sig))]);

        let err = verify_with_defaults(&stmt, &data, &hash).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SignatureInvalid);
    }

    #[test]
    fn test_self_attestation_alg_mismatch() {
        let key = p256_signing_key(3);
        let data = auth_data(&p256_public(&key), [0; 16]);
        let hash = [0x42; 32];
        let sig = sign_der(&key, &signed_data(&data, &hash));
        let stmt = Value::Map(vec![(text("alg"), int(-257)), (text("sig"), Value::Bytes(sig))]);

        let err = verify_with_defaults(&stmt, &data, &hash).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Attestation);
    }

    #[test]
    fn test_ecdaa_unsupported() {
        let key = p256_signing_key(3);
        let data = auth_data(&p256_public(&key), [0; 16]);
        let stmt = Value::Map(vec![
            (text("alg"), int(-7)),
            (text("sig"), Value::Bytes(vec![0; 8])),
            (text("ecdaaKeyId"), Value::Bytes(vec![1; 32])),
        ]);

        let err = verify_with_defaults(&stmt, &data, &[0; 32]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedAlgorithm);
    }

    #[test]
    fn test_missing_sig() {
        let key = p256_signing_key(3);
        let data = auth_data(&p256_public(&key), [0; 16]);
        let stmt = Value::Map(vec![(text("alg"), int(-7))]);

        let err = verify_with_defaults(&stmt, &data, &[0; 32]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }
}
