//! `android-key` attestation
//!
//! The leaf certificate is the credential key itself, certified by the
//! Android keystore. Its key attestation extension records the challenge the
//! key was generated for and the authorisation lists the keystore enforces.

use super::{
    chain_attestation_type, credential, signed_data, statement_alg, statement_x5c,
    AndroidKeyRootPolicy, AttestationContext, AttestationFormat, AttestationType,
    VerifiedAttestation,
};
use crate::authenticator_data::AuthenticatorData;
use crate::cbor;
use crate::certificate;
use crate::crypto;
use crate::error::{Error, Result};
use ciborium::value::Value;
use log::{debug, warn};
use x509_parser::der_parser::ber::{BerObject, Class};
use x509_parser::der_parser::der::parse_der;

/// Android key attestation extension
pub const OID_ANDROID_KEY_ATTESTATION: &str = "1.3.6.1.4.1.11129.2.1.17";

const TAG_PURPOSE: u32 = 1;
const TAG_ALL_APPLICATIONS: u32 = 600;
const TAG_ORIGIN: u32 = 702;

const KM_PURPOSE_SIGN: u64 = 2;
const KM_ORIGIN_GENERATED: u64 = 0;

/// Subset of a keymaster `AuthorizationList`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizationList {
    pub purpose: Vec<u64>,
    pub all_applications: bool,
    pub origin: Option<u64>,
}

/// Fields of the `KeyDescription` extension that attestation relies on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDescription {
    pub attestation_challenge: Vec<u8>,
    pub software_enforced: AuthorizationList,
    pub tee_enforced: AuthorizationList,
}

impl KeyDescription {
    /// Parse the DER `KeyDescription` sequence
    ///
    /// # Errors
    ///
    /// Returns `Error::Attestation` if the structure is not a key description.
    pub fn parse(der: &[u8]) -> Result<Self> {
        let (_, obj) = parse_der(der).map_err(|e| malformed(&e))?;
        let fields = obj.as_sequence().map_err(|e| malformed(&e))?;
        if fields.len() < 8 {
            return Err(Error::Attestation(format!(
                "KeyDescription has {} fields, expected 8",
                fields.len()
            )));
        }
        Ok(Self {
            attestation_challenge: fields[4].as_slice().map_err(|e| malformed(&e))?.to_vec(),
            software_enforced: parse_authorization_list(&fields[6])?,
            tee_enforced: parse_authorization_list(&fields[7])?,
        })
    }
}

fn malformed(err: &dyn std::fmt::Display) -> Error {
    Error::Attestation(format!("Malformed key attestation extension: {err}"))
}

fn parse_authorization_list(obj: &BerObject<'_>) -> Result<AuthorizationList> {
    let mut list = AuthorizationList::default();
    for entry in obj.as_sequence().map_err(|e| malformed(&e))? {
        if entry.class() != Class::ContextSpecific {
            continue;
        }
        match entry.tag().0 {
            TAG_PURPOSE => {
                let (_, set) = parse_der(entry.as_slice().map_err(|e| malformed(&e))?)
                    .map_err(|e| malformed(&e))?;
                for purpose in set.as_set().map_err(|e| malformed(&e))? {
                    list.purpose.push(purpose.as_u64().map_err(|e| malformed(&e))?);
                }
            }
            TAG_ALL_APPLICATIONS => list.all_applications = true,
            TAG_ORIGIN => {
                let (_, origin) = parse_der(entry.as_slice().map_err(|e| malformed(&e))?)
                    .map_err(|e| malformed(&e))?;
                list.origin = Some(origin.as_u64().map_err(|e| malformed(&e))?);
            }
            _ => {}
        }
    }
    Ok(list)
}

/// Verify an `android-key` attestation statement
///
/// # Errors
///
/// - `Error::Format` if `alg`, `sig` or `x5c` are missing
/// - `Error::SignatureInvalid` if `sig` does not verify with the leaf key
/// - `Error::Attestation` if the leaf key differs from the credential key or
///   the key description does not satisfy the attestation requirements
/// - `Error::UntrustedRoot` under [`AndroidKeyRootPolicy::Reject`] when the
///   chain does not reach a configured root
/// - other chain validation errors
pub fn verify(
    stmt: &Value,
    auth_data: &AuthenticatorData,
    client_data_hash: &[u8; 32],
    ctx: &AttestationContext<'_>,
) -> Result<VerifiedAttestation> {
    let alg = statement_alg(stmt)?;
    let sig = cbor::required_bytes(stmt, "sig")?;
    let x5c = statement_x5c(stmt)?
        .ok_or_else(|| Error::Format("android-key attestation requires x5c".to_string()))?;
    let attested = credential(auth_data)?;

    let leaf = certificate::parse(&x5c[0])?;
    let leaf_key = certificate::public_key(&leaf)?;
    crypto::verify_signature(
        alg,
        &leaf_key,
        &signed_data(auth_data, client_data_hash),
        sig,
    )?;

    if leaf_key != attested.public_key.key {
        return Err(Error::Attestation(
            "attestation certificate key differs from the credential key".to_string(),
        ));
    }

    let extension = certificate::extension_value(&leaf, OID_ANDROID_KEY_ATTESTATION)
        .ok_or_else(|| {
            Error::Attestation("certificate lacks the key attestation extension".to_string())
        })?;
    let description = KeyDescription::parse(extension)?;
    check_key_description(
        &description,
        client_data_hash,
        ctx.policy.android_key_require_tee,
    )?;
    debug!("✓ Android key description accepted");

    match ctx.validate_chain(AttestationFormat::AndroidKey, &x5c) {
        Ok(outcome) => Ok(VerifiedAttestation {
            attestation_type: chain_attestation_type(&outcome),
            trust_path: x5c,
        }),
        Err(Error::UntrustedRoot(detail))
            if ctx.policy.android_key_root_policy == AndroidKeyRootPolicy::AcceptAsSelf =>
        {
            warn!("⚠️ android-key chain untrusted ({detail}); accepting as self attestation");
            Ok(VerifiedAttestation {
                attestation_type: AttestationType::Self_,
                trust_path: x5c,
            })
        }
        Err(e) => Err(e),
    }
}

/// Check the key description against the client data hash and origin rules
///
/// # Errors
///
/// Returns `Error::Attestation` naming the first requirement that fails.
pub fn check_key_description(
    description: &KeyDescription,
    client_data_hash: &[u8; 32],
    require_tee: bool,
) -> Result<()> {
    if description.attestation_challenge != client_data_hash {
        return Err(Error::Attestation(
            "attestationChallenge does not match the client data hash".to_string(),
        ));
    }

    let software = &description.software_enforced;
    let tee = &description.tee_enforced;
    if software.all_applications || tee.all_applications {
        return Err(Error::Attestation(
            "key is scoped to all applications".to_string(),
        ));
    }

    let (origin, can_sign) = if require_tee {
        (tee.origin, tee.purpose.contains(&KM_PURPOSE_SIGN))
    } else {
        (
            tee.origin.or(software.origin),
            tee.purpose.contains(&KM_PURPOSE_SIGN) || software.purpose.contains(&KM_PURPOSE_SIGN),
        )
    };
    if origin != Some(KM_ORIGIN_GENERATED) {
        return Err(Error::Attestation(
            "key was not generated inside the keystore".to_string(),
        ));
    }
    if !can_sign {
        return Err(Error::Attestation(
            "key purpose does not include signing".to_string(),
        ));
    }
    Ok(())
}
