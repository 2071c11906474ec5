//! `android-safetynet` attestation
//!
//! The statement wraps a SafetyNet compact JWS. The JWS header carries the
//! signing chain; the payload nonce binds it to this registration.

use super::{
    signed_data, AttestationContext, AttestationFormat, AttestationType, VerifiedAttestation,
};
use crate::authenticator_data::AuthenticatorData;
use crate::cbor;
use crate::certificate;
use crate::crypto;
use crate::error::{Error, Result};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use ciborium::value::Value;
use log::debug;
use serde::Deserialize;

/// Hostname the SafetyNet signing certificate is issued to
pub const SAFETYNET_HOSTNAME: &str = "attest.android.com";

#[derive(Debug, Deserialize)]
struct JwsHeader {
    alg: String,
    #[serde(default)]
    x5c: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SafetyNetPayload {
    nonce: String,
    timestamp_ms: i64,
    #[serde(default)]
    cts_profile_match: bool,
}

/// A compact JWS split into its parts
struct CompactJws<'a> {
    signing_input: &'a str,
    header: JwsHeader,
    payload: SafetyNetPayload,
    signature: Vec<u8>,
}

impl<'a> CompactJws<'a> {
    fn parse(response: &'a str) -> Result<Self> {
        let mut parts = response.split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::Format(
                "SafetyNet response is not a compact JWS".to_string(),
            ));
        };
        let signing_input = &response[..header.len() + 1 + payload.len()];

        Ok(Self {
            signing_input,
            header: serde_json::from_slice(&URL_SAFE_NO_PAD.decode(header)?)?,
            payload: serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload)?)?,
            signature: URL_SAFE_NO_PAD.decode(signature)?,
        })
    }
}

/// Verify an `android-safetynet` attestation statement
///
/// # Errors
///
/// - `Error::Format` if the statement or JWS is malformed
/// - `Error::SignatureInvalid` if the JWS signature does not verify
/// - `Error::Attestation` if the nonce, CTS profile, hostname or timestamp
///   requirements fail
/// - chain validation errors from [`crate::certificate::validate`]
pub fn verify(
    stmt: &Value,
    auth_data: &AuthenticatorData,
    client_data_hash: &[u8; 32],
    ctx: &AttestationContext<'_>,
) -> Result<VerifiedAttestation> {
    if cbor::required_text(stmt, "ver")?.is_empty() {
        return Err(Error::Attestation(
            "SafetyNet 'ver' must not be empty".to_string(),
        ));
    }
    let response = std::str::from_utf8(cbor::required_bytes(stmt, "response")?)
        .map_err(|_| Error::Format("SafetyNet response is not UTF-8".to_string()))?;
    let jws = CompactJws::parse(response)?;

    let chain = jws
        .header
        .x5c
        .iter()
        .map(|cert| STANDARD.decode(cert))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let Some(leaf_der) = chain.first() else {
        return Err(Error::Format("SafetyNet JWS header has no x5c".to_string()));
    };
    let leaf = certificate::parse(leaf_der)?;
    crypto::verify_jws_signature(
        &jws.header.alg,
        &certificate::public_key(&leaf)?,
        jws.signing_input.as_bytes(),
        &jws.signature,
    )?;

    let expected_nonce =
        STANDARD.encode(crypto::sha256(&signed_data(auth_data, client_data_hash)));
    if jws.payload.nonce != expected_nonce {
        return Err(Error::Attestation(
            "SafetyNet nonce does not match the registration".to_string(),
        ));
    }
    if !jws.payload.cts_profile_match {
        return Err(Error::Attestation(
            "SafetyNet ctsProfileMatch is false".to_string(),
        ));
    }
    if certificate::common_name(&leaf) != Some(SAFETYNET_HOSTNAME) {
        return Err(Error::Attestation(format!(
            "SafetyNet certificate is not issued to {SAFETYNET_HOSTNAME}"
        )));
    }
    check_timestamp(jws.payload.timestamp_ms, ctx)?;
    debug!("✓ SafetyNet response accepted");

    ctx.validate_chain(AttestationFormat::AndroidSafetynet, &chain)?;
    Ok(VerifiedAttestation {
        attestation_type: AttestationType::Basic,
        trust_path: chain,
    })
}

fn check_timestamp(timestamp_ms: i64, ctx: &AttestationContext<'_>) -> Result<()> {
    let millis = |d: std::time::Duration| i64::try_from(d.as_millis()).unwrap_or(i64::MAX);
    let now = ctx.now.timestamp_millis();

    if timestamp_ms > now.saturating_add(millis(ctx.anchors.clock_skew())) {
        return Err(Error::Attestation(
            "SafetyNet timestamp is in the future".to_string(),
        ));
    }
    if timestamp_ms < now.saturating_sub(millis(ctx.policy.safetynet_max_age)) {
        return Err(Error::Attestation(
            "SafetyNet response is too old".to_string(),
        ));
    }
    Ok(())
}
