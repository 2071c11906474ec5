//! Attestation statement verification
//!
//! Each attestation format is a variant of [`AttestationFormat`] with its own
//! verifier function. Dispatch is on the `fmt` string of the attestation
//! object; unknown formats are rejected.

pub mod android_key;
pub mod android_safetynet;
pub mod fido_u2f;
pub mod none;
pub mod packed;
pub mod tpm;

use crate::authenticator_data::{AttestedCredentialData, AuthenticatorData};
use crate::cbor;
use crate::certificate::{ChainOutcome, TrustStore};
use crate::cose::CoseAlgorithm;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use ciborium::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Supported attestation statement formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttestationFormat {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "packed")]
    Packed,
    #[serde(rename = "android-key")]
    AndroidKey,
    #[serde(rename = "android-safetynet")]
    AndroidSafetynet,
    #[serde(rename = "fido-u2f")]
    FidoU2f,
    #[serde(rename = "tpm")]
    Tpm,
}

impl AttestationFormat {
    pub const ALL: [Self; 6] = [
        Self::None,
        Self::Packed,
        Self::AndroidKey,
        Self::AndroidSafetynet,
        Self::FidoU2f,
        Self::Tpm,
    ];

    /// Parse the `fmt` identifier of an attestation object
    ///
    /// # Errors
    ///
    /// Returns `Error::Attestation` for unrecognised formats.
    pub fn from_fmt(fmt: &str) -> Result<Self> {
        match fmt {
            "none" => Ok(Self::None),
            "packed" => Ok(Self::Packed),
            "android-key" => Ok(Self::AndroidKey),
            "android-safetynet" => Ok(Self::AndroidSafetynet),
            "fido-u2f" => Ok(Self::FidoU2f),
            "tpm" => Ok(Self::Tpm),
            other => Err(Error::Attestation(format!(
                "unsupported attestation format '{other}'"
            ))),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Packed => "packed",
            Self::AndroidKey => "android-key",
            Self::AndroidSafetynet => "android-safetynet",
            Self::FidoU2f => "fido-u2f",
            Self::Tpm => "tpm",
        }
    }
}

impl fmt::Display for AttestationFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provenance established by an attestation statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttestationType {
    /// No attestation was provided
    None,
    /// Signed by the credential key itself
    #[serde(rename = "self")]
    Self_,
    /// Leaf certificate issued directly by a trust root
    Basic,
    /// Chain through one or more intermediate CAs
    AttCa,
    /// Per-credential certificate from an anonymization CA
    AnonCa,
}

/// What to do when an android-key chain does not reach a configured root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AndroidKeyRootPolicy {
    /// Fail with `UntrustedRoot`
    #[default]
    Reject,
    /// Downgrade to self attestation, keeping the chain for audit
    AcceptAsSelf,
}

/// Format-specific attestation knobs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationPolicy {
    pub android_key_root_policy: AndroidKeyRootPolicy,
    /// Require purpose and origin in the TEE-enforced list
    pub android_key_require_tee: bool,
    /// Oldest acceptable SafetyNet `timestampMs`
    pub safetynet_max_age: Duration,
}

impl Default for AttestationPolicy {
    fn default() -> Self {
        Self {
            android_key_root_policy: AndroidKeyRootPolicy::Reject,
            android_key_require_tee: false,
            safetynet_max_age: Duration::from_secs(60),
        }
    }
}

/// Trust roots per attestation format plus the tolerated clock skew
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustAnchors {
    stores: HashMap<AttestationFormat, TrustStore>,
    clock_skew: Duration,
}

impl TrustAnchors {
    #[must_use]
    pub fn new(clock_skew: Duration) -> Self {
        Self {
            stores: HashMap::new(),
            clock_skew,
        }
    }

    /// Add a DER trust root for `format`
    pub fn add_root(&mut self, format: AttestationFormat, der: Vec<u8>) {
        self.stores.entry(format).or_default().roots.push(der);
    }

    /// Add a pre-fetched DER intermediate for `format`
    pub fn add_intermediate(&mut self, format: AttestationFormat, der: Vec<u8>) {
        self.stores.entry(format).or_default().intermediates.push(der);
    }

    /// Builder-style [`TrustAnchors::add_root`]
    #[must_use]
    pub fn with_root(mut self, format: AttestationFormat, der: Vec<u8>) -> Self {
        self.add_root(format, der);
        self
    }

    /// The trust store for `format`, empty when nothing is configured
    #[must_use]
    pub fn store(&self, format: AttestationFormat) -> TrustStore {
        self.stores.get(&format).cloned().unwrap_or_default()
    }

    /// DER roots configured for `format`
    #[must_use]
    pub fn roots(&self, format: AttestationFormat) -> &[Vec<u8>] {
        self.stores
            .get(&format)
            .map_or(&[][..], |store| store.roots.as_slice())
    }

    /// Whether no format has any root configured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stores.values().all(|store| store.roots.is_empty())
    }

    #[must_use]
    pub fn clock_skew(&self) -> Duration {
        self.clock_skew
    }
}

/// Inputs shared by every format verifier
#[derive(Debug, Clone, Copy)]
pub struct AttestationContext<'a> {
    pub anchors: &'a TrustAnchors,
    pub policy: &'a AttestationPolicy,
    pub now: DateTime<Utc>,
}

impl AttestationContext<'_> {
    /// Validate `chain` against the roots configured for `format`
    ///
    /// # Errors
    ///
    /// Propagates the errors of [`crate::certificate::validate`].
    pub fn validate_chain(
        &self,
        format: AttestationFormat,
        chain: &[Vec<u8>],
    ) -> Result<ChainOutcome> {
        crate::certificate::validate(
            chain,
            &self.anchors.store(format),
            self.now,
            self.anchors.clock_skew(),
        )
    }
}

/// Outcome of a successful attestation statement check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedAttestation {
    pub attestation_type: AttestationType,
    /// Certificates backing the attestation, leaf first
    pub trust_path: Vec<Vec<u8>>,
}

/// Verify an attestation statement
///
/// # Arguments
/// * `format` - The attestation format from the `fmt` field
/// * `stmt` - The `attStmt` map
/// * `auth_data` - The parsed authenticator data
/// * `client_data_hash` - SHA-256 of the client data JSON
/// * `ctx` - Trust anchors, policy and verification time
///
/// # Errors
///
/// Returns the format verifier's error; every failure is terminal.
pub fn verify(
    format: AttestationFormat,
    stmt: &Value,
    auth_data: &AuthenticatorData,
    client_data_hash: &[u8; 32],
    ctx: &AttestationContext<'_>,
) -> Result<VerifiedAttestation> {
    if stmt.as_map().is_none() {
        return Err(Error::Format("attStmt must be a CBOR map".to_string()));
    }
    log::debug!("🔍 Verifying {format} attestation statement");
    match format {
        AttestationFormat::None => none::verify(stmt),
        AttestationFormat::Packed => packed::verify(stmt, auth_data, client_data_hash, ctx),
        AttestationFormat::AndroidKey => {
            android_key::verify(stmt, auth_data, client_data_hash, ctx)
        }
        AttestationFormat::AndroidSafetynet => {
            android_safetynet::verify(stmt, auth_data, client_data_hash, ctx)
        }
        AttestationFormat::FidoU2f => fido_u2f::verify(stmt, auth_data, client_data_hash, ctx),
        AttestationFormat::Tpm => tpm::verify(stmt, auth_data, client_data_hash, ctx),
    }
}

/// Attestation type implied by a validated chain
#[must_use]
pub fn chain_attestation_type(outcome: &ChainOutcome) -> AttestationType {
    if outcome.intermediates == 0 {
        AttestationType::Basic
    } else {
        AttestationType::AttCa
    }
}

pub(crate) fn credential(auth_data: &AuthenticatorData) -> Result<&AttestedCredentialData> {
    auth_data
        .attested_credential_data
        .as_ref()
        .ok_or_else(|| Error::Format("Authenticator data has no attested credential".to_string()))
}

pub(crate) fn statement_alg(stmt: &Value) -> Result<CoseAlgorithm> {
    let id = cbor::map_get_text(stmt, "alg")
        .and_then(cbor::as_i64)
        .ok_or_else(|| Error::Format("attStmt is missing integer 'alg'".to_string()))?;
    CoseAlgorithm::from_id(id)
}

/// The `x5c` array, `None` when absent
pub(crate) fn statement_x5c(stmt: &Value) -> Result<Option<Vec<Vec<u8>>>> {
    let Some(value) = cbor::map_get_text(stmt, "x5c") else {
        return Ok(None);
    };
    let certs = value
        .as_array()
        .ok_or_else(|| Error::Format("x5c must be an array".to_string()))?
        .iter()
        .map(|cert| {
            cert.as_bytes()
                .cloned()
                .ok_or_else(|| Error::Format("x5c entries must be byte strings".to_string()))
        })
        .collect::<Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(Error::Format("x5c must not be empty".to_string()));
    }
    Ok(Some(certs))
}

pub(crate) fn signed_data(auth_data: &AuthenticatorData, client_data_hash: &[u8; 32]) -> Vec<u8> {
    let mut data = Vec::with_capacity(auth_data.raw.len() + client_data_hash.len());
    data.extend_from_slice(&auth_data.raw);
    data.extend_from_slice(client_data_hash);
    data
}
