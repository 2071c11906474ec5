//! Client data binding checks
//!
//! The browser serialises `CollectedClientData` as JSON; the authenticator
//! signs its SHA-256 hash. This module parses that JSON and checks it was
//! produced for the expected ceremony, challenge and origin.

use crate::crypto;
use crate::error::{Error, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use log::debug;
use serde::{Deserialize, Serialize};
use url::Url;

/// Ceremony recorded in the client data `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientDataType {
    Create,
    Get,
}

impl ClientDataType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "webauthn.create",
            Self::Get => "webauthn.get",
        }
    }
}

/// How the client data origin is compared with the configured origin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginPolicy {
    /// Exact string equality
    #[default]
    Strict,
    /// Same scheme and port; host equal to or a subdomain of the expected host
    Relaxed,
}

#[derive(Debug, Deserialize)]
struct RawClientData {
    #[serde(rename = "type")]
    type_: String,
    challenge: String,
    origin: String,
    #[serde(rename = "crossOrigin", default)]
    cross_origin: Option<bool>,
    #[serde(rename = "topOrigin", default)]
    top_origin: Option<String>,
}

/// Parsed client data together with the bytes it was parsed from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedClientData {
    pub type_: String,
    pub challenge: String,
    pub origin: String,
    pub cross_origin: bool,
    pub top_origin: Option<String>,
    raw: Vec<u8>,
}

impl CollectedClientData {
    /// Parse client data JSON
    ///
    /// # Errors
    ///
    /// Returns `Error::Format` if the bytes are not a JSON object carrying
    /// string `type`, `challenge` and `origin` members.
    pub fn parse(json: &[u8]) -> Result<Self> {
        let raw: RawClientData = serde_json::from_slice(json)?;
        Ok(Self {
            type_: raw.type_,
            challenge: raw.challenge,
            origin: raw.origin,
            cross_origin: raw.cross_origin.unwrap_or(false),
            top_origin: raw.top_origin,
            raw: json.to_vec(),
        })
    }

    /// SHA-256 of the exact client data bytes
    #[must_use]
    pub fn hash(&self) -> [u8; 32] {
        crypto::sha256(&self.raw)
    }

    /// The bytes this client data was parsed from
    #[must_use]
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Check the client data was produced for this ceremony
    ///
    /// # Arguments
    /// * `expected_challenge` - The challenge bytes issued to the client
    /// * `expected_origin` - The relying party origin
    /// * `expected_type` - The ceremony being verified
    /// * `policy` - How origins are compared
    /// * `allow_cross_origin` - Whether `crossOrigin: true` is acceptable
    ///
    /// # Errors
    ///
    /// Returns `Error::TypeMismatch`, `Error::ChallengeMismatch` or
    /// `Error::OriginMismatch` for the first binding that fails.
    pub fn check(
        &self,
        expected_challenge: &[u8],
        expected_origin: &str,
        expected_type: ClientDataType,
        policy: OriginPolicy,
        allow_cross_origin: bool,
    ) -> Result<()> {
        if self.type_ != expected_type.as_str() {
            return Err(Error::TypeMismatch(format!(
                "expected '{}', got '{}'",
                expected_type.as_str(),
                self.type_
            )));
        }

        let challenge = URL_SAFE_NO_PAD
            .decode(self.challenge.trim_end_matches('='))
            .map_err(|_| {
                Error::ChallengeMismatch("client data challenge is not base64url".to_string())
            })?;
        if challenge != expected_challenge {
            return Err(Error::ChallengeMismatch(
                "client data challenge differs from the issued challenge".to_string(),
            ));
        }

        if !origin_matches(&self.origin, expected_origin, policy) {
            return Err(Error::OriginMismatch(format!(
                "origin '{}' is not acceptable for '{expected_origin}'",
                self.origin
            )));
        }

        if self.cross_origin && !allow_cross_origin {
            return Err(Error::OriginMismatch(
                "cross-origin ceremonies are not allowed".to_string(),
            ));
        }

        debug!("✓ Client data bound to {} at {}", expected_type.as_str(), self.origin);
        Ok(())
    }
}

/// Compare a client origin with the expected one under `policy`
#[must_use]
pub fn origin_matches(origin: &str, expected: &str, policy: OriginPolicy) -> bool {
    match policy {
        OriginPolicy::Strict => origin == expected,
        OriginPolicy::Relaxed => {
            let (Ok(actual), Ok(expected)) = (Url::parse(origin), Url::parse(expected)) else {
                return false;
            };
            let (Some(actual_host), Some(expected_host)) = (actual.host_str(), expected.host_str())
            else {
                return false;
            };
            actual.scheme() == expected.scheme()
                && actual.port_or_known_default() == expected.port_or_known_default()
                && (actual_host == expected_host
                    || actual_host.ends_with(&format!(".{expected_host}")))
        }
    }
}
