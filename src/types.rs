//! Browser-facing JSON shapes
//!
//! Every byte field travels as base64url without padding, as produced by
//! `PublicKeyCredential.toJSON()` in browsers.

use crate::error::{Error, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

/// The only credential type WebAuthn defines
pub const PUBLIC_KEY_TYPE: &str = "public-key";

/// Registration options sent to the client
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RegistrationOptions {
    pub challenge: String, // Base64URL-encoded random challenge
    pub rp: RelyingPartyEntity,
    pub user: UserEntity,
    #[serde(rename = "pubKeyCredParams")]
    pub public_key_params: Vec<PublicKeyCredentialParameters>,
    pub timeout: u32,        // Timeout in milliseconds
    pub attestation: String, // "none", "indirect", "direct"
    #[serde(rename = "excludeCredentials", default)]
    pub exclude_credentials: Vec<PublicKeyCredentialDescriptor>,
    #[serde(rename = "authenticatorSelection")]
    pub authenticator_selection: AuthenticatorSelectionCriteria,
}

/// Authentication options sent to the client
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AuthenticationOptions {
    pub challenge: String, // Base64URL-encoded random challenge
    pub timeout: u32,      // Timeout in milliseconds
    #[serde(rename = "rpId")]
    pub rp_id: String,
    #[serde(rename = "allowCredentials")]
    pub allow_credentials: Vec<PublicKeyCredentialDescriptor>,
    #[serde(rename = "userVerification")]
    pub user_verification: String, // "required", "preferred", "discouraged"
}

/// Relying party information
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RelyingPartyEntity {
    pub id: String,   // Domain name (e.g., "example.com")
    pub name: String, // Display name
}

/// User entity
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UserEntity {
    pub id: String, // Base64URL-encoded user handle
    pub name: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
}

/// Public key credential parameters
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PublicKeyCredentialParameters {
    #[serde(rename = "type")]
    pub r#type: String, // Always "public-key"
    pub alg: i64,       // COSE algorithm identifier
}

/// Authenticator selection criteria
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AuthenticatorSelectionCriteria {
    #[serde(rename = "authenticatorAttachment", skip_serializing_if = "Option::is_none")]
    pub authenticator_attachment: Option<String>, // "platform", "cross-platform"
    #[serde(rename = "residentKey")]
    pub resident_key: String,
    #[serde(rename = "userVerification")]
    pub user_verification: String,
}

/// Public key credential descriptor
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PublicKeyCredentialDescriptor {
    #[serde(rename = "type")]
    pub r#type: String, // Always "public-key"
    pub id: String,     // Base64URL-encoded credential ID
}

/// Registration response from the client
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RegistrationResponse {
    pub id: String, // Base64URL-encoded credential ID
    #[serde(rename = "rawId")]
    pub raw_id: String,
    pub response: AuthenticatorAttestationResponse,
    #[serde(rename = "clientExtensionResults", default)]
    pub client_extension_results: Option<serde_json::Value>,
    #[serde(rename = "type")]
    pub r#type: String,
}

/// Authentication response from the client
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AuthenticationResponse {
    pub id: String,
    #[serde(rename = "rawId")]
    pub raw_id: String,
    pub response: AuthenticatorAssertionResponse,
    #[serde(rename = "clientExtensionResults", default)]
    pub client_extension_results: Option<serde_json::Value>,
    #[serde(rename = "type")]
    pub r#type: String,
}

/// Authenticator attestation response during registration
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AuthenticatorAttestationResponse {
    #[serde(rename = "clientDataJSON")]
    pub client_data_json: String,
    #[serde(rename = "attestationObject")]
    pub attestation_object: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transports: Vec<String>,
}

/// Authenticator assertion response during authentication
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AuthenticatorAssertionResponse {
    #[serde(rename = "clientDataJSON")]
    pub client_data_json: String,
    #[serde(rename = "authenticatorData")]
    pub authenticator_data: String,
    pub signature: String,
    #[serde(rename = "userHandle", default)]
    pub user_handle: Option<String>,
}

/// Byte fields of a registration response
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedRegistration {
    pub raw_id: Vec<u8>,
    pub client_data_json: Vec<u8>,
    pub attestation_object: Vec<u8>,
}

/// Byte fields of an authentication response
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedAssertion {
    pub raw_id: Vec<u8>,
    pub client_data_json: Vec<u8>,
    pub authenticator_data: Vec<u8>,
    pub signature: Vec<u8>,
    pub user_handle: Option<Vec<u8>>,
}

impl RegistrationResponse {
    /// Decode the base64url fields after checking the credential envelope
    ///
    /// # Errors
    ///
    /// Returns `Error::Format` if a field is not base64url, `id` differs from
    /// `rawId` or `type` is not `public-key`.
    pub fn decode(&self) -> Result<DecodedRegistration> {
        let raw_id = check_credential(&self.id, &self.raw_id, &self.r#type)?;
        Ok(DecodedRegistration {
            raw_id,
            client_data_json: decode_field(&self.response.client_data_json, "clientDataJSON")?,
            attestation_object: decode_field(
                &self.response.attestation_object,
                "attestationObject",
            )?,
        })
    }
}

impl AuthenticationResponse {
    /// Decode the base64url fields after checking the credential envelope
    ///
    /// # Errors
    ///
    /// Returns `Error::Format` if a field is not base64url, `id` differs from
    /// `rawId` or `type` is not `public-key`.
    pub fn decode(&self) -> Result<DecodedAssertion> {
        let raw_id = check_credential(&self.id, &self.raw_id, &self.r#type)?;
        Ok(DecodedAssertion {
            raw_id,
            client_data_json: decode_field(&self.response.client_data_json, "clientDataJSON")?,
            authenticator_data: decode_field(
                &self.response.authenticator_data,
                "authenticatorData",
            )?,
            signature: decode_field(&self.response.signature, "signature")?,
            user_handle: self
                .response
                .user_handle
                .as_deref()
                .filter(|handle| !handle.is_empty())
                .map(|handle| decode_field(handle, "userHandle"))
                .transpose()?,
        })
    }
}

fn check_credential(id: &str, raw_id: &str, credential_type: &str) -> Result<Vec<u8>> {
    if credential_type != PUBLIC_KEY_TYPE {
        return Err(Error::Format(format!(
            "credential type '{credential_type}' is not '{PUBLIC_KEY_TYPE}'"
        )));
    }
    let raw = decode_field(raw_id, "rawId")?;
    if URL_SAFE_NO_PAD.encode(&raw) != id.trim_end_matches('=') {
        return Err(Error::Format(
            "credential id does not match rawId".to_string(),
        ));
    }
    Ok(raw)
}

fn decode_field(value: &str, name: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|e| Error::Format(format!("'{name}' is not base64url: {e}")))
}

/// Encode bytes the way every transported field is encoded
#[must_use]
pub fn encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn registration_json(id: &str, credential_type: &str) -> String {
        format!(
            r#"{{
                "id": "{id}",
                "rawId": "bR-PgWS9SeyZjnNv_Wcnyw",
                "type": "{credential_type}",
                "response": {{
                    "clientDataJSON": "eyJ0eXBlIjoid2ViYXV0aG4uY3JlYXRlIn0",
                    "attestationObject": "oA"
                }},
                "clientExtensionResults": {{}}
            }}"#
        )
    }

    #[test]
    fn test_registration_decode() {
        let response: RegistrationResponse =
            serde_json::from_str(&registration_json("bR-PgWS9SeyZjnNv_Wcnyw", "public-key"))
                .unwrap();
        let decoded = response.decode().unwrap();

        assert_eq!(decoded.raw_id.len(), 16);
        assert_eq!(decoded.client_data_json, br#"{"type":"webauthn.create"}"#);
        assert_eq!(decoded.attestation_object, vec![0xa0]);
    }

    #[test]
    fn test_id_must_match_raw_id() {
        let response: RegistrationResponse =
            serde_json::from_str(&registration_json("AAAA", "public-key")).unwrap();
        assert_eq!(response.decode().unwrap_err().kind(), ErrorKind::Format);
    }

    #[test]
    fn test_type_must_be_public_key() {
        let response: RegistrationResponse =
            serde_json::from_str(&registration_json("bR-PgWS9SeyZjnNv_Wcnyw", "password"))
                .unwrap();
        assert_eq!(response.decode().unwrap_err().kind(), ErrorKind::Format);
    }

    #[test]
    fn test_assertion_decode_with_empty_user_handle() {
        let json = r#"{
            "id": "AQID",
            "rawId": "AQID",
            "type": "public-key",
            "response": {
                "clientDataJSON": "e30",
                "authenticatorData": "AAAA",
                "signature": "MEQ",
                "userHandle": ""
            }
        }"#;
        let response: AuthenticationResponse = serde_json::from_str(json).unwrap();
        let decoded = response.decode().unwrap();

        assert_eq!(decoded.raw_id, vec![1, 2, 3]);
        assert_eq!(decoded.client_data_json, b"{}");
        assert_eq!(decoded.authenticator_data, vec![0, 0, 0]);
        assert_eq!(decoded.user_handle, None);
    }

    #[test]
    fn test_invalid_base64() {
        let json = r#"{
            "id": "AQID",
            "rawId": "AQID",
            "type": "public-key",
            "response": {
                "clientDataJSON": "e30",
                "authenticatorData": "***",
                "signature": "MEQ"
            }
        }"#;
        let response: AuthenticationResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.decode().unwrap_err().kind(), ErrorKind::Format);
    }
}
