//! Registration and assertion orchestration
//!
//! [`Verifier`] runs the full check sequence for both ceremonies over raw
//! bytes. [`RelyingParty`] layers challenge issue and credential storage on
//! top through the collaborator traits in [`crate::store`].

use crate::attestation::{
    self, AttestationContext, AttestationFormat, AttestationPolicy, AttestationType,
    TrustAnchors,
};
use crate::authenticator_data::{AuthenticatorData, Flags};
use crate::cbor;
use crate::client_data::{ClientDataType, CollectedClientData, OriginPolicy};
use crate::cose::{CoseAlgorithm, CoseKey};
use crate::crypto;
use crate::error::{Error, Result};
use crate::settings::VerifierSettings;
use crate::store::{Ceremony, ChallengeStore, CredentialStore, StoredCredential};
use crate::types::{
    self, AuthenticationOptions, AuthenticationResponse, AuthenticatorSelectionCriteria,
    PublicKeyCredentialDescriptor, PublicKeyCredentialParameters, RegistrationOptions,
    RegistrationResponse, RelyingPartyEntity, UserEntity, PUBLIC_KEY_TYPE,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;
use uuid::Uuid;

/// Longest credential ID WebAuthn allows
pub const MAX_CREDENTIAL_ID_LEN: usize = 1023;

/// Algorithms offered to authenticators, most preferred first
const OFFERED_ALGORITHMS: [CoseAlgorithm; 6] = [
    CoseAlgorithm::Es256,
    CoseAlgorithm::EdDsa,
    CoseAlgorithm::Es384,
    CoseAlgorithm::Es512,
    CoseAlgorithm::Ps256,
    CoseAlgorithm::Rs256,
];

/// Relying party identity and client data policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelyingPartyConfig {
    pub id: String,
    pub name: String,
    pub origin: String,
    pub origin_policy: OriginPolicy,
    pub allow_cross_origin: bool,
    pub require_user_verification: bool,
    /// Ceremony timeout advertised to clients
    pub timeout: Duration,
}

impl RelyingPartyConfig {
    /// Strict-origin configuration for `id` served from `origin`
    #[must_use]
    pub fn new(id: &str, origin: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            origin: origin.to_string(),
            origin_policy: OriginPolicy::Strict,
            allow_cross_origin: false,
            require_user_verification: false,
            timeout: Duration::from_secs(300),
        }
    }
}

/// Signature counter handling for authenticators that keep no counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterPolicy {
    /// The received counter must exceed the stored one
    #[default]
    Strict,
    /// A stored and received counter of zero is accepted as "no counter"
    AllowCounterless,
}

/// Everything a [`Verifier`] needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifierConfig {
    pub relying_party: RelyingPartyConfig,
    pub anchors: TrustAnchors,
    pub policy: AttestationPolicy,
    pub counter_policy: CounterPolicy,
}

impl VerifierConfig {
    /// Configuration with no trust roots and default attestation policy
    #[must_use]
    pub fn new(relying_party: RelyingPartyConfig) -> Self {
        Self {
            relying_party,
            anchors: TrustAnchors::default(),
            policy: AttestationPolicy::default(),
            counter_policy: CounterPolicy::default(),
        }
    }

    /// Build the configuration from loaded settings, reading trust roots
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the relying party ID is empty, the
    /// origin is not a URL, or a trust root cannot be loaded.
    pub fn from_settings(settings: &VerifierSettings) -> Result<Self> {
        let rp = &settings.relying_party;
        let attestation = &settings.attestation;

        let mut anchors = TrustAnchors::new(Duration::from_secs(attestation.clock_skew_seconds));
        for entry in &settings.trust_roots {
            for der in entry.load_der()? {
                if entry.intermediate {
                    anchors.add_intermediate(entry.format, der);
                } else {
                    anchors.add_root(entry.format, der);
                }
            }
        }
        info!(
            "✓ Loaded {} trust anchor entries for relying party {}",
            settings.trust_roots.len(),
            rp.id
        );

        let config = Self {
            relying_party: RelyingPartyConfig {
                id: rp.id.clone(),
                name: rp.name.clone(),
                origin: rp.origin.clone(),
                origin_policy: rp.origin_policy,
                allow_cross_origin: rp.allow_cross_origin,
                require_user_verification: rp.require_user_verification,
                timeout: Duration::from_secs(rp.timeout_seconds),
            },
            anchors,
            policy: AttestationPolicy {
                android_key_root_policy: attestation.android_key_root_policy,
                android_key_require_tee: attestation.android_key_require_tee,
                safetynet_max_age: Duration::from_secs(attestation.safetynet_max_age_seconds),
            },
            counter_policy: rp.counter_policy,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.relying_party.id.trim().is_empty() {
            return Err(Error::Configuration(
                "relying party ID must not be empty".to_string(),
            ));
        }
        Url::parse(&self.relying_party.origin).map_err(|e| {
            Error::Configuration(format!(
                "relying party origin '{}' is not a URL: {e}",
                self.relying_party.origin
            ))
        })?;
        Ok(())
    }
}

/// Outcome of a successful registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationResult {
    pub credential_id: Vec<u8>,
    /// Typed key plus the raw COSE bytes to store
    pub public_key: CoseKey,
    pub attestation_format: AttestationFormat,
    pub attestation_type: AttestationType,
    /// Attestation certificates, leaf first
    pub trust_path: Vec<Vec<u8>>,
    pub aaguid: [u8; 16],
    pub sign_count: u32,
    pub flags: Flags,
}

impl RegistrationResult {
    /// The record a credential store keeps for this registration
    #[must_use]
    pub fn to_stored_credential(&self, user_handle: &str, now: DateTime<Utc>) -> StoredCredential {
        StoredCredential {
            credential_id: self.credential_id.clone(),
            user_handle: user_handle.to_string(),
            public_key: self.public_key.clone(),
            sign_count: self.sign_count,
            attestation_type: self.attestation_type,
            aaguid: self.aaguid,
            backup_eligible: self.flags.backup_eligible(),
            created_at: now,
            last_used: None,
        }
    }
}

/// Outcome of a successful assertion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssertionResult {
    pub new_counter: u32,
    pub user_present: bool,
    pub user_verified: bool,
    pub backup_eligible: bool,
    pub backup_state: bool,
}

/// Stateless WebAuthn verifier for one relying party
#[derive(Debug, Clone)]
pub struct Verifier {
    config: VerifierConfig,
    rp_id_hash: [u8; 32],
}

impl Verifier {
    /// Create a verifier
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the relying party ID is empty or the
    /// origin is not a URL.
    pub fn new(config: VerifierConfig) -> Result<Self> {
        config.validate()?;
        let rp_id_hash = crypto::sha256(config.relying_party.id.as_bytes());
        Ok(Self { config, rp_id_hash })
    }

    #[must_use]
    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Verify a registration ceremony at the current time
    ///
    /// # Arguments
    /// * `attestation_object` - CBOR attestation object from the authenticator
    /// * `client_data_json` - Exact client data bytes
    /// * `expected_challenge` - The challenge issued for this ceremony
    ///
    /// # Errors
    ///
    /// Returns the first failed check; see [`Verifier::verify_registration_at`].
    pub fn verify_registration(
        &self,
        attestation_object: &[u8],
        client_data_json: &[u8],
        expected_challenge: &[u8],
    ) -> Result<RegistrationResult> {
        self.verify_registration_at(
            attestation_object,
            client_data_json,
            expected_challenge,
            Utc::now(),
        )
    }

    /// Verify a registration ceremony with certificates checked at `now`
    ///
    /// Order: client data binding, attestation object decoding, RP ID hash,
    /// user presence and verification, attested credential data, then the
    /// attestation statement.
    ///
    /// # Errors
    ///
    /// Returns the error of the first check that fails. No partial result is
    /// ever produced.
    pub fn verify_registration_at(
        &self,
        attestation_object: &[u8],
        client_data_json: &[u8],
        expected_challenge: &[u8],
        now: DateTime<Utc>,
    ) -> Result<RegistrationResult> {
        let client_data = self.check_client_data(
            client_data_json,
            expected_challenge,
            ClientDataType::Create,
        )?;

        let object = cbor::decode(attestation_object)?;
        if object.as_map().is_none() {
            return Err(Error::Format(
                "attestation object must be a CBOR map".to_string(),
            ));
        }
        let fmt = cbor::required_text(&object, "fmt")?;
        let stmt = cbor::map_get_text(&object, "attStmt")
            .ok_or_else(|| Error::Format("attestation object is missing 'attStmt'".to_string()))?;
        let auth_data = AuthenticatorData::parse(cbor::required_bytes(&object, "authData")?)?;

        self.check_authenticator_data(&auth_data)?;
        let attested = auth_data.attested_credential_data.as_ref().ok_or_else(|| {
            Error::Format("registration lacks attested credential data".to_string())
        })?;
        if attested.credential_id.len() > MAX_CREDENTIAL_ID_LEN {
            return Err(Error::Format(format!(
                "credential ID is {} bytes, limit is {MAX_CREDENTIAL_ID_LEN}",
                attested.credential_id.len()
            )));
        }

        let format = AttestationFormat::from_fmt(fmt)?;
        let ctx = AttestationContext {
            anchors: &self.config.anchors,
            policy: &self.config.policy,
            now,
        };
        let verified = attestation::verify(format, stmt, &auth_data, &client_data.hash(), &ctx)?;
        info!(
            "✅ Registration verified for {} ({format}, {:?}, AAGUID {})",
            self.config.relying_party.id,
            verified.attestation_type,
            Uuid::from_bytes(attested.aaguid)
        );

        Ok(RegistrationResult {
            credential_id: attested.credential_id.clone(),
            public_key: attested.public_key.clone(),
            attestation_format: format,
            attestation_type: verified.attestation_type,
            trust_path: verified.trust_path,
            aaguid: attested.aaguid,
            sign_count: auth_data.sign_count,
            flags: auth_data.flags,
        })
    }

    /// Verify an assertion against a stored credential
    ///
    /// # Arguments
    /// * `authenticator_data` - Raw authenticator data
    /// * `client_data_json` - Exact client data bytes
    /// * `signature` - Assertion signature
    /// * `expected_challenge` - The challenge issued for this ceremony
    /// * `stored_public_key` - The credential key saved at registration
    /// * `stored_counter` - The last accepted signature counter
    ///
    /// # Errors
    ///
    /// Returns the error of the first check that fails, including
    /// `Error::CounterRegression` when the counter did not advance.
    pub fn verify_assertion(
        &self,
        authenticator_data: &[u8],
        client_data_json: &[u8],
        signature: &[u8],
        expected_challenge: &[u8],
        stored_public_key: &CoseKey,
        stored_counter: u32,
    ) -> Result<AssertionResult> {
        let client_data =
            self.check_client_data(client_data_json, expected_challenge, ClientDataType::Get)?;
        let auth_data = AuthenticatorData::parse(authenticator_data)?;
        self.check_authenticator_data(&auth_data)?;

        let client_data_hash = client_data.hash();
        let mut message = Vec::with_capacity(auth_data.raw.len() + client_data_hash.len());
        message.extend_from_slice(&auth_data.raw);
        message.extend_from_slice(&client_data_hash);
        crypto::verify_signature(
            stored_public_key.algorithm,
            &stored_public_key.key,
            &message,
            signature,
        )?;

        let received = auth_data.sign_count;
        check_counter(stored_counter, received, self.config.counter_policy)?;
        debug!("✓ Assertion verified, counter {stored_counter} -> {received}");

        Ok(AssertionResult {
            new_counter: received,
            user_present: auth_data.flags.user_present(),
            user_verified: auth_data.flags.user_verified(),
            backup_eligible: auth_data.flags.backup_eligible(),
            backup_state: auth_data.flags.backup_state(),
        })
    }

    /// Verify a browser registration response
    ///
    /// # Errors
    ///
    /// Returns `Error::Format` if the envelope is malformed or `rawId`
    /// differs from the attested credential ID, otherwise the errors of
    /// [`Verifier::verify_registration`].
    pub fn verify_registration_response(
        &self,
        response: &RegistrationResponse,
        expected_challenge: &[u8],
    ) -> Result<RegistrationResult> {
        let decoded = response.decode()?;
        let result = self.verify_registration(
            &decoded.attestation_object,
            &decoded.client_data_json,
            expected_challenge,
        )?;
        if result.credential_id != decoded.raw_id {
            return Err(Error::Format(
                "rawId differs from the attested credential ID".to_string(),
            ));
        }
        Ok(result)
    }

    /// Verify a browser authentication response against a stored credential
    ///
    /// # Errors
    ///
    /// Returns `Error::Format` if the envelope is malformed or names another
    /// credential, otherwise the errors of [`Verifier::verify_assertion`].
    pub fn verify_assertion_response(
        &self,
        response: &AuthenticationResponse,
        expected_challenge: &[u8],
        credential: &StoredCredential,
    ) -> Result<AssertionResult> {
        let decoded = response.decode()?;
        if decoded.raw_id != credential.credential_id {
            return Err(Error::Format(
                "response is for a different credential".to_string(),
            ));
        }
        if let Some(user_handle) = &decoded.user_handle {
            if types::encode(user_handle) != credential.user_handle {
                return Err(Error::Format(
                    "userHandle does not match the credential owner".to_string(),
                ));
            }
        }
        self.verify_assertion(
            &decoded.authenticator_data,
            &decoded.client_data_json,
            &decoded.signature,
            expected_challenge,
            &credential.public_key,
            credential.sign_count,
        )
    }

    fn check_client_data(
        &self,
        client_data_json: &[u8],
        expected_challenge: &[u8],
        expected_type: ClientDataType,
    ) -> Result<CollectedClientData> {
        let rp = &self.config.relying_party;
        let client_data = CollectedClientData::parse(client_data_json)?;
        client_data.check(
            expected_challenge,
            &rp.origin,
            expected_type,
            rp.origin_policy,
            rp.allow_cross_origin,
        )?;
        Ok(client_data)
    }

    fn check_authenticator_data(&self, auth_data: &AuthenticatorData) -> Result<()> {
        if auth_data.rp_id_hash != self.rp_id_hash {
            warn!("⚠️ RP ID hash mismatch for {}", self.config.relying_party.id);
            return Err(Error::RpIdMismatch(format!(
                "authenticator data was not produced for '{}'",
                self.config.relying_party.id
            )));
        }
        if !auth_data.flags.user_present() {
            return Err(Error::UserPresence(
                "user presence flag is not set".to_string(),
            ));
        }
        if self.config.relying_party.require_user_verification && !auth_data.flags.user_verified()
        {
            return Err(Error::UserVerification(
                "user verification is required".to_string(),
            ));
        }
        if auth_data.flags.backup_state() && !auth_data.flags.backup_eligible() {
            return Err(Error::Format(
                "backup state set on a credential that is not backup eligible".to_string(),
            ));
        }
        Ok(())
    }
}

/// Signature counter rule: the received value must exceed the stored one.
/// Under [`CounterPolicy::AllowCounterless`] both being zero also passes.
///
/// # Errors
///
/// Returns `Error::CounterRegression` when the counter did not advance.
pub fn check_counter(stored: u32, received: u32, policy: CounterPolicy) -> Result<()> {
    let counterless = stored == 0 && received == 0;
    if received > stored || (counterless && policy == CounterPolicy::AllowCounterless) {
        Ok(())
    } else {
        warn!("⚠️ Signature counter regression: stored {stored}, received {received}");
        Err(Error::CounterRegression { stored, received })
    }
}

/// A relying party wired to credential and challenge storage
pub struct RelyingParty<C, S> {
    verifier: Verifier,
    credentials: C,
    challenges: S,
}

impl<C: CredentialStore, S: ChallengeStore> RelyingParty<C, S> {
    /// Create a relying party; roots listed by the credential store are added
    /// to the configured trust anchors
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the configuration is invalid.
    pub fn new(mut config: VerifierConfig, credentials: C, challenges: S) -> Result<Self> {
        for format in AttestationFormat::ALL {
            for root in credentials.list_trust_roots(format) {
                config.anchors.add_root(format, root);
            }
        }
        Ok(Self {
            verifier: Verifier::new(config)?,
            credentials,
            challenges,
        })
    }

    #[must_use]
    pub fn verifier(&self) -> &Verifier {
        &self.verifier
    }

    #[must_use]
    pub fn credentials(&self) -> &C {
        &self.credentials
    }

    /// Create registration options for a new credential
    ///
    /// # Arguments
    /// * `user_handle` - Base64URL-encoded user handle
    /// * `user_name` - User name (e.g., email)
    /// * `display_name` - User display name
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if a challenge cannot be generated.
    pub fn start_registration(
        &self,
        user_handle: &str,
        user_name: &str,
        display_name: &str,
    ) -> Result<RegistrationOptions> {
        let rp = &self.verifier.config.relying_party;
        let challenge = self
            .challenges
            .issue_challenge(Ceremony::Registration, user_handle)?;
        let attestation = if self.verifier.config.anchors.is_empty() {
            "none"
        } else {
            "direct"
        };

        Ok(RegistrationOptions {
            challenge: types::encode(&challenge),
            rp: RelyingPartyEntity {
                id: rp.id.clone(),
                name: rp.name.clone(),
            },
            user: UserEntity {
                id: user_handle.to_string(),
                name: user_name.to_string(),
                display_name: display_name.to_string(),
            },
            public_key_params: OFFERED_ALGORITHMS
                .iter()
                .map(|alg| PublicKeyCredentialParameters {
                    r#type: PUBLIC_KEY_TYPE.to_string(),
                    alg: alg.id(),
                })
                .collect(),
            timeout: timeout_millis(rp.timeout),
            attestation: attestation.to_string(),
            exclude_credentials: Vec::new(),
            authenticator_selection: AuthenticatorSelectionCriteria {
                authenticator_attachment: None,
                resident_key: "preferred".to_string(),
                user_verification: user_verification(rp).to_string(),
            },
        })
    }

    /// Complete registration and store the credential
    ///
    /// The challenge echoed in the client data is consumed first, so a
    /// response can complete at most one registration.
    ///
    /// # Errors
    ///
    /// Returns `Error::ChallengeMismatch`/`Error::ChallengeExpired` for
    /// unknown or stale challenges, verification errors, or the store's error
    /// if the credential cannot be saved.
    pub fn finish_registration(&self, response: &RegistrationResponse) -> Result<StoredCredential> {
        let decoded = response.decode()?;
        let challenge = echoed_challenge(&decoded.client_data_json)?;
        let user_handle = self
            .challenges
            .consume_challenge(Ceremony::Registration, &challenge)?;

        let result = self.verifier.verify_registration_response(response, &challenge)?;
        let credential = result.to_stored_credential(&user_handle, Utc::now());
        self.credentials.save_credential(credential.clone())?;
        info!("✅ Stored new credential for user {user_handle}");
        Ok(credential)
    }

    /// Create authentication options
    ///
    /// # Arguments
    /// * `user_handle` - The user expected to authenticate, if known
    /// * `allow_credentials` - Credential IDs the client may use
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if a challenge cannot be generated.
    pub fn start_authentication(
        &self,
        user_handle: Option<&str>,
        allow_credentials: &[Vec<u8>],
    ) -> Result<AuthenticationOptions> {
        let rp = &self.verifier.config.relying_party;
        let challenge = self
            .challenges
            .issue_challenge(Ceremony::Authentication, user_handle.unwrap_or_default())?;

        Ok(AuthenticationOptions {
            challenge: types::encode(&challenge),
            timeout: timeout_millis(rp.timeout),
            rp_id: rp.id.clone(),
            allow_credentials: allow_credentials
                .iter()
                .map(|id| PublicKeyCredentialDescriptor {
                    r#type: PUBLIC_KEY_TYPE.to_string(),
                    id: types::encode(id),
                })
                .collect(),
            user_verification: user_verification(rp).to_string(),
        })
    }

    /// Complete authentication and advance the stored counter
    ///
    /// # Errors
    ///
    /// Returns `Error::Format` for unknown credentials,
    /// `Error::ChallengeMismatch` when the challenge was issued for another
    /// user, verification errors, or `Error::CounterRegression` if a
    /// concurrent assertion advanced the counter first.
    pub fn finish_authentication(
        &self,
        response: &AuthenticationResponse,
    ) -> Result<(StoredCredential, AssertionResult)> {
        let decoded = response.decode()?;
        let credential = self
            .credentials
            .lookup_credential(&decoded.raw_id)
            .ok_or_else(|| Error::Format("credential is not registered".to_string()))?;

        let challenge = echoed_challenge(&decoded.client_data_json)?;
        let expected_user = self
            .challenges
            .consume_challenge(Ceremony::Authentication, &challenge)?;
        if !expected_user.is_empty() && expected_user != credential.user_handle {
            return Err(Error::ChallengeMismatch(
                "challenge was issued for a different user".to_string(),
            ));
        }

        let result = self
            .verifier
            .verify_assertion_response(response, &challenge, &credential)?;
        self.credentials.update_counter(
            &credential.credential_id,
            credential.sign_count,
            result.new_counter,
        )?;
        info!("✅ Authenticated user {}", credential.user_handle);
        Ok((credential, result))
    }
}

fn echoed_challenge(client_data_json: &[u8]) -> Result<Vec<u8>> {
    let client_data = CollectedClientData::parse(client_data_json)?;
    URL_SAFE_NO_PAD
        .decode(client_data.challenge.trim_end_matches('='))
        .map_err(|_| Error::ChallengeMismatch("client data challenge is not base64url".to_string()))
}

fn timeout_millis(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

fn user_verification(rp: &RelyingPartyConfig) -> &'static str {
    if rp.require_user_verification {
        "required"
    } else {
        "preferred"
    }
}
