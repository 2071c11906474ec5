#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! WebAuthn relying party verification
//!
//! Verifies registration (attestation) and authentication (assertion)
//! ceremonies produced by browsers and authenticators. Transport, sessions
//! and persistence belong to the caller; [`store`] defines the contracts a
//! [`RelyingParty`] needs from them.

/// Version of the passkey-verifier library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod attestation;
pub mod authenticator_data;
pub mod cbor;
pub mod certificate;
pub mod client_data;
pub mod cose;
pub mod crypto;
pub mod error;
pub mod settings;
pub mod store;
pub mod types;
pub mod verifier;

/// Re-export commonly used items
pub use attestation::{
    AndroidKeyRootPolicy, AttestationFormat, AttestationPolicy, AttestationType, TrustAnchors,
};
pub use authenticator_data::{AuthenticatorData, Flags};
pub use client_data::{ClientDataType, CollectedClientData, OriginPolicy};
pub use cose::{CoseAlgorithm, CoseKey, PublicKey};
pub use error::{Error, ErrorKind, Result};
pub use settings::VerifierSettings;
pub use store::{
    Ceremony, ChallengeStore, CredentialStore, MemoryChallengeStore, MemoryCredentialStore,
    StoredCredential,
};
pub use types::{
    AuthenticationOptions, AuthenticationResponse, RegistrationOptions, RegistrationResponse,
};
pub use verifier::{
    AssertionResult, CounterPolicy, RegistrationResult, RelyingParty, RelyingPartyConfig,
    Verifier, VerifierConfig,
};
