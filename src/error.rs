//! Verification error types
//!
//! Every failure carries a machine-readable [`ErrorKind`] and a human-readable
//! detail. All errors are terminal for the verification call that produced them.

use serde::Serialize;
use std::fmt;

/// Errors that can occur while verifying a registration or an authentication
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Malformed binary, CBOR, JSON or base64 input
    #[error("Format error: {0}")]
    Format(String),

    /// Client data challenge differs from the issued challenge
    #[error("Challenge mismatch: {0}")]
    ChallengeMismatch(String),

    /// Challenge was issued but is no longer valid
    #[error("Challenge expired: {0}")]
    ChallengeExpired(String),

    /// Client data origin is not acceptable for this relying party
    #[error("Origin mismatch: {0}")]
    OriginMismatch(String),

    /// Client data type is not the one expected for the ceremony
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    /// Authenticator data was not produced for this relying party ID
    #[error("RP ID mismatch: {0}")]
    RpIdMismatch(String),

    /// User presence flag is not set
    #[error("User presence missing: {0}")]
    UserPresence(String),

    /// User verification was required but not performed
    #[error("User verification missing: {0}")]
    UserVerification(String),

    /// Attestation statement failed a format-specific check
    #[error("Attestation error: {0}")]
    Attestation(String),

    /// Signature counter did not advance
    #[error("Signature counter regression: stored {stored}, received {received}")]
    CounterRegression { stored: u32, received: u32 },

    /// Algorithm, key type or curve outside the supported set
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Certificate chain does not end in a configured trust root
    #[error("Untrusted root: {0}")]
    UntrustedRoot(String),

    /// A certificate is outside its validity window
    #[error("Certificate expired: {0}")]
    Expired(String),

    /// A signature did not verify
    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    /// A certificate is used in a role its constraints forbid
    #[error("Certificate usage violation: {0}")]
    UsageViolation(String),

    /// Invalid settings or trust-root material
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Machine-readable classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Format,
    ChallengeMismatch,
    ChallengeExpired,
    OriginMismatch,
    TypeMismatch,
    RpIdMismatch,
    UserPresence,
    UserVerification,
    Attestation,
    CounterRegression,
    UnsupportedAlgorithm,
    UntrustedRoot,
    Expired,
    SignatureInvalid,
    UsageViolation,
    Configuration,
}

impl Error {
    /// The machine-readable kind of this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Format(_) => ErrorKind::Format,
            Self::ChallengeMismatch(_) => ErrorKind::ChallengeMismatch,
            Self::ChallengeExpired(_) => ErrorKind::ChallengeExpired,
            Self::OriginMismatch(_) => ErrorKind::OriginMismatch,
            Self::TypeMismatch(_) => ErrorKind::TypeMismatch,
            Self::RpIdMismatch(_) => ErrorKind::RpIdMismatch,
            Self::UserPresence(_) => ErrorKind::UserPresence,
            Self::UserVerification(_) => ErrorKind::UserVerification,
            Self::Attestation(_) => ErrorKind::Attestation,
            Self::CounterRegression { .. } => ErrorKind::CounterRegression,
            Self::UnsupportedAlgorithm(_) => ErrorKind::UnsupportedAlgorithm,
            Self::UntrustedRoot(_) => ErrorKind::UntrustedRoot,
            Self::Expired(_) => ErrorKind::Expired,
            Self::SignatureInvalid(_) => ErrorKind::SignatureInvalid,
            Self::UsageViolation(_) => ErrorKind::UsageViolation,
            Self::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Human-readable detail without the kind prefix
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::Format(msg)
            | Self::ChallengeMismatch(msg)
            | Self::ChallengeExpired(msg)
            | Self::OriginMismatch(msg)
            | Self::TypeMismatch(msg)
            | Self::RpIdMismatch(msg)
            | Self::UserPresence(msg)
            | Self::UserVerification(msg)
            | Self::Attestation(msg)
            | Self::UnsupportedAlgorithm(msg)
            | Self::UntrustedRoot(msg)
            | Self::Expired(msg)
            | Self::SignatureInvalid(msg)
            | Self::UsageViolation(msg)
            | Self::Configuration(msg) => msg.clone(),
            Self::CounterRegression { stored, received } => {
                format!("stored {stored}, received {received}")
            }
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Format => "format",
            Self::ChallengeMismatch => "challenge_mismatch",
            Self::ChallengeExpired => "challenge_expired",
            Self::OriginMismatch => "origin_mismatch",
            Self::TypeMismatch => "type_mismatch",
            Self::RpIdMismatch => "rp_id_mismatch",
            Self::UserPresence => "user_presence",
            Self::UserVerification => "user_verification",
            Self::Attestation => "attestation",
            Self::CounterRegression => "counter_regression",
            Self::UnsupportedAlgorithm => "unsupported_algorithm",
            Self::UntrustedRoot => "untrusted_root",
            Self::Expired => "expired",
            Self::SignatureInvalid => "signature_invalid",
            Self::UsageViolation => "usage_violation",
            Self::Configuration => "configuration",
        };
        f.write_str(name)
    }
}

impl From<base64::DecodeError> for Error {
    fn from(err: base64::DecodeError) -> Self {
        Self::Format(format!("Invalid base64url encoding: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Format(format!("Invalid JSON: {err}"))
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;
