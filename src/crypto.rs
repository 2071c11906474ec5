//! Signature primitives
//!
//! Hashing, challenge generation and signature verification for every
//! supported COSE algorithm. ECDSA signatures are ASN.1 DER as produced by
//! authenticators; JWS signatures use the fixed-width form.

use crate::cose::{CoseAlgorithm, EcCurve, PublicKey};
use crate::error::{Error, Result};
use p256::ecdsa::signature::Verifier;
use ring::rand::SecureRandom;
use sha2::{Digest, Sha256, Sha384, Sha512};

/// Byte length of generated challenges
pub const CHALLENGE_LEN: usize = 32;

/// Hash data using SHA-256
#[must_use]
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Hash the concatenation of `parts` with SHA-256
#[must_use]
pub fn sha256_concat(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Digest algorithms referenced by attestation structures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    /// The digest paired with a COSE signature algorithm
    #[must_use]
    pub fn for_algorithm(algorithm: CoseAlgorithm) -> Self {
        match algorithm {
            CoseAlgorithm::Es256 | CoseAlgorithm::Rs256 | CoseAlgorithm::Ps256 => Self::Sha256,
            CoseAlgorithm::Es384 | CoseAlgorithm::Rs384 | CoseAlgorithm::Ps384 => Self::Sha384,
            CoseAlgorithm::Es512
            | CoseAlgorithm::Rs512
            | CoseAlgorithm::Ps512
            | CoseAlgorithm::EdDsa => Self::Sha512,
        }
    }

    /// Hash `data`
    #[must_use]
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha384 => Sha384::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

/// Generate a secure random challenge
///
/// # Errors
///
/// Returns `Error::Configuration` if the system random source fails.
pub fn generate_challenge() -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; CHALLENGE_LEN];
    ring::rand::SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| Error::Configuration("System random source unavailable".to_string()))?;
    Ok(bytes)
}

/// Verify a signature made with a credential or attestation key
///
/// # Arguments
/// * `algorithm` - The COSE algorithm the signer declared
/// * `key` - The signer's public key
/// * `message` - The signed bytes
/// * `signature` - The signature, DER-encoded for ECDSA
///
/// # Errors
///
/// Returns `Error::SignatureInvalid` if the signature does not verify,
/// `Error::UnsupportedAlgorithm` if the key cannot be used with the algorithm.
pub fn verify_signature(
    algorithm: CoseAlgorithm,
    key: &PublicKey,
    message: &[u8],
    signature: &[u8],
) -> Result<()> {
    let verified = match (algorithm, key) {
        (CoseAlgorithm::Es256, PublicKey::Ec2 { curve: EcCurve::P256, .. }) => {
            let vk = p256::ecdsa::VerifyingKey::from_sec1_bytes(&sec1(key)?)
                .map_err(|e| Error::Format(format!("Invalid P-256 key: {e}")))?;
            let sig = p256::ecdsa::Signature::from_der(signature)
                .map_err(|e| Error::SignatureInvalid(format!("Malformed ECDSA signature: {e}")))?;
            vk.verify(message, &sig).is_ok()
        }
        (CoseAlgorithm::Es384, PublicKey::Ec2 { curve: EcCurve::P384, .. }) => {
            let vk = p384::ecdsa::VerifyingKey::from_sec1_bytes(&sec1(key)?)
                .map_err(|e| Error::Format(format!("Invalid P-384 key: {e}")))?;
            let sig = p384::ecdsa::Signature::from_der(signature)
                .map_err(|e| Error::SignatureInvalid(format!("Malformed ECDSA signature: {e}")))?;
            vk.verify(message, &sig).is_ok()
        }
        (CoseAlgorithm::Es512, PublicKey::Ec2 { curve: EcCurve::P521, .. }) => {
            let vk = p521::ecdsa::VerifyingKey::from_sec1_bytes(&sec1(key)?)
                .map_err(|e| Error::Format(format!("Invalid P-521 key: {e}")))?;
            let sig = p521::ecdsa::Signature::from_der(signature)
                .map_err(|e| Error::SignatureInvalid(format!("Malformed ECDSA signature: {e}")))?;
            vk.verify(message, &sig).is_ok()
        }
        (CoseAlgorithm::EdDsa, PublicKey::Okp { x, .. }) => {
            let bytes: [u8; 32] = x
                .as_slice()
                .try_into()
                .map_err(|_| Error::Format("Ed25519 key must be 32 bytes".to_string()))?;
            let vk = ed25519_dalek::VerifyingKey::from_bytes(&bytes)
                .map_err(|e| Error::Format(format!("Invalid Ed25519 key: {e}")))?;
            let sig = ed25519_dalek::Signature::from_slice(signature)
                .map_err(|e| Error::SignatureInvalid(format!("Malformed EdDSA signature: {e}")))?;
            vk.verify_strict(message, &sig).is_ok()
        }
        (alg, PublicKey::Rsa { n, e }) if alg.is_rsa() => verify_rsa(alg, n, e, message, signature)?,
        (alg, _) => {
            return Err(Error::UnsupportedAlgorithm(format!(
                "{alg} cannot be used with this key type"
            )))
        }
    };

    if verified {
        log::debug!("🔒 {algorithm} signature verified");
        Ok(())
    } else {
        Err(Error::SignatureInvalid(format!(
            "{algorithm} signature verification failed"
        )))
    }
}

/// Verify a JWS signature, where ECDSA signatures are fixed-width `r || s`
///
/// # Errors
///
/// Returns `Error::UnsupportedAlgorithm` for JWS algorithms other than
/// RS256 and ES256, `Error::SignatureInvalid` if verification fails.
pub fn verify_jws_signature(
    jws_alg: &str,
    key: &PublicKey,
    signing_input: &[u8],
    signature: &[u8],
) -> Result<()> {
    match jws_alg {
        "RS256" => verify_signature(CoseAlgorithm::Rs256, key, signing_input, signature),
        "ES256" => {
            let sig = p256::ecdsa::Signature::from_slice(signature)
                .map_err(|e| Error::SignatureInvalid(format!("Malformed JWS signature: {e}")))?;
            verify_signature(
                CoseAlgorithm::Es256,
                key,
                signing_input,
                sig.to_der().as_bytes(),
            )
        }
        other => Err(Error::UnsupportedAlgorithm(format!(
            "JWS algorithm {other} is not supported"
        ))),
    }
}

fn sec1(key: &PublicKey) -> Result<Vec<u8>> {
    key.sec1_uncompressed()
        .ok_or_else(|| Error::Format("Expected an EC2 key".to_string()))
}

fn verify_rsa(
    algorithm: CoseAlgorithm,
    n: &[u8],
    e: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<bool> {
    use rsa::{pkcs1v15, pss, BigUint, RsaPublicKey};

    let public_key = RsaPublicKey::new(BigUint::from_bytes_be(n), BigUint::from_bytes_be(e))
        .map_err(|err| Error::Format(format!("Invalid RSA key: {err}")))?;

    let verified = match algorithm {
        CoseAlgorithm::Rs256 | CoseAlgorithm::Rs384 | CoseAlgorithm::Rs512 => {
            let sig = pkcs1v15::Signature::try_from(signature)
                .map_err(|err| Error::SignatureInvalid(format!("Malformed RSA signature: {err}")))?;
            match algorithm {
                CoseAlgorithm::Rs256 => pkcs1v15::VerifyingKey::<Sha256>::new(public_key)
                    .verify(message, &sig)
                    .is_ok(),
                CoseAlgorithm::Rs384 => pkcs1v15::VerifyingKey::<Sha384>::new(public_key)
                    .verify(message, &sig)
                    .is_ok(),
                _ => pkcs1v15::VerifyingKey::<Sha512>::new(public_key)
                    .verify(message, &sig)
                    .is_ok(),
            }
        }
        _ => {
            let sig = pss::Signature::try_from(signature)
                .map_err(|err| Error::SignatureInvalid(format!("Malformed RSA signature: {err}")))?;
            match algorithm {
                CoseAlgorithm::Ps256 => pss::VerifyingKey::<Sha256>::new(public_key)
                    .verify(message, &sig)
                    .is_ok(),
                CoseAlgorithm::Ps384 => pss::VerifyingKey::<Sha384>::new(public_key)
                    .verify(message, &sig)
                    .is_ok(),
                _ => pss::VerifyingKey::<Sha512>::new(public_key)
                    .verify(message, &sig)
                    .is_ok(),
            }
        }
    };
    Ok(verified)
}
