//! X.509 certificate chain validation
//!
//! Attestation statements carry DER certificate chains, leaf first. A chain
//! is accepted when every certificate is inside its validity window, each
//! certificate is signed by the next one, every issuer is allowed to issue
//! certificates, and the walk ends at a configured trust root.

use crate::cose::{EcCurve, OkpCurve, PublicKey};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::time::Duration;
use x509_parser::certificate::X509Certificate;
use x509_parser::error::X509Error;
use x509_parser::prelude::FromDer;
use x509_parser::x509::X509Version;

/// FIDO AAGUID certificate extension
pub const OID_FIDO_GEN_CE_AAGUID: &str = "1.3.6.1.4.1.45724.1.1.4";

const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
const OID_RSA_ENCRYPTION: &str = "1.2.840.113549.1.1.1";
const OID_ED25519: &str = "1.3.101.112";
const OID_CURVE_P256: &str = "1.2.840.10045.3.1.7";
const OID_CURVE_P384: &str = "1.3.132.0.34";
const OID_CURVE_P521: &str = "1.3.132.0.35";

/// Roots and pre-fetched intermediates for one attestation format
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustStore {
    pub roots: Vec<Vec<u8>>,
    pub intermediates: Vec<Vec<u8>>,
}

impl TrustStore {
    /// A store holding only the given roots
    #[must_use]
    pub fn with_roots(roots: Vec<Vec<u8>>) -> Self {
        Self {
            roots,
            intermediates: Vec::new(),
        }
    }
}

/// Result of a successful chain walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainOutcome {
    /// Number of CA certificates between the leaf and the trust root
    pub intermediates: usize,
    /// DER of the trust root the walk ended at
    pub root: Vec<u8>,
}

/// Parse a DER certificate, rejecting trailing data
///
/// # Errors
///
/// Returns `Error::Format` if the bytes are not exactly one certificate.
pub fn parse(der: &[u8]) -> Result<X509Certificate<'_>> {
    match X509Certificate::from_der(der) {
        Ok((rest, cert)) if rest.is_empty() => Ok(cert),
        Ok(_) => Err(Error::Format(
            "Trailing bytes after certificate".to_string(),
        )),
        Err(e) => Err(Error::Format(format!("Invalid X.509 certificate: {e}"))),
    }
}

/// Validate `chain` (leaf first) against `store` at time `at`
///
/// Links inside the supplied chain are verified even when no root matches,
/// so an `UntrustedRoot` result still implies an internally consistent chain.
///
/// # Errors
///
/// - `Error::Format` if a certificate cannot be parsed or the chain is empty
/// - `Error::Expired` if any certificate is outside its validity window
/// - `Error::SignatureInvalid` if a certificate is not signed by its successor
/// - `Error::UsageViolation` if an issuer is not a CA or may not sign certificates
/// - `Error::UntrustedRoot` if the walk does not end at a configured root
pub fn validate(
    chain: &[Vec<u8>],
    store: &TrustStore,
    at: DateTime<Utc>,
    clock_skew: Duration,
) -> Result<ChainOutcome> {
    if chain.is_empty() {
        return Err(Error::Format("Empty certificate chain".to_string()));
    }

    let certs = chain
        .iter()
        .map(|der| parse(der))
        .collect::<Result<Vec<_>>>()?;
    for cert in &certs {
        check_validity(cert, at, clock_skew)?;
    }

    let roots = store
        .roots
        .iter()
        .map(|der| parse(der).map(|cert| (der, cert)))
        .collect::<Result<Vec<_>>>()?;
    let extras = store
        .intermediates
        .iter()
        .map(|der| parse(der).map(|cert| (der, cert)))
        .collect::<Result<Vec<_>>>()?;

    let mut path: Vec<(&[u8], &X509Certificate<'_>)> = vec![(chain[0].as_slice(), &certs[0])];
    let max_steps = chain.len() + extras.len() + 1;

    for _ in 0..max_steps {
        let Some(&(current_der, current)) = path.last() else {
            break;
        };
        let depth = path.len() - 1;

        if let Some((root_der, _)) = roots.iter().find(|(der, _)| der.as_slice() == current_der) {
            debug!("✓ Certificate chain ends at a configured root");
            return Ok(ChainOutcome {
                intermediates: depth.saturating_sub(1),
                root: root_der.to_vec(),
            });
        }

        if let Some((root_der, _)) = find_issuer(current, &roots, depth, at, clock_skew)? {
            debug!("✓ Certificate chain verified by a configured root");
            return Ok(ChainOutcome {
                intermediates: depth,
                root: root_der.to_vec(),
            });
        }

        let next = if let Some(next_der) = chain.get(path.len()) {
            let next = &certs[path.len()];
            check_issuer_usage(next, depth)?;
            verify_issued(current, next)?;
            (next_der.as_slice(), next)
        } else if let Some((next_der, next)) =
            find_issuer(current, &extras, depth, at, clock_skew)?
        {
            debug!("Extending certificate chain with a configured intermediate");
            (next_der.as_slice(), next)
        } else {
            break;
        };
        path.push(next);
    }

    warn!("⚠️ Certificate chain does not end at a configured trust root");
    if store.roots.is_empty() {
        return Err(Error::UntrustedRoot(
            "No trust roots configured for this attestation format".to_string(),
        ));
    }
    Err(Error::UntrustedRoot(
        "Certificate chain does not end at a configured trust root".to_string(),
    ))
}

/// Check `at` lies within the certificate's validity window widened by `clock_skew`
///
/// # Errors
///
/// Returns `Error::Expired` when it does not.
pub fn check_validity(
    cert: &X509Certificate<'_>,
    at: DateTime<Utc>,
    clock_skew: Duration,
) -> Result<()> {
    let skew = i64::try_from(clock_skew.as_secs()).unwrap_or(i64::MAX);
    let now = at.timestamp();
    let not_before = cert.validity().not_before.timestamp();
    let not_after = cert.validity().not_after.timestamp();

    if now.saturating_add(skew) < not_before {
        return Err(Error::Expired(format!(
            "certificate '{}' is not yet valid",
            cert.subject()
        )));
    }
    if now.saturating_sub(skew) > not_after {
        return Err(Error::Expired(format!(
            "certificate '{}' expired",
            cert.subject()
        )));
    }
    Ok(())
}

/// Whether the certificate asserts basicConstraints CA=true
#[must_use]
pub fn is_ca(cert: &X509Certificate<'_>) -> bool {
    matches!(cert.basic_constraints(), Ok(Some(bc)) if bc.value.ca)
}

/// Whether the certificate is an X.509 v3 certificate
#[must_use]
pub fn is_v3(cert: &X509Certificate<'_>) -> bool {
    cert.version() == X509Version::V3
}

/// The first subject common name, if any
#[must_use]
pub fn common_name<'a>(cert: &'a X509Certificate<'_>) -> Option<&'a str> {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
}

/// Raw value of the extension with the given dotted OID
#[must_use]
pub fn extension_value<'a>(cert: &'a X509Certificate<'_>, oid: &str) -> Option<&'a [u8]> {
    cert.extensions()
        .iter()
        .find(|ext| ext.oid.to_id_string() == oid)
        .map(|ext| ext.value)
}

/// AAGUID carried in the FIDO extension, if present
///
/// # Errors
///
/// Returns `Error::Attestation` if the extension is present but malformed.
pub fn aaguid_extension(cert: &X509Certificate<'_>) -> Result<Option<[u8; 16]>> {
    let Some(ext) = cert
        .extensions()
        .iter()
        .find(|ext| ext.oid.to_id_string() == OID_FIDO_GEN_CE_AAGUID)
    else {
        return Ok(None);
    };
    if ext.critical {
        return Err(Error::Attestation(
            "AAGUID extension must not be critical".to_string(),
        ));
    }
    // OCTET STRING wrapping the 16 AAGUID bytes
    match ext.value {
        [0x04, 0x10, rest @ ..] if rest.len() == 16 => {
            let mut aaguid = [0u8; 16];
            aaguid.copy_from_slice(rest);
            Ok(Some(aaguid))
        }
        _ => Err(Error::Attestation(
            "AAGUID extension is not a 16-byte OCTET STRING".to_string(),
        )),
    }
}

/// Extract the subject public key
///
/// # Errors
///
/// Returns `Error::UnsupportedAlgorithm` for key types other than EC (P-256,
/// P-384, P-521), RSA and Ed25519, `Error::Format` for malformed keys.
pub fn public_key(cert: &X509Certificate<'_>) -> Result<PublicKey> {
    let spki = cert.public_key();
    let key_data: &[u8] = &spki.subject_public_key.data;

    match spki.algorithm.algorithm.to_id_string().as_str() {
        OID_EC_PUBLIC_KEY => {
            let curve_oid = spki
                .algorithm
                .parameters
                .as_ref()
                .and_then(|p| p.as_oid().ok())
                .map(|oid| oid.to_id_string())
                .ok_or_else(|| Error::Format("EC key without named curve".to_string()))?;
            let curve = match curve_oid.as_str() {
                OID_CURVE_P256 => EcCurve::P256,
                OID_CURVE_P384 => EcCurve::P384,
                OID_CURVE_P521 => EcCurve::P521,
                other => {
                    return Err(Error::UnsupportedAlgorithm(format!(
                        "EC curve {other} is not supported"
                    )))
                }
            };
            let len = curve.coordinate_len();
            match key_data {
                [0x04, coords @ ..] if coords.len() == 2 * len => Ok(PublicKey::Ec2 {
                    curve,
                    x: coords[..len].to_vec(),
                    y: coords[len..].to_vec(),
                }),
                _ => Err(Error::Format(
                    "EC public key is not an uncompressed point".to_string(),
                )),
            }
        }
        OID_RSA_ENCRYPTION => match spki.parsed() {
            Ok(x509_parser::public_key::PublicKey::RSA(rsa)) => {
                Ok(PublicKey::rsa(rsa.modulus, rsa.exponent))
            }
            _ => Err(Error::Format("Invalid RSA public key".to_string())),
        },
        OID_ED25519 => Ok(PublicKey::Okp {
            curve: OkpCurve::Ed25519,
            x: key_data.to_vec(),
        }),
        other => Err(Error::UnsupportedAlgorithm(format!(
            "certificate key algorithm {other} is not supported"
        ))),
    }
}

fn issued_by(cert: &X509Certificate<'_>, issuer: &X509Certificate<'_>) -> bool {
    cert.issuer().as_raw() == issuer.subject().as_raw()
}

/// First candidate named as the issuer of `cert` that passes the issuer checks
///
/// Candidates may share a subject (key rollover), so every match is tried.
/// Returns `Ok(None)` when no candidate carries the name, otherwise the first
/// failure when none of them verifies.
fn find_issuer<'a, 'c, D>(
    cert: &X509Certificate<'_>,
    candidates: &'a [(D, X509Certificate<'c>)],
    depth: usize,
    at: DateTime<Utc>,
    clock_skew: Duration,
) -> Result<Option<&'a (D, X509Certificate<'c>)>> {
    let mut first_error = None;
    for candidate in candidates.iter().filter(|(_, issuer)| issued_by(cert, issuer)) {
        let issuer = &candidate.1;
        let checked = check_validity(issuer, at, clock_skew)
            .and_then(|()| check_issuer_usage(issuer, depth))
            .and_then(|()| verify_issued(cert, issuer));
        match checked {
            Ok(()) => return Ok(Some(candidate)),
            Err(e) => {
                debug!("Issuer candidate '{}' rejected: {}", issuer.subject(), e.detail());
                first_error.get_or_insert(e);
            }
        }
    }
    first_error.map_or(Ok(None), Err)
}

fn verify_issued(cert: &X509Certificate<'_>, issuer: &X509Certificate<'_>) -> Result<()> {
    cert.verify_signature(Some(issuer.public_key()))
        .map_err(|e| match e {
            X509Error::SignatureUnsupportedAlgorithm => Error::UnsupportedAlgorithm(format!(
                "certificate '{}' uses an unsupported signature algorithm",
                cert.subject()
            )),
            _ => Error::SignatureInvalid(format!(
                "certificate '{}' is not signed by '{}'",
                cert.subject(),
                issuer.subject()
            )),
        })
}

/// `issued_below` is the number of CA certificates between the leaf and this issuer
fn check_issuer_usage(issuer: &X509Certificate<'_>, issued_below: usize) -> Result<()> {
    let constraints = match issuer.basic_constraints() {
        Ok(Some(bc)) if bc.value.ca => bc.value,
        _ => {
            return Err(Error::UsageViolation(format!(
                "issuer '{}' is not a CA",
                issuer.subject()
            )))
        }
    };
    if let Some(path_len) = constraints.path_len_constraint {
        if issued_below > usize::try_from(path_len).unwrap_or(usize::MAX) {
            return Err(Error::UsageViolation(format!(
                "issuer '{}' path length constraint exceeded",
                issuer.subject()
            )));
        }
    }
    match issuer.key_usage() {
        Ok(Some(ku)) if !ku.value.key_cert_sign() => Err(Error::UsageViolation(format!(
            "issuer '{}' key usage does not allow certificate signing",
            issuer.subject()
        ))),
        Err(_) => Err(Error::Format(format!(
            "issuer '{}' has an invalid key usage extension",
            issuer.subject()
        ))),
        _ => Ok(()),
    }
}
