//! COSE key decoding
//!
//! Credential public keys arrive as COSE_Key maps (RFC 9052) inside the
//! attested credential data. This module turns them into a typed
//! [`PublicKey`] plus the declared [`CoseAlgorithm`], validating that the
//! key type, curve and coordinates agree with the algorithm.

use crate::cbor;
use crate::error::{Error, Result};
use ciborium::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

const LABEL_KTY: i64 = 1;
const LABEL_ALG: i64 = 3;
const LABEL_CRV: i64 = -1;
const LABEL_X: i64 = -2;
const LABEL_Y: i64 = -3;
const LABEL_RSA_N: i64 = -1;
const LABEL_RSA_E: i64 = -2;

const KTY_OKP: i64 = 1;
const KTY_EC2: i64 = 2;
const KTY_RSA: i64 = 3;

/// Signature algorithms accepted for credentials and attestation statements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoseAlgorithm {
    Es256,
    Es384,
    Es512,
    EdDsa,
    Rs256,
    Rs384,
    Rs512,
    Ps256,
    Ps384,
    Ps512,
}

impl CoseAlgorithm {
    /// Map a COSE algorithm identifier to a supported algorithm
    ///
    /// # Errors
    ///
    /// Returns `Error::UnsupportedAlgorithm` for identifiers outside the supported set.
    pub fn from_id(id: i64) -> Result<Self> {
        match id {
            -7 => Ok(Self::Es256),
            -35 => Ok(Self::Es384),
            -36 => Ok(Self::Es512),
            -8 => Ok(Self::EdDsa),
            -257 => Ok(Self::Rs256),
            -258 => Ok(Self::Rs384),
            -259 => Ok(Self::Rs512),
            -37 => Ok(Self::Ps256),
            -38 => Ok(Self::Ps384),
            -39 => Ok(Self::Ps512),
            other => Err(Error::UnsupportedAlgorithm(format!(
                "COSE algorithm {other} is not supported"
            ))),
        }
    }

    /// The COSE algorithm identifier
    #[must_use]
    pub fn id(self) -> i64 {
        match self {
            Self::Es256 => -7,
            Self::Es384 => -35,
            Self::Es512 => -36,
            Self::EdDsa => -8,
            Self::Rs256 => -257,
            Self::Rs384 => -258,
            Self::Rs512 => -259,
            Self::Ps256 => -37,
            Self::Ps384 => -38,
            Self::Ps512 => -39,
        }
    }

    /// Whether this is one of the RSA algorithms
    #[must_use]
    pub fn is_rsa(self) -> bool {
        matches!(
            self,
            Self::Rs256 | Self::Rs384 | Self::Rs512 | Self::Ps256 | Self::Ps384 | Self::Ps512
        )
    }
}

impl fmt::Display for CoseAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Es256 => "ES256",
            Self::Es384 => "ES384",
            Self::Es512 => "ES512",
            Self::EdDsa => "EdDSA",
            Self::Rs256 => "RS256",
            Self::Rs384 => "RS384",
            Self::Rs512 => "RS512",
            Self::Ps256 => "PS256",
            Self::Ps384 => "PS384",
            Self::Ps512 => "PS512",
        };
        f.write_str(name)
    }
}

/// NIST curves used with EC2 keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EcCurve {
    P256,
    P384,
    P521,
}

impl EcCurve {
    fn from_cose(id: i64) -> Result<Self> {
        match id {
            1 => Ok(Self::P256),
            2 => Ok(Self::P384),
            3 => Ok(Self::P521),
            other => Err(Error::UnsupportedAlgorithm(format!(
                "EC2 curve {other} is not supported"
            ))),
        }
    }

    /// The COSE curve identifier
    #[must_use]
    pub fn cose_id(self) -> i64 {
        match self {
            Self::P256 => 1,
            Self::P384 => 2,
            Self::P521 => 3,
        }
    }

    /// Length in bytes of one affine coordinate
    #[must_use]
    pub fn coordinate_len(self) -> usize {
        match self {
            Self::P256 => 32,
            Self::P384 => 48,
            Self::P521 => 66,
        }
    }
}

/// Edwards curves used with OKP keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OkpCurve {
    Ed25519,
}

/// Public key material, independent of where it was read from
///
/// RSA components are stored without leading zero bytes so keys read from
/// COSE, TPM structures and certificates compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublicKey {
    Ec2 { curve: EcCurve, x: Vec<u8>, y: Vec<u8> },
    Okp { curve: OkpCurve, x: Vec<u8> },
    Rsa { n: Vec<u8>, e: Vec<u8> },
}

impl PublicKey {
    /// Build an RSA key, normalising the big-endian components
    #[must_use]
    pub fn rsa(n: &[u8], e: &[u8]) -> Self {
        Self::Rsa {
            n: strip_leading_zeros(n).to_vec(),
            e: strip_leading_zeros(e).to_vec(),
        }
    }

    /// SEC1 uncompressed point `0x04 || x || y` for EC2 keys
    #[must_use]
    pub fn sec1_uncompressed(&self) -> Option<Vec<u8>> {
        match self {
            Self::Ec2 { x, y, .. } => {
                let mut point = Vec::with_capacity(1 + x.len() + y.len());
                point.push(0x04);
                point.extend_from_slice(x);
                point.extend_from_slice(y);
                Some(point)
            }
            _ => None,
        }
    }

    /// Check that the material describes a usable key
    ///
    /// # Errors
    ///
    /// Returns `Error::Format` if coordinates have the wrong length or do not
    /// form a point on the curve, or the RSA components are unusable.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Ec2 { curve, x, y } => {
                let len = curve.coordinate_len();
                if x.len() != len || y.len() != len {
                    return Err(Error::Format(format!(
                        "EC2 coordinates must be {len} bytes for {curve:?}"
                    )));
                }
                let point = self.sec1_uncompressed().unwrap_or_default();
                let on_curve = match curve {
                    EcCurve::P256 => p256::PublicKey::from_sec1_bytes(&point).is_ok(),
                    EcCurve::P384 => p384::PublicKey::from_sec1_bytes(&point).is_ok(),
                    EcCurve::P521 => p521::PublicKey::from_sec1_bytes(&point).is_ok(),
                };
                if on_curve {
                    Ok(())
                } else {
                    Err(Error::Format(format!("EC2 point is not on {curve:?}")))
                }
            }
            Self::Okp { x, .. } => {
                let bytes: [u8; 32] = x.as_slice().try_into().map_err(|_| {
                    Error::Format("Ed25519 public key must be 32 bytes".to_string())
                })?;
                ed25519_dalek::VerifyingKey::from_bytes(&bytes)
                    .map(|_| ())
                    .map_err(|e| Error::Format(format!("Invalid Ed25519 public key: {e}")))
            }
            Self::Rsa { n, e } => {
                rsa::RsaPublicKey::new(
                    rsa::BigUint::from_bytes_be(n),
                    rsa::BigUint::from_bytes_be(e),
                )
                .map(|_| ())
                .map_err(|err| Error::Format(format!("Invalid RSA public key: {err}")))
            }
        }
    }

    /// Encode as a COSE_Key map for the given algorithm
    ///
    /// # Errors
    ///
    /// Returns `Error::Format` if serialisation fails.
    pub fn to_cose_bytes(&self, algorithm: CoseAlgorithm) -> Result<Vec<u8>> {
        let int = |v: i64| Value::Integer(v.into());
        let mut entries = Vec::new();
        match self {
            Self::Ec2 { curve, x, y } => {
                entries.push((int(LABEL_KTY), int(KTY_EC2)));
                entries.push((int(LABEL_ALG), int(algorithm.id())));
                entries.push((int(LABEL_CRV), int(curve.cose_id())));
                entries.push((int(LABEL_X), Value::Bytes(x.clone())));
                entries.push((int(LABEL_Y), Value::Bytes(y.clone())));
            }
            Self::Okp { x, .. } => {
                entries.push((int(LABEL_KTY), int(KTY_OKP)));
                entries.push((int(LABEL_ALG), int(algorithm.id())));
                entries.push((int(LABEL_CRV), int(6)));
                entries.push((int(LABEL_X), Value::Bytes(x.clone())));
            }
            Self::Rsa { n, e } => {
                entries.push((int(LABEL_KTY), int(KTY_RSA)));
                entries.push((int(LABEL_ALG), int(algorithm.id())));
                entries.push((int(LABEL_RSA_N), Value::Bytes(n.clone())));
                entries.push((int(LABEL_RSA_E), Value::Bytes(e.clone())));
            }
        }
        let mut out = Vec::new();
        ciborium::ser::into_writer(&Value::Map(entries), &mut out)
            .map_err(|e| Error::Format(format!("Failed to encode COSE key: {e}")))?;
        Ok(out)
    }
}

/// A decoded COSE public key with its declared algorithm
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoseKey {
    pub algorithm: CoseAlgorithm,
    pub key: PublicKey,
    /// The COSE_Key bytes as received, kept for storage
    pub raw: Vec<u8>,
}

impl CoseKey {
    /// Decode a COSE key from its CBOR encoding
    ///
    /// # Errors
    ///
    /// Returns `Error::Format` for malformed input and
    /// `Error::UnsupportedAlgorithm` for algorithms, key types or curves
    /// outside the supported set.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let value = cbor::decode(bytes)?;
        Self::parse(&value, bytes.to_vec())
    }

    /// Decode a COSE key from an already decoded CBOR map
    ///
    /// # Errors
    ///
    /// Same as [`CoseKey::from_bytes`].
    pub fn from_cbor(value: &Value) -> Result<Self> {
        let mut raw = Vec::new();
        ciborium::ser::into_writer(value, &mut raw)
            .map_err(|e| Error::Format(format!("Failed to encode COSE key: {e}")))?;
        Self::parse(value, raw)
    }

    fn parse(value: &Value, raw: Vec<u8>) -> Result<Self> {
        if value.as_map().is_none() {
            return Err(Error::Format("COSE key must be a CBOR map".to_string()));
        }

        let kty = required_int(value, LABEL_KTY, "kty")?;
        let algorithm = CoseAlgorithm::from_id(required_int(value, LABEL_ALG, "alg")?)?;

        let key = match kty {
            KTY_EC2 => {
                let curve = EcCurve::from_cose(required_int(value, LABEL_CRV, "crv")?)?;
                let expected = match algorithm {
                    CoseAlgorithm::Es256 => EcCurve::P256,
                    CoseAlgorithm::Es384 => EcCurve::P384,
                    CoseAlgorithm::Es512 => EcCurve::P521,
                    other => return Err(mismatch(other, "EC2")),
                };
                if curve != expected {
                    return Err(Error::UnsupportedAlgorithm(format!(
                        "{algorithm} cannot be used with curve {curve:?}"
                    )));
                }
                PublicKey::Ec2 {
                    curve,
                    x: required_label_bytes(value, LABEL_X, "x")?.to_vec(),
                    y: required_label_bytes(value, LABEL_Y, "y")?.to_vec(),
                }
            }
            KTY_OKP => {
                if algorithm != CoseAlgorithm::EdDsa {
                    return Err(mismatch(algorithm, "OKP"));
                }
                let curve = required_int(value, LABEL_CRV, "crv")?;
                if curve != 6 {
                    return Err(Error::UnsupportedAlgorithm(format!(
                        "OKP curve {curve} is not supported"
                    )));
                }
                PublicKey::Okp {
                    curve: OkpCurve::Ed25519,
                    x: required_label_bytes(value, LABEL_X, "x")?.to_vec(),
                }
            }
            KTY_RSA => {
                if !algorithm.is_rsa() {
                    return Err(mismatch(algorithm, "RSA"));
                }
                PublicKey::rsa(
                    required_label_bytes(value, LABEL_RSA_N, "n")?,
                    required_label_bytes(value, LABEL_RSA_E, "e")?,
                )
            }
            other => {
                return Err(Error::UnsupportedAlgorithm(format!(
                    "COSE key type {other} is not supported"
                )))
            }
        };

        key.validate()?;
        Ok(Self {
            algorithm,
            key,
            raw,
        })
    }
}

fn mismatch(algorithm: CoseAlgorithm, kty: &str) -> Error {
    Error::UnsupportedAlgorithm(format!("{algorithm} cannot be used with {kty} keys"))
}

fn required_int(map: &Value, label: i64, name: &str) -> Result<i64> {
    cbor::map_get_int(map, label)
        .and_then(cbor::as_i64)
        .ok_or_else(|| Error::Format(format!("COSE key is missing integer '{name}'")))
}

fn required_label_bytes<'a>(map: &'a Value, label: i64, name: &str) -> Result<&'a [u8]> {
    cbor::map_get_int(map, label)
        .and_then(Value::as_bytes)
        .map(Vec::as_slice)
        .ok_or_else(|| Error::Format(format!("COSE key is missing byte string '{name}'")))
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}
