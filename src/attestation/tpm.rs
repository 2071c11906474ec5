//! `tpm` attestation
//!
//! A TPM 2.0 attestation identity key (AIK) certifies the credential key.
//! `pubArea` is the credential's `TPMT_PUBLIC`, `certInfo` the signed
//! `TPMS_ATTEST` structure; all integers are big-endian.

use super::{
    credential, signed_data, statement_alg, statement_x5c, AttestationContext,
    AttestationFormat, AttestationType, VerifiedAttestation,
};
use crate::authenticator_data::AuthenticatorData;
use crate::cbor;
use crate::certificate;
use crate::cose::{EcCurve, PublicKey};
use crate::crypto::{self, HashAlgorithm};
use crate::error::{Error, Result};
use ciborium::value::Value;
use log::debug;

/// `TPM_GENERATED_VALUE`
pub const TPM_GENERATED: u32 = 0xff54_4347;
/// `TPM_ST_ATTEST_CERTIFY`
pub const TPM_ST_ATTEST_CERTIFY: u16 = 0x8017;
/// `tcg-kp-AIKCertificate` extended key usage
pub const OID_TCG_KP_AIK_CERTIFICATE: &str = "2.23.133.8.3";

const OID_SUBJECT_ALT_NAME: &str = "2.5.29.17";

const TPM_ALG_RSA: u16 = 0x0001;
const TPM_ALG_SHA1: u16 = 0x0004;
const TPM_ALG_SHA256: u16 = 0x000b;
const TPM_ALG_SHA384: u16 = 0x000c;
const TPM_ALG_SHA512: u16 = 0x000d;
const TPM_ALG_NULL: u16 = 0x0010;
const TPM_ALG_ECC: u16 = 0x0023;

const TPM_ECC_NIST_P256: u16 = 0x0003;
const TPM_ECC_NIST_P384: u16 = 0x0004;
const TPM_ECC_NIST_P521: u16 = 0x0005;

const RSA_DEFAULT_EXPONENT: u32 = 65_537;

/// Big-endian cursor over a TPM structure
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, pos: 0, what }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let bytes = self
            .buf
            .get(self.pos..self.pos.saturating_add(len))
            .ok_or_else(|| Error::Format(format!("{} truncated", self.what)))?;
        self.pos += len;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(b);
        Ok(u64::from_be_bytes(bytes))
    }

    /// A `TPM2B_*` buffer: u16 size followed by that many bytes
    fn sized(&mut self) -> Result<&'a [u8]> {
        let len = usize::from(self.u16()?);
        self.take(len)
    }

    fn finish(&self) -> Result<()> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(Error::Format(format!(
                "{} has {} trailing bytes",
                self.what,
                self.buf.len() - self.pos
            )))
        }
    }
}

/// The parts of `TPMT_PUBLIC` attestation needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubArea {
    pub name_alg: u16,
    pub key: PublicKey,
}

impl PubArea {
    /// Parse a `TPMT_PUBLIC` structure
    ///
    /// # Errors
    ///
    /// Returns `Error::Format` for truncated or trailing data and
    /// `Error::UnsupportedAlgorithm` for key types and curves other than RSA
    /// and NIST P-256/384/521.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes, "pubArea");
        let key_type = r.u16()?;
        let name_alg = r.u16()?;
        let _object_attributes = r.u32()?;
        let _auth_policy = r.sized()?;

        let key = match key_type {
            TPM_ALG_RSA => {
                skip_symmetric(&mut r)?;
                skip_scheme(&mut r)?;
                let _key_bits = r.u16()?;
                let exponent = match r.u32()? {
                    0 => RSA_DEFAULT_EXPONENT,
                    e => e,
                };
                let modulus = r.sized()?;
                PublicKey::rsa(modulus, &exponent.to_be_bytes())
            }
            TPM_ALG_ECC => {
                skip_symmetric(&mut r)?;
                skip_scheme(&mut r)?;
                let curve = match r.u16()? {
                    TPM_ECC_NIST_P256 => EcCurve::P256,
                    TPM_ECC_NIST_P384 => EcCurve::P384,
                    TPM_ECC_NIST_P521 => EcCurve::P521,
                    other => {
                        return Err(Error::UnsupportedAlgorithm(format!(
                            "TPM curve 0x{other:04x} is not supported"
                        )))
                    }
                };
                // kdf scheme
                skip_scheme(&mut r)?;
                let len = curve.coordinate_len();
                PublicKey::Ec2 {
                    curve,
                    x: left_pad(r.sized()?, len)?,
                    y: left_pad(r.sized()?, len)?,
                }
            }
            other => {
                return Err(Error::UnsupportedAlgorithm(format!(
                    "TPM key type 0x{other:04x} is not supported"
                )))
            }
        };
        r.finish()?;
        Ok(Self { name_alg, key })
    }
}

fn skip_symmetric(r: &mut Reader<'_>) -> Result<()> {
    if r.u16()? != TPM_ALG_NULL {
        let _key_bits = r.u16()?;
        let _mode = r.u16()?;
    }
    Ok(())
}

fn skip_scheme(r: &mut Reader<'_>) -> Result<()> {
    if r.u16()? != TPM_ALG_NULL {
        let _hash_alg = r.u16()?;
    }
    Ok(())
}

fn left_pad(coordinate: &[u8], len: usize) -> Result<Vec<u8>> {
    if coordinate.len() > len {
        return Err(Error::Format(format!(
            "TPM ECC coordinate longer than {len} bytes"
        )));
    }
    let mut out = vec![0u8; len - coordinate.len()];
    out.extend_from_slice(coordinate);
    Ok(out)
}

/// The parts of `TPMS_ATTEST` attestation needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    pub magic: u32,
    pub attest_type: u16,
    pub extra_data: Vec<u8>,
    /// `TPMS_CERTIFY_INFO.name` of the certified object
    pub attested_name: Vec<u8>,
}

impl CertInfo {
    /// Parse a `TPMS_ATTEST` structure of the certify kind
    ///
    /// # Errors
    ///
    /// Returns `Error::Format` for truncated or trailing data.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes, "certInfo");
        let magic = r.u32()?;
        let attest_type = r.u16()?;
        let _qualified_signer = r.sized()?;
        let extra_data = r.sized()?.to_vec();
        // clockInfo: clock, resetCount, restartCount, safe
        let _clock = r.u64()?;
        let _reset_count = r.u32()?;
        let _restart_count = r.u32()?;
        let _safe = r.u8()?;
        let _firmware_version = r.u64()?;
        let attested_name = r.sized()?.to_vec();
        let _qualified_name = r.sized()?;
        r.finish()?;

        Ok(Self {
            magic,
            attest_type,
            extra_data,
            attested_name,
        })
    }
}

fn name_hash(name_alg: u16) -> Result<HashAlgorithm> {
    match name_alg {
        TPM_ALG_SHA256 => Ok(HashAlgorithm::Sha256),
        TPM_ALG_SHA384 => Ok(HashAlgorithm::Sha384),
        TPM_ALG_SHA512 => Ok(HashAlgorithm::Sha512),
        TPM_ALG_SHA1 => Err(Error::UnsupportedAlgorithm(
            "TPM nameAlg SHA-1 is not supported".to_string(),
        )),
        other => Err(Error::UnsupportedAlgorithm(format!(
            "TPM nameAlg 0x{other:04x} is not supported"
        ))),
    }
}

/// Verify a `tpm` attestation statement
///
/// # Errors
///
/// - `Error::Format` for missing fields or malformed TPM structures
/// - `Error::UnsupportedAlgorithm` for ECDAA or unsupported TPM algorithms
/// - `Error::Attestation` if the version, key, magic, type, extra data, name
///   or AIK certificate requirements fail
/// - `Error::SignatureInvalid` if `sig` does not verify with the AIK
/// - chain validation errors from [`crate::certificate::validate`]
pub fn verify(
    stmt: &Value,
    auth_data: &AuthenticatorData,
    client_data_hash: &[u8; 32],
    ctx: &AttestationContext<'_>,
) -> Result<VerifiedAttestation> {
    let ver = cbor::required_text(stmt, "ver")?;
    if ver != "2.0" {
        return Err(Error::Attestation(format!(
            "TPM version '{ver}' is not supported"
        )));
    }
    if cbor::map_get_text(stmt, "ecdaaKeyId").is_some() {
        return Err(Error::UnsupportedAlgorithm(
            "ECDAA attestation is not supported".to_string(),
        ));
    }
    let alg = statement_alg(stmt)?;
    let sig = cbor::required_bytes(stmt, "sig")?;
    let pub_area_bytes = cbor::required_bytes(stmt, "pubArea")?;
    let cert_info_bytes = cbor::required_bytes(stmt, "certInfo")?;
    let x5c = statement_x5c(stmt)?
        .ok_or_else(|| Error::Format("tpm attestation requires x5c".to_string()))?;
    let attested = credential(auth_data)?;

    let pub_area = PubArea::parse(pub_area_bytes)?;
    if pub_area.key != attested.public_key.key {
        return Err(Error::Attestation(
            "pubArea key differs from the credential key".to_string(),
        ));
    }

    let cert_info = CertInfo::parse(cert_info_bytes)?;
    if cert_info.magic != TPM_GENERATED {
        return Err(Error::Attestation(format!(
            "certInfo magic 0x{:08x} is not TPM_GENERATED",
            cert_info.magic
        )));
    }
    if cert_info.attest_type != TPM_ST_ATTEST_CERTIFY {
        return Err(Error::Attestation(format!(
            "certInfo type 0x{:04x} is not TPM_ST_ATTEST_CERTIFY",
            cert_info.attest_type
        )));
    }
    let expected_extra =
        HashAlgorithm::for_algorithm(alg).digest(&signed_data(auth_data, client_data_hash));
    if cert_info.extra_data != expected_extra {
        return Err(Error::Attestation(
            "certInfo extraData does not match the registration".to_string(),
        ));
    }
    let mut expected_name = pub_area.name_alg.to_be_bytes().to_vec();
    expected_name.extend_from_slice(&name_hash(pub_area.name_alg)?.digest(pub_area_bytes));
    if cert_info.attested_name != expected_name {
        return Err(Error::Attestation(
            "certInfo attested name does not match pubArea".to_string(),
        ));
    }

    let aik = certificate::parse(&x5c[0])?;
    crypto::verify_signature(alg, &certificate::public_key(&aik)?, cert_info_bytes, sig)?;
    check_aik_certificate(&aik, &attested.aaguid)?;
    debug!("✓ TPM certify structure verified");

    ctx.validate_chain(AttestationFormat::Tpm, &x5c)?;
    Ok(VerifiedAttestation {
        attestation_type: AttestationType::AttCa,
        trust_path: x5c,
    })
}

fn check_aik_certificate(
    aik: &x509_parser::certificate::X509Certificate<'_>,
    aaguid: &[u8; 16],
) -> Result<()> {
    if !certificate::is_v3(aik) {
        return Err(Error::Attestation(
            "AIK certificate must be X.509 v3".to_string(),
        ));
    }
    if aik.subject().iter().next().is_some() {
        return Err(Error::Attestation(
            "AIK certificate subject must be empty".to_string(),
        ));
    }
    if certificate::extension_value(aik, OID_SUBJECT_ALT_NAME).is_none() {
        return Err(Error::Attestation(
            "AIK certificate lacks a subject alternative name".to_string(),
        ));
    }
    let has_aik_usage = match aik.extended_key_usage() {
        Ok(Some(eku)) => eku
            .value
            .other
            .iter()
            .any(|oid| oid.to_id_string() == OID_TCG_KP_AIK_CERTIFICATE),
        _ => false,
    };
    if !has_aik_usage {
        return Err(Error::Attestation(
            "AIK certificate lacks the tcg-kp-AIKCertificate usage".to_string(),
        ));
    }
    if certificate::is_ca(aik) {
        return Err(Error::UsageViolation(
            "AIK certificate must not be a CA".to_string(),
        ));
    }
    if let Some(cert_aaguid) = certificate::aaguid_extension(aik)? {
        if &cert_aaguid != aaguid {
            return Err(Error::Attestation(
                "AIK certificate AAGUID does not match the authenticator data".to_string(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn ecc_pub_area(x: &[u8], y: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&TPM_ALG_ECC.to_be_bytes());
        out.extend_from_slice(&TPM_ALG_SHA256.to_be_bytes());
        out.extend_from_slice(&0x0006_0472u32.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&TPM_ALG_NULL.to_be_bytes());
        out.extend_from_slice(&TPM_ALG_NULL.to_be_bytes());
        out.extend_from_slice(&TPM_ECC_NIST_P256.to_be_bytes());
        out.extend_from_slice(&TPM_ALG_NULL.to_be_bytes());
        for coordinate in [x, y] {
            out.extend_from_slice(&u16::try_from(coordinate.len()).unwrap().to_be_bytes());
            out.extend_from_slice(coordinate);
        }
        out
    }

    fn rsa_pub_area(modulus: &[u8], exponent: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&TPM_ALG_RSA.to_be_bytes());
        out.extend_from_slice(&TPM_ALG_SHA256.to_be_bytes());
        out.extend_from_slice(&0x0006_0472u32.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&TPM_ALG_NULL.to_be_bytes());
        // RSASSA with SHA-256
        out.extend_from_slice(&0x0014u16.to_be_bytes());
        out.extend_from_slice(&TPM_ALG_SHA256.to_be_bytes());
        out.extend_from_slice(&2048u16.to_be_bytes());
        out.extend_from_slice(&exponent.to_be_bytes());
        out.extend_from_slice(&u16::try_from(modulus.len()).unwrap().to_be_bytes());
        out.extend_from_slice(modulus);
        out
    }

    fn cert_info(extra: &[u8], name: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&TPM_GENERATED.to_be_bytes());
        out.extend_from_slice(&TPM_ST_ATTEST_CERTIFY.to_be_bytes());
        out.extend_from_slice(&2u16.to_be_bytes());
        out.extend_from_slice(&[0xaa, 0xbb]);
        out.extend_from_slice(&u16::try_from(extra.len()).unwrap().to_be_bytes());
        out.extend_from_slice(extra);
        out.extend_from_slice(&[0u8; 17]);
        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&u16::try_from(name.len()).unwrap().to_be_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(&0u16.to_be_bytes());
        out
    }

    #[test]
    fn test_parse_ecc_pub_area() {
        let parsed = PubArea::parse(&ecc_pub_area(&[1; 32], &[2; 31])).unwrap();
        assert_eq!(parsed.name_alg, TPM_ALG_SHA256);
        let PublicKey::Ec2 { curve, x, y } = parsed.key else {
            panic!("expected an EC2 key");
        };
        assert_eq!(curve, EcCurve::P256);
        assert_eq!(x, vec![1; 32]);
        assert_eq!(y.len(), 32);
        assert_eq!(y[0], 0);
    }

    #[test]
    fn test_parse_rsa_pub_area_default_exponent() {
        let modulus = vec![0xc3; 256];
        let parsed = PubArea::parse(&rsa_pub_area(&modulus, 0)).unwrap();
        assert_eq!(parsed.key, PublicKey::rsa(&modulus, &[0x01, 0x00, 0x01]));
    }

    #[test]
    fn test_pub_area_rejects_trailing_and_truncated() {
        let mut area = ecc_pub_area(&[1; 32], &[2; 32]);
        area.push(0);
        assert_eq!(PubArea::parse(&area).unwrap_err().kind(), ErrorKind::Format);
        area.truncate(20);
        assert_eq!(PubArea::parse(&area).unwrap_err().kind(), ErrorKind::Format);
    }

    #[test]
    fn test_unknown_key_type() {
        let mut area = ecc_pub_area(&[1; 32], &[2; 32]);
        area[0] = 0x00;
        area[1] = 0x25;
        assert_eq!(
            PubArea::parse(&area).unwrap_err().kind(),
            ErrorKind::UnsupportedAlgorithm
        );
    }

    #[test]
    fn test_parse_cert_info() {
        let parsed = CertInfo::parse(&cert_info(&[5; 32], &[0, 0x0b, 9, 9])).unwrap();
        assert_eq!(parsed.magic, TPM_GENERATED);
        assert_eq!(parsed.attest_type, TPM_ST_ATTEST_CERTIFY);
        assert_eq!(parsed.extra_data, vec![5; 32]);
        assert_eq!(parsed.attested_name, vec![0, 0x0b, 9, 9]);

        let info = cert_info(&[5; 32], &[0, 0x0b]);
        for cut in 0..info.len() {
            assert!(CertInfo::parse(&info[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn test_name_algorithms() {
        assert_eq!(name_hash(TPM_ALG_SHA256).unwrap(), HashAlgorithm::Sha256);
        assert_eq!(
            name_hash(TPM_ALG_SHA1).unwrap_err().kind(),
            ErrorKind::UnsupportedAlgorithm
        );
    }
}
