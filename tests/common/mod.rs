// Shared builders for integration tests: keys, certificates, client data and
// attestation objects minted on the fly with OpenSSL and ciborium
#![allow(dead_code)]

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ciborium::value::Value;
use openssl::asn1::{Asn1Object, Asn1OctetString, Asn1Time};
use openssl::bn::{BigNum, BigNumContext};
use openssl::ec::{EcGroup, EcKey};
use openssl::ecdsa::EcdsaSig;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::sign::Signer;
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
};
use openssl::x509::{X509Extension, X509Name, X509};
use passkey_verifier::cose::{CoseAlgorithm, EcCurve, PublicKey};
use passkey_verifier::crypto;
use passkey_verifier::{
    AttestationFormat, RelyingPartyConfig, TrustAnchors, Verifier, VerifierConfig,
};
use std::time::Duration;

pub const RP_ID: &str = "example.org";
pub const ORIGIN: &str = "https://example.org";
pub const AAGUID: [u8; 16] = [
    0xf8, 0xa0, 0x11, 0xf3, 0x8c, 0x0a, 0x4d, 0x15, 0x80, 0x06, 0x17, 0x11, 0x1f, 0x9e, 0xdc, 0x7d,
];
pub const CREDENTIAL_ID: [u8; 16] = [0x42; 16];

pub const FLAG_UP: u8 = 0x01;
pub const FLAG_UV: u8 = 0x04;
pub const FLAG_BE: u8 = 0x08;
pub const FLAG_BS: u8 = 0x10;
pub const FLAG_AT: u8 = 0x40;

const OID_FIDO_GEN_CE_AAGUID: &str = "1.3.6.1.4.1.45724.1.1.4";

/// A P-256 key pair held by OpenSSL
pub struct EcKeyPair {
    pub pkey: PKey<Private>,
}

impl EcKeyPair {
    pub fn generate() -> Self {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        Self {
            pkey: PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap(),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        let ec = self.pkey.ec_key().unwrap();
        let mut ctx = BigNumContext::new().unwrap();
        let mut x = BigNum::new().unwrap();
        let mut y = BigNum::new().unwrap();
        ec.public_key()
            .affine_coordinates(ec.group(), &mut x, &mut y, &mut ctx)
            .unwrap();
        PublicKey::Ec2 {
            curve: EcCurve::P256,
            x: x.to_vec_padded(32).unwrap(),
            y: y.to_vec_padded(32).unwrap(),
        }
    }

    /// COSE_Key encoding for ES256
    pub fn cose(&self) -> Vec<u8> {
        self.public_key().to_cose_bytes(CoseAlgorithm::Es256).unwrap()
    }

    /// DER ECDSA signature over SHA-256
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.pkey).unwrap();
        signer.sign_oneshot_to_vec(message).unwrap()
    }

    /// Fixed-width `r || s` signature as used by JWS
    pub fn sign_jws(&self, message: &[u8]) -> Vec<u8> {
        let sig = EcdsaSig::from_der(&self.sign(message)).unwrap();
        let mut out = sig.r().to_vec_padded(32).unwrap();
        out.extend_from_slice(&sig.s().to_vec_padded(32).unwrap());
        out
    }
}

fn name(entries: &[(&str, &str)]) -> X509Name {
    let mut builder = X509Name::builder().unwrap();
    for (field, value) in entries {
        builder.append_entry_by_text(field, value).unwrap();
    }
    builder.build()
}

/// How a leaf certificate is profiled
#[derive(Default)]
pub struct LeafProfile {
    pub subject: Vec<(&'static str, String)>,
    pub aaguid: Option<[u8; 16]>,
    /// TPM AIK: empty subject, SAN and the AIK extended key usage
    pub aik: bool,
    pub ca: bool,
    /// Unix time the certificate expires, one year from now when unset
    pub not_after: Option<i64>,
}

impl LeafProfile {
    /// Packed attestation leaf with the required subject fields
    pub fn packed(aaguid: Option<[u8; 16]>) -> Self {
        Self {
            subject: vec![
                ("C", "US".to_string()),
                ("O", "Example Authenticators".to_string()),
                ("OU", "Authenticator Attestation".to_string()),
                ("CN", "Example Attestation".to_string()),
            ],
            aaguid,
            ..Self::default()
        }
    }

    pub fn common_name(cn: &str) -> Self {
        Self {
            subject: vec![("CN", cn.to_string())],
            ..Self::default()
        }
    }

    pub fn aik() -> Self {
        Self {
            aik: true,
            ..Self::default()
        }
    }
}

/// A certificate authority that can issue intermediates and leaves
pub struct Authority {
    pub key: EcKeyPair,
    pub cn: String,
    pub der: Vec<u8>,
}

impl Authority {
    pub fn root(cn: &str) -> Self {
        let key = EcKeyPair::generate();
        let der = build(
            &name(&[("CN", cn)]),
            &key.pkey,
            cn,
            &key.pkey,
            &LeafProfile {
                ca: true,
                ..LeafProfile::default()
            },
        );
        Self {
            key,
            cn: cn.to_string(),
            der,
        }
    }

    pub fn intermediate(&self, cn: &str) -> Self {
        let key = EcKeyPair::generate();
        let der = build(
            &name(&[("CN", cn)]),
            &key.pkey,
            &self.cn,
            &self.key.pkey,
            &LeafProfile {
                ca: true,
                ..LeafProfile::default()
            },
        );
        Self {
            key,
            cn: cn.to_string(),
            der,
        }
    }

    pub fn issue(&self, key: &EcKeyPair, profile: &LeafProfile) -> Vec<u8> {
        let subject: Vec<(&str, &str)> = profile
            .subject
            .iter()
            .map(|(field, value)| (*field, value.as_str()))
            .collect();
        build(&name(&subject), &key.pkey, &self.cn, &self.key.pkey, profile)
    }
}

fn build(
    subject: &X509Name,
    key: &PKey<Private>,
    issuer_cn: &str,
    issuer_key: &PKey<Private>,
    profile: &LeafProfile,
) -> Vec<u8> {
    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(7).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(subject).unwrap();
    builder.set_issuer_name(&name(&[("CN", issuer_cn)])).unwrap();
    builder.set_pubkey(key).unwrap();
    builder
        .set_not_before(&Asn1Time::from_unix(1_600_000_000).unwrap())
        .unwrap();
    let not_after = match profile.not_after {
        Some(at) => Asn1Time::from_unix(at).unwrap(),
        None => Asn1Time::days_from_now(365).unwrap(),
    };
    builder.set_not_after(&not_after).unwrap();

    if profile.ca {
        builder
            .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
            .unwrap();
        builder
            .append_extension(KeyUsage::new().key_cert_sign().build().unwrap())
            .unwrap();
    } else {
        builder
            .append_extension(BasicConstraints::new().build().unwrap())
            .unwrap();
    }
    if let Some(aaguid) = profile.aaguid {
        let mut value = vec![0x04, 0x10];
        value.extend_from_slice(&aaguid);
        let extension = X509Extension::new_from_der(
            &Asn1Object::from_str(OID_FIDO_GEN_CE_AAGUID).unwrap(),
            false,
            &Asn1OctetString::new_from_bytes(&value).unwrap(),
        )
        .unwrap();
        builder.append_extension(extension).unwrap();
    }
    if profile.aik {
        let san = SubjectAlternativeName::new()
            .dns("tpm.example.org")
            .build(&builder.x509v3_context(None, None))
            .unwrap();
        builder.append_extension(san).unwrap();
        builder
            .append_extension(ExtendedKeyUsage::new().other("2.23.133.8.3").build().unwrap())
            .unwrap();
    }

    builder.sign(issuer_key, MessageDigest::sha256()).unwrap();
    builder.build().to_der().unwrap()
}

/// Client data JSON as a browser would serialise it
pub fn client_data(ceremony: &str, challenge: &[u8], origin: &str) -> Vec<u8> {
    format!(
        r#"{{"type":"{ceremony}","challenge":"{}","origin":"{origin}","crossOrigin":false}}"#,
        URL_SAFE_NO_PAD.encode(challenge)
    )
    .into_bytes()
}

/// Authenticator data carrying an attested credential
pub fn registration_auth_data(
    rp_id: &str,
    flags: u8,
    sign_count: u32,
    credential_id: &[u8],
    cose_key: &[u8],
) -> Vec<u8> {
    let mut data = crypto::sha256(rp_id.as_bytes()).to_vec();
    data.push(flags | FLAG_AT);
    data.extend_from_slice(&sign_count.to_be_bytes());
    data.extend_from_slice(&AAGUID);
    data.extend_from_slice(&u16::try_from(credential_id.len()).unwrap().to_be_bytes());
    data.extend_from_slice(credential_id);
    data.extend_from_slice(cose_key);
    data
}

/// Authenticator data for an assertion
pub fn assertion_auth_data(rp_id: &str, flags: u8, sign_count: u32) -> Vec<u8> {
    let mut data = crypto::sha256(rp_id.as_bytes()).to_vec();
    data.push(flags);
    data.extend_from_slice(&sign_count.to_be_bytes());
    data
}

/// `authData || SHA-256(clientDataJSON)`
pub fn signed_data(auth_data: &[u8], client_data_json: &[u8]) -> Vec<u8> {
    let mut message = auth_data.to_vec();
    message.extend_from_slice(&crypto::sha256(client_data_json));
    message
}

pub fn text(value: &str) -> Value {
    Value::Text(value.to_string())
}

pub fn int(value: i64) -> Value {
    Value::Integer(value.into())
}

pub fn bytes(value: &[u8]) -> Value {
    Value::Bytes(value.to_vec())
}

pub fn x5c(chain: &[&[u8]]) -> Value {
    Value::Array(chain.iter().map(|der| bytes(der)).collect())
}

/// Encode an attestation object
pub fn attestation_object(fmt: &str, stmt: Value, auth_data: &[u8]) -> Vec<u8> {
    let object = Value::Map(vec![
        (text("fmt"), text(fmt)),
        (text("attStmt"), stmt),
        (text("authData"), bytes(auth_data)),
    ]);
    let mut out = Vec::new();
    ciborium::ser::into_writer(&object, &mut out).unwrap();
    out
}

pub fn relying_party() -> RelyingPartyConfig {
    RelyingPartyConfig::new(RP_ID, ORIGIN)
}

/// Verifier trusting `roots` for `format`
pub fn verifier_with_roots(format: AttestationFormat, roots: &[&[u8]]) -> Verifier {
    let mut anchors = TrustAnchors::new(Duration::from_secs(300));
    for root in roots {
        anchors.add_root(format, root.to_vec());
    }
    let mut config = VerifierConfig::new(relying_party());
    config.anchors = anchors;
    Verifier::new(config).unwrap()
}

pub fn verifier() -> Verifier {
    Verifier::new(VerifierConfig::new(relying_party())).unwrap()
}
