//! Authenticator data parsing
//!
//! Layout:
//! - 32 bytes: RP ID hash
//! - 1 byte: flags
//! - 4 bytes: signature counter (big-endian)
//! - variable: attested credential data (if AT is set)
//!   - 16 bytes: AAGUID
//!   - 2 bytes: credential ID length (L, big-endian)
//!   - L bytes: credential ID
//!   - variable: CBOR COSE public key
//! - variable: CBOR extensions map (if ED is set)

use crate::cbor;
use crate::cose::CoseKey;
use crate::error::{Error, Result};
use ciborium::value::Value;
use serde::{Deserialize, Serialize};

/// Length of the mandatory prefix
pub const MIN_LEN: usize = 37;

/// Authenticator data flag bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flags(pub u8);

impl Flags {
    pub const USER_PRESENT: u8 = 0x01;
    pub const USER_VERIFIED: u8 = 0x04;
    pub const BACKUP_ELIGIBLE: u8 = 0x08;
    pub const BACKUP_STATE: u8 = 0x10;
    pub const ATTESTED_CREDENTIAL_DATA: u8 = 0x40;
    pub const EXTENSION_DATA: u8 = 0x80;

    #[must_use]
    pub fn user_present(self) -> bool {
        self.0 & Self::USER_PRESENT != 0
    }

    #[must_use]
    pub fn user_verified(self) -> bool {
        self.0 & Self::USER_VERIFIED != 0
    }

    #[must_use]
    pub fn backup_eligible(self) -> bool {
        self.0 & Self::BACKUP_ELIGIBLE != 0
    }

    #[must_use]
    pub fn backup_state(self) -> bool {
        self.0 & Self::BACKUP_STATE != 0
    }

    #[must_use]
    pub fn attested_credential_data(self) -> bool {
        self.0 & Self::ATTESTED_CREDENTIAL_DATA != 0
    }

    #[must_use]
    pub fn extension_data(self) -> bool {
        self.0 & Self::EXTENSION_DATA != 0
    }
}

/// Credential material present during registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestedCredentialData {
    pub aaguid: [u8; 16],
    pub credential_id: Vec<u8>,
    pub public_key: CoseKey,
}

/// Parsed authenticator data, retaining the raw bytes signatures cover
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatorData {
    pub rp_id_hash: [u8; 32],
    pub flags: Flags,
    pub sign_count: u32,
    pub attested_credential_data: Option<AttestedCredentialData>,
    pub extensions: Option<Value>,
    pub raw: Vec<u8>,
}

impl AuthenticatorData {
    /// Parse authenticator data
    ///
    /// # Errors
    ///
    /// Returns `Error::Format` if the data is truncated, if the structures
    /// announced by the flags are malformed, or if bytes remain that no flag
    /// accounts for. COSE key problems surface with their own kinds.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MIN_LEN {
            return Err(Error::Format(format!(
                "Authenticator data truncated: {} bytes, need at least {MIN_LEN}",
                bytes.len()
            )));
        }

        let mut rp_id_hash = [0u8; 32];
        rp_id_hash.copy_from_slice(&bytes[..32]);
        let flags = Flags(bytes[32]);
        let sign_count = u32::from_be_bytes([bytes[33], bytes[34], bytes[35], bytes[36]]);
        let mut pos = MIN_LEN;

        let attested_credential_data = if flags.attested_credential_data() {
            let (data, consumed) = parse_attested_credential_data(&bytes[pos..])?;
            pos += consumed;
            Some(data)
        } else {
            None
        };

        let extensions = if flags.extension_data() {
            let value = cbor::decode(&bytes[pos..])
                .map_err(|e| Error::Format(format!("Invalid extension data: {}", e.detail())))?;
            if value.as_map().is_none() {
                return Err(Error::Format("Extension data must be a CBOR map".to_string()));
            }
            pos = bytes.len();
            Some(value)
        } else {
            None
        };

        if pos != bytes.len() {
            return Err(Error::Format(format!(
                "{} unexpected trailing bytes in authenticator data",
                bytes.len() - pos
            )));
        }

        Ok(Self {
            rp_id_hash,
            flags,
            sign_count,
            attested_credential_data,
            extensions,
            raw: bytes.to_vec(),
        })
    }
}

fn parse_attested_credential_data(bytes: &[u8]) -> Result<(AttestedCredentialData, usize)> {
    if bytes.len() < 18 {
        return Err(Error::Format(
            "Attested credential data truncated before credential ID length".to_string(),
        ));
    }

    let mut aaguid = [0u8; 16];
    aaguid.copy_from_slice(&bytes[..16]);
    let id_len = usize::from(u16::from_be_bytes([bytes[16], bytes[17]]));
    let mut pos = 18;

    let credential_id = bytes
        .get(pos..pos + id_len)
        .ok_or_else(|| Error::Format("Credential ID exceeds authenticator data".to_string()))?
        .to_vec();
    pos += id_len;

    let key_bytes = &bytes[pos..];
    let (_, key_len) = cbor::decode_prefix(key_bytes)
        .map_err(|e| Error::Format(format!("Invalid credential public key: {}", e.detail())))?;
    let public_key = CoseKey::from_bytes(&key_bytes[..key_len])?;
    pos += key_len;

    Ok((
        AttestedCredentialData {
            aaguid,
            credential_id,
            public_key,
        },
        pos,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cose::{CoseAlgorithm, EcCurve, PublicKey};
    use crate::error::ErrorKind;
    use p256::elliptic_curve::sec1::ToEncodedPoint;

    fn cose_key_bytes() -> Vec<u8> {
        let secret = p256::SecretKey::from_slice(&[11u8; 32]).unwrap();
        let point = secret.public_key().to_encoded_point(false);
        PublicKey::Ec2 {
            curve: EcCurve::P256,
            x: point.x().unwrap().to_vec(),
            y: point.y().unwrap().to_vec(),
        }
        .to_cose_bytes(CoseAlgorithm::Es256)
        .unwrap()
    }

    fn prefix(flags: u8, counter: u32) -> Vec<u8> {
        let mut data = vec![0xaa; 32];
        data.push(flags);
        data.extend_from_slice(&counter.to_be_bytes());
        data
    }

    fn with_credential(flags: u8) -> Vec<u8> {
        let mut data = prefix(flags, 0);
        data.extend_from_slice(&[0x11; 16]);
        data.extend_from_slice(&4u16.to_be_bytes());
        data.extend_from_slice(&[1, 2, 3, 4]);
        data.extend_from_slice(&cose_key_bytes());
        data
    }

    #[test]
    fn test_parse_assertion_data() {
        let data = prefix(0x05, 42);
        let parsed = AuthenticatorData::parse(&data).unwrap();

        assert_eq!(parsed.rp_id_hash, [0xaa; 32]);
        assert!(parsed.flags.user_present());
        assert!(parsed.flags.user_verified());
        assert!(!parsed.flags.backup_eligible());
        assert_eq!(parsed.sign_count, 42);
        assert!(parsed.attested_credential_data.is_none());
        assert_eq!(parsed.raw, data);
    }

    #[test]
    fn test_parse_attested_credential_data() {
        let data = with_credential(0x41);
        let parsed = AuthenticatorData::parse(&data).unwrap();
        let attested = parsed.attested_credential_data.unwrap();

        assert_eq!(attested.aaguid, [0x11; 16]);
        assert_eq!(attested.credential_id, vec![1, 2, 3, 4]);
        assert_eq!(attested.public_key.algorithm, CoseAlgorithm::Es256);
        assert_eq!(attested.public_key.raw, cose_key_bytes());
    }

    #[test]
    fn test_extensions_consume_remainder() {
        let mut data = with_credential(0xc1);
        // {"credProtect": 1}
        data.extend_from_slice(&[
            0xa1, 0x6b, b'c', b'r', b'e', b'd', b'P', b'r', b'o', b't', b'e', b'c', b't', 0x01,
        ]);
        let parsed = AuthenticatorData::parse(&data).unwrap();
        let extensions = parsed.extensions.unwrap();
        assert_eq!(
            cbor::map_get_text(&extensions, "credProtect").and_then(cbor::as_i64),
            Some(1)
        );

        data.push(0x00);
        let err = AuthenticatorData::parse(&data).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn test_truncated_prefix() {
        let err = AuthenticatorData::parse(&[0u8; 36]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn test_trailing_bytes_without_flags() {
        let mut data = prefix(0x01, 0);
        data.push(0xa0);
        let err = AuthenticatorData::parse(&data).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);

        let mut data = with_credential(0x41);
        data.push(0x00);
        assert!(AuthenticatorData::parse(&data).is_err());
    }

    #[test]
    fn test_truncated_credential_never_panics() {
        let data = with_credential(0x41);
        for cut in MIN_LEN..data.len() {
            let err = AuthenticatorData::parse(&data[..cut]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Format, "cut at {cut}");
        }
    }

    #[test]
    fn test_oversized_credential_id_length() {
        let mut data = prefix(0x41, 0);
        data.extend_from_slice(&[0u8; 16]);
        data.extend_from_slice(&u16::MAX.to_be_bytes());
        data.extend_from_slice(&[1, 2, 3]);
        let err = AuthenticatorData::parse(&data).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }
}
