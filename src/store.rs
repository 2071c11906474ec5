//! Collaborator contracts for credential storage and challenge sessions
//!
//! Verification never touches storage directly. [`crate::verifier::RelyingParty`]
//! drives these traits; the in-memory implementations serve tests and
//! single-process deployments.

use crate::attestation::{AttestationFormat, AttestationType};
use crate::cose::CoseKey;
use crate::crypto;
use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A registered credential as the relying party keeps it
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StoredCredential {
    pub credential_id: Vec<u8>,
    pub user_handle: String,
    pub public_key: CoseKey,
    pub sign_count: u32,
    pub attestation_type: AttestationType,
    pub aaguid: [u8; 16],
    pub backup_eligible: bool,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
}

/// Credential persistence
pub trait CredentialStore: Send + Sync {
    /// Fetch a credential by its ID
    fn lookup_credential(&self, credential_id: &[u8]) -> Option<StoredCredential>;

    /// Persist a newly registered credential
    ///
    /// # Errors
    ///
    /// Returns an error if a credential with the same ID already exists.
    fn save_credential(&self, credential: StoredCredential) -> Result<()>;

    /// Advance the signature counter from `previous` to `new`
    ///
    /// Must be a compare-and-advance: when the stored counter is no longer
    /// `previous` the update fails and nothing changes.
    ///
    /// # Errors
    ///
    /// Returns `Error::CounterRegression` if the stored counter moved.
    fn update_counter(&self, credential_id: &[u8], previous: u32, new: u32) -> Result<()>;

    /// DER trust roots configured for an attestation format
    fn list_trust_roots(&self, format: AttestationFormat) -> Vec<Vec<u8>>;
}

/// The ceremony a challenge was issued for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ceremony {
    Registration,
    Authentication,
}

/// Challenge issue and single-use consumption
pub trait ChallengeStore: Send + Sync {
    /// Issue a fresh challenge for `ceremony`, bound to `user_context`
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if random generation fails.
    fn issue_challenge(&self, ceremony: Ceremony, user_context: &str) -> Result<Vec<u8>>;

    /// Consume a challenge, returning the context it was issued for
    ///
    /// # Errors
    ///
    /// Returns `Error::ChallengeMismatch` for unknown challenges or ones
    /// issued for another ceremony, and `Error::ChallengeExpired` for stale
    /// ones.
    fn consume_challenge(&self, ceremony: Ceremony, challenge: &[u8]) -> Result<String>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory credential store
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    credentials: Mutex<HashMap<Vec<u8>, StoredCredential>>,
    trust_roots: HashMap<AttestationFormat, Vec<Vec<u8>>>,
}

impl MemoryCredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that reports `roots` for `format`
    #[must_use]
    pub fn with_trust_roots(mut self, format: AttestationFormat, roots: Vec<Vec<u8>>) -> Self {
        self.trust_roots.insert(format, roots);
        self
    }

    /// Number of stored credentials
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.credentials).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn lookup_credential(&self, credential_id: &[u8]) -> Option<StoredCredential> {
        lock(&self.credentials).get(credential_id).cloned()
    }

    fn save_credential(&self, credential: StoredCredential) -> Result<()> {
        let mut credentials = lock(&self.credentials);
        if credentials.contains_key(&credential.credential_id) {
            return Err(Error::Attestation(
                "credential ID is already registered".to_string(),
            ));
        }
        debug!("Storing credential for user {}", credential.user_handle);
        credentials.insert(credential.credential_id.clone(), credential);
        Ok(())
    }

    fn update_counter(&self, credential_id: &[u8], previous: u32, new: u32) -> Result<()> {
        let mut credentials = lock(&self.credentials);
        let credential = credentials
            .get_mut(credential_id)
            .ok_or_else(|| Error::Format("credential ID is not registered".to_string()))?;
        if credential.sign_count != previous {
            warn!(
                "⚠️ Counter for credential changed concurrently ({} != {previous})",
                credential.sign_count
            );
            return Err(Error::CounterRegression {
                stored: credential.sign_count,
                received: new,
            });
        }
        credential.sign_count = new;
        credential.last_used = Some(Utc::now());
        Ok(())
    }

    fn list_trust_roots(&self, format: AttestationFormat) -> Vec<Vec<u8>> {
        self.trust_roots.get(&format).cloned().unwrap_or_default()
    }
}

#[derive(Debug)]
struct PendingChallenge {
    ceremony: Ceremony,
    user_context: String,
    issued_at: DateTime<Utc>,
}

/// In-memory challenge store with a fixed time-to-live
///
/// Expired challenges are dropped whenever a new one is issued, so abandoned
/// ceremonies do not accumulate.
#[derive(Debug)]
pub struct MemoryChallengeStore {
    pending: Mutex<HashMap<Vec<u8>, PendingChallenge>>,
    ttl: Duration,
}

impl Default for MemoryChallengeStore {
    fn default() -> Self {
        Self::new(Duration::minutes(5))
    }
}

impl MemoryChallengeStore {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Number of challenges awaiting consumption
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Issue a challenge as of `now`, dropping expired ones first
    ///
    /// # Errors
    ///
    /// Same as [`ChallengeStore::issue_challenge`].
    pub fn issue_challenge_at(
        &self,
        ceremony: Ceremony,
        user_context: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<u8>> {
        let challenge = crypto::generate_challenge()?;
        let mut pending = lock(&self.pending);
        self.retain_live(&mut pending, now);
        pending.insert(
            challenge.clone(),
            PendingChallenge {
                ceremony,
                user_context: user_context.to_string(),
                issued_at: now,
            },
        );
        Ok(challenge)
    }

    /// Consume a challenge as of `now`
    ///
    /// # Errors
    ///
    /// Same as [`ChallengeStore::consume_challenge`].
    pub fn consume_challenge_at(
        &self,
        ceremony: Ceremony,
        challenge: &[u8],
        now: DateTime<Utc>,
    ) -> Result<String> {
        let pending = lock(&self.pending).remove(challenge).ok_or_else(|| {
            Error::ChallengeMismatch("challenge was not issued or was already used".to_string())
        })?;
        if now.signed_duration_since(pending.issued_at) > self.ttl {
            return Err(Error::ChallengeExpired(format!(
                "challenge issued at {} has expired",
                pending.issued_at
            )));
        }
        if pending.ceremony != ceremony {
            warn!(
                "⚠️ Challenge issued for {:?} presented during {ceremony:?}",
                pending.ceremony
            );
            return Err(Error::ChallengeMismatch(
                "challenge was issued for another ceremony".to_string(),
            ));
        }
        Ok(pending.user_context)
    }

    /// Drop challenges older than the time-to-live
    pub fn purge_expired(&self, now: DateTime<Utc>) {
        self.retain_live(&mut lock(&self.pending), now);
    }

    fn retain_live(&self, pending: &mut HashMap<Vec<u8>, PendingChallenge>, now: DateTime<Utc>) {
        let before = pending.len();
        pending.retain(|_, entry| now.signed_duration_since(entry.issued_at) <= self.ttl);
        if pending.len() < before {
            debug!("Dropped {} expired challenges", before - pending.len());
        }
    }
}

impl ChallengeStore for MemoryChallengeStore {
    fn issue_challenge(&self, ceremony: Ceremony, user_context: &str) -> Result<Vec<u8>> {
        self.issue_challenge_at(ceremony, user_context, Utc::now())
    }

    fn consume_challenge(&self, ceremony: Ceremony, challenge: &[u8]) -> Result<String> {
        self.consume_challenge_at(ceremony, challenge, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cose::CoseAlgorithm;
    use crate::error::ErrorKind;

    fn credential(id: &[u8], sign_count: u32) -> StoredCredential {
        let key_bytes = [
            0xa4, 0x01, 0x01, 0x03, 0x27, 0x20, 0x06, 0x21, 0x58, 0x20, 0xd7, 0x5a, 0x98, 0x01,
            0x82, 0xb1, 0x0a, 0xb7, 0xd5, 0x4b, 0xfe, 0xd3, 0xc9, 0x64, 0x07, 0x3a, 0x0e, 0xe1,
            0x72, 0xf3, 0xda, 0xa6, 0x23, 0x25, 0xaf, 0x02, 0x1a, 0x68, 0xf7, 0x07, 0x51, 0x1a,
        ];
        let public_key = CoseKey::from_bytes(&key_bytes).unwrap();
        assert_eq!(public_key.algorithm, CoseAlgorithm::EdDsa);
        StoredCredential {
            credential_id: id.to_vec(),
            user_handle: "user-1".to_string(),
            public_key,
            sign_count,
            attestation_type: AttestationType::None,
            aaguid: [0; 16],
            backup_eligible: false,
            created_at: Utc::now(),
            last_used: None,
        }
    }

    #[test]
    fn test_save_and_lookup() {
        let store = MemoryCredentialStore::new();
        assert!(store.is_empty());
        store.save_credential(credential(b"cred", 0)).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.lookup_credential(b"cred").unwrap().user_handle, "user-1");
        assert!(store.lookup_credential(b"other").is_none());

        let err = store.save_credential(credential(b"cred", 0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Attestation);
    }

    #[test]
    fn test_counter_compare_and_advance() {
        let store = MemoryCredentialStore::new();
        store.save_credential(credential(b"cred", 5)).unwrap();

        store.update_counter(b"cred", 5, 6).unwrap();
        assert_eq!(store.lookup_credential(b"cred").unwrap().sign_count, 6);
        assert!(store.lookup_credential(b"cred").unwrap().last_used.is_some());

        // a second writer that read the old counter loses
        let err = store.update_counter(b"cred", 5, 7).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CounterRegression);
        assert_eq!(store.lookup_credential(b"cred").unwrap().sign_count, 6);

        let err = store.update_counter(b"missing", 0, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn test_concurrent_advances_single_winner() {
        let store = std::sync::Arc::new(MemoryCredentialStore::new());
        store.save_credential(credential(b"cred", 1)).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || store.update_counter(b"cred", 1, 2 + i).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_trust_roots() {
        let store = MemoryCredentialStore::new()
            .with_trust_roots(AttestationFormat::FidoU2f, vec![vec![0x30, 0x00]]);
        assert_eq!(store.list_trust_roots(AttestationFormat::FidoU2f).len(), 1);
        assert!(store.list_trust_roots(AttestationFormat::Tpm).is_empty());
    }

    #[test]
    fn test_challenge_single_use() {
        let store = MemoryChallengeStore::default();
        let challenge = store
            .issue_challenge(Ceremony::Registration, "alice")
            .unwrap();
        assert_eq!(challenge.len(), crypto::CHALLENGE_LEN);

        assert_eq!(
            store
                .consume_challenge(Ceremony::Registration, &challenge)
                .unwrap(),
            "alice"
        );
        let err = store
            .consume_challenge(Ceremony::Registration, &challenge)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChallengeMismatch);
        assert!(store.is_empty());
    }

    #[test]
    fn test_challenge_bound_to_ceremony() {
        let store = MemoryChallengeStore::default();
        let challenge = store
            .issue_challenge(Ceremony::Registration, "alice")
            .unwrap();

        let err = store
            .consume_challenge(Ceremony::Authentication, &challenge)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChallengeMismatch);

        // a misused challenge is burnt
        let err = store
            .consume_challenge(Ceremony::Registration, &challenge)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChallengeMismatch);
    }

    #[test]
    fn test_challenge_expiry() {
        let store = MemoryChallengeStore::new(Duration::seconds(30));
        let challenge = store
            .issue_challenge(Ceremony::Authentication, "bob")
            .unwrap();
        let later = Utc::now() + Duration::seconds(31);
        let err = store
            .consume_challenge_at(Ceremony::Authentication, &challenge, later)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChallengeExpired);

        let unknown = store
            .consume_challenge(Ceremony::Authentication, &[0u8; 32])
            .unwrap_err();
        assert_eq!(unknown.kind(), ErrorKind::ChallengeMismatch);
    }

    #[test]
    fn test_purge_expired() {
        let store = MemoryChallengeStore::new(Duration::seconds(30));
        let challenge = store
            .issue_challenge(Ceremony::Registration, "carol")
            .unwrap();
        store.purge_expired(Utc::now() + Duration::seconds(60));
        let err = store
            .consume_challenge(Ceremony::Registration, &challenge)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChallengeMismatch);
    }

    #[test]
    fn test_issue_drops_abandoned_challenges() {
        let store = MemoryChallengeStore::new(Duration::seconds(30));
        let start = Utc::now();
        for _ in 0..5 {
            store
                .issue_challenge_at(Ceremony::Authentication, "", start)
                .unwrap();
        }
        assert_eq!(store.len(), 5);

        let later = start + Duration::seconds(31);
        let live = store
            .issue_challenge_at(Ceremony::Authentication, "dave", later)
            .unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(
            store
                .consume_challenge_at(Ceremony::Authentication, &live, later)
                .unwrap(),
            "dave"
        );
    }
}
