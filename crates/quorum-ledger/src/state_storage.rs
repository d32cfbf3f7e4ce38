// STATE STORAGE
// Checksummed registry snapshots
//
// SAFETY INVARIANTS:
// 1. A snapshot is a bincode payload wrapped with its SHA-256 checksum
// 2. Loading verifies version and checksum before any record is trusted
// 3. Files are written to a sibling temp path and renamed into place

use crate::ledger_account::LedgerAccount;
use crate::ledger_config::SubjectConfig;
use crate::ledger_types::Timestamp;
use crate::resolution_engine::ResolutionEngine;
use crate::subject_registry::ArchivedSubject;
use log::info;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Checksum mismatch: expected {expected}, found {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        StorageError::Encoding(e.to_string())
    }
}

/// Every persisted record: one per subject, one per staker, plus the treasury
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub version: u32,
    pub taken_at: Timestamp,
    pub defaults: SubjectConfig,
    pub subjects: Vec<ResolutionEngine>,
    pub accounts: Vec<LedgerAccount>,
    pub treasury: LedgerAccount,
    pub archive: Vec<ArchivedSubject>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotEnvelope {
    version: u32,
    checksum: Vec<u8>,
    payload: Vec<u8>,
}

fn checksum(payload: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().to_vec()
}

pub fn encode_snapshot(snapshot: &RegistrySnapshot) -> Result<Vec<u8>, StorageError> {
    let payload = bincode::serialize(snapshot)?;
    let envelope = SnapshotEnvelope {
        version: snapshot.version,
        checksum: checksum(&payload),
        payload,
    };
    Ok(bincode::serialize(&envelope)?)
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<RegistrySnapshot, StorageError> {
    let envelope: SnapshotEnvelope = bincode::deserialize(bytes)?;
    if envelope.version != SNAPSHOT_VERSION {
        return Err(StorageError::UnsupportedVersion(envelope.version));
    }

    let actual = checksum(&envelope.payload);
    if actual != envelope.checksum {
        return Err(StorageError::ChecksumMismatch {
            expected: hex::encode(&envelope.checksum),
            actual: hex::encode(&actual),
        });
    }

    Ok(bincode::deserialize(&envelope.payload)?)
}

pub fn save_snapshot(path: &Path, snapshot: &RegistrySnapshot) -> Result<(), StorageError> {
    let bytes = encode_snapshot(snapshot)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &bytes)?;
    fs::rename(&tmp, path)?;

    info!(
        "Saved snapshot of {} subjects and {} accounts to {}",
        snapshot.subjects.len(),
        snapshot.accounts.len(),
        path.display()
    );
    Ok(())
}

pub fn load_snapshot(path: &Path) -> Result<RegistrySnapshot, StorageError> {
    let bytes = fs::read(path)?;
    decode_snapshot(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger_types::{StakerId, SubjectId};

    fn sample() -> RegistrySnapshot {
        let mut account = LedgerAccount::new(StakerId::from("alice"));
        account.credit(75).unwrap();
        RegistrySnapshot {
            version: SNAPSHOT_VERSION,
            taken_at: 42,
            defaults: SubjectConfig::default(),
            subjects: vec![ResolutionEngine::new(SubjectId::from("s1"), SubjectConfig::default(), 40)],
            accounts: vec![account],
            treasury: LedgerAccount::new(StakerId::from("treasury")),
            archive: Vec::new(),
        }
    }

    #[test]
    fn test_save_and_load() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ledger.snapshot");

        save_snapshot(&path, &sample())?;
        assert_eq!(load_snapshot(&path)?, sample());
        assert!(!path.with_extension("tmp").exists());
        Ok(())
    }

    #[test]
    fn test_corrupted_payload_detected() -> Result<(), StorageError> {
        let mut bytes = encode_snapshot(&sample())?;
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;

        assert!(matches!(
            decode_snapshot(&bytes),
            Err(StorageError::ChecksumMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_unknown_version_rejected() -> Result<(), StorageError> {
        let mut snapshot = sample();
        snapshot.version = 99;
        let bytes = encode_snapshot(&snapshot)?;

        assert!(matches!(decode_snapshot(&bytes), Err(StorageError::UnsupportedVersion(99))));
        Ok(())
    }
}
