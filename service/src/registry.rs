// SPDX-License-Identifier:

//! Durable mapping from terminal id to registered public key and current
//! KSN state.
//!
//! The mutex guards the map; KSN advancement is additionally a
//! compare-and-swap keyed on the KSN the issuance was derived from, so two
//! concurrent requests for the same terminal can never both be issued
//! against the same KSN value. The loser of the race fails whole, with no
//! state change.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::info;

use rki_protocol::RkiError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalRecord {
    pub public_key_pem: String,
    pub current_ksn: String,
}

#[derive(Debug)]
pub struct Registry {
    path: PathBuf,
    records: Mutex<HashMap<String, TerminalRecord>>,
}

impl Registry {
    /// Opens the registry file, starting empty if it does not exist yet. A
    /// file that exists but does not parse is a corrupt store, reported as
    /// such rather than silently emptied.
    pub fn open(path: &Path) -> Result<Self, RkiError> {
        let records = match fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| RkiError::KeyStoreCorrupt(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(RkiError::Storage(e)),
        };
        Ok(Self {
            path: path.to_owned(),
            records: Mutex::new(records),
        })
    }

    /// Binds `terminal_id` to `public_key_pem` and assigns its initial KSN.
    ///
    /// Re-registration with the identical key is idempotent and returns the
    /// current KSN; a different key is a [`RkiError::TerminalConflict`].
    pub fn register(&self, terminal_id: &str, public_key_pem: &str) -> Result<String, RkiError> {
        let mut records = self.lock()?;
        match records.get(terminal_id) {
            Some(record) if record.public_key_pem == public_key_pem => {
                info!(terminal_id, "re-registration with identical key");
                Ok(record.current_ksn.clone())
            }
            Some(_) => Err(RkiError::TerminalConflict(terminal_id.to_owned())),
            None => {
                let ksn = initial_ksn();
                records.insert(
                    terminal_id.to_owned(),
                    TerminalRecord {
                        public_key_pem: public_key_pem.to_owned(),
                        current_ksn: ksn.clone(),
                    },
                );
                self.persist(&records)?;
                info!(terminal_id, %ksn, "terminal registered");
                Ok(ksn)
            }
        }
    }

    /// Fails with [`RkiError::UnknownTerminal`] when absent; callers surface
    /// that distinctly so a terminal knows to register first.
    pub fn lookup(&self, terminal_id: &str) -> Result<TerminalRecord, RkiError> {
        let records = self.lock()?;
        records
            .get(terminal_id)
            .cloned()
            .ok_or_else(|| RkiError::UnknownTerminal(terminal_id.to_owned()))
    }

    /// Stores the KSN returned by the derivation authority. Called only
    /// after a full issuance (wrap and sign included) has succeeded, so a
    /// request abandoned mid-flight never skips a KSN.
    ///
    /// Compare-and-swap: `from_ksn` is the KSN the issuance derived from.
    /// If the stored KSN no longer matches, a concurrent issuance for the
    /// same terminal already advanced it; this one fails whole with
    /// [`RkiError::KsnConflict`] and its response must not reach the
    /// terminal.
    pub fn advance_ksn(
        &self,
        terminal_id: &str,
        from_ksn: &str,
        to_ksn: &str,
    ) -> Result<(), RkiError> {
        let mut records = self.lock()?;
        let record = records
            .get_mut(terminal_id)
            .ok_or_else(|| RkiError::UnknownTerminal(terminal_id.to_owned()))?;
        if record.current_ksn != from_ksn {
            return Err(RkiError::KsnConflict(terminal_id.to_owned()));
        }
        record.current_ksn = to_ksn.to_owned();
        self.persist(&records)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, TerminalRecord>>, RkiError> {
        self.records
            .lock()
            .map_err(|_| RkiError::Storage(std::io::Error::other("registry mutex poisoned")))
    }

    fn persist(&self, records: &HashMap<String, TerminalRecord>) -> Result<(), RkiError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(records)
            .map_err(|e| RkiError::Storage(std::io::Error::other(e)))?;
        fs::write(&self.path, raw)?;
        Ok(())
    }
}

/// Fresh 20-hex-digit KSN: fixed key-set prefix, random device field, zeroed
/// transaction counter. The derivation authority owns every advancement
/// after this seed.
fn initial_ksn() -> String {
    let mut device = [0u8; 5];
    OsRng.fill_bytes(&mut device);
    format!("FFFF{}000000", hex::encode_upper(device))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(&dir.path().join("terminals.json")).unwrap();
        (dir, registry)
    }

    #[test]
    fn register_assigns_a_fresh_ksn() {
        let (_dir, registry) = open_temp();
        let ksn = registry.register("T1", "PEM1").unwrap();
        assert_eq!(ksn.len(), 20);
        assert!(ksn.starts_with("FFFF"));
        assert!(ksn.ends_with("000000"));
        assert_eq!(registry.lookup("T1").unwrap().current_ksn, ksn);
    }

    #[test]
    fn re_registration_with_identical_key_is_idempotent() {
        let (_dir, registry) = open_temp();
        let first = registry.register("T1", "PEM1").unwrap();
        let second = registry.register("T1", "PEM1").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn re_registration_with_different_key_conflicts() {
        let (_dir, registry) = open_temp();
        registry.register("T1", "PEM1").unwrap();
        let err = registry.register("T1", "PEM2").unwrap_err();
        assert!(matches!(err, RkiError::TerminalConflict(_)));
        // the original binding survives the rejected attempt
        assert_eq!(registry.lookup("T1").unwrap().public_key_pem, "PEM1");
    }

    #[test]
    fn lookup_of_unregistered_terminal_is_distinct() {
        let (_dir, registry) = open_temp();
        let err = registry.lookup("nobody").unwrap_err();
        assert!(matches!(err, RkiError::UnknownTerminal(_)));
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("terminals.json");

        let ksn = {
            let registry = Registry::open(&path).unwrap();
            let ksn = registry.register("T1", "PEM1").unwrap();
            registry
                .advance_ksn("T1", &ksn, "FFFF0000000000000001")
                .unwrap();
            ksn
        };

        let reopened = Registry::open(&path).unwrap();
        let record = reopened.lookup("T1").unwrap();
        assert_eq!(record.public_key_pem, "PEM1");
        assert_eq!(record.current_ksn, "FFFF0000000000000001");
        assert_ne!(record.current_ksn, ksn);
    }

    #[test]
    fn advancement_from_a_stale_ksn_is_rejected() {
        let (_dir, registry) = open_temp();
        let ksn = registry.register("T1", "PEM1").unwrap();
        registry
            .advance_ksn("T1", &ksn, "FFFF0000000000000001")
            .unwrap();

        // a second issuance that derived from the now-stale seed loses
        let err = registry
            .advance_ksn("T1", &ksn, "FFFF0000000000000002")
            .unwrap_err();
        assert!(matches!(err, RkiError::KsnConflict(_)), "{err}");
        assert_eq!(
            registry.lookup("T1").unwrap().current_ksn,
            "FFFF0000000000000001"
        );
    }

    #[test]
    fn corrupt_registry_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("terminals.json");
        fs::write(&path, "{ not json").unwrap();
        let err = Registry::open(&path).unwrap_err();
        assert!(matches!(err, RkiError::KeyStoreCorrupt(_)));
    }
}
