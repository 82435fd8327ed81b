// SPDX-License-Identifier:

//! Asymmetric identity of a protocol role.
//!
//! One [`Identity`] per role instance: the service holds exactly one, each
//! terminal holds exactly one. The private half never leaves this struct;
//! the public half is exported as SPKI PEM for registration.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tracing::info;

use crate::error::RkiError;

/// 2048-bit modulus: large enough for PSS signatures and OAEP wrapping of a
/// 16-byte IPEK with room to spare.
pub const RSA_KEY_BITS: usize = 2048;

pub struct Identity {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl Identity {
    /// Generates a fresh RSA keypair. Failure here is fatal: without a key
    /// there is no role to play.
    pub fn generate() -> Result<Self, RkiError> {
        let private = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
            .map_err(|e| RkiError::Crypto(format!("RSA key generation failed: {e}")))?;
        let public = private.to_public_key();
        Ok(Self { private, public })
    }

    /// Loads the identity from `path`, or generates one and persists it
    /// before returning. A key file that exists but does not parse is
    /// reported as [`RkiError::KeyStoreCorrupt`], never regenerated over:
    /// silently replacing the key would invalidate a prior registration.
    pub fn load_or_generate(path: &Path) -> Result<Self, RkiError> {
        match fs::read_to_string(path) {
            Ok(pem) => {
                let private = RsaPrivateKey::from_pkcs8_pem(&pem).map_err(|e| {
                    RkiError::KeyStoreCorrupt(format!("{}: {e}", path.display()))
                })?;
                let public = private.to_public_key();
                info!(path = %path.display(), "loaded existing identity");
                Ok(Self { private, public })
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let identity = Self::generate()?;
                identity.persist(path)?;
                info!(path = %path.display(), "generated and persisted new identity");
                Ok(identity)
            }
            Err(e) => Err(RkiError::Storage(e)),
        }
    }

    fn persist(&self, path: &Path) -> Result<(), RkiError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let pem = self
            .private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| RkiError::Crypto(format!("private key encoding failed: {e}")))?;
        fs::write(path, pem.as_bytes())?;
        Ok(())
    }

    /// SPKI PEM blob of the public half, the form exchanged on the wire.
    pub fn export_public_pem(&self) -> Result<String, RkiError> {
        self.public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| RkiError::Crypto(format!("public key encoding failed: {e}")))
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }
}

/// Parses a peer's SPKI PEM blob received over the wire.
pub fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey, RkiError> {
    RsaPublicKey::from_public_key_pem(pem)
        .map_err(|e| RkiError::MalformedMessage(format!("bad public key: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_or_generate_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t1_private_key.pem");

        let first = Identity::load_or_generate(&path).unwrap();
        assert!(path.exists());

        let second = Identity::load_or_generate(&path).unwrap();
        assert_eq!(
            first.export_public_pem().unwrap(),
            second.export_public_pem().unwrap()
        );
    }

    #[test]
    fn corrupt_key_file_is_not_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t1_private_key.pem");
        fs::write(&path, "not a pem").unwrap();

        let err = Identity::load_or_generate(&path)
            .err()
            .expect("corrupt key file must not load");
        assert!(matches!(err, RkiError::KeyStoreCorrupt(_)), "{err}");
        // the corrupt file must still be there, untouched
        assert_eq!(fs::read_to_string(&path).unwrap(), "not a pem");
    }

    #[test]
    fn exported_public_pem_parses_back() {
        let identity = Identity::generate().unwrap();
        let pem = identity.export_public_pem().unwrap();
        let parsed = public_key_from_pem(&pem).unwrap();
        assert_eq!(&parsed, identity.public_key());
    }
}
