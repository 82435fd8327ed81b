// SPDX-License-Identifier:

//! RSA-OAEP wrapping of raw IPEK bytes under the terminal's public key.
//!
//! Plaintext key bytes exist only transiently in memory on either side of
//! these calls; they are never persisted and never logged.

use rand::rngs::OsRng;
use rsa::sha2::Sha256;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use tracing::debug;

use crate::error::RkiError;

/// Encrypts `key_bytes` under `public_key` with OAEP-SHA256. The padding is
/// randomized, so repeated wraps of the same key yield different ciphertext.
pub fn wrap(public_key: &RsaPublicKey, key_bytes: &[u8]) -> Result<Vec<u8>, RkiError> {
    public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), key_bytes)
        .map_err(|e| RkiError::Crypto(format!("key wrap failed: {e}")))
}

/// Decrypts a wrapped key with the terminal's private key.
///
/// Wrong key, truncated ciphertext and corrupt padding are indistinguishable
/// to the caller: all of them surface as [`RkiError::DecryptionFailed`]. The
/// underlying cause is only visible in debug logs.
pub fn unwrap(private_key: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>, RkiError> {
    private_key
        .decrypt(Oaep::new::<Sha256>(), ciphertext)
        .map_err(|e| {
            debug!(cause = %e, "IPEK unwrap failed");
            RkiError::DecryptionFailed
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    #[test]
    fn wrap_unwrap_round_trip() {
        let identity = Identity::generate().unwrap();
        let ipek = [0x5Au8; 16];
        let wrapped = wrap(identity.public_key(), &ipek).unwrap();
        let unwrapped = unwrap(identity.private_key(), &wrapped).unwrap();
        assert_eq!(unwrapped, ipek);
    }

    #[test]
    fn wrapping_is_randomized() {
        let identity = Identity::generate().unwrap();
        let ipek = [0x5Au8; 16];
        let first = wrap(identity.public_key(), &ipek).unwrap();
        let second = wrap(identity.public_key(), &ipek).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn unwrap_under_wrong_key_fails_uniformly() {
        let sender = Identity::generate().unwrap();
        let other = Identity::generate().unwrap();
        let wrapped = wrap(sender.public_key(), &[1u8; 16]).unwrap();
        let err = unwrap(other.private_key(), &wrapped).unwrap_err();
        assert!(matches!(err, RkiError::DecryptionFailed));
    }

    #[test]
    fn corrupt_ciphertext_fails_uniformly() {
        let identity = Identity::generate().unwrap();
        let mut wrapped = wrap(identity.public_key(), &[1u8; 16]).unwrap();
        let last = wrapped.len() - 1;
        wrapped[last] ^= 0xFF;
        let err = unwrap(identity.private_key(), &wrapped).unwrap_err();
        assert!(matches!(err, RkiError::DecryptionFailed));
    }
}
