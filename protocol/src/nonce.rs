// SPDX-License-Identifier:

//! Per-request freshness tokens and the one-shot echo check.
//!
//! Freshness is purely request/response-paired: the terminal remembers the
//! nonce it sent and accepts a response only if the echoed nonce matches.
//! There is no server-side nonce store.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::RkiError;

const TOKEN_BYTES: usize = 16;

fn random_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// 128 bits of entropy, hex-rendered. Unique per key-request attempt.
pub fn new_nonce() -> String {
    random_token()
}

/// Correlation id the service attaches to each signed response.
pub fn new_request_id() -> String {
    random_token()
}

/// A mismatch is fatal for the exchange: the response must be discarded and
/// no key material it carries may be trusted.
pub fn check_echoed(sent: &str, received: &str) -> Result<(), RkiError> {
    if sent == received {
        Ok(())
    } else {
        Err(RkiError::NonceMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonces_are_unique_and_sized() {
        let a = new_nonce();
        let b = new_nonce();
        assert_ne!(a, b);
        assert_eq!(a.len(), TOKEN_BYTES * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn echo_check_accepts_match() {
        let n = new_nonce();
        check_echoed(&n, &n.clone()).unwrap();
    }

    #[test]
    fn echo_check_rejects_mismatch() {
        let err = check_echoed("n1", "n2").unwrap_err();
        assert!(matches!(err, RkiError::NonceMismatch));
    }
}
