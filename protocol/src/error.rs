// SPDX-License-Identifier:

use thiserror::Error;

/// Protocol failures, one variant per rejection cause.
///
/// `SignatureInvalid`, `NonceMismatch` and `DecryptionFailed` are kept apart
/// for logs and tests, but a network peer only ever sees the uniform
/// "request rejected" rendering (see the service front end). None of these
/// are retried by the core; retries belong to the calling transport layer.
#[derive(Debug, Error)]
pub enum RkiError {
    #[error("unknown terminal: {0}")]
    UnknownTerminal(String),

    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("response nonce does not match the request nonce")]
    NonceMismatch,

    #[error("key unwrap failed")]
    DecryptionFailed,

    #[error("terminal {0} is already registered with a different public key")]
    TerminalConflict(String),

    #[error("KSN state for terminal {0} advanced during issuance")]
    KsnConflict(String),

    #[error("upstream dependency unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("caller is not authorized to perform this action")]
    NotAuthorized,

    #[error("key store is corrupt: {0}")]
    KeyStoreCorrupt(String),

    #[error("storage failure: {0}")]
    Storage(#[from] std::io::Error),

    #[error("cryptographic operation failed: {0}")]
    Crypto(String),
}
