// SPDX-License-Identifier:

//! The two protocol exchanges, composed from the primitive modules.
//!
//! Each function here is a pure step of the registration or key-request
//! flow; the role drivers supply transport and durable state around them.
//! Any single failure aborts the whole exchange: no partial key material is
//! ever surfaced.

use rsa::RsaPublicKey;
use tracing::debug;

use crate::error::RkiError;
use crate::identity::Identity;
use crate::types::{
    DerivedKey, KeyInjectionRequest, KeyInjectionResponse, KeyMaterialResult, KeyRequestPayload,
    KeyResponsePayload,
};
use crate::{codec, nonce, wrap};

/// A signed key request together with the nonce the terminal must see
/// echoed in the response.
pub struct PendingKeyRequest {
    pub nonce: String,
    pub request: KeyInjectionRequest,
}

/// Terminal side: builds the signed, nonced payload
/// `{terminal_id, full_ksn, nonce}`.
pub fn build_key_request(
    identity: &Identity,
    terminal_id: &str,
    full_ksn: &str,
) -> Result<PendingKeyRequest, RkiError> {
    let nonce = nonce::new_nonce();
    let payload = KeyRequestPayload {
        terminal_id,
        full_ksn,
        nonce: &nonce,
    };
    let signature = codec::sign(identity, &payload)?;
    Ok(PendingKeyRequest {
        request: KeyInjectionRequest {
            terminal_id: terminal_id.to_owned(),
            full_ksn: full_ksn.to_owned(),
            nonce: nonce.clone(),
            signature_b64: codec::b64_encode(&signature),
        },
        nonce,
    })
}

/// Service side: checks the request signature against the terminal's
/// registered public key. Fails with [`RkiError::SignatureInvalid`] and
/// nothing else; the caller is responsible for having resolved the terminal
/// first so an unknown terminal is reported distinctly.
pub fn verify_key_request(
    terminal_public: &RsaPublicKey,
    request: &KeyInjectionRequest,
) -> Result<(), RkiError> {
    let signature = codec::b64_decode(&request.signature_b64)?;
    codec::verify(terminal_public, &KeyRequestPayload::from(request), &signature)
}

/// Service side: wraps the derived IPEK under the terminal's public key,
/// assembles the response payload with the echoed nonce, and signs the
/// entire payload with the service identity.
pub fn issue_key_response(
    service_identity: &Identity,
    terminal_public: &RsaPublicKey,
    request_nonce: &str,
    derived: &DerivedKey,
) -> Result<KeyInjectionResponse, RkiError> {
    let wrapped = wrap::wrap(terminal_public, &derived.ipek)?;
    let encrypted_ipek_b64 = codec::b64_encode(&wrapped);
    let request_id = nonce::new_request_id();

    let payload = KeyResponsePayload {
        nonce: request_nonce,
        ksn: &derived.ksn,
        kcv: &derived.kcv,
        request_id: &request_id,
        encrypted_ipek_b64: &encrypted_ipek_b64,
    };
    let signature = codec::sign(service_identity, &payload)?;

    Ok(KeyInjectionResponse {
        nonce: request_nonce.to_owned(),
        ksn: derived.ksn.clone(),
        kcv: derived.kcv.clone(),
        request_id,
        encrypted_ipek_b64,
        signature_b64: codec::b64_encode(&signature),
    })
}

/// Terminal side: validates and unwraps a key response.
///
/// Order matters: the signature over the full payload is checked first, then
/// the nonce echo (independent of and in addition to the signature), and
/// only then is the ciphertext touched. The first failure aborts the
/// exchange.
pub fn accept_key_response(
    identity: &Identity,
    service_public: &RsaPublicKey,
    sent_nonce: &str,
    response: &KeyInjectionResponse,
) -> Result<KeyMaterialResult, RkiError> {
    let signature = codec::b64_decode(&response.signature_b64)?;
    codec::verify(service_public, &KeyResponsePayload::from(response), &signature)?;
    nonce::check_echoed(sent_nonce, &response.nonce)?;

    let ciphertext = codec::b64_decode(&response.encrypted_ipek_b64)?;
    let ipek = wrap::unwrap(identity.private_key(), &ciphertext)?;
    debug!(ksn = %response.ksn, request_id = %response.request_id, "key response accepted");

    Ok(KeyMaterialResult {
        ipek_hex: hex::encode_upper(ipek),
        ksn: response.ksn.clone(),
        kcv: response.kcv.clone(),
        request_id: response.request_id.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn derived_fixture() -> DerivedKey {
        DerivedKey {
            ipek: vec![0xAB; 16],
            ksn: "KSN1".into(),
            kcv: "ABCD".into(),
        }
    }

    #[test]
    fn full_exchange_round_trips() {
        let terminal = Identity::generate().unwrap();
        let service = Identity::generate().unwrap();

        let pending = build_key_request(&terminal, "T1", "KSN0").unwrap();
        verify_key_request(terminal.public_key(), &pending.request).unwrap();

        let response =
            issue_key_response(&service, terminal.public_key(), &pending.request.nonce, &derived_fixture())
                .unwrap();
        let result =
            accept_key_response(&terminal, service.public_key(), &pending.nonce, &response).unwrap();

        assert_eq!(result.ipek_hex, hex::encode_upper([0xAB; 16]));
        assert_eq!(result.ksn, "KSN1");
        assert_eq!(result.kcv, "ABCD");
        assert!(!result.request_id.is_empty());
    }

    #[test]
    fn request_signed_by_other_key_is_rejected() {
        let terminal = Identity::generate().unwrap();
        let impostor = Identity::generate().unwrap();

        let pending = build_key_request(&impostor, "T1", "KSN0").unwrap();
        let err = verify_key_request(terminal.public_key(), &pending.request).unwrap_err();
        assert!(matches!(err, RkiError::SignatureInvalid));
    }

    #[test]
    fn tampered_response_field_is_rejected_before_unwrap() {
        let terminal = Identity::generate().unwrap();
        let service = Identity::generate().unwrap();

        let pending = build_key_request(&terminal, "T1", "KSN0").unwrap();
        let mut response =
            issue_key_response(&service, terminal.public_key(), &pending.nonce, &derived_fixture())
                .unwrap();
        // man-in-the-middle alters the KSN after signing
        response.ksn = "KSN9".into();

        let err = accept_key_response(&terminal, service.public_key(), &pending.nonce, &response)
            .unwrap_err();
        assert!(matches!(err, RkiError::SignatureInvalid));
    }

    #[test]
    fn altered_nonce_is_rejected_even_with_a_valid_signature() {
        let terminal = Identity::generate().unwrap();
        let service = Identity::generate().unwrap();

        let pending = build_key_request(&terminal, "T1", "KSN0").unwrap();
        // a response legitimately signed by the service, but for a nonce the
        // terminal never sent (replayed or misrouted)
        let response =
            issue_key_response(&service, terminal.public_key(), "stale-nonce", &derived_fixture())
                .unwrap();

        let err = accept_key_response(&terminal, service.public_key(), &pending.nonce, &response)
            .unwrap_err();
        assert!(matches!(err, RkiError::NonceMismatch));
    }

    #[test]
    fn wrapped_key_is_undecryptable_by_other_terminals() {
        let terminal = Identity::generate().unwrap();
        let eavesdropper = Identity::generate().unwrap();
        let service = Identity::generate().unwrap();

        let pending = build_key_request(&terminal, "T1", "KSN0").unwrap();
        let response =
            issue_key_response(&service, terminal.public_key(), &pending.nonce, &derived_fixture())
                .unwrap();

        let err =
            accept_key_response(&eavesdropper, service.public_key(), &pending.nonce, &response)
                .unwrap_err();
        assert!(matches!(err, RkiError::DecryptionFailed));
    }
}
