// SPDX-License-Identifier:

//! Wire messages and signed-payload views.
//!
//! Decoding is strict: unknown fields in untrusted RKI payloads are rejected
//! rather than silently filtered, and missing required fields fail the whole
//! message.

use serde::{Deserialize, Serialize};

use crate::error::RkiError;

/// Registration request. Sent unsigned: no shared trust exists yet, and the
/// caller is vouched for by the authorization collaborator instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterTerminalRequest {
    pub terminal_id: String,
    pub public_key_pem: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterTerminalResponse {
    pub service_public_key_pem: String,
    pub full_ksn: String,
}

/// Signed key request: `signature_b64` covers the canonical encoding of
/// [`KeyRequestPayload`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyInjectionRequest {
    pub terminal_id: String,
    pub full_ksn: String,
    pub nonce: String,
    pub signature_b64: String,
}

/// Signed key response: `signature_b64` covers the canonical encoding of
/// [`KeyResponsePayload`], i.e. every other field of this message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyInjectionResponse {
    pub nonce: String,
    pub ksn: String,
    pub kcv: String,
    pub request_id: String,
    pub encrypted_ipek_b64: String,
    pub signature_b64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// The portion of a [`KeyInjectionRequest`] that the terminal signs.
#[derive(Serialize)]
pub struct KeyRequestPayload<'a> {
    pub terminal_id: &'a str,
    pub full_ksn: &'a str,
    pub nonce: &'a str,
}

impl<'a> From<&'a KeyInjectionRequest> for KeyRequestPayload<'a> {
    fn from(request: &'a KeyInjectionRequest) -> Self {
        Self {
            terminal_id: &request.terminal_id,
            full_ksn: &request.full_ksn,
            nonce: &request.nonce,
        }
    }
}

/// The portion of a [`KeyInjectionResponse`] that the service signs.
#[derive(Serialize)]
pub struct KeyResponsePayload<'a> {
    pub nonce: &'a str,
    pub ksn: &'a str,
    pub kcv: &'a str,
    pub request_id: &'a str,
    pub encrypted_ipek_b64: &'a str,
}

impl<'a> From<&'a KeyInjectionResponse> for KeyResponsePayload<'a> {
    fn from(response: &'a KeyInjectionResponse) -> Self {
        Self {
            nonce: &response.nonce,
            ksn: &response.ksn,
            kcv: &response.kcv,
            request_id: &response.request_id,
            encrypted_ipek_b64: &response.encrypted_ipek_b64,
        }
    }
}

/// Opaque result of the external key-derivation authority: raw IPEK bytes
/// for the terminal's current KSN, the advanced KSN, and the check value.
#[derive(Debug)]
pub struct DerivedKey {
    pub ipek: Vec<u8>,
    pub ksn: String,
    pub kcv: String,
}

/// The terminal's final output of a successful key request. Owned by the
/// caller of this library once returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterialResult {
    pub ipek_hex: String,
    pub ksn: String,
    pub kcv: String,
    pub request_id: String,
}

pub fn to_json<T: Serialize>(message: &T) -> Result<String, RkiError> {
    serde_json::to_string(message)
        .map_err(|e| RkiError::MalformedMessage(format!("encode failed: {e}")))
}

pub fn from_json<'a, T: Deserialize<'a>>(s: &'a str) -> Result<T, RkiError> {
    serde_json::from_str(s).map_err(|e| RkiError::MalformedMessage(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_are_rejected() {
        let raw = r#"{"terminal_id":"T1","public_key_pem":"pem","extra":"x"}"#;
        let err = from_json::<RegisterTerminalRequest>(raw).unwrap_err();
        assert!(matches!(err, RkiError::MalformedMessage(_)));
    }

    #[test]
    fn missing_fields_are_rejected() {
        let raw = r#"{"terminal_id":"T1","full_ksn":"KSN0"}"#;
        let err = from_json::<KeyInjectionRequest>(raw).unwrap_err();
        assert!(matches!(err, RkiError::MalformedMessage(_)));
    }

    #[test]
    fn key_request_round_trips() {
        let request = KeyInjectionRequest {
            terminal_id: "T1".into(),
            full_ksn: "KSN0".into(),
            nonce: "n1".into(),
            signature_b64: "c2ln".into(),
        };
        let encoded = to_json(&request).unwrap();
        let decoded: KeyInjectionRequest = from_json(&encoded).unwrap();
        assert_eq!(decoded.terminal_id, request.terminal_id);
        assert_eq!(decoded.nonce, request.nonce);
    }
}
