// SPDX-License-Identifier:

//! External collaborators of the key-issuing service.
//!
//! Caller authorization (bearer credential -> verified caller) and IPEK
//! derivation both live behind traits: production talks HTTP to the
//! credentialing and key-derivation services, local development and tests
//! use the in-process stand-ins. Collaborator replies are trusted once
//! obtained; their unavailability is always surfaced as
//! [`RkiError::UpstreamUnavailable`].

use std::collections::HashMap;
use std::io::Read;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;
use ureq::Agent;

use rki_protocol::types::DerivedKey;
use rki_protocol::RkiError;

/// Verified caller identity resolved from a bearer api key.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub merchant_id: String,
}

pub trait CallerAuthorization: Send + Sync {
    fn authorize(&self, api_key: &str) -> Result<CallerIdentity, RkiError>;
}

pub trait KeyDerivation: Send + Sync {
    /// Obtains fresh raw IPEK bytes for the terminal's current KSN, plus the
    /// advanced KSN and key-check value. The result is opaque to this core.
    fn derive_ipek(&self, terminal_id: &str, current_ksn: &str) -> Result<DerivedKey, RkiError>;
}

/// Credentialing service client.
pub struct HttpAuthorization {
    agent: Agent,
    url: String,
}

#[derive(Deserialize)]
struct AuthorizationReply {
    authorized: bool,
    #[serde(default)]
    merchant_id: String,
}

impl HttpAuthorization {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            agent: ureq::agent(),
            url: url.into(),
        }
    }
}

impl CallerAuthorization for HttpAuthorization {
    fn authorize(&self, api_key: &str) -> Result<CallerIdentity, RkiError> {
        let body = serde_json::json!({ "auth_key": api_key }).to_string();
        let mut resp = self
            .agent
            .post(&self.url)
            .header("authorization", format!("Bearer {api_key}"))
            .content_type("application/json")
            .send(body.as_str())
            .map_err(|e| RkiError::UpstreamUnavailable(format!("authorization: {e}")))?;

        let mut raw = String::new();
        resp.body_mut()
            .as_reader()
            .read_to_string(&mut raw)
            .map_err(|e| RkiError::UpstreamUnavailable(format!("authorization: {e}")))?;
        let reply: AuthorizationReply = serde_json::from_str(&raw)
            .map_err(|e| RkiError::UpstreamUnavailable(format!("authorization reply: {e}")))?;

        if !reply.authorized {
            return Err(RkiError::NotAuthorized);
        }
        Ok(CallerIdentity {
            merchant_id: reply.merchant_id,
        })
    }
}

/// Fixed api-key allowlist for local runs and tests.
pub struct StaticAuthorization {
    keys: HashMap<String, String>,
}

impl StaticAuthorization {
    pub fn new(keys: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }
}

impl CallerAuthorization for StaticAuthorization {
    fn authorize(&self, api_key: &str) -> Result<CallerIdentity, RkiError> {
        self.keys
            .get(api_key)
            .map(|merchant_id| CallerIdentity {
                merchant_id: merchant_id.clone(),
            })
            .ok_or(RkiError::NotAuthorized)
    }
}

/// Key-derivation authority client.
pub struct HttpKeyDerivation {
    agent: Agent,
    url: String,
}

#[derive(Deserialize)]
struct DerivationReply {
    ipek: String,
    ksn: String,
    kcv: String,
}

impl HttpKeyDerivation {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            agent: ureq::agent(),
            url: url.into(),
        }
    }
}

impl KeyDerivation for HttpKeyDerivation {
    fn derive_ipek(&self, terminal_id: &str, current_ksn: &str) -> Result<DerivedKey, RkiError> {
        let body = serde_json::json!({
            "terminal_id": terminal_id,
            "full_ksn": current_ksn,
        })
        .to_string();
        let mut resp = self
            .agent
            .post(&self.url)
            .content_type("application/json")
            .send(body.as_str())
            .map_err(|e| RkiError::UpstreamUnavailable(format!("key derivation: {e}")))?;

        let mut raw = String::new();
        resp.body_mut()
            .as_reader()
            .read_to_string(&mut raw)
            .map_err(|e| RkiError::UpstreamUnavailable(format!("key derivation: {e}")))?;
        let reply: DerivationReply = serde_json::from_str(&raw)
            .map_err(|e| RkiError::UpstreamUnavailable(format!("derivation reply: {e}")))?;

        let ipek = hex::decode(&reply.ipek)
            .map_err(|e| RkiError::UpstreamUnavailable(format!("derivation reply ipek: {e}")))?;
        debug!(terminal_id, ksn = %reply.ksn, "obtained IPEK from derivation authority");
        Ok(DerivedKey {
            ipek,
            ksn: reply.ksn,
            kcv: reply.kcv,
        })
    }
}

/// In-process stand-in for the derivation authority: random 16-byte IPEK,
/// counter-advanced KSN, SHA-256-derived check value. For development and
/// tests only; it deliberately implements no real DUKPT derivation.
pub struct LocalKeyDerivation;

impl KeyDerivation for LocalKeyDerivation {
    fn derive_ipek(&self, _terminal_id: &str, current_ksn: &str) -> Result<DerivedKey, RkiError> {
        let mut ipek = vec![0u8; 16];
        OsRng.fill_bytes(&mut ipek);
        let kcv = hex::encode_upper(&Sha256::digest(&ipek)[..3]);
        Ok(DerivedKey {
            ipek,
            ksn: advance_counter(current_ksn)?,
            kcv,
        })
    }
}

/// Increments the 6-hex-digit transaction counter at the tail of a KSN.
fn advance_counter(ksn: &str) -> Result<String, RkiError> {
    if ksn.len() < 6 || !ksn.is_ascii() {
        return Err(RkiError::UpstreamUnavailable(format!("malformed KSN: {ksn}")));
    }
    let (head, counter) = ksn.split_at(ksn.len() - 6);
    let value = u32::from_str_radix(counter, 16)
        .map_err(|_| RkiError::UpstreamUnavailable(format!("malformed KSN counter: {ksn}")))?;
    if value >= 0xFF_FFFF {
        return Err(RkiError::UpstreamUnavailable(format!(
            "KSN counter exhausted: {ksn}"
        )));
    }
    Ok(format!("{head}{:06X}", value + 1))
}
