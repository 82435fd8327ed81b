// SPDX-License-Identifier:

//! Canonical payload encoding and detached RSA-PSS signatures.
//!
//! Signer and verifier must hash byte-identical bytes, so payloads are
//! rendered as compact JSON with object keys sorted lexicographically at
//! every nesting level, regardless of field insertion order. Any divergence
//! here causes universal verification failure, which makes this the most
//! load-bearing code in the protocol.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use rand::rngs::OsRng;
use rsa::pss::{BlindedSigningKey, Signature, VerifyingKey};
use rsa::sha2::Sha256;
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::RsaPublicKey;
use serde::Serialize;
use serde_json::Value;

use crate::error::RkiError;
use crate::identity::Identity;

/// Renders `payload` in the canonical form that signatures cover.
pub fn canonical_bytes<T: Serialize>(payload: &T) -> Result<Vec<u8>, RkiError> {
    let value = serde_json::to_value(payload)
        .map_err(|e| RkiError::MalformedMessage(format!("payload not serializable: {e}")))?;
    let mut out = Vec::new();
    write_canonical(&value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) -> Result<(), RkiError> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                out.extend(encode_leaf(&Value::String((*key).clone()))?);
                out.push(b':');
                write_canonical(&map[*key], out)?;
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out)?;
            }
            out.push(b']');
        }
        leaf => out.extend(encode_leaf(leaf)?),
    }
    Ok(())
}

fn encode_leaf(value: &Value) -> Result<Vec<u8>, RkiError> {
    serde_json::to_vec(value)
        .map_err(|e| RkiError::MalformedMessage(format!("payload not serializable: {e}")))
}

/// Signs the canonical encoding of `payload` with RSA-PSS-SHA256. The
/// padding salt is random, so two signatures over the same payload differ.
pub fn sign<T: Serialize>(identity: &Identity, payload: &T) -> Result<Vec<u8>, RkiError> {
    let message = canonical_bytes(payload)?;
    let signing_key = BlindedSigningKey::<Sha256>::new(identity.private_key().clone());
    let signature = signing_key.sign_with_rng(&mut OsRng, &message);
    Ok(signature.to_vec())
}

/// Verifies a detached signature over the canonical encoding of `payload`.
/// Every failure mode collapses to [`RkiError::SignatureInvalid`]; callers
/// must treat it as a hard rejection of the whole envelope.
pub fn verify<T: Serialize>(
    public_key: &RsaPublicKey,
    payload: &T,
    signature: &[u8],
) -> Result<(), RkiError> {
    let message = canonical_bytes(payload)?;
    let signature = Signature::try_from(signature).map_err(|_| RkiError::SignatureInvalid)?;
    VerifyingKey::<Sha256>::new(public_key.clone())
        .verify(&message, &signature)
        .map_err(|_| RkiError::SignatureInvalid)
}

pub fn b64_encode(data: &[u8]) -> String {
    B64.encode(data)
}

pub fn b64_decode(s: &str) -> Result<Vec<u8>, RkiError> {
    B64.decode(s)
        .map_err(|e| RkiError::MalformedMessage(format!("bad base64: {e}")))
}
