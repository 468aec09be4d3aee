//! Canonical serialization, content hashing, and Ed25519 signing for spans.
//!
//! §4.2 of the core spec: a record's `curr_hash` is BLAKE3 over the
//! canonical JSON of the record with `signature`/`curr_hash`/`public_key`
//! stripped; `signature` is Ed25519 over the hash bytes. Canonicalization
//! (key-sorted, compact JSON) follows the same `sort_keys` algorithm used
//! for config hashing and audit-log hash chains elsewhere in this
//! workspace — one convention, reused everywhere a stable hash is needed.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("failed to serialize value for canonicalization: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("signing key is not valid hex or wrong length: {0}")]
    InvalidSigningKey(String),

    #[error("public key is not valid hex or wrong length: {0}")]
    InvalidPublicKey(String),

    #[error("signature is not valid hex or wrong length: {0}")]
    InvalidSignature(String),

    #[error("content hash mismatch: claimed {claimed}, recomputed {recomputed}")]
    HashMismatch { claimed: String, recomputed: String },

    #[error("signature does not verify against the given public key")]
    SignatureInvalid,
}

/// Canonicalize a JSON value: sort object keys recursively, emit compact
/// (no-whitespace) JSON. Arrays and scalars are left in place.
pub fn canonicalize(value: &Value) -> String {
    let sorted = sort_keys(value);
    // `sort_keys` only reorders object keys; serialization of an already-valid
    // `Value` cannot fail.
    serde_json::to_string(&sorted).expect("canonical json serialization cannot fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

/// Canonicalize any `Serialize` value by round-tripping it through
/// `serde_json::Value` first.
pub fn canonicalize_ser<T: Serialize>(value: &T) -> Result<String, CryptoError> {
    let raw = serde_json::to_value(value)?;
    Ok(canonicalize(&raw))
}

/// BLAKE3 content hash of a value's canonical JSON, hex-encoded.
pub fn content_hash(value: &Value) -> String {
    let canonical = canonicalize(value);
    blake3::hash(canonical.as_bytes()).to_hex().to_string()
}

pub fn content_hash_ser<T: Serialize>(value: &T) -> Result<String, CryptoError> {
    let raw = serde_json::to_value(value)?;
    Ok(content_hash(&raw))
}

/// Decode a hex-encoded Ed25519 signing (private) key.
pub fn signing_key_from_hex(hex_str: &str) -> Result<SigningKey, CryptoError> {
    let bytes = hex::decode(hex_str).map_err(|e| CryptoError::InvalidSigningKey(e.to_string()))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidSigningKey("expected 32 bytes".to_string()))?;
    Ok(SigningKey::from_bytes(&arr))
}

/// Decode a hex-encoded Ed25519 verifying (public) key.
pub fn public_key_from_hex(hex_str: &str) -> Result<VerifyingKey, CryptoError> {
    let bytes = hex::decode(hex_str).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey("expected 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&arr).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}

/// Sign a hex-encoded content hash, returning `(signature_hex, public_key_hex)`.
pub fn sign_hash_hex(signing_key: &SigningKey, curr_hash_hex: &str) -> (String, String) {
    let sig: Signature = signing_key.sign(curr_hash_hex.as_bytes());
    let pubkey = signing_key.verifying_key();
    (hex::encode(sig.to_bytes()), hex::encode(pubkey.as_bytes()))
}

/// Verify a hex-encoded Ed25519 signature over a hex-encoded content hash.
pub fn verify_hash_hex(
    public_key_hex: &str,
    curr_hash_hex: &str,
    signature_hex: &str,
) -> Result<(), CryptoError> {
    let pubkey = public_key_from_hex(public_key_hex)?;
    let sig_bytes =
        hex::decode(signature_hex).map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
    let sig_arr: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidSignature("expected 64 bytes".to_string()))?;
    let sig = Signature::from_bytes(&sig_arr);
    pubkey
        .verify(curr_hash_hex.as_bytes(), &sig)
        .map_err(|_| CryptoError::SignatureInvalid)
}

/// Remove the three proof fields so what's left can be hashed for signing
/// or re-verified against a claimed hash (§4.2). A kernel preparing to
/// sign a row and the registry re-verifying I3 on insert must strip
/// identically, or the hash will never match.
pub fn strip_proof_fields(mut value: Value) -> Value {
    if let Value::Object(map) = &mut value {
        map.remove("signature");
        map.remove("curr_hash");
        map.remove("public_key");
    }
    value
}

/// The envelope a record's signable fields must satisfy: everything except
/// `signature`/`curr_hash`/`public_key` feeds the hash; the hash feeds the
/// signature. Strip the three proof fields from `body` before calling this.
pub struct SignedEnvelope {
    pub curr_hash: String,
    pub signature: String,
    pub public_key: String,
}

/// Hash `body` (already stripped of proof fields) and sign it.
pub fn seal(signing_key: &SigningKey, body: &Value) -> SignedEnvelope {
    let curr_hash = content_hash(body);
    let (signature, public_key) = sign_hash_hex(signing_key, &curr_hash);
    SignedEnvelope {
        curr_hash,
        signature,
        public_key,
    }
}

/// Re-derive `body`'s hash and verify it matches `claimed_hash`, then verify
/// `signature` over that hash. I3 / P1 in one call.
pub fn verify_envelope(
    body: &Value,
    claimed_hash: &str,
    signature: &str,
    public_key: &str,
) -> Result<(), CryptoError> {
    let recomputed = content_hash(body);
    if recomputed != claimed_hash {
        return Err(CryptoError::HashMismatch {
            claimed: claimed_hash.to_string(),
            recomputed,
        });
    }
    verify_hash_hex(public_key, claimed_hash, signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keypair_hex() -> (SigningKey, String) {
        use rand_core::OsRng;
        let sk = SigningKey::generate(&mut OsRng);
        let pk_hex = hex::encode(sk.verifying_key().as_bytes());
        (sk, pk_hex)
    }

    #[test]
    fn canonicalize_sorts_keys_at_every_depth() {
        let a = json!({"b": 1, "a": {"d": 2, "c": 3}});
        let b = json!({"a": {"c": 3, "d": 2}, "b": 1});
        assert_eq!(canonicalize(&a), canonicalize(&b));
    }

    #[test]
    fn canonicalize_is_an_involution() {
        let v = json!({"z": [3, 1, 2], "a": {"y": 1, "x": 2}});
        let once: Value = serde_json::from_str(&canonicalize(&v)).unwrap();
        let twice = canonicalize(&once);
        assert_eq!(canonicalize(&v), twice);
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let (sk, pk_hex) = keypair_hex();
        let body = json!({"this": "run_code", "who": "edge:stage0"});
        let envelope = seal(&sk, &body);
        assert!(verify_envelope(
            &body,
            &envelope.curr_hash,
            &envelope.signature,
            &pk_hex
        )
        .is_ok());
    }

    #[test]
    fn verify_rejects_tampered_body() {
        let (sk, pk_hex) = keypair_hex();
        let body = json!({"this": "run_code"});
        let envelope = seal(&sk, &body);
        let tampered = json!({"this": "run_code_evil"});
        let err = verify_envelope(&tampered, &envelope.curr_hash, &envelope.signature, &pk_hex)
            .unwrap_err();
        assert!(matches!(err, CryptoError::HashMismatch { .. }));
    }

    #[test]
    fn verify_rejects_wrong_public_key() {
        let (sk, _pk_hex) = keypair_hex();
        let (_other_sk, other_pk_hex) = keypair_hex();
        let body = json!({"this": "run_code"});
        let envelope = seal(&sk, &body);
        let err = verify_envelope(
            &body,
            &envelope.curr_hash,
            &envelope.signature,
            &other_pk_hex,
        )
        .unwrap_err();
        assert!(matches!(err, CryptoError::SignatureInvalid));
    }
}
