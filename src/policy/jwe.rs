//! JWE serialization handling.
//!
//! Clevis emits compact JWEs; LUKS2 tokens keep them in flattened JSON form.
//! Only the format is touched here, never the cryptography.

use crate::error::{ClevisError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

const COMPACT_PARTS: [&str; 5] = ["protected", "encrypted_key", "iv", "ciphertext", "tag"];

pub fn b64_encode(bytes: impl AsRef<[u8]>) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn b64_decode(encoded: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(encoded.trim().trim_end_matches('='))
        .map_err(|e| ClevisError::MalformedMetadata(format!("invalid base64url: {e}")))
}

fn compact_parts(jwe: &str) -> Result<Vec<&str>> {
    let parts: Vec<&str> = jwe.trim().split('.').collect();
    if parts.len() != COMPACT_PARTS.len() || parts[0].is_empty() {
        return Err(ClevisError::MalformedMetadata(format!(
            "expected a compact JWE with {} parts, found {}",
            COMPACT_PARTS.len(),
            parts.len()
        )));
    }
    Ok(parts)
}

/// Decoded protected header of a compact JWE.
pub fn protected_header(jwe: &str) -> Result<Value> {
    let protected = compact_parts(jwe)?[0];
    let header: Value = serde_json::from_slice(&b64_decode(protected)?)
        .map_err(|e| ClevisError::MalformedMetadata(format!("JWE protected header: {e}")))?;
    if !header.is_object() {
        return Err(ClevisError::MalformedMetadata(
            "JWE protected header is not a JSON object".into(),
        ));
    }
    Ok(header)
}

pub fn compact_to_json(jwe: &str) -> Result<Value> {
    let parts = compact_parts(jwe)?;
    let mut object = Map::new();
    for (name, part) in COMPACT_PARTS.iter().zip(parts) {
        if *name == "encrypted_key" && part.is_empty() {
            continue;
        }
        object.insert(name.to_string(), Value::String(part.to_string()));
    }
    Ok(Value::Object(object))
}

pub fn json_to_compact(jwe: &Value) -> Result<String> {
    let object = jwe
        .as_object()
        .ok_or_else(|| ClevisError::MalformedMetadata("JWE is not a JSON object".into()))?;
    if let Some(field) = ["header", "unprotected", "recipients", "aad"]
        .iter()
        .find(|f| object.contains_key(**f))
    {
        return Err(ClevisError::MalformedMetadata(format!(
            "JWE with `{field}` has no compact serialization"
        )));
    }
    let parts = COMPACT_PARTS
        .iter()
        .map(|name| match object.get(*name) {
            Some(Value::String(part)) => Ok(part.as_str()),
            None if *name == "encrypted_key" => Ok(""),
            _ => Err(ClevisError::MalformedMetadata(format!(
                "JWE is missing `{name}`"
            ))),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(parts.join("."))
}

/// Short, non-secret identifier of a blob for log lines.
pub fn blob_id(jwe: &str) -> String {
    hex::encode(&Sha256::digest(jwe.trim().as_bytes())[..6])
}
