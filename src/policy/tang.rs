//! Tang advertisements: fetching, key extraction and thumbprints.

use super::jwe::{b64_decode, b64_encode};
use super::KeySet;
use crate::error::{ClevisError, Result};
use crate::host::AdvertisementFetcher;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// A server's published key set.
///
/// Either the signed JWS served on `/adv` (`{payload, protected,
/// signatures}`) or the bare JWK set clevis embeds in a tang binding.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement(Value);

impl Advertisement {
    pub fn from_value(value: Value) -> Result<Self> {
        let adv = Self(value);
        adv.keys()?;
        Ok(adv)
    }

    pub fn keys(&self) -> Result<Vec<Value>> {
        let malformed =
            |what: &str| ClevisError::MalformedMetadata(format!("advertisement {what}"));
        let jwks = match self.0.get("payload") {
            Some(Value::String(payload)) => serde_json::from_slice(&b64_decode(payload)?)
                .map_err(|e| malformed(&format!("payload is not JSON: {e}")))?,
            Some(_) => return Err(malformed("payload is not a string")),
            None => self.0.clone(),
        };
        match jwks.get("keys") {
            Some(Value::Array(keys)) => Ok(keys.clone()),
            _ => Err(malformed("has no keys")),
        }
    }

    pub fn thumbprints(&self) -> Result<KeySet> {
        let mut set = KeySet::new();
        for key in self.keys()? {
            match thumbprint(&key) {
                Ok(thp) => {
                    set.insert(thp);
                }
                Err(e) => log::warn!("skipping advertised key: {}", e),
            }
        }
        Ok(set)
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

/// RFC 7638 JWK thumbprint, SHA-256, base64url.
pub fn thumbprint(jwk: &Value) -> Result<String> {
    let kty = jwk
        .get("kty")
        .and_then(Value::as_str)
        .ok_or_else(|| ClevisError::MalformedMetadata("JWK without kty".into()))?;
    let required: &[&str] = match kty {
        "EC" => &["crv", "kty", "x", "y"],
        "RSA" => &["e", "kty", "n"],
        "OKP" => &["crv", "kty", "x"],
        "oct" => &["k", "kty"],
        other => {
            return Err(ClevisError::MalformedMetadata(format!(
                "unsupported JWK type `{other}`"
            )))
        }
    };
    // serde_json's map is ordered, which gives the lexicographic member order.
    let mut members = Map::new();
    for name in required {
        let value = jwk.get(*name).ok_or_else(|| {
            ClevisError::MalformedMetadata(format!("{kty} JWK without `{name}`"))
        })?;
        members.insert(name.to_string(), value.clone());
    }
    let canonical = serde_json::to_string(&Value::Object(members))?;
    Ok(b64_encode(Sha256::digest(canonical.as_bytes())))
}

pub fn advertisement_url(server: &str) -> String {
    let server = server.trim_end_matches('/');
    if server.starts_with("http") {
        format!("{server}/adv")
    } else {
        format!("http://{server}/adv")
    }
}

/// Fetches advertisements over HTTP. No retries.
#[derive(Debug, Clone)]
pub struct TangClient {
    client: reqwest::blocking::Client,
}

impl TangClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }
}

impl AdvertisementFetcher for TangClient {
    fn fetch(&self, server: &str) -> Result<Advertisement> {
        let url = advertisement_url(server);
        let failure = |reason: String| ClevisError::NetworkFetchFailure {
            url: url.clone(),
            reason,
        };
        log::debug!("downloading advertisement from {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| failure(e.to_string()))?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(failure(format!("HTTP status {}", response.status())));
        }
        let body: Value = response.json().map_err(|e| failure(e.to_string()))?;
        Advertisement::from_value(body).map_err(|e| failure(e.to_string()))
    }
}
