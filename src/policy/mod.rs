//! Clevis policies: what a binding's secret is encrypted to.
//!
//! A policy is built from the desired servers before binding and decoded
//! back out of an existing blob's protected header, so the two can be
//! compared.

use crate::error::{ClevisError, Result};
use crate::host::AdvertisementFetcher;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

pub mod jwe;
pub mod tang;

use tang::Advertisement;

/// Thumbprints of advertised server keys.
pub type KeySet = BTreeSet<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Pin {
    Tang,
    Tpm2,
    Sss,
}

impl Pin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tang => "tang",
            Self::Tpm2 => "tpm2",
            Self::Sss => "sss",
        }
    }
}

impl FromStr for Pin {
    type Err = ClevisError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tang" => Ok(Self::Tang),
            "tpm2" => Ok(Self::Tpm2),
            "sss" => Ok(Self::Sss),
            other => Err(ClevisError::UnsupportedPin(other.to_string())),
        }
    }
}

impl fmt::Display for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TangConfig {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adv: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tpm2Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pcr_bank: Option<String>,
    /// A comma separated string or a list, depending on who wrote it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pcr_ids: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pcr_digest: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SssConfig {
    #[serde(rename = "t")]
    pub threshold: u32,
    pub pins: BTreeMap<Pin, Vec<PolicyConfig>>,
}

impl SssConfig {
    pub fn child_count(&self) -> usize {
        self.pins.values().map(Vec::len).sum()
    }
}

/// Serializes to the JSON config `clevis encrypt <pin>` takes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PolicyConfig {
    Tang(TangConfig),
    Tpm2(Tpm2Config),
    Sss(SssConfig),
}

impl PolicyConfig {
    pub fn pin(&self) -> Pin {
        match self {
            Self::Tang(_) => Pin::Tang,
            Self::Tpm2(_) => Pin::Tpm2,
            Self::Sss(_) => Pin::Sss,
        }
    }

    /// The same policy with advertisement payloads dropped, recursively.
    pub fn without_adv(&self) -> Self {
        match self {
            Self::Tang(tang) => Self::Tang(TangConfig {
                url: tang.url.clone(),
                adv: None,
            }),
            Self::Tpm2(tpm2) => Self::Tpm2(tpm2.clone()),
            Self::Sss(sss) => Self::Sss(SssConfig {
                threshold: sss.threshold,
                pins: sss
                    .pins
                    .iter()
                    .map(|(pin, children)| {
                        (*pin, children.iter().map(Self::without_adv).collect())
                    })
                    .collect(),
            }),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Sss(sss) => {
                let children = sss.child_count();
                if sss.threshold < 1 || sss.threshold as usize > children {
                    return Err(ClevisError::InvalidBinding(format!(
                        "threshold {} must be between 1 and the number of pins ({})",
                        sss.threshold, children
                    )));
                }
                sss.pins.values().flatten().try_for_each(Self::validate)
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub config: PolicyConfig,
    pub keys: KeySet,
}

impl Policy {
    pub fn pin(&self) -> Pin {
        self.config.pin()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.config)?)
    }
}

/// The policy for binding to `servers`.
///
/// No servers yields no policy, one gives a tang pin and several an sss pin
/// over one tang child per server. Every advertisement must be fetched.
pub fn build_policy<F>(fetcher: &F, servers: &[String], threshold: u32) -> Result<Option<Policy>>
where
    F: AdvertisementFetcher + ?Sized,
{
    let mut keys = KeySet::new();
    let mut children = Vec::with_capacity(servers.len());
    for server in servers {
        let adv = fetcher.fetch(server)?;
        keys.extend(adv.thumbprints()?);
        children.push(PolicyConfig::Tang(TangConfig {
            url: server.clone(),
            adv: Some(adv.into_value()),
        }));
    }

    let config = match children.len() {
        0 => return Ok(None),
        1 => children.remove(0),
        _ => PolicyConfig::Sss(SssConfig {
            threshold,
            pins: BTreeMap::from([(Pin::Tang, children)]),
        }),
    };
    config.validate()?;
    Ok(Some(Policy { config, keys }))
}

/// Recover the policy a blob was encrypted to from its protected header.
pub fn decode_policy(jwe: &str) -> Result<Policy> {
    let header = jwe::protected_header(jwe)?;
    let clevis = header
        .get("clevis")
        .ok_or_else(|| ClevisError::MalformedMetadata("no clevis header".into()))?;
    let pin: Pin = clevis
        .get("pin")
        .and_then(Value::as_str)
        .ok_or_else(|| ClevisError::MalformedMetadata("clevis header without pin".into()))?
        .parse()?;
    let config = clevis.get(pin.as_str()).ok_or_else(|| {
        ClevisError::MalformedMetadata(format!("clevis header without `{pin}` config"))
    })?;

    let mut keys = KeySet::new();
    let config = decode_config(pin, config, &mut keys)?;
    Ok(Policy { config, keys })
}

fn decode_config(pin: Pin, config: &Value, keys: &mut KeySet) -> Result<PolicyConfig> {
    match pin {
        Pin::Tang => {
            let url = config
                .get("url")
                .and_then(Value::as_str)
                .ok_or_else(|| ClevisError::MalformedMetadata("tang config without url".into()))?;
            let adv = config
                .get("adv")
                .cloned()
                .ok_or_else(|| ClevisError::MalformedMetadata("tang config without adv".into()))
                .and_then(Advertisement::from_value)?;
            keys.extend(adv.thumbprints()?);
            Ok(PolicyConfig::Tang(TangConfig {
                url: url.to_string(),
                adv: Some(adv.into_value()),
            }))
        }
        Pin::Tpm2 => Ok(PolicyConfig::Tpm2(
            serde_json::from_value(config.clone())
                .map_err(|e| ClevisError::MalformedMetadata(format!("tpm2 config: {e}")))?,
        )),
        Pin::Sss => {
            let threshold = config
                .get("t")
                .and_then(Value::as_u64)
                .and_then(|t| u32::try_from(t).ok())
                .ok_or_else(|| {
                    ClevisError::MalformedMetadata("sss config without threshold".into())
                })?;
            let blobs = match config.get("jwe") {
                Some(Value::Array(blobs)) => blobs,
                _ => {
                    return Err(ClevisError::MalformedMetadata(
                        "sss config without child blobs".into(),
                    ))
                }
            };
            if threshold < 1 || threshold as usize > blobs.len() {
                return Err(ClevisError::MalformedMetadata(format!(
                    "sss threshold {threshold} with {} children",
                    blobs.len()
                )));
            }

            let mut pins: BTreeMap<Pin, Vec<PolicyConfig>> = BTreeMap::new();
            for blob in blobs {
                // An undecodable child only makes the policy compare unequal.
                let child = blob
                    .as_str()
                    .ok_or_else(|| {
                        ClevisError::MalformedMetadata("sss child is not a string".into())
                    })
                    .and_then(decode_policy);
                match child {
                    Ok(child) => {
                        let pin = child.config.pin();
                        keys.extend(child.keys);
                        pins.entry(pin).or_default().push(child.config);
                    }
                    Err(e) => log::warn!("skipping sss child: {}", e),
                }
            }
            Ok(PolicyConfig::Sss(SssConfig { threshold, pins }))
        }
    }
}

/// Equality ignoring advertisement payloads: servers are identified by url.
pub fn configs_equivalent(a: &PolicyConfig, b: &PolicyConfig) -> bool {
    a.without_adv() == b.without_adv()
}
