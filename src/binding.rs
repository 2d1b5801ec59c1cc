use crate::error::{ClevisError, Result};
use crate::secret::{Credential, Secret};
use serde::{Deserialize, Serialize, Serializer};
use std::path::{Path, PathBuf};

/// Highest LUKS2 keyslot is 31. LUKS1 devices are checked against their own
/// limit once their format is known.
pub const MAX_SLOTS: u32 = 32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingState {
    #[default]
    Present,
    Absent,
}

/// One desired binding as written by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BindingSpec {
    pub device: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "redact"
    )]
    pub encryption_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<PathBuf>,
    /// Where the key file came from; stands in for `encryption_key` when
    /// that is not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key_src: Option<PathBuf>,
    #[serde(default)]
    pub state: BindingState,
    #[serde(default = "default_slot")]
    pub slot: u32,
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default = "default_threshold")]
    pub threshold: u32,
    #[serde(default)]
    pub password_temporary: bool,
    #[serde(default = "default_overwrite")]
    pub overwrite: bool,
}

fn default_slot() -> u32 {
    1
}

fn default_threshold() -> u32 {
    1
}

fn default_overwrite() -> bool {
    true
}

fn redact<S: Serializer>(_: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str("***")
}

impl BindingSpec {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            encryption_password: None,
            encryption_key: None,
            encryption_key_src: None,
            state: BindingState::default(),
            slot: default_slot(),
            servers: Vec::new(),
            threshold: default_threshold(),
            password_temporary: false,
            overwrite: default_overwrite(),
        }
    }
}

/// A validated binding, ready for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub device: String,
    pub slot: u32,
    pub state: BindingState,
    pub credential: Option<Credential>,
    pub servers: Vec<String>,
    pub threshold: u32,
    pub password_temporary: bool,
    pub overwrite: bool,
}

impl Binding {
    /// Validate `spec`. Key files are looked up by name in `data_dir` if
    /// one is given.
    pub fn from_spec(spec: &BindingSpec, data_dir: Option<&Path>) -> Result<Self> {
        let invalid = |reason: String| {
            ClevisError::InvalidBinding(format!("{}:{}: {}", spec.device, spec.slot, reason))
        };
        if spec.device.trim().is_empty() {
            return Err(ClevisError::InvalidBinding(
                "each binding must have a device set".into(),
            ));
        }
        if spec.slot >= MAX_SLOTS {
            return Err(invalid(format!("slot must be below {MAX_SLOTS}")));
        }
        if spec.threshold < 1 {
            return Err(invalid("threshold must be at least 1".into()));
        }
        if spec.state == BindingState::Present {
            if spec.servers.is_empty() {
                return Err(invalid("no servers to bind to".into()));
            }
            if spec.servers.len() > 1 && spec.threshold as usize > spec.servers.len() {
                return Err(invalid(format!(
                    "threshold {} exceeds the {} servers given",
                    spec.threshold,
                    spec.servers.len()
                )));
            }
        }

        let keyfile = spec.encryption_key.as_ref();
        let keyfile = keyfile.or(spec.encryption_key_src.as_ref());
        let credential = match (&spec.encryption_password, keyfile) {
            (Some(password), key) => {
                if key.is_some() {
                    log::warn!(
                        "{}: both a password and a key file given, using the password",
                        spec.device
                    );
                }
                Some(Credential::Passphrase(Secret::from(password.as_str())))
            }
            (None, Some(key)) => Some(Credential::Keyfile(resolve_keyfile(key, data_dir)?)),
            (None, None) => None,
        };

        Ok(Self {
            device: spec.device.clone(),
            slot: spec.slot,
            state: spec.state,
            credential,
            servers: spec.servers.clone(),
            threshold: spec.threshold,
            password_temporary: spec.password_temporary,
            overwrite: spec.overwrite,
        })
    }
}

fn resolve_keyfile(key: &Path, data_dir: Option<&Path>) -> Result<PathBuf> {
    match data_dir {
        None => Ok(key.to_path_buf()),
        Some(dir) => {
            let name = key.file_name().ok_or_else(|| {
                ClevisError::InvalidBinding(format!("key file {} has no name", key.display()))
            })?;
            Ok(dir.join(name))
        }
    }
}
