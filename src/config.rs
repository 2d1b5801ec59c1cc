use crate::binding::{Binding, BindingSpec};
use crate::error::{ClevisError, Result};
use clap::Args;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Desired state as read from YAML.
///
/// ```yaml
/// data_dir: /var/tmp/nbde_client
/// bindings:
///   - device: /dev/sda1
///     encryption_password: hunter2
///     servers: [http://tang1.example, http://tang2.example]
///     threshold: 1
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DesiredStateFile {
    pub bindings: Vec<BindingSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl DesiredStateFile {
    pub fn load(path: &Path) -> Result<Self> {
        log::debug!("reading desired state from {}", path.display());
        Self::from_yaml(&fs::read_to_string(path)?)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Validated bindings, in order. `data_dir` overrides the file's.
    pub fn bindings(&self, data_dir: Option<&Path>) -> Result<Vec<Binding>> {
        if self.bindings.is_empty() {
            return Err(ClevisError::InvalidBinding("no bindings set".into()));
        }
        let data_dir = data_dir.or(self.data_dir.as_deref());
        self.bindings
            .iter()
            .map(|spec| Binding::from_spec(spec, data_dir))
            .collect()
    }
}

/// Where to find the external programs.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    /// cryptsetup binary
    #[arg(
        long,
        value_name = "PATH",
        env = "CLEVIS_CRYPTSETUP",
        default_value = "cryptsetup"
    )]
    pub cryptsetup: PathBuf,

    /// luksmeta binary, for LUKS1 devices
    #[arg(
        long,
        value_name = "PATH",
        env = "CLEVIS_LUKSMETA",
        default_value = "luksmeta"
    )]
    pub luksmeta: PathBuf,

    /// clevis binary
    #[arg(
        long,
        value_name = "PATH",
        env = "CLEVIS_CLEVIS",
        default_value = "clevis"
    )]
    pub clevis: PathBuf,

    /// pwmake binary, used to generate binding passphrases
    #[arg(
        long,
        value_name = "PATH",
        env = "CLEVIS_PWMAKE",
        default_value = "pwmake"
    )]
    pub pwmake: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            cryptsetup: "cryptsetup".into(),
            luksmeta: "luksmeta".into(),
            clevis: "clevis".into(),
            pwmake: "pwmake".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::BindingState;
    use crate::secret::Credential;
    use std::io::Write;

    const DESIRED: &str = "
data_dir: /var/tmp/nbde
bindings:
  - device: /dev/sda1
    encryption_key: /root/keys/sda1
    servers:
      - http://tang1.example
      - http://tang2.example
    threshold: 2
  - device: /dev/sda2
    slot: 2
    state: absent
";

    #[test]
    fn load_from_file() -> eyre::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(DESIRED.as_bytes())?;
        let desired = DesiredStateFile::load(file.path())?;
        let bindings = desired.bindings(None)?;

        assert_eq!(bindings.len(), 2);
        assert_eq!(
            bindings[0].credential,
            Some(Credential::Keyfile("/var/tmp/nbde/sda1".into()))
        );
        assert_eq!(bindings[0].threshold, 2);
        assert_eq!(bindings[1].state, BindingState::Absent);
        assert_eq!(bindings[1].slot, 2);

        let bindings = desired.bindings(Some(Path::new("/srv/keys")))?;
        assert_eq!(
            bindings[0].credential,
            Some(Credential::Keyfile("/srv/keys/sda1".into()))
        );
        Ok(())
    }

    #[test]
    fn empty_and_invalid() -> eyre::Result<()> {
        let empty = DesiredStateFile::from_yaml("bindings: []")?;
        let err = empty.bindings(None);
        assert!(matches!(err, Err(ClevisError::InvalidBinding(_))));
        assert!(DesiredStateFile::from_yaml("devices: []").is_err());
        assert!(DesiredStateFile::load(Path::new("/nonexistent/desired.yml")).is_err());
        Ok(())
    }

    #[test]
    fn tool_defaults() {
        assert_eq!(ToolPaths::default().cryptsetup, PathBuf::from("cryptsetup"));
    }
}
