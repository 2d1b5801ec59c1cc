//! The `clevis` and `pwmake` command line tools.

use crate::command::Tool;
use crate::error::{ClevisError, Result};
use crate::host::{ClevisTool, SecretGenerator};
use crate::policy::Pin;
use crate::secret::Secret;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct Clevis {
    tool: Tool,
}

impl Clevis {
    pub fn new(binary: &Path) -> Self {
        Self {
            tool: Tool::new(binary),
        }
    }
}

impl ClevisTool for Clevis {
    /// `clevis encrypt <pin> <config>`, the secret on stdin.
    fn encrypt(&self, pin: Pin, config: &str, secret: &Secret) -> Result<String> {
        let out = self
            .tool
            .run_checked(["encrypt", pin.as_str(), config], Some(secret.as_bytes()))?;
        let jwe = out.stdout_string().trim().to_string();
        if jwe.is_empty() {
            return Err(ClevisError::ExternalToolFailure {
                program: self.tool.binary().display().to_string(),
                status: out.status,
                diagnostic: "encrypt produced no output".into(),
            });
        }
        Ok(jwe)
    }

    fn decrypt(&self, jwe: &str) -> Result<Secret> {
        let out = self.tool.run_checked(["decrypt"], Some(jwe.as_bytes()))?;
        Ok(Secret::from_output(out.stdout))
    }
}

/// Generates passphrases with `pwmake <bits>`.
#[derive(Debug, Clone)]
pub struct Pwmake {
    tool: Tool,
}

impl Pwmake {
    pub fn new(binary: &Path) -> Self {
        Self {
            tool: Tool::new(binary),
        }
    }
}

impl SecretGenerator for Pwmake {
    fn generate(&self, bits: u32) -> Result<Secret> {
        let bits = bits.to_string();
        let out = self.tool.run_checked([bits.as_str()], None)?;
        Ok(Secret::from_output(out.stdout))
    }
}
