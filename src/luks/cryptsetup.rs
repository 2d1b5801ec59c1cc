use super::LuksDeviceType;
use crate::command::Tool;
use crate::error::Result;
use crate::host::LuksTool;
use crate::secret::Credential;
use std::ffi::OsString;
use std::path::Path;
use zeroize::Zeroizing;

#[derive(Debug, Clone)]
pub struct Cryptsetup {
    tool: Tool,
}

/// Arguments plus the stdin payload carrying any passphrases.
///
/// Passphrases go one per line, the current one first; key files go on the
/// command line.
struct Invocation {
    args: Vec<OsString>,
    stdin: Zeroizing<Vec<u8>>,
}

impl Invocation {
    fn new(action: &str) -> Self {
        Self {
            args: vec![action.into()],
            stdin: Zeroizing::new(Vec::new()),
        }
    }

    fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn current(mut self, credential: &Credential) -> Self {
        match credential {
            Credential::Keyfile(path) => {
                self.args.push("--key-file".into());
                self.args.push(path.into());
            }
            Credential::Passphrase(secret) => self.push_line(secret.as_bytes()),
        }
        self
    }

    /// Must come after the device argument: a new key file is positional.
    fn new_key(mut self, credential: &Credential) -> Self {
        match credential {
            Credential::Keyfile(path) => self.args.push(path.into()),
            Credential::Passphrase(secret) => self.push_line(secret.as_bytes()),
        }
        self
    }

    fn push_line(&mut self, line: &[u8]) {
        if !self.stdin.is_empty() {
            self.stdin.push(b'\n');
        }
        self.stdin.extend_from_slice(line);
    }

    fn input(&self) -> Option<&[u8]> {
        if self.stdin.is_empty() {
            None
        } else {
            Some(self.stdin.as_slice())
        }
    }
}

impl Cryptsetup {
    pub fn new(binary: &Path) -> Self {
        Self {
            tool: Tool::new(binary),
        }
    }

    fn run_checked(&self, invocation: Invocation) -> Result<String> {
        let out = self.tool.run_checked(&invocation.args, invocation.input())?;
        Ok(out.stdout_string())
    }
}

impl LuksTool for Cryptsetup {
    fn is_luks(&self, device: &str) -> Result<bool> {
        Ok(self.tool.run(["isLuks", device], None)?.success())
    }

    fn is_luks_type(&self, device: &str, luks_type: LuksDeviceType) -> Result<bool> {
        let out = self
            .tool
            .run(["isLuks", "--type", luks_type.as_str(), device], None)?;
        Ok(out.success())
    }

    fn dump(&self, device: &str) -> Result<String> {
        self.run_checked(Invocation::new("luksDump").arg(device))
    }

    fn test_passphrase(
        &self,
        device: &str,
        credential: &Credential,
        slot: Option<u32>,
    ) -> Result<bool> {
        let mut invocation = Invocation::new("open").arg("--test-passphrase").arg(device);
        if let Some(slot) = slot {
            invocation = invocation.arg("--key-slot").arg(slot.to_string());
        }
        let invocation = invocation.current(credential);
        Ok(self
            .tool
            .run(&invocation.args, invocation.input())?
            .success())
    }

    fn add_key(
        &self,
        device: &str,
        slot: u32,
        current: &Credential,
        new: &Credential,
    ) -> Result<()> {
        let invocation = Invocation::new("luksAddKey")
            .arg("--key-slot")
            .arg(slot.to_string())
            .arg("--batch-mode")
            .arg("--force-password")
            .current(current)
            .arg(device)
            .new_key(new);
        self.run_checked(invocation).map(drop)
    }

    fn change_key(
        &self,
        device: &str,
        slot: u32,
        current: &Credential,
        new: &Credential,
    ) -> Result<()> {
        let invocation = Invocation::new("luksChangeKey")
            .arg("--key-slot")
            .arg(slot.to_string())
            .arg("--batch-mode")
            .arg("--force-password")
            .current(current)
            .arg(device)
            .new_key(new);
        self.run_checked(invocation).map(drop)
    }

    fn kill_slot(&self, device: &str, slot: u32, credential: Option<&Credential>) -> Result<()> {
        let mut invocation = Invocation::new("luksKillSlot").arg("--batch-mode");
        if let Some(credential) = credential {
            invocation = invocation.current(credential);
        }
        self.run_checked(invocation.arg(device).arg(slot.to_string()))
            .map(drop)
    }

    fn remove_key(&self, device: &str, credential: &Credential) -> Result<()> {
        // luksRemoveKey takes the key file to remove as a positional argument.
        let invocation = Invocation::new("luksRemoveKey")
            .arg("--batch-mode")
            .arg(device)
            .new_key(credential);
        self.run_checked(invocation).map(drop)
    }

    fn token_export(&self, device: &str, token_id: u32) -> Result<String> {
        self.run_checked(
            Invocation::new("token")
                .arg("export")
                .arg("--token-id")
                .arg(token_id.to_string())
                .arg(device),
        )
    }

    fn token_import(&self, device: &str, token: &str) -> Result<()> {
        self.tool
            .run_checked(["token", "import", device], Some(token.as_bytes()))
            .map(drop)
    }

    fn token_remove(&self, device: &str, token_id: u32) -> Result<()> {
        self.run_checked(
            Invocation::new("token")
                .arg("remove")
                .arg("--token-id")
                .arg(token_id.to_string())
                .arg(device),
        )
        .map(drop)
    }
}
