use std::fmt;
use std::path::PathBuf;
use zeroize::Zeroizing;

/// Secret bytes that are wiped from memory on drop and never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(Zeroizing<Vec<u8>>);

impl Secret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Zeroizing::new(bytes.into()))
    }

    /// Take ownership of a tool's stdout, dropping the trailing newline.
    pub fn from_output(mut stdout: Vec<u8>) -> Self {
        while matches!(stdout.last(), Some(b'\n' | b'\r')) {
            stdout.pop();
        }
        Self::new(stdout)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes())
    }
}

/// Material able to unlock a LUKS keyslot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Passphrase(Secret),
    Keyfile(PathBuf),
}

impl From<Secret> for Credential {
    fn from(secret: Secret) -> Self {
        Self::Passphrase(secret)
    }
}
