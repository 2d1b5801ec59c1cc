use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClevisError {
    #[error("{0} is not a LUKS device")]
    NotLuks(String),
    #[error("not possible to detect whether {0} is LUKS1 or LUKS2")]
    UnknownLuksType(String),
    #[error("{device}:{slot} is not clevis-bound")]
    NotBound { device: String, slot: u32 },
    #[error("{device}:{slot} is already bound and no overwrite set")]
    AlreadyBound { device: String, slot: u32 },
    #[error("{device}:{slot} is in use by a keyslot not bound by clevis")]
    SlotInUse { device: String, slot: u32 },
    #[error("no valid passphrase could be obtained for {0}")]
    NoValidCredential(String),
    #[error("invalid passphrase for {0}")]
    InvalidPassphrase(String),
    #[error("unsupported pin `{0}`")]
    UnsupportedPin(String),
    #[error("malformed metadata: {0}")]
    MalformedMetadata(String),
    #[error("invalid binding: {0}")]
    InvalidBinding(String),
    #[error("`{program}` failed with exit code {status}: {diagnostic}")]
    ExternalToolFailure {
        program: String,
        status: i32,
        diagnostic: String,
    },
    #[error("error writing metadata to {device}:{slot}: {source}")]
    WriteFailed {
        device: String,
        slot: u32,
        #[source]
        source: Box<ClevisError>,
    },
    #[error("verification mismatch: {0}")]
    VerificationMismatch(String),
    #[error("partial failure, manual recovery required: {0}")]
    PartialFailure(String),
    #[error("failed to fetch advertisement from {url}: {reason}")]
    NetworkFetchFailure { url: String, reason: String },
    #[error("binding applied but temporary credential is still valid on {device}: {source}")]
    CredentialRetained {
        device: String,
        #[source]
        source: Box<ClevisError>,
    },
    #[error("{context}: {source}")]
    Fatal {
        context: String,
        #[source]
        source: Box<ClevisError>,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub type Result<T, E = ClevisError> = core::result::Result<T, E>;

impl ClevisError {
    pub fn fatal(context: impl Into<String>, source: ClevisError) -> Self {
        Self::Fatal {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Device state is unknown after this error; no further bindings may run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. } | Self::PartialFailure(_))
    }

    /// Whether the device was left different from how it was found.
    pub fn modified_device(&self) -> bool {
        self.is_fatal() || matches!(self, Self::CredentialRetained { .. })
    }

    pub fn is_not_bound(&self) -> bool {
        matches!(self, Self::NotBound { .. })
    }
}
