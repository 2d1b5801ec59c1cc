//! The external services a reconciliation run talks to.
//!
//! Each service is a trait so the engine can run against the real tools
//! ([`SystemHost`]) or an in-memory stand-in.

use crate::clevis::{Clevis, Pwmake};
use crate::config::ToolPaths;
use crate::error::Result;
use crate::luks::cryptsetup::Cryptsetup;
use crate::luks::luksmeta::LuksMeta;
use crate::luks::LuksDeviceType;
use crate::policy::tang::{Advertisement, TangClient};
use crate::policy::Pin;
use crate::secret::{Credential, Secret};
use ambassador::{delegatable_trait, Delegate};

/// The LUKS volume tool (`cryptsetup`).
#[delegatable_trait]
pub trait LuksTool {
    fn is_luks(&self, device: &str) -> Result<bool>;
    fn is_luks_type(&self, device: &str, luks_type: LuksDeviceType) -> Result<bool>;
    fn dump(&self, device: &str) -> Result<String>;
    /// Non-mutating unlock test, optionally restricted to one keyslot.
    fn test_passphrase(
        &self,
        device: &str,
        credential: &Credential,
        slot: Option<u32>,
    ) -> Result<bool>;
    fn add_key(
        &self,
        device: &str,
        slot: u32,
        current: &Credential,
        new: &Credential,
    ) -> Result<()>;
    fn change_key(
        &self,
        device: &str,
        slot: u32,
        current: &Credential,
        new: &Credential,
    ) -> Result<()>;
    fn kill_slot(&self, device: &str, slot: u32, credential: Option<&Credential>) -> Result<()>;
    fn remove_key(&self, device: &str, credential: &Credential) -> Result<()>;
    fn token_export(&self, device: &str, token_id: u32) -> Result<String>;
    fn token_import(&self, device: &str, token: &str) -> Result<()>;
    fn token_remove(&self, device: &str, token_id: u32) -> Result<()>;
}

/// The LUKS1 side-car metadata store (`luksmeta`).
#[delegatable_trait]
pub trait LuksMetaTool {
    fn is_initialized(&self, device: &str) -> Result<bool>;
    fn initialize(&self, device: &str) -> Result<()>;
    fn show(&self, device: &str) -> Result<String>;
    fn load(&self, device: &str, slot: u32, uuid: &str) -> Result<String>;
    fn save(&self, device: &str, slot: u32, uuid: &str, data: &str) -> Result<()>;
    fn wipe(&self, device: &str, slot: u32, uuid: &str) -> Result<()>;
}

#[delegatable_trait]
pub trait ClevisTool {
    fn encrypt(&self, pin: Pin, config: &str, secret: &Secret) -> Result<String>;
    fn decrypt(&self, jwe: &str) -> Result<Secret>;
}

#[delegatable_trait]
pub trait SecretGenerator {
    /// A printable secret carrying `bits` of entropy.
    fn generate(&self, bits: u32) -> Result<Secret>;
}

#[delegatable_trait]
pub trait AdvertisementFetcher {
    fn fetch(&self, server: &str) -> Result<Advertisement>;
}

pub trait Host:
    LuksTool + LuksMetaTool + ClevisTool + SecretGenerator + AdvertisementFetcher
{
}

impl<T> Host for T where
    T: LuksTool + LuksMetaTool + ClevisTool + SecretGenerator + AdvertisementFetcher + ?Sized
{
}

/// Host backed by the real binaries and HTTP.
#[derive(Delegate)]
#[delegate(LuksTool, target = "cryptsetup")]
#[delegate(LuksMetaTool, target = "luksmeta")]
#[delegate(ClevisTool, target = "clevis")]
#[delegate(SecretGenerator, target = "pwmake")]
#[delegate(AdvertisementFetcher, target = "tang")]
pub struct SystemHost {
    cryptsetup: Cryptsetup,
    luksmeta: LuksMeta,
    clevis: Clevis,
    pwmake: Pwmake,
    tang: TangClient,
}

impl SystemHost {
    pub fn new(paths: &ToolPaths) -> Result<Self> {
        Ok(Self {
            cryptsetup: Cryptsetup::new(&paths.cryptsetup),
            luksmeta: LuksMeta::new(&paths.luksmeta),
            clevis: Clevis::new(&paths.clevis),
            pwmake: Pwmake::new(&paths.pwmake),
            tang: TangClient::new()?,
        })
    }
}
