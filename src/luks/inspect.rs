use super::{LuksDeviceType, LuksMetadata, MetadataFormat};
use crate::error::{ClevisError, Result};
use crate::host::Host;
use crate::secret::Credential;
use std::collections::BTreeSet;

/// Read-only queries against LUKS devices.
pub struct DeviceInspector<'h> {
    host: &'h dyn Host,
}

impl<'h> DeviceInspector<'h> {
    pub fn new(host: &'h dyn Host) -> Self {
        Self { host }
    }

    pub fn luks_type(&self, device: &str) -> Result<LuksDeviceType> {
        if !self.host.is_luks(device)? {
            return Err(ClevisError::NotLuks(device.to_string()));
        }
        for luks_type in LuksDeviceType::ALL {
            if self.host.is_luks_type(device, luks_type)? {
                return Ok(luks_type);
            }
        }
        Err(ClevisError::UnknownLuksType(device.to_string()))
    }

    /// Pick the device's metadata format.
    ///
    /// With `initialize`, a LUKS1 device also gets its luksmeta store set up
    /// if it has none yet.
    pub fn classify(&self, device: &str, initialize: bool) -> Result<LuksMetadata> {
        let luks_type = self.luks_type(device)?;
        let metadata = LuksMetadata::new(device, luks_type);
        if let (LuksMetadata::Luks1(luks1), true) = (&metadata, initialize) {
            luks1.ensure_initialized(self.host)?;
        }
        log::debug!("{} is {}", device, luks_type);
        Ok(metadata)
    }

    pub fn occupied_slots(&self, metadata: &LuksMetadata) -> Result<BTreeSet<u32>> {
        metadata.enumerate_slots(self.host)
    }

    pub fn is_clevis_bound(&self, metadata: &LuksMetadata, slot: u32) -> Result<bool> {
        metadata.is_bound(self.host, slot)
    }

    pub fn bound_slots(&self, metadata: &LuksMetadata) -> Result<Vec<u32>> {
        metadata.bound_slots(self.host)
    }

    /// Whether `credential` unlocks the device, or `slot` if given.
    ///
    /// A failure to run the test counts as "does not unlock".
    pub fn verify_passphrase(
        &self,
        device: &str,
        credential: &Credential,
        slot: Option<u32>,
    ) -> bool {
        match self.host.test_passphrase(device, credential, slot) {
            Ok(valid) => valid,
            Err(e) => {
                log::warn!("could not test passphrase on {}: {}", device, e);
                false
            }
        }
    }
}
