use super::{LuksMetadata, MetadataFormat};
use crate::error::{ClevisError, Result};
use crate::host::Host;
use crate::secret::{Credential, Secret};

/// How [`KeyslotManager::set_passphrase`] put the new secret in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassphraseChange {
    /// The current credential owned the slot and was rotated atomically.
    InPlace,
    /// The slot was killed, then the new secret added.
    Replaced,
    /// The slot was free.
    Added,
}

/// Mutations of LUKS keyslot passphrases.
pub struct KeyslotManager<'h> {
    host: &'h dyn Host,
}

impl<'h> KeyslotManager<'h> {
    pub fn new(host: &'h dyn Host) -> Self {
        Self { host }
    }

    /// A printable secret with as much entropy as the device's master key.
    pub fn generate_key(&self, metadata: &LuksMetadata) -> Result<Secret> {
        let bits = metadata.key_bits(self.host)?;
        let key = self.host.generate(bits)?;
        if key.is_empty() {
            return Err(ClevisError::ExternalToolFailure {
                program: "pwmake".into(),
                status: 0,
                diagnostic: "generated an empty secret".into(),
            });
        }
        Ok(key)
    }

    /// Make `new` the passphrase of `slot`.
    ///
    /// A failure after the slot has been killed leaves it empty and is
    /// reported as `Fatal`.
    pub fn set_passphrase(
        &self,
        metadata: &LuksMetadata,
        slot: u32,
        current: &Credential,
        new: &Secret,
    ) -> Result<PassphraseChange> {
        let device = metadata.device();
        if !self.host.test_passphrase(device, current, None)? {
            return Err(ClevisError::InvalidPassphrase(device.to_string()));
        }
        let new = Credential::Passphrase(new.clone());

        if self.host.test_passphrase(device, current, Some(slot))? {
            log::debug!("rotating {}:{} in place", device, slot);
            self.host.change_key(device, slot, current, &new)?;
            return Ok(PassphraseChange::InPlace);
        }

        if !metadata.enumerate_slots(self.host)?.contains(&slot) {
            self.host.add_key(device, slot, current, &new)?;
            return Ok(PassphraseChange::Added);
        }

        log::debug!("replacing {}:{}", device, slot);
        self.host.kill_slot(device, slot, Some(current))?;
        let context = format!("{device}:{slot} killed but new passphrase not added");
        self.host
            .add_key(device, slot, current, &new)
            .map_err(|e| ClevisError::fatal(context, e))?;
        Ok(PassphraseChange::Replaced)
    }

    /// Put `previous` back into `slot`, which `current` unlocks.
    pub fn restore_passphrase(
        &self,
        metadata: &LuksMetadata,
        slot: u32,
        current: &Secret,
        previous: &Credential,
    ) -> Result<()> {
        let current = Credential::Passphrase(current.clone());
        self.host
            .change_key(metadata.device(), slot, &current, previous)
    }

    pub fn kill(
        &self,
        metadata: &LuksMetadata,
        slot: u32,
        credential: Option<&Credential>,
    ) -> Result<()> {
        self.host.kill_slot(metadata.device(), slot, credential)
    }

    /// Remove `credential` from whichever slot holds it.
    pub fn discard(&self, device: &str, credential: &Credential) -> Result<()> {
        self.host.remove_key(device, credential)
    }
}
