//! Where a keyslot's clevis blob lives, per LUKS version.

use super::{dump, luksmeta, LuksDeviceType};
use crate::error::{ClevisError, Result};
use crate::host::Host;
use crate::policy::jwe;
use ambassador::{delegatable_trait, Delegate};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

/// luksmeta UUID marking clevis entries on LUKS1.
pub const CLEVIS_UUID: &str = "cb6e8904-81ff-40da-a84a-07ab9ab5715e";

/// Metadata as it was before a destructive write.
#[derive(Debug, Clone, PartialEq)]
pub struct Backup {
    slot: u32,
    data: BackupData,
}

#[derive(Debug, Clone, PartialEq)]
enum BackupData {
    /// Every clevis entry in the store: luksmeta has no per-slot restore.
    Luks1(BTreeMap<u32, String>),
    /// The slot's token, verbatim.
    Luks2(Option<Value>),
}

impl Backup {
    /// Whether the slot had a clevis entry when the backup was taken.
    pub fn has_entry(&self) -> bool {
        match &self.data {
            BackupData::Luks1(entries) => entries.contains_key(&self.slot),
            BackupData::Luks2(token) => token.is_some(),
        }
    }
}

#[delegatable_trait]
pub trait MetadataFormat {
    fn device(&self) -> &str;
    fn luks_type(&self) -> LuksDeviceType;
    /// Keyslots holding a passphrase.
    fn enumerate_slots(&self, host: &dyn Host) -> Result<BTreeSet<u32>>;
    /// Master key entropy in bits.
    fn key_bits(&self, host: &dyn Host) -> Result<u32>;
    /// The slot's blob in compact form, or `NotBound`.
    fn read_blob(&self, host: &dyn Host, slot: u32) -> Result<String>;
    /// Raw write; the slot must not have an entry.
    fn store_blob(&self, host: &dyn Host, slot: u32, jwe: &str) -> Result<()>;
    fn remove_blob(&self, host: &dyn Host, slot: u32) -> Result<()>;
    fn backup(&self, host: &dyn Host, slot: u32) -> Result<Backup>;
    fn restore(&self, host: &dyn Host, backup: &Backup) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct Luks1Metadata {
    device: String,
}

impl Luks1Metadata {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
        }
    }

    pub fn ensure_initialized(&self, host: &dyn Host) -> Result<()> {
        if !host.is_initialized(&self.device)? {
            log::info!("initializing luksmeta on {}", self.device);
            host.initialize(&self.device)?;
        }
        Ok(())
    }

    fn clevis_slots(&self, host: &dyn Host) -> Result<BTreeSet<u32>> {
        if !host.is_initialized(&self.device)? {
            return Ok(BTreeSet::new());
        }
        Ok(luksmeta::parse_show(&host.show(&self.device)?)
            .into_iter()
            .filter(|e| e.active && e.uuid.as_deref() == Some(CLEVIS_UUID))
            .map(|e| e.slot)
            .collect())
    }

    fn load(&self, host: &dyn Host, slot: u32) -> Result<String> {
        let blob = host.load(&self.device, slot, CLEVIS_UUID)?;
        let blob = blob.trim();
        jwe::protected_header(blob)?;
        Ok(blob.to_string())
    }
}

impl MetadataFormat for Luks1Metadata {
    fn device(&self) -> &str {
        &self.device
    }

    fn luks_type(&self) -> LuksDeviceType {
        LuksDeviceType::Luks1
    }

    fn enumerate_slots(&self, host: &dyn Host) -> Result<BTreeSet<u32>> {
        dump::luks1_keyslots(&host.dump(&self.device)?)
    }

    fn key_bits(&self, host: &dyn Host) -> Result<u32> {
        dump::luks1_key_bits(&host.dump(&self.device)?).ok_or_else(|| {
            ClevisError::MalformedMetadata(format!("no master key size for {}", self.device))
        })
    }

    fn read_blob(&self, host: &dyn Host, slot: u32) -> Result<String> {
        if !self.clevis_slots(host)?.contains(&slot) {
            return Err(ClevisError::NotBound {
                device: self.device.clone(),
                slot,
            });
        }
        self.load(host, slot)
    }

    fn store_blob(&self, host: &dyn Host, slot: u32, jwe: &str) -> Result<()> {
        self.ensure_initialized(host)?;
        host.save(&self.device, slot, CLEVIS_UUID, jwe)
    }

    fn remove_blob(&self, host: &dyn Host, slot: u32) -> Result<()> {
        host.wipe(&self.device, slot, CLEVIS_UUID)
    }

    fn backup(&self, host: &dyn Host, slot: u32) -> Result<Backup> {
        let entries = self
            .clevis_slots(host)?
            .into_iter()
            .map(|s| Ok((s, self.load(host, s)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Backup {
            slot,
            data: BackupData::Luks1(entries),
        })
    }

    fn restore(&self, host: &dyn Host, backup: &Backup) -> Result<()> {
        let BackupData::Luks1(entries) = &backup.data else {
            return Err(ClevisError::MalformedMetadata(format!(
                "LUKS2 backup applied to LUKS1 device {}",
                self.device
            )));
        };
        host.initialize(&self.device)?;
        for (slot, blob) in entries {
            host.save(&self.device, *slot, CLEVIS_UUID, blob)?;
            if self.read_blob(host, *slot)? != *blob {
                return Err(ClevisError::VerificationMismatch(format!(
                    "restored entry for {}:{} differs from backup",
                    self.device, slot
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Luks2Metadata {
    device: String,
}

impl Luks2Metadata {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
        }
    }

    fn token_id(&self, host: &dyn Host, slot: u32) -> Result<Option<u32>> {
        Ok(dump::clevis_token_for_slot(&host.dump(&self.device)?, slot))
    }

    fn not_bound(&self, slot: u32) -> ClevisError {
        ClevisError::NotBound {
            device: self.device.clone(),
            slot,
        }
    }

    fn export(&self, host: &dyn Host, token_id: u32) -> Result<Value> {
        let token: Value = serde_json::from_str(&host.token_export(&self.device, token_id)?)
            .map_err(|e| ClevisError::MalformedMetadata(format!("token {token_id}: {e}")))?;
        Ok(token)
    }
}

impl MetadataFormat for Luks2Metadata {
    fn device(&self) -> &str {
        &self.device
    }

    fn luks_type(&self) -> LuksDeviceType {
        LuksDeviceType::Luks2
    }

    fn enumerate_slots(&self, host: &dyn Host) -> Result<BTreeSet<u32>> {
        dump::luks2_keyslots(&host.dump(&self.device)?)
    }

    fn key_bits(&self, host: &dyn Host) -> Result<u32> {
        dump::luks2_key_bits(&host.dump(&self.device)?).ok_or_else(|| {
            ClevisError::MalformedMetadata(format!("no volume key size for {}", self.device))
        })
    }

    fn read_blob(&self, host: &dyn Host, slot: u32) -> Result<String> {
        let token_id = self
            .token_id(host, slot)?
            .ok_or_else(|| self.not_bound(slot))?;
        let token = self.export(host, token_id)?;
        if token.get("type").and_then(Value::as_str) != Some("clevis") {
            return Err(self.not_bound(slot));
        }
        let jwe = token.get("jwe").ok_or_else(|| {
            ClevisError::MalformedMetadata(format!("clevis token {token_id} without jwe"))
        })?;
        jwe::json_to_compact(jwe)
    }

    fn store_blob(&self, host: &dyn Host, slot: u32, jwe: &str) -> Result<()> {
        let token = json!({
            "type": "clevis",
            "keyslots": [slot.to_string()],
            "jwe": jwe::compact_to_json(jwe)?,
        });
        host.token_import(&self.device, &serde_json::to_string(&token)?)
    }

    fn remove_blob(&self, host: &dyn Host, slot: u32) -> Result<()> {
        let token_id = self
            .token_id(host, slot)?
            .ok_or_else(|| self.not_bound(slot))?;
        host.token_remove(&self.device, token_id)
    }

    fn backup(&self, host: &dyn Host, slot: u32) -> Result<Backup> {
        let token = match self.token_id(host, slot)? {
            Some(token_id) => Some(self.export(host, token_id)?),
            None => None,
        };
        Ok(Backup {
            slot,
            data: BackupData::Luks2(token),
        })
    }

    fn restore(&self, host: &dyn Host, backup: &Backup) -> Result<()> {
        let BackupData::Luks2(token) = &backup.data else {
            return Err(ClevisError::MalformedMetadata(format!(
                "LUKS1 backup applied to LUKS2 device {}",
                self.device
            )));
        };
        if let Some(current) = self.token_id(host, backup.slot)? {
            host.token_remove(&self.device, current)?;
        }
        if let Some(token) = token {
            host.token_import(&self.device, &serde_json::to_string(token)?)?;
            let restored = match self.token_id(host, backup.slot)? {
                Some(token_id) => Some(self.export(host, token_id)?),
                None => None,
            };
            if restored.as_ref() != Some(token) {
                return Err(ClevisError::VerificationMismatch(format!(
                    "restored token for {}:{} differs from backup",
                    self.device, backup.slot
                )));
            }
        }
        Ok(())
    }
}

/// The metadata format of one device, chosen once when it is classified.
#[derive(Debug, Clone, Delegate)]
#[delegate(MetadataFormat)]
pub enum LuksMetadata {
    Luks1(Luks1Metadata),
    Luks2(Luks2Metadata),
}

impl LuksMetadata {
    pub fn new(device: impl Into<String>, luks_type: LuksDeviceType) -> Self {
        match luks_type {
            LuksDeviceType::Luks1 => Self::Luks1(Luks1Metadata::new(device)),
            LuksDeviceType::Luks2 => Self::Luks2(Luks2Metadata::new(device)),
        }
    }

    /// A well-formed clevis entry exists for `slot`.
    pub fn is_bound(&self, host: &dyn Host, slot: u32) -> Result<bool> {
        match self.read_blob(host, slot) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_bound() => Ok(false),
            Err(ClevisError::MalformedMetadata(reason)) => {
                log::warn!(
                    "{}:{} has unreadable clevis metadata: {}",
                    self.device(),
                    slot,
                    reason
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Occupied keyslots that are clevis-bound, ascending.
    pub fn bound_slots(&self, host: &dyn Host) -> Result<Vec<u32>> {
        let mut bound = Vec::new();
        for slot in self.enumerate_slots(host)? {
            if self.is_bound(host, slot)? {
                bound.push(slot);
            }
        }
        Ok(bound)
    }

    /// Write `jwe` to `slot`, verified by reading it back.
    ///
    /// Any existing entry is replaced only with `overwrite`. On failure the
    /// metadata is restored to how it was found.
    pub fn write_blob(&self, host: &dyn Host, slot: u32, jwe: &str, overwrite: bool) -> Result<()> {
        let existing = match self.read_blob(host, slot) {
            Ok(blob) => Some(blob),
            Err(e) if e.is_not_bound() => None,
            Err(e) => return Err(e),
        };
        if existing.is_some() && !overwrite {
            return Err(ClevisError::AlreadyBound {
                device: self.device().to_string(),
                slot,
            });
        }

        let transaction = MetadataTransaction::begin(self, host, slot, existing.is_some())?;
        match self.store_verified(host, slot, jwe) {
            Ok(()) => {
                transaction.commit();
                log::debug!(
                    "stored blob {} in {}:{}",
                    jwe::blob_id(jwe),
                    self.device(),
                    slot
                );
                Ok(())
            }
            Err(e) => Err(transaction.rollback(e)),
        }
    }

    fn store_verified(&self, host: &dyn Host, slot: u32, jwe: &str) -> Result<()> {
        let write_failed = |source| ClevisError::WriteFailed {
            device: self.device().to_string(),
            slot,
            source: Box::new(source),
        };
        self.store_blob(host, slot, jwe).map_err(write_failed)?;
        let stored = self.read_blob(host, slot).map_err(write_failed)?;
        if stored.trim() != jwe.trim() {
            return Err(ClevisError::VerificationMismatch(format!(
                "{}:{} reads back blob {} instead of {}",
                self.device(),
                slot,
                jwe::blob_id(&stored),
                jwe::blob_id(jwe)
            )));
        }
        Ok(())
    }
}

/// Backup taken before a destructive metadata change, restored unless the
/// change is committed.
#[must_use = "a transaction must be committed or rolled back"]
pub struct MetadataTransaction<'a> {
    format: &'a dyn MetadataFormat,
    host: &'a dyn Host,
    backup: Backup,
}

impl<'a> MetadataTransaction<'a> {
    /// Snapshot `slot`, removing its entry afterwards if `remove_existing`.
    pub fn begin(
        format: &'a dyn MetadataFormat,
        host: &'a dyn Host,
        slot: u32,
        remove_existing: bool,
    ) -> Result<Self> {
        let backup = format.backup(host, slot)?;
        let transaction = Self {
            format,
            host,
            backup,
        };
        if remove_existing && transaction.backup.has_entry() {
            if let Err(e) = format.remove_blob(host, slot) {
                return Err(transaction.rollback(e));
            }
        }
        Ok(transaction)
    }

    pub fn commit(self) {
        log::trace!(
            "discarding metadata backup of {}:{}",
            self.format.device(),
            self.backup.slot
        );
    }

    /// Restore the backup, returning `cause` or, if that fails, a
    /// `PartialFailure` naming both.
    pub fn rollback(self, cause: ClevisError) -> ClevisError {
        let device = self.format.device();
        log::warn!(
            "restoring metadata of {}:{} after: {}",
            device,
            self.backup.slot,
            cause
        );
        match self.format.restore(self.host, &self.backup) {
            Ok(()) => cause,
            Err(e) => ClevisError::PartialFailure(format!(
                "{cause}; restoring metadata of {device}:{} failed: {e}",
                self.backup.slot
            )),
        }
    }
}
