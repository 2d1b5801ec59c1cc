//! LUKS devices: header inspection, keyslots and clevis metadata.
//!
//! LUKS1 keeps clevis metadata in a luksmeta side-car store, LUKS2 in native
//! JSON tokens. Both are reached through [`metadata::LuksMetadata`].

use std::fmt;

pub mod cryptsetup;
pub mod dump;
pub mod inspect;
pub mod keyslot;
pub mod luksmeta;
pub mod metadata;

pub use inspect::DeviceInspector;
pub use keyslot::{KeyslotManager, PassphraseChange};
pub use metadata::{Backup, LuksMetadata, MetadataFormat, MetadataTransaction, CLEVIS_UUID};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LuksDeviceType {
    Luks1,
    Luks2,
}

impl LuksDeviceType {
    pub const ALL: [LuksDeviceType; 2] = [LuksDeviceType::Luks1, LuksDeviceType::Luks2];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Luks1 => "luks1",
            Self::Luks2 => "luks2",
        }
    }

    /// Number of keyslots in the header.
    pub fn keyslots(&self) -> u32 {
        match self {
            Self::Luks1 => 8,
            Self::Luks2 => 32,
        }
    }
}

impl fmt::Display for LuksDeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
