//! The `luksmeta` side-car store used for clevis metadata on LUKS1 devices.

use crate::command::Tool;
use crate::error::Result;
use crate::host::LuksMetaTool;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

static SHOW_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d+)\s+(active|inactive)\s+(\S+)\s*$").unwrap());

#[derive(Debug, Clone)]
pub struct LuksMeta {
    tool: Tool,
}

/// One line of `luksmeta show`, e.g. `1   active cb6e8904-...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShowEntry {
    pub slot: u32,
    pub active: bool,
    pub uuid: Option<String>,
}

pub fn parse_show(output: &str) -> Vec<ShowEntry> {
    output
        .lines()
        .filter_map(|line| SHOW_LINE.captures(line))
        .filter_map(|c| {
            Some(ShowEntry {
                slot: c[1].parse().ok()?,
                active: &c[2] == "active",
                uuid: match &c[3] {
                    "empty" => None,
                    uuid => Some(uuid.to_string()),
                },
            })
        })
        .collect()
}

impl LuksMeta {
    pub fn new(binary: &Path) -> Self {
        Self {
            tool: Tool::new(binary),
        }
    }
}

impl LuksMetaTool for LuksMeta {
    fn is_initialized(&self, device: &str) -> Result<bool> {
        Ok(self.tool.run(["test", "-d", device], None)?.success())
    }

    fn initialize(&self, device: &str) -> Result<()> {
        self.tool
            .run_checked(["init", "-f", "-d", device], None)
            .map(drop)
    }

    fn show(&self, device: &str) -> Result<String> {
        Ok(self
            .tool
            .run_checked(["show", "-d", device], None)?
            .stdout_string())
    }

    fn load(&self, device: &str, slot: u32, uuid: &str) -> Result<String> {
        let slot = slot.to_string();
        let args = ["load", "-d", device, "-s", slot.as_str(), "-u", uuid];
        let out = self.tool.run_checked(args, None)?;
        Ok(out.stdout_string().trim_end().to_string())
    }

    fn save(&self, device: &str, slot: u32, uuid: &str, data: &str) -> Result<()> {
        let slot = slot.to_string();
        let args = ["save", "-d", device, "-s", slot.as_str(), "-u", uuid];
        self.tool.run_checked(args, Some(data.as_bytes())).map(drop)
    }

    fn wipe(&self, device: &str, slot: u32, uuid: &str) -> Result<()> {
        let slot = slot.to_string();
        let args = ["wipe", "-f", "-d", device, "-s", slot.as_str(), "-u", uuid];
        self.tool.run_checked(args, None).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::luks::CLEVIS_UUID;
    use uuid::Uuid;

    #[test]
    fn show_output() {
        let foreign = Uuid::new_v4().to_string();
        let output = format!(
            "0   active empty\n1   active {CLEVIS_UUID}\n2 inactive empty\n3   active {foreign}\n"
        );
        let entries = parse_show(&output);
        assert_eq!(entries.len(), 4);
        assert_eq!(
            entries[0],
            ShowEntry {
                slot: 0,
                active: true,
                uuid: None
            }
        );
        assert_eq!(entries[1].uuid.as_deref(), Some(CLEVIS_UUID));
        assert!(!entries[2].active);
        assert_eq!(entries[3].uuid, Some(foreign));
    }

    #[test]
    fn show_ignores_noise() {
        assert!(parse_show("luksmeta: device is not initialized\n").is_empty());
    }
}
