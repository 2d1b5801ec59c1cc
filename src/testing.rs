//! In-memory stand-in for cryptsetup, luksmeta, clevis, pwmake and tang.
//!
//! Devices render `luksDump` and `luksmeta show` text so the real parsers
//! run against it. Every mutating call is recorded, attempted or not.

use crate::error::{ClevisError, Result};
use crate::host::{AdvertisementFetcher, ClevisTool, LuksMetaTool, LuksTool, SecretGenerator};
use crate::luks::{LuksDeviceType, CLEVIS_UUID};
use crate::policy::jwe::{self, b64_encode};
use crate::policy::tang::{advertisement_url, Advertisement};
use crate::policy::Pin;
use crate::secret::{Credential, Secret};
use serde_json::{json, Value};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;

const CORRUPT_TAG: &str = "Y29ycnVwdA";
const NO_KEY: &str = "No key available with this passphrase.";

#[derive(Debug, Default)]
struct Device {
    luks_type: Option<LuksDeviceType>,
    keyslots: BTreeMap<u32, Vec<u8>>,
    /// `None` until `luksmeta init`.
    luksmeta: Option<BTreeMap<u32, (String, String)>>,
    tokens: BTreeMap<u32, Value>,
}

#[derive(Debug, Default)]
struct Server {
    keys: Vec<Value>,
    generation: u32,
    down: bool,
}

#[derive(Default)]
pub struct FakeHost {
    devices: RefCell<HashMap<String, Device>>,
    servers: RefCell<HashMap<String, Server>>,
    /// Blob to the secret it decrypts to.
    blobs: RefCell<HashMap<String, Secret>>,
    mutations: RefCell<Vec<String>>,
    generated: RefCell<Vec<u32>>,
    counter: Cell<u32>,
    corrupt_writes: Cell<u32>,
    fail_add_key: Cell<bool>,
    fail_kill_slot: Cell<bool>,
    fail_change_key_after: Cell<Option<u32>>,
    encrypt_lies: Cell<bool>,
}

fn failure(program: &str, diagnostic: impl Into<String>) -> ClevisError {
    ClevisError::ExternalToolFailure {
        program: program.into(),
        status: 1,
        diagnostic: diagnostic.into(),
    }
}

fn no_token(token_id: u32) -> ClevisError {
    failure("cryptsetup", format!("Token {token_id} is not in use."))
}

fn credential_bytes(credential: &Credential) -> Result<Vec<u8>> {
    match credential {
        Credential::Passphrase(secret) => Ok(secret.as_bytes().to_vec()),
        Credential::Keyfile(path) => Ok(std::fs::read(path)?),
    }
}

fn corrupt(compact: &str) -> String {
    match compact.rsplit_once('.') {
        Some((head, _)) => format!("{head}.{CORRUPT_TAG}"),
        None => CORRUPT_TAG.to_string(),
    }
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    // Setup, not recorded as mutations.

    pub fn add_device(&self, device: &str, luks_type: LuksDeviceType, passphrase: &str) {
        let mut state = Device {
            luks_type: Some(luks_type),
            ..Device::default()
        };
        state.keyslots.insert(0, passphrase.as_bytes().to_vec());
        self.devices.borrow_mut().insert(device.to_string(), state);
    }

    pub fn add_plain_device(&self, device: &str) {
        self.devices
            .borrow_mut()
            .insert(device.to_string(), Device::default());
    }

    pub fn set_passphrase(&self, device: &str, slot: u32, passphrase: &str) {
        self.with_device(device, |d| {
            d.keyslots.insert(slot, passphrase.as_bytes().to_vec());
            Ok(())
        })
        .unwrap();
    }

    pub fn add_server(&self, server: &str) {
        let mut state = Server::default();
        state.keys.push(Self::server_key(server, 0));
        self.servers.borrow_mut().insert(server.to_string(), state);
    }

    /// Replace the server's keys with a fresh one.
    pub fn rotate_keys(&self, server: &str) {
        let mut servers = self.servers.borrow_mut();
        let state = servers.get_mut(server).unwrap();
        state.generation += 1;
        state.keys = vec![Self::server_key(server, state.generation)];
    }

    pub fn set_server_down(&self, server: &str, down: bool) {
        self.servers.borrow_mut().get_mut(server).unwrap().down = down;
    }

    pub fn corrupt_next_writes(&self, count: u32) {
        self.corrupt_writes.set(count);
    }

    pub fn fail_add_key(&self, fail: bool) {
        self.fail_add_key.set(fail);
    }

    pub fn fail_kill_slot(&self, fail: bool) {
        self.fail_kill_slot.set(fail);
    }

    /// Let `count` more key changes succeed, then fail.
    pub fn fail_change_key_after(&self, count: Option<u32>) {
        self.fail_change_key_after.set(count);
    }

    /// `clevis encrypt` exits 0 with a blob that decrypts to something else.
    pub fn encrypt_lies(&self, lies: bool) {
        self.encrypt_lies.set(lies);
    }

    // Inspection.

    pub fn mutations(&self) -> Vec<String> {
        self.mutations.borrow().clone()
    }

    pub fn clear_mutations(&self) {
        self.mutations.borrow_mut().clear();
    }

    pub fn generated_bits(&self) -> Vec<u32> {
        self.generated.borrow().clone()
    }

    pub fn passphrase(&self, device: &str, slot: u32) -> Option<String> {
        self.devices
            .borrow()
            .get(device)?
            .keyslots
            .get(&slot)
            .map(|p| String::from_utf8_lossy(p).into_owned())
    }

    pub fn luksmeta_initialized(&self, device: &str) -> bool {
        self.devices
            .borrow()
            .get(device)
            .map_or(false, |d| d.luksmeta.is_some())
    }

    /// Metadata entries and tokens, for before/after comparisons.
    pub fn metadata_snapshot(&self, device: &str) -> String {
        let devices = self.devices.borrow();
        let Some(d) = devices.get(device) else {
            return String::new();
        };
        format!("{:?} {:?}", d.luksmeta, d.tokens)
    }

    pub fn keyslot_snapshot(&self, device: &str) -> BTreeMap<u32, Vec<u8>> {
        self.devices
            .borrow()
            .get(device)
            .map(|d| d.keyslots.clone())
            .unwrap_or_default()
    }

    fn server_key(server: &str, generation: u32) -> Value {
        json!({
            "kty": "EC",
            "crv": "P-521",
            "x": b64_encode(format!("{server}-{generation}")),
            "y": "AQAB",
            "alg": "ECMR"
        })
    }

    fn record(&self, mutation: String) {
        self.mutations.borrow_mut().push(mutation);
    }

    fn next(&self) -> u32 {
        let n = self.counter.get() + 1;
        self.counter.set(n);
        n
    }

    fn take_corruption(&self) -> bool {
        let remaining = self.corrupt_writes.get();
        if remaining > 0 {
            self.corrupt_writes.set(remaining - 1);
        }
        remaining > 0
    }

    fn with_device<T>(&self, device: &str, f: impl FnOnce(&mut Device) -> Result<T>) -> Result<T> {
        let mut devices = self.devices.borrow_mut();
        let state = devices
            .get_mut(device)
            .ok_or_else(|| failure("cryptsetup", format!("Device {device} does not exist")))?;
        f(state)
    }

    fn unlocks(device: &Device, credential: &Credential, slot: Option<u32>) -> Result<bool> {
        let key = credential_bytes(credential)?;
        Ok(device
            .keyslots
            .iter()
            .any(|(s, k)| *k == key && slot.map_or(true, |slot| slot == *s)))
    }

    fn render_dump(device: &Device) -> String {
        let mut out = String::new();
        match device.luks_type {
            Some(LuksDeviceType::Luks1) => {
                out.push_str("LUKS header information for fake\n\nVersion:       \t1\n");
                out.push_str("Cipher name:   \taes\nMK bits:       \t512\n\n");
                for slot in 0..8 {
                    let state = match device.keyslots.contains_key(&slot) {
                        true => "ENABLED",
                        false => "DISABLED",
                    };
                    let _ = writeln!(out, "Key Slot {slot}: {state}");
                }
            }
            Some(LuksDeviceType::Luks2) => {
                out.push_str("LUKS header information\nVersion:       \t2\n\nKeyslots:\n");
                for slot in device.keyslots.keys() {
                    let _ = writeln!(
                        out,
                        "  {slot}: luks2\n\tKey:        512 bits\n\tPriority:   normal"
                    );
                }
                out.push_str("Tokens:\n");
                for (id, token) in &device.tokens {
                    let kind = token["type"].as_str().unwrap_or("unknown");
                    let _ = writeln!(out, "  {id}: {kind}");
                    for slot in token["keyslots"].as_array().into_iter().flatten() {
                        let _ = writeln!(out, "\tKeyslot:    {}", slot.as_str().unwrap_or(""));
                    }
                }
                out.push_str("Digests:\n  0: pbkdf2\n\tHash:       sha256\n");
            }
            None => {}
        }
        out
    }

    /// The clevis header `clevis encrypt` would write for `config`.
    fn clevis_header(&self, pin: Pin, config: &Value) -> Result<Value> {
        match pin {
            Pin::Tang => {
                let adv = Advertisement::from_value(config["adv"].clone())?;
                Ok(json!({
                    "pin": "tang",
                    "tang": {"url": config["url"], "adv": {"keys": adv.keys()?}}
                }))
            }
            Pin::Tpm2 => Ok(json!({"pin": "tpm2", "tpm2": config})),
            Pin::Sss => {
                let mut children = Vec::new();
                for (name, configs) in config["pins"].as_object().into_iter().flatten() {
                    let child_pin: Pin = name.parse()?;
                    for child in configs.as_array().into_iter().flatten() {
                        children.push(self.blob(self.clevis_header(child_pin, child)?));
                    }
                }
                Ok(json!({
                    "pin": "sss",
                    "sss": {"t": config["t"], "p": "cHJpbWU", "jwe": children}
                }))
            }
        }
    }

    fn blob(&self, clevis: Value) -> String {
        let header = json!({"alg": "ECDH-ES", "enc": "A256GCM", "clevis": clevis});
        let header = b64_encode(header.to_string());
        let iv = b64_encode(self.next().to_string());
        format!("{header}..{iv}.Y2lwaGVydGV4dA.dGFn")
    }

    fn tang_urls(header: &Value) -> Vec<String> {
        match (header["pin"].as_str(), header["tang"]["url"].as_str()) {
            (Some("tang"), Some(url)) => vec![url.to_string()],
            _ => Vec::new(),
        }
    }
}

impl LuksTool for FakeHost {
    fn is_luks(&self, device: &str) -> Result<bool> {
        Ok(self
            .devices
            .borrow()
            .get(device)
            .map_or(false, |d| d.luks_type.is_some()))
    }

    fn is_luks_type(&self, device: &str, luks_type: LuksDeviceType) -> Result<bool> {
        Ok(self
            .devices
            .borrow()
            .get(device)
            .map_or(false, |d| d.luks_type == Some(luks_type)))
    }

    fn dump(&self, device: &str) -> Result<String> {
        self.with_device(device, |d| Ok(Self::render_dump(d)))
    }

    fn test_passphrase(
        &self,
        device: &str,
        credential: &Credential,
        slot: Option<u32>,
    ) -> Result<bool> {
        self.with_device(device, |d| Self::unlocks(d, credential, slot))
    }

    fn add_key(
        &self,
        device: &str,
        slot: u32,
        current: &Credential,
        new: &Credential,
    ) -> Result<()> {
        self.record(format!("luksAddKey {device} {slot}"));
        let fail = self.fail_add_key.get();
        self.with_device(device, |d| {
            if fail {
                return Err(failure("cryptsetup", "Keyslot open failed."));
            }
            if !Self::unlocks(d, current, None)? {
                return Err(failure("cryptsetup", NO_KEY));
            }
            if d.keyslots.contains_key(&slot) {
                return Err(failure("cryptsetup", format!("Key slot {slot} is full")));
            }
            d.keyslots.insert(slot, credential_bytes(new)?);
            Ok(())
        })
    }

    fn change_key(
        &self,
        device: &str,
        slot: u32,
        current: &Credential,
        new: &Credential,
    ) -> Result<()> {
        self.record(format!("luksChangeKey {device} {slot}"));
        if let Some(remaining) = self.fail_change_key_after.get() {
            if remaining == 0 {
                return Err(failure("cryptsetup", "Keyslot open failed."));
            }
            self.fail_change_key_after.set(Some(remaining - 1));
        }
        self.with_device(device, |d| {
            if !Self::unlocks(d, current, Some(slot))? {
                return Err(failure("cryptsetup", NO_KEY));
            }
            d.keyslots.insert(slot, credential_bytes(new)?);
            Ok(())
        })
    }

    fn kill_slot(&self, device: &str, slot: u32, _credential: Option<&Credential>) -> Result<()> {
        self.record(format!("luksKillSlot {device} {slot}"));
        let fail = self.fail_kill_slot.get();
        self.with_device(device, |d| {
            if fail || d.keyslots.remove(&slot).is_none() {
                let reason = format!("Keyslot {slot} is not active.");
                return Err(failure("cryptsetup", reason));
            }
            let slot = Value::String(slot.to_string());
            for token in d.tokens.values_mut() {
                if let Some(keyslots) = token["keyslots"].as_array_mut() {
                    keyslots.retain(|s| *s != slot);
                }
            }
            Ok(())
        })
    }

    fn remove_key(&self, device: &str, credential: &Credential) -> Result<()> {
        self.record(format!("luksRemoveKey {device}"));
        self.with_device(device, |d| {
            let key = credential_bytes(credential)?;
            let slot = d
                .keyslots
                .iter()
                .find(|(_, k)| **k == key)
                .map(|(s, _)| *s)
                .ok_or_else(|| failure("cryptsetup", NO_KEY))?;
            d.keyslots.remove(&slot);
            Ok(())
        })
    }

    fn token_export(&self, device: &str, token_id: u32) -> Result<String> {
        self.with_device(device, |d| {
            let token = d.tokens.get(&token_id).ok_or_else(|| no_token(token_id))?;
            Ok(serde_json::to_string(token)?)
        })
    }

    fn token_import(&self, device: &str, token: &str) -> Result<()> {
        self.record(format!("token import {device}"));
        let corrupted = self.take_corruption();
        self.with_device(device, |d| {
            let mut token: Value = serde_json::from_str(token)?;
            for slot in token["keyslots"].as_array().into_iter().flatten() {
                let slot: Option<u32> = slot.as_str().and_then(|s| s.parse().ok());
                if !slot.map_or(false, |s| d.keyslots.contains_key(&s)) {
                    return Err(failure("cryptsetup", "Failed to import token from file."));
                }
            }
            if corrupted {
                token["jwe"]["tag"] = Value::String(CORRUPT_TAG.into());
            }
            let id = (0..).find(|id| !d.tokens.contains_key(id)).unwrap_or(0);
            d.tokens.insert(id, token);
            Ok(())
        })
    }

    fn token_remove(&self, device: &str, token_id: u32) -> Result<()> {
        self.record(format!("token remove {device} {token_id}"));
        self.with_device(device, |d| match d.tokens.remove(&token_id) {
            Some(_) => Ok(()),
            None => Err(no_token(token_id)),
        })
    }
}

impl LuksMetaTool for FakeHost {
    fn is_initialized(&self, device: &str) -> Result<bool> {
        Ok(self.luksmeta_initialized(device))
    }

    fn initialize(&self, device: &str) -> Result<()> {
        self.record(format!("luksmeta init {device}"));
        self.with_device(device, |d| {
            d.luksmeta = Some(BTreeMap::new());
            Ok(())
        })
    }

    fn show(&self, device: &str) -> Result<String> {
        self.with_device(device, |d| {
            let entries = d
                .luksmeta
                .as_ref()
                .ok_or_else(|| failure("luksmeta", "Device is not initialized"))?;
            let mut out = String::new();
            for slot in 0..8 {
                let active = match d.keyslots.contains_key(&slot) {
                    true => "  active",
                    false => "inactive",
                };
                let uuid = entries.get(&slot).map_or("empty", |e| e.0.as_str());
                let _ = writeln!(out, "{slot} {active} {uuid}");
            }
            Ok(out)
        })
    }

    fn load(&self, device: &str, slot: u32, uuid: &str) -> Result<String> {
        self.with_device(device, |d| {
            match d.luksmeta.as_ref().and_then(|m| m.get(&slot)) {
                Some((stored, data)) if stored == uuid => Ok(format!("{data}\n")),
                _ => Err(failure("luksmeta", "The given slot has no data")),
            }
        })
    }

    fn save(&self, device: &str, slot: u32, uuid: &str, data: &str) -> Result<()> {
        self.record(format!("luksmeta save {device} {slot}"));
        let corrupted = self.take_corruption();
        self.with_device(device, |d| {
            let entries = d
                .luksmeta
                .as_mut()
                .ok_or_else(|| failure("luksmeta", "Device is not initialized"))?;
            if entries.contains_key(&slot) {
                return Err(failure("luksmeta", "The given slot is already in use"));
            }
            let data = match corrupted {
                true => corrupt(data.trim()),
                false => data.trim().to_string(),
            };
            entries.insert(slot, (uuid.to_string(), data));
            Ok(())
        })
    }

    fn wipe(&self, device: &str, slot: u32, uuid: &str) -> Result<()> {
        self.record(format!("luksmeta wipe {device} {slot}"));
        self.with_device(device, |d| {
            let entries = d
                .luksmeta
                .as_mut()
                .ok_or_else(|| failure("luksmeta", "Device is not initialized"))?;
            match entries.get(&slot) {
                Some((stored, _)) if stored == uuid => {
                    entries.remove(&slot);
                    Ok(())
                }
                _ => Err(failure("luksmeta", "The given slot has no data")),
            }
        })
    }
}

impl ClevisTool for FakeHost {
    fn encrypt(&self, pin: Pin, config: &str, secret: &Secret) -> Result<String> {
        let config: Value = serde_json::from_str(config)?;
        let blob = self.blob(self.clevis_header(pin, &config)?);
        let stored = match self.encrypt_lies.get() {
            true => Secret::from("not the secret"),
            false => secret.clone(),
        };
        self.blobs.borrow_mut().insert(blob.clone(), stored);
        Ok(blob)
    }

    fn decrypt(&self, blob: &str) -> Result<Secret> {
        let header = jwe::protected_header(blob)?;
        for url in Self::tang_urls(&header["clevis"]) {
            if self.servers.borrow().get(&url).map_or(true, |s| s.down) {
                let reason = format!("Unable to fetch recovery key from {url}");
                return Err(failure("clevis", reason));
            }
        }
        self.blobs
            .borrow()
            .get(blob.trim())
            .cloned()
            .ok_or_else(|| failure("clevis", "Unable to decrypt JWE"))
    }
}

impl SecretGenerator for FakeHost {
    fn generate(&self, bits: u32) -> Result<Secret> {
        self.generated.borrow_mut().push(bits);
        Ok(Secret::new(format!("generated-{}-{}", bits, self.next())))
    }
}

impl AdvertisementFetcher for FakeHost {
    fn fetch(&self, server: &str) -> Result<Advertisement> {
        let servers = self.servers.borrow();
        match servers.get(server) {
            Some(state) if !state.down => {
                let payload = b64_encode(json!({ "keys": state.keys }).to_string());
                Advertisement::from_value(json!({
                    "payload": payload,
                    "protected": "eyJhbGciOiJFUzUxMiIsImN0eSI6Imp3ay1zZXQranNvbiJ9",
                    "signature": "c2lnbmF0dXJl"
                }))
            }
            _ => Err(ClevisError::NetworkFetchFailure {
                url: advertisement_url(server),
                reason: "connection refused".into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::luks::dump;

    #[test]
    fn fake_dump_parses() -> eyre::Result<()> {
        let host = FakeHost::new();
        host.add_device("/dev/one", LuksDeviceType::Luks1, "a");
        host.add_device("/dev/two", LuksDeviceType::Luks2, "b");
        host.set_passphrase("/dev/two", 3, "c");
        assert_eq!(dump::luks1_keyslots(&host.dump("/dev/one")?)?.len(), 1);
        assert_eq!(dump::luks2_keyslots(&host.dump("/dev/two")?)?.len(), 2);
        host.initialize("/dev/one")?;
        host.save("/dev/one", 0, CLEVIS_UUID, "x.y.z.w.v")?;
        let shown = host.show("/dev/one")?;
        assert!(shown.contains(&format!("0   active {CLEVIS_UUID}")));
        Ok(())
    }
}
