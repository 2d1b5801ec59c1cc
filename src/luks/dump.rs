//! Parsers for `cryptsetup luksDump` output.

use crate::error::{ClevisError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

static LUKS1_KEYSLOT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^Key Slot\s(\d+): ENABLED\s*$").unwrap());
static LUKS2_KEYSLOT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s+(\d+): luks2\s*$").unwrap());
static LUKS1_KEY_BITS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^MK bits:\s*(\d+)\s*$").unwrap());
static LUKS2_KEY_BITS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s+Key:\s+(\d+) bits\s*$").unwrap());
static TOKEN_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s+(\d+):\s+(\S+)\s*$").unwrap());
static TOKEN_KEYSLOT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s+Keyslots?:\s+(\d+)\s*$").unwrap());

/// A LUKS2 token entry as listed under `Tokens:`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub id: u32,
    pub kind: String,
    pub keyslots: Vec<u32>,
}

fn non_empty(dump: &str) -> Result<&str> {
    match dump.trim() {
        "" => Err(ClevisError::MalformedMetadata(
            "empty luksDump output".into(),
        )),
        _ => Ok(dump),
    }
}

fn captures(regex: &Regex, dump: &str) -> BTreeSet<u32> {
    regex
        .captures_iter(dump)
        .filter_map(|c| c[1].parse().ok())
        .collect()
}

fn first_capture(regex: &Regex, dump: &str) -> Option<u32> {
    regex.captures(dump).and_then(|c| c[1].parse().ok())
}

/// Keyslots holding a passphrase, whether clevis-bound or not.
pub fn luks1_keyslots(dump: &str) -> Result<BTreeSet<u32>> {
    Ok(captures(&LUKS1_KEYSLOT, non_empty(dump)?))
}

pub fn luks2_keyslots(dump: &str) -> Result<BTreeSet<u32>> {
    Ok(captures(&LUKS2_KEYSLOT, non_empty(dump)?))
}

/// Master key entropy in bits.
pub fn luks1_key_bits(dump: &str) -> Option<u32> {
    first_capture(&LUKS1_KEY_BITS, dump)
}

pub fn luks2_key_bits(dump: &str) -> Option<u32> {
    first_capture(&LUKS2_KEY_BITS, dump)
}

pub fn luks2_tokens(dump: &str) -> Vec<Token> {
    let mut tokens: Vec<Token> = Vec::new();
    let mut in_tokens = false;
    for line in dump.lines() {
        if !in_tokens {
            in_tokens = line.trim_end() == "Tokens:";
            continue;
        }
        if !line.starts_with(char::is_whitespace) {
            // Next top-level section, usually `Digests:`.
            break;
        }
        if let Some(header) = TOKEN_HEADER.captures(line) {
            if let Ok(id) = header[1].parse() {
                tokens.push(Token {
                    id,
                    kind: header[2].to_string(),
                    keyslots: Vec::new(),
                });
            }
        } else if let Some(keyslot) = TOKEN_KEYSLOT.captures(line) {
            if let (Some(token), Ok(slot)) = (tokens.last_mut(), keyslot[1].parse()) {
                token.keyslots.push(slot);
            }
        }
    }
    tokens
}

pub fn clevis_token_for_slot(dump: &str, slot: u32) -> Option<u32> {
    luks2_tokens(dump)
        .into_iter()
        .find(|t| t.kind == "clevis" && t.keyslots.contains(&slot))
        .map(|t| t.id)
}
