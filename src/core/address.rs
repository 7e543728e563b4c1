//! Payment address codec
//!
//! Recipients may be given either as CashAddr (`bitcoincash:q...`) or as
//! legacy Base58Check addresses. Both decode to the same [`Address`], which
//! maps one-to-one onto a P2PKH or P2SH locking script.

use crate::core::script::{self, ScriptKind};
use crate::error::{EngineError, Result};
use crate::utils::{base58_decode, base58_encode, hash256};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";
const CHECKSUM_GROUPS: usize = 8;
const HASH_LEN: usize = 20;
const LEGACY_CHECKSUM_LEN: usize = 4;

static CHARSET_REV: Lazy<[Option<u8>; 128]> = Lazy::new(|| {
    let mut table = [None; 128];
    for (value, symbol) in CHARSET.iter().enumerate() {
        table[*symbol as usize] = Some(value as u8);
    }
    table
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
}

impl Network {
    pub fn cashaddr_prefix(&self) -> &'static str {
        match self {
            Network::Mainnet => "bitcoincash",
            Network::Testnet => "bchtest",
        }
    }

    fn legacy_version(&self, kind: AddressKind) -> u8 {
        match (self, kind) {
            (Network::Mainnet, AddressKind::P2PKH) => 0x00,
            (Network::Mainnet, AddressKind::P2SH) => 0x05,
            (Network::Testnet, AddressKind::P2PKH) => 0x6f,
            (Network::Testnet, AddressKind::P2SH) => 0xc4,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Testnet => write!(f, "testnet"),
        }
    }
}

impl FromStr for Network {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mainnet" | "bitcoincash" => Ok(Network::Mainnet),
            "testnet" | "bchtest" => Ok(Network::Testnet),
            _ => Err(EngineError::Config(format!(
                "Unknown network: {s}. Valid options: mainnet, testnet"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    P2PKH,
    P2SH,
}

impl AddressKind {
    fn type_bits(&self) -> u8 {
        match self {
            AddressKind::P2PKH => 0,
            AddressKind::P2SH => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub network: Network,
    pub kind: AddressKind,
    pub hash: [u8; HASH_LEN],
}

impl Address {
    pub fn new(network: Network, kind: AddressKind, hash: [u8; HASH_LEN]) -> Address {
        Address {
            network,
            kind,
            hash,
        }
    }

    /// Accepts CashAddr with or without prefix, or a legacy address.
    pub fn parse(address: &str) -> Result<Address> {
        let trimmed = address.trim();
        if trimmed.is_empty() {
            return Err(EngineError::InvalidAddress("empty address".to_string()));
        }
        if trimmed.contains(':') {
            return decode_cashaddr(trimmed);
        }
        decode_cashaddr(trimmed).or_else(|cash_err| decode_legacy(trimmed).map_err(|_| cash_err))
    }

    pub fn locking_script(&self) -> Vec<u8> {
        match self.kind {
            AddressKind::P2PKH => script::p2pkh_locking_script(&self.hash),
            AddressKind::P2SH => script::p2sh_locking_script(&self.hash),
        }
    }

    pub fn to_cashaddr(&self) -> String {
        let prefix = self.network.cashaddr_prefix();
        let mut payload = Vec::with_capacity(HASH_LEN + 1);
        // version byte: type in bits 3..6, size code 0 for a 160 bit hash
        payload.push(self.kind.type_bits() << 3);
        payload.extend_from_slice(&self.hash);

        let data = convert_bits(&payload, 8, 5, true).unwrap_or_default();
        let checksum = checksum(prefix, &data);

        let mut out = String::with_capacity(prefix.len() + 1 + data.len() + CHECKSUM_GROUPS);
        out.push_str(prefix);
        out.push(':');
        for value in data.iter().chain(checksum.iter()) {
            out.push(CHARSET[*value as usize] as char);
        }
        out
    }

    pub fn to_legacy(&self) -> String {
        let mut payload = vec![self.network.legacy_version(self.kind)];
        payload.extend_from_slice(&self.hash);
        let check = hash256(&payload);
        payload.extend_from_slice(&check[..LEGACY_CHECKSUM_LEN]);
        base58_encode(&payload)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_cashaddr())
    }
}

fn polymod(values: &[u8]) -> u64 {
    const GENERATORS: [u64; 5] = [
        0x98f2bc8e61,
        0x79b76d99e2,
        0xf33e5fb3c4,
        0xae2eabe2a8,
        0x1e4f43e470,
    ];
    let mut c: u64 = 1;
    for value in values {
        let c0 = (c >> 35) as u8;
        c = ((c & 0x07_ffff_ffff) << 5) ^ (*value as u64);
        for (bit, generator) in GENERATORS.iter().enumerate() {
            if c0 & (1 << bit) != 0 {
                c ^= generator;
            }
        }
    }
    c ^ 1
}

fn prefix_values(prefix: &str) -> Vec<u8> {
    let mut values: Vec<u8> = prefix.bytes().map(|b| b & 0x1f).collect();
    values.push(0);
    values
}

fn checksum(prefix: &str, data: &[u8]) -> [u8; CHECKSUM_GROUPS] {
    let mut values = prefix_values(prefix);
    values.extend_from_slice(data);
    values.extend_from_slice(&[0u8; CHECKSUM_GROUPS]);
    let modulus = polymod(&values);

    let mut out = [0u8; CHECKSUM_GROUPS];
    for (i, group) in out.iter_mut().enumerate() {
        *group = ((modulus >> (5 * (CHECKSUM_GROUPS - 1 - i))) & 0x1f) as u8;
    }
    out
}

fn convert_bits(data: &[u8], from: u32, to: u32, pad: bool) -> Result<Vec<u8>> {
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    let max = (1u32 << to) - 1;
    let mut out = Vec::with_capacity(data.len() * from as usize / to as usize + 1);

    for value in data {
        let value = *value as u32;
        if value >> from != 0 {
            return Err(EngineError::InvalidAddress("invalid data range".to_string()));
        }
        acc = (acc << from) | value;
        bits += from;
        while bits >= to {
            bits -= to;
            out.push(((acc >> bits) & max) as u8);
        }
    }

    if pad {
        if bits > 0 {
            out.push(((acc << (to - bits)) & max) as u8);
        }
    } else if bits >= from || ((acc << (to - bits)) & max) != 0 {
        return Err(EngineError::InvalidAddress("invalid padding".to_string()));
    }
    Ok(out)
}

fn decode_cashaddr(address: &str) -> Result<Address> {
    let has_lower = address.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = address.chars().any(|c| c.is_ascii_uppercase());
    if has_lower && has_upper {
        return Err(EngineError::InvalidAddress(format!(
            "{address}: mixed case"
        )));
    }
    let lowered = address.to_lowercase();

    let (candidates, body) = match lowered.split_once(':') {
        Some((prefix, body)) => {
            let network = [Network::Mainnet, Network::Testnet]
                .into_iter()
                .find(|network| network.cashaddr_prefix() == prefix)
                .ok_or_else(|| {
                    EngineError::InvalidAddress(format!("{address}: unknown prefix {prefix}"))
                })?;
            (vec![network], body)
        }
        None => (vec![Network::Mainnet, Network::Testnet], lowered.as_str()),
    };

    let mut data = Vec::with_capacity(body.len());
    for c in body.chars() {
        let value = CHARSET_REV
            .get(c as usize)
            .copied()
            .flatten()
            .ok_or_else(|| EngineError::InvalidAddress(format!("{address}: invalid character {c}")))?;
        data.push(value);
    }
    if data.len() <= CHECKSUM_GROUPS {
        return Err(EngineError::InvalidAddress(format!("{address}: too short")));
    }

    let network = candidates
        .into_iter()
        .find(|network| {
            let mut values = prefix_values(network.cashaddr_prefix());
            values.extend_from_slice(&data);
            polymod(&values) == 0
        })
        .ok_or_else(|| EngineError::InvalidAddress(format!("{address}: bad checksum")))?;

    let payload = convert_bits(&data[..data.len() - CHECKSUM_GROUPS], 5, 8, false)?;
    let (version, hash) = payload
        .split_first()
        .ok_or_else(|| EngineError::InvalidAddress(format!("{address}: empty payload")))?;

    if version & 0x07 != 0 || hash.len() != HASH_LEN {
        return Err(EngineError::InvalidAddress(format!(
            "{address}: only 160 bit hashes are supported"
        )));
    }
    let kind = match version >> 3 {
        0 => AddressKind::P2PKH,
        1 => AddressKind::P2SH,
        other => {
            return Err(EngineError::InvalidAddress(format!(
                "{address}: unsupported address type {other}"
            )))
        }
    };

    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(hash);
    Ok(Address::new(network, kind, out))
}

fn decode_legacy(address: &str) -> Result<Address> {
    let payload = base58_decode(address)?;
    if payload.len() != 1 + HASH_LEN + LEGACY_CHECKSUM_LEN {
        return Err(EngineError::InvalidAddress(format!(
            "{address}: unexpected length"
        )));
    }
    let (body, check) = payload.split_at(1 + HASH_LEN);
    if hash256(body)[..LEGACY_CHECKSUM_LEN] != *check {
        return Err(EngineError::InvalidAddress(format!("{address}: bad checksum")));
    }

    let (network, kind) = match body[0] {
        0x00 => (Network::Mainnet, AddressKind::P2PKH),
        0x05 => (Network::Mainnet, AddressKind::P2SH),
        0x6f => (Network::Testnet, AddressKind::P2PKH),
        0xc4 => (Network::Testnet, AddressKind::P2SH),
        other => {
            return Err(EngineError::InvalidAddress(format!(
                "{address}: unknown version byte 0x{other:02x}"
            )))
        }
    };

    let mut hash = [0u8; HASH_LEN];
    hash.copy_from_slice(&body[1..]);
    Ok(Address::new(network, kind, hash))
}

pub fn address_to_locking_script(address: &str) -> Result<Vec<u8>> {
    Ok(Address::parse(address)?.locking_script())
}

pub fn locking_script_to_address(locking_script: &[u8], network: Network) -> Result<Address> {
    match script::classify(locking_script) {
        ScriptKind::P2PKH(hash) => Ok(Address::new(network, AddressKind::P2PKH, hash)),
        ScriptKind::P2SH(hash) => Ok(Address::new(network, AddressKind::P2SH, hash)),
        ScriptKind::Other => Err(EngineError::UnsupportedScript(
            "locking script is neither P2PKH nor P2SH".to_string(),
        )),
    }
}

/// Typed check used before an output is accepted into a campaign.
pub fn validate_address(address: &str) -> Result<Address> {
    Address::parse(address)
}

pub fn is_well_formed_address(address: &str) -> bool {
    Address::parse(address).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_encoding::HEXUPPER;

    #[test]
    fn test_decode_cashaddr_p2pkh() {
        let address = Address::parse("bitcoincash:qr6m7j9njldwwzlg9v7v53unlr4jkmx6eylep8ekg2").unwrap();
        assert_eq!(address.network, Network::Mainnet);
        assert_eq!(address.kind, AddressKind::P2PKH);
        assert_eq!(
            HEXUPPER.encode(&address.hash),
            "F5BF48B397DAE70BE82B3CCA4793F8EB2B6CDAC9"
        );
    }

    #[test]
    fn test_decode_testnet_p2sh() {
        let address = Address::parse("bchtest:pr6m7j9njldwwzlg9v7v53unlr4jkmx6eyvwc0uz5t").unwrap();
        assert_eq!(address.network, Network::Testnet);
        assert_eq!(address.kind, AddressKind::P2SH);
        assert_eq!(
            HEXUPPER.encode(&address.hash),
            "F5BF48B397DAE70BE82B3CCA4793F8EB2B6CDAC9"
        );
    }

    #[test]
    fn test_cashaddr_round_trip_and_missing_prefix() {
        let text = "bitcoincash:qr6m7j9njldwwzlg9v7v53unlr4jkmx6eylep8ekg2";
        let address = Address::parse(text).unwrap();
        assert_eq!(address.to_cashaddr(), text);

        let bare = Address::parse("qr6m7j9njldwwzlg9v7v53unlr4jkmx6eylep8ekg2").unwrap();
        assert_eq!(bare, address);

        let upper = Address::parse(&text.to_uppercase()).unwrap();
        assert_eq!(upper, address);
    }

    #[test]
    fn test_legacy_and_cashaddr_agree() {
        let legacy = Address::parse("1BpEi6DfDAUFd7GtittLSdBeYJvcoaVggu").unwrap();
        let cash = Address::parse("bitcoincash:qpm2qsznhks23z7629mms6s4cwef74vcwvy22gdx6a").unwrap();
        assert_eq!(legacy, cash);
        assert_eq!(legacy.to_legacy(), "1BpEi6DfDAUFd7GtittLSdBeYJvcoaVggu");
    }

    #[test]
    fn test_legacy_genesis_address() {
        let address = Address::parse("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa").unwrap();
        assert_eq!(
            data_encoding::HEXLOWER.encode(&address.hash),
            "62e907b15cbf27d5425399ebf6f0fb50ebb88f18"
        );
        let script = address.locking_script();
        assert_eq!(
            locking_script_to_address(&script, Network::Mainnet).unwrap(),
            address
        );
    }

    #[test]
    fn test_rejects_corrupted_addresses() {
        // last character changed
        assert!(validate_address("bitcoincash:qr6m7j9njldwwzlg9v7v53unlr4jkmx6eylep8ekg3").is_err());
        assert!(validate_address("bitcoincash:Qr6m7j9njldwwzlg9v7v53unlr4jkmx6eylep8ekg2").is_err());
        assert!(validate_address("litecoin:qr6m7j9njldwwzlg9v7v53unlr4jkmx6eylep8ekg2").is_err());
        assert!(validate_address("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNb").is_err());
        assert!(!is_well_formed_address(""));
        assert!(is_well_formed_address("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa"));
    }

    #[test]
    fn test_locking_script_templates() {
        let p2sh = Address::parse("bchtest:pr6m7j9njldwwzlg9v7v53unlr4jkmx6eyvwc0uz5t").unwrap();
        let script = address_to_locking_script(&p2sh.to_cashaddr()).unwrap();
        assert_eq!(script.len(), 23);
        assert_eq!(script[0], crate::core::script::OP_HASH160);
        assert!(locking_script_to_address(&[0x6a], Network::Testnet).is_err());
    }
}
