use ring::digest::{Context, SHA256};
use ripemd::{Digest as RipemdDigest, Ripemd160};

use crate::error::{EngineError, Result};
use data_encoding::HEXLOWER;
use std::time::{SystemTime, UNIX_EPOCH};

/// Unix time in seconds, the resolution campaign windows and records use.
pub fn current_timestamp() -> Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| EngineError::Crypto(format!("System time error: {e}")))?
        .as_secs();

    if duration > i64::MAX as u64 {
        return Err(EngineError::Crypto("Timestamp overflow".to_string()));
    }

    Ok(duration as i64)
}

pub fn sha256_digest(data: &[u8]) -> Vec<u8> {
    let mut context = Context::new(&SHA256);
    context.update(data);
    let digest = context.finish();
    digest.as_ref().to_vec()
}

/// SHA256 applied twice, used for transaction ids, sighash and checksums.
pub fn hash256(data: &[u8]) -> [u8; 32] {
    let first = sha256_digest(data);
    let second = sha256_digest(&first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

pub fn ripemd160_digest(data: &[u8]) -> Vec<u8> {
    let mut hasher = Ripemd160::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// RIPEMD160(SHA256(data)), the digest P2PKH and P2SH scripts commit to.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let digest = ripemd160_digest(&sha256_digest(data));
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

pub fn base58_encode(data: &[u8]) -> String {
    bs58::encode(data).into_string()
}

pub fn base58_decode(data: &str) -> Result<Vec<u8>> {
    bs58::decode(data)
        .into_vec()
        .map_err(|e| EngineError::InvalidAddress(format!("Invalid base58 encoding: {e}")))
}

pub fn decode_hex(data: &str) -> Result<Vec<u8>> {
    HEXLOWER
        .decode(data.to_ascii_lowercase().as_bytes())
        .map_err(|e| EngineError::Codec(format!("Invalid hex string: {e}")))
}

/// Hex of the bytes in reverse order, how hashes are displayed on chain.
pub fn reversed_hex(bytes: &[u8]) -> String {
    let mut reversed = bytes.to_vec();
    reversed.reverse();
    HEXLOWER.encode(&reversed)
}

/// Parse a displayed 32-byte hash back into wire order.
pub fn decode_reversed_hash(display: &str) -> Result<[u8; 32]> {
    let bytes = decode_hex(display)?;
    if bytes.len() != 32 {
        return Err(EngineError::Codec(format!(
            "Expected a 32 byte hash, got {} bytes",
            bytes.len()
        )));
    }
    let mut out = [0u8; 32];
    for (i, byte) in bytes.iter().rev().enumerate() {
        out[i] = *byte;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash256_of_empty_input() {
        assert_eq!(
            HEXLOWER.encode(&hash256(b"")),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }

    #[test]
    fn test_hash160_of_generator_pubkey() {
        let pubkey = decode_hex(
            "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798",
        )
        .unwrap();
        assert_eq!(
            HEXLOWER.encode(&hash160(&pubkey)),
            "751e76e8199196d454941c45d1b3a323f1433bd6"
        );
    }

    #[test]
    fn test_reversed_hash_round_trip() {
        let display = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";
        let wire = decode_reversed_hash(display).unwrap();
        assert_eq!(wire[0], 0xff);
        assert_eq!(reversed_hex(&wire), display);
        assert!(decode_reversed_hash("abcd").is_err());
    }

    #[test]
    fn test_decode_hex_accepts_uppercase() {
        assert_eq!(decode_hex("ABcd").unwrap(), vec![0xab, 0xcd]);
        assert!(decode_hex("abc").is_err());
    }
}
