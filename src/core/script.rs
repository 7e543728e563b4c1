//! Locking and unlocking scripts
//!
//! Only the two standard templates recipients may use are built here, and
//! only the single-signature P2PKH unlock form is ever parsed.

use crate::error::{EngineError, Result};
use crate::utils::sha256_digest;
use data_encoding::HEXLOWER;

pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;

pub const COMPRESSED_PUBKEY_LEN: usize = 33;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    P2PKH([u8; 20]),
    P2SH([u8; 20]),
    Other,
}

pub fn p2pkh_locking_script(pub_key_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[OP_DUP, OP_HASH160, 20]);
    script.extend_from_slice(pub_key_hash);
    script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
    script
}

pub fn p2sh_locking_script(script_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(23);
    script.extend_from_slice(&[OP_HASH160, 20]);
    script.extend_from_slice(script_hash);
    script.push(OP_EQUAL);
    script
}

pub fn classify(script: &[u8]) -> ScriptKind {
    let mut hash = [0u8; 20];
    match script {
        [OP_DUP, OP_HASH160, 20, body @ .., OP_EQUALVERIFY, OP_CHECKSIG] if body.len() == 20 => {
            hash.copy_from_slice(body);
            ScriptKind::P2PKH(hash)
        }
        [OP_HASH160, 20, body @ .., OP_EQUAL] if body.len() == 20 => {
            hash.copy_from_slice(body);
            ScriptKind::P2SH(hash)
        }
        _ => ScriptKind::Other,
    }
}

/// Minimal push encoding of `data`.
pub fn push_data(data: &[u8]) -> Vec<u8> {
    let len = data.len();
    let mut out = Vec::with_capacity(len + 5);
    if len < OP_PUSHDATA1 as usize {
        out.push(len as u8);
    } else if len <= 0xff {
        out.extend_from_slice(&[OP_PUSHDATA1, len as u8]);
    } else if len <= 0xffff {
        out.push(OP_PUSHDATA2);
        out.extend_from_slice(&(len as u16).to_le_bytes());
    } else {
        out.push(OP_PUSHDATA4);
        out.extend_from_slice(&(len as u32).to_le_bytes());
    }
    out.extend_from_slice(data);
    out
}

/// Split a push-only script into its pushed items.
fn parse_pushes(script: &[u8]) -> Result<Vec<&[u8]>> {
    let truncated = || EngineError::MalformedUnlockScript("push runs past end of script".into());
    let mut items = Vec::new();
    let mut pos = 0;

    while pos < script.len() {
        let opcode = script[pos];
        pos += 1;
        let (len, header) = match opcode {
            0x01..=0x4b => (opcode as usize, 0),
            OP_PUSHDATA1 => (*script.get(pos).ok_or_else(truncated)? as usize, 1),
            OP_PUSHDATA2 => {
                let bytes = script.get(pos..pos + 2).ok_or_else(truncated)?;
                (u16::from_le_bytes([bytes[0], bytes[1]]) as usize, 2)
            }
            OP_PUSHDATA4 => {
                let bytes = script.get(pos..pos + 4).ok_or_else(truncated)?;
                let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                (len as usize, 4)
            }
            other => {
                return Err(EngineError::MalformedUnlockScript(format!(
                    "unexpected opcode 0x{other:02x}"
                )))
            }
        };
        pos += header;
        let end = pos.checked_add(len).ok_or_else(truncated)?;
        items.push(script.get(pos..end).ok_or_else(truncated)?);
        pos = end;
    }

    Ok(items)
}

/// Unlock script of a single-signature spend: the signature (with its sighash
/// suffix byte) followed by a compressed public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct P2PKHUnlock {
    pub signature: Vec<u8>,
    pub public_key: [u8; COMPRESSED_PUBKEY_LEN],
}

pub fn parse_p2pkh_unlock(script: &[u8]) -> Result<P2PKHUnlock> {
    let items = parse_pushes(script)?;
    let [signature, public_key] = items.as_slice() else {
        return Err(EngineError::MalformedUnlockScript(format!(
            "expected 2 pushes, found {}",
            items.len()
        )));
    };

    if signature.len() < 2 {
        return Err(EngineError::MalformedUnlockScript(
            "signature push is too short".to_string(),
        ));
    }
    if public_key.len() != COMPRESSED_PUBKEY_LEN || !matches!(public_key[0], 0x02 | 0x03) {
        return Err(EngineError::MalformedUnlockScript(format!(
            "second push is not a compressed public key: {}",
            HEXLOWER.encode(public_key)
        )));
    }

    let mut key = [0u8; COMPRESSED_PUBKEY_LEN];
    key.copy_from_slice(public_key);
    Ok(P2PKHUnlock {
        signature: signature.to_vec(),
        public_key: key,
    })
}

pub fn build_p2pkh_unlock(signature: &[u8], public_key: &[u8]) -> Vec<u8> {
    let mut script = push_data(signature);
    script.extend_from_slice(&push_data(public_key));
    script
}

/// Subscription key for a locking script: SHA256 of the script, hex encoded
/// in reverse byte order.
pub fn script_hash(locking_script: &[u8]) -> String {
    let mut digest = sha256_digest(locking_script);
    digest.reverse();
    HEXLOWER.encode(&digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_key() -> [u8; 33] {
        let mut key = [0x11u8; 33];
        key[0] = 0x02;
        key
    }

    #[test]
    fn test_classify_templates() {
        let hash = [7u8; 20];
        assert_eq!(classify(&p2pkh_locking_script(&hash)), ScriptKind::P2PKH(hash));
        assert_eq!(classify(&p2sh_locking_script(&hash)), ScriptKind::P2SH(hash));
        assert_eq!(classify(&[0x6a, 0x01, 0x00]), ScriptKind::Other);
        assert_eq!(p2pkh_locking_script(&hash).len(), 25);
    }

    #[test]
    fn test_unlock_round_trip() {
        let signature = vec![0x30; 72];
        let script = build_p2pkh_unlock(&signature, &sample_key());
        let parsed = parse_p2pkh_unlock(&script).unwrap();
        assert_eq!(parsed.signature, signature);
        assert_eq!(parsed.public_key, sample_key());
    }

    #[test]
    fn test_unlock_requires_two_pushes() {
        let one = push_data(&[0x30; 71]);
        assert!(matches!(
            parse_p2pkh_unlock(&one),
            Err(EngineError::MalformedUnlockScript(_))
        ));

        let mut three = build_p2pkh_unlock(&[0x30; 71], &sample_key());
        three.extend_from_slice(&push_data(&[1]));
        assert!(parse_p2pkh_unlock(&three).is_err());
    }

    #[test]
    fn test_unlock_rejects_uncompressed_key_and_opcodes() {
        let mut uncompressed = vec![0x04];
        uncompressed.extend_from_slice(&[0x22; 64]);
        let script = build_p2pkh_unlock(&[0x30; 71], &uncompressed);
        assert!(parse_p2pkh_unlock(&script).is_err());

        let mut with_opcode = build_p2pkh_unlock(&[0x30; 71], &sample_key());
        with_opcode.insert(0, OP_DUP);
        assert!(parse_p2pkh_unlock(&with_opcode).is_err());

        let truncated = &build_p2pkh_unlock(&[0x30; 71], &sample_key())[..50];
        assert!(parse_p2pkh_unlock(truncated).is_err());
    }

    #[test]
    fn test_script_hash_is_reversed_sha256() {
        let hash = script_hash(&[]);
        assert_eq!(
            hash,
            "55b852781b9995a44c939b64e441ae2724b96f99c8f4fb9a141cfc9842c4b0e3"
        );
    }
}
