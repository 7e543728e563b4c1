//! Per-input signature hashing for the contract
//!
//! Every commitment signs its own outpoint plus the full recipient output
//! set and nothing else: the prevouts and sequence hashes are zero-filled and
//! the sighash type is ALL | ANYONECANPAY | FORKID. That lets inputs be
//! collected one at a time without invalidating earlier signatures.

use crate::core::codec::{encode_output_index, encode_output_value, encode_var_bytes};
use crate::core::monetary::{TRANSACTION_LOCKTIME, TRANSACTION_VERSION};
use crate::core::transaction::TXOutput;
use crate::error::{EngineError, Result};
use crate::utils::hash256;
use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_FORKID: u32 = 0x40;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

/// 0xc1, the only sighash type a commitment may carry.
pub const CONTRACT_SIGHASH_TYPE: u32 = SIGHASH_ALL | SIGHASH_FORKID | SIGHASH_ANYONECANPAY;

/// hash256 over each output's value followed by its length-prefixed script.
pub fn hash_outputs(outputs: &[TXOutput]) -> Result<[u8; 32]> {
    let mut buffer = Vec::new();
    for output in outputs {
        buffer.extend_from_slice(&encode_output_value(output.get_value())?);
        buffer.extend_from_slice(&encode_var_bytes(output.get_locking_script()));
    }
    Ok(hash256(&buffer))
}

/// Build the signing preimage for one commitment. `prev_tx_hash` is in
/// display order.
pub fn build_preimage(
    prev_tx_hash: &[u8; 32],
    prev_output_index: u32,
    prev_output_value: u64,
    prev_locking_script: &[u8],
    contract_outputs: &[TXOutput],
    sequence: u32,
) -> Result<Vec<u8>> {
    let mut preimage = Vec::with_capacity(4 + 32 + 32 + 36 + 26 + 8 + 4 + 32 + 4 + 4);
    preimage.extend_from_slice(&TRANSACTION_VERSION.to_le_bytes());
    preimage.extend_from_slice(&[0u8; 32]);
    preimage.extend_from_slice(&[0u8; 32]);
    preimage.extend(prev_tx_hash.iter().rev());
    preimage.extend_from_slice(&encode_output_index(prev_output_index));
    preimage.extend_from_slice(&encode_var_bytes(prev_locking_script));
    preimage.extend_from_slice(&encode_output_value(prev_output_value)?);
    preimage.extend_from_slice(&sequence.to_le_bytes());
    preimage.extend_from_slice(&hash_outputs(contract_outputs)?);
    preimage.extend_from_slice(&TRANSACTION_LOCKTIME.to_le_bytes());
    preimage.extend_from_slice(&CONTRACT_SIGHASH_TYPE.to_le_bytes());
    Ok(preimage)
}

pub fn build_signing_digest(
    prev_tx_hash: &[u8; 32],
    prev_output_index: u32,
    prev_output_value: u64,
    prev_locking_script: &[u8],
    contract_outputs: &[TXOutput],
    sequence: u32,
) -> Result<[u8; 32]> {
    let preimage = build_preimage(
        prev_tx_hash,
        prev_output_index,
        prev_output_value,
        prev_locking_script,
        contract_outputs,
        sequence,
    )?;
    Ok(hash256(&preimage))
}

/// Verify a DER signature carrying its trailing sighash byte.
///
/// Any suffix other than the contract type fails, since such a signature
/// commits to a different preimage than the one checked here.
pub fn verify(signature: &[u8], public_key: &[u8], digest: &[u8; 32]) -> bool {
    let Some((sighash_type, der)) = signature.split_last() else {
        return false;
    };
    if *sighash_type as u32 != CONTRACT_SIGHASH_TYPE {
        return false;
    }

    let Ok(verifying_key) = VerifyingKey::from_sec1_bytes(public_key) else {
        return false;
    };
    let Ok(parsed) = Signature::from_der(der) else {
        return false;
    };
    // the chain accepts high-S encodings that k256 refuses
    let normalized = parsed.normalize_s().unwrap_or(parsed);

    verifying_key.verify_prehash(digest, &normalized).is_ok()
}

/// Sign a digest, returning DER with the contract sighash byte appended.
pub fn sign(private_key: &[u8], digest: &[u8; 32]) -> Result<Vec<u8>> {
    let signing_key = SigningKey::from_slice(private_key)
        .map_err(|e| EngineError::Crypto(format!("Invalid private key: {e}")))?;
    let signature: Signature = signing_key
        .sign_prehash(digest)
        .map_err(|e| EngineError::Crypto(format!("Failed to sign digest: {e}")))?;

    let mut out = signature.to_der().as_bytes().to_vec();
    out.push(CONTRACT_SIGHASH_TYPE as u8);
    Ok(out)
}

/// Compressed SEC1 public key for a raw 32 byte private key.
pub fn public_key_for(private_key: &[u8]) -> Result<Vec<u8>> {
    let signing_key = SigningKey::from_slice(private_key)
        .map_err(|e| EngineError::Crypto(format!("Invalid private key: {e}")))?;
    Ok(signing_key
        .verifying_key()
        .as_affine()
        .to_encoded_point(true)
        .as_bytes()
        .to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::monetary::FINAL_SEQUENCE;
    use crate::core::script::p2pkh_locking_script;
    use crate::utils::hash160;

    const PRIVATE_KEY: [u8; 32] = [0x42; 32];

    fn recipients() -> Vec<TXOutput> {
        vec![
            TXOutput::new(500_000_000, p2pkh_locking_script(&[0xaa; 20])),
            TXOutput::new(1_000, p2pkh_locking_script(&[0xbb; 20])),
        ]
    }

    fn digest_for(outputs: &[TXOutput]) -> [u8; 32] {
        let public_key = public_key_for(&PRIVATE_KEY).unwrap();
        let prev_lock = p2pkh_locking_script(&hash160(&public_key));
        build_signing_digest(&[0x11; 32], 1, 600_000_000, &prev_lock, outputs, FINAL_SEQUENCE)
            .unwrap()
    }

    #[test]
    fn test_preimage_layout() {
        let prev_lock = p2pkh_locking_script(&[0xcc; 20]);
        let mut prev_hash = [0u8; 32];
        prev_hash[0] = 0x99;
        let preimage =
            build_preimage(&prev_hash, 7, 1_000, &prev_lock, &recipients(), FINAL_SEQUENCE)
                .unwrap();

        assert_eq!(preimage.len(), 4 + 32 + 32 + 36 + 26 + 8 + 4 + 32 + 4 + 4);
        assert_eq!(&preimage[..4], &[2, 0, 0, 0]);
        assert!(preimage[4..68].iter().all(|b| *b == 0));
        // outpoint hash is reversed, so the first display byte lands last
        assert_eq!(preimage[68 + 31], 0x99);
        assert_eq!(&preimage[100..104], &[7, 0, 0, 0]);
        assert_eq!(preimage[104], 25);
        assert_eq!(&preimage[preimage.len() - 4..], &[0xc1, 0, 0, 0]);
    }

    #[test]
    fn test_sign_then_verify() {
        let public_key = public_key_for(&PRIVATE_KEY).unwrap();
        let digest = digest_for(&recipients());
        let signature = sign(&PRIVATE_KEY, &digest).unwrap();

        assert_eq!(*signature.last().unwrap(), 0xc1);
        assert!(verify(&signature, &public_key, &digest));
    }

    #[test]
    fn test_signature_binds_recipient_amounts_and_addresses() {
        let public_key = public_key_for(&PRIVATE_KEY).unwrap();
        let signature = sign(&PRIVATE_KEY, &digest_for(&recipients())).unwrap();

        let mut changed_amount = recipients();
        changed_amount[1] = TXOutput::new(1_001, p2pkh_locking_script(&[0xbb; 20]));
        assert!(!verify(&signature, &public_key, &digest_for(&changed_amount)));

        let mut changed_address = recipients();
        changed_address[0] = TXOutput::new(500_000_000, p2pkh_locking_script(&[0xab; 20]));
        assert!(!verify(&signature, &public_key, &digest_for(&changed_address)));
    }

    #[test]
    fn test_verify_rejects_wrong_sighash_type_and_key() {
        let public_key = public_key_for(&PRIVATE_KEY).unwrap();
        let digest = digest_for(&recipients());
        let mut signature = sign(&PRIVATE_KEY, &digest).unwrap();

        let other_key = public_key_for(&[0x07; 32]).unwrap();
        assert!(!verify(&signature, &other_key, &digest));

        if let Some(last) = signature.last_mut() {
            *last = 0x41;
        }
        assert!(!verify(&signature, &public_key, &digest));
        assert!(!verify(&[], &public_key, &digest));
    }

    #[test]
    fn test_invalid_private_key() {
        assert!(sign(&[0u8; 32], &[1u8; 32]).is_err());
        assert!(public_key_for(&[0u8; 16]).is_err());
    }
}
