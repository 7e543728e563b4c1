// Transaction model for the contract: the raw transactions I read back from the
// indexer and the single fulfillment transaction I assemble and broadcast.
// Hashes are kept in display order in memory and only reversed on the wire.

use crate::core::codec::{self, Reader};
use crate::error::{EngineError, Result};
use crate::utils::{decode_hex, hash256, reversed_hex};
use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};

// An input spends output `vout` of the transaction with id `txid`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct TXInput {
    txid: [u8; 32],
    vout: u32,
    unlock_script: Vec<u8>,
    sequence: u32,
}

impl TXInput {
    pub fn new(txid: [u8; 32], vout: u32, unlock_script: Vec<u8>, sequence: u32) -> TXInput {
        TXInput {
            txid,
            vout,
            unlock_script,
            sequence,
        }
    }

    pub fn get_txid(&self) -> &[u8; 32] {
        &self.txid
    }

    pub fn get_txid_hex(&self) -> String {
        HEXLOWER.encode(&self.txid)
    }

    pub fn get_vout(&self) -> u32 {
        self.vout
    }

    pub fn get_unlock_script(&self) -> &[u8] {
        self.unlock_script.as_slice()
    }

    pub fn get_sequence(&self) -> u32 {
        self.sequence
    }

    pub fn spends(&self, txid: &[u8; 32], vout: u32) -> bool {
        self.txid == *txid && self.vout == vout
    }

    pub fn serialize(&self) -> Vec<u8> {
        codec::serialize_input(&self.txid, self.vout, &self.unlock_script, self.sequence)
    }
}

// An output pays `value` satoshis to whoever satisfies `locking_script`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct TXOutput {
    value: u64,
    locking_script: Vec<u8>,
}

impl TXOutput {
    pub fn new(value: u64, locking_script: Vec<u8>) -> TXOutput {
        TXOutput {
            value,
            locking_script,
        }
    }

    pub fn get_value(&self) -> u64 {
        self.value
    }

    pub fn get_locking_script(&self) -> &[u8] {
        self.locking_script.as_slice()
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        codec::serialize_output(self.value, &self.locking_script)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    version: u32,
    vin: Vec<TXInput>,
    vout: Vec<TXOutput>,
    locktime: u32,
}

impl Transaction {
    pub fn new(version: u32, vin: Vec<TXInput>, vout: Vec<TXOutput>, locktime: u32) -> Self {
        Transaction {
            version,
            vin,
            vout,
            locktime,
        }
    }

    /// Parse a raw transaction. Trailing bytes are rejected.
    pub fn decode(raw: &[u8]) -> Result<Transaction> {
        let mut reader = Reader::new(raw);
        let version = reader.read_u32()?;

        let input_count = reader.read_var_int()?;
        let mut vin = Vec::new();
        for _ in 0..input_count {
            let mut txid = reader.read_hash()?;
            txid.reverse();
            let vout = reader.read_u32()?;
            let unlock_script = reader.read_var_bytes()?.to_vec();
            let sequence = reader.read_u32()?;
            vin.push(TXInput::new(txid, vout, unlock_script, sequence));
        }

        let output_count = reader.read_var_int()?;
        let mut vout = Vec::new();
        for _ in 0..output_count {
            let value = reader.read_output_value()?;
            let locking_script = reader.read_var_bytes()?.to_vec();
            vout.push(TXOutput::new(value, locking_script));
        }

        let locktime = reader.read_u32()?;
        if !reader.is_empty() {
            return Err(EngineError::Codec(
                "Trailing bytes after transaction locktime".to_string(),
            ));
        }

        Ok(Transaction {
            version,
            vin,
            vout,
            locktime,
        })
    }

    pub fn from_hex(raw_hex: &str) -> Result<Transaction> {
        Transaction::decode(&decode_hex(raw_hex)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let inputs: Vec<Vec<u8>> = self.vin.iter().map(TXInput::serialize).collect();
        let outputs = self
            .vout
            .iter()
            .map(TXOutput::serialize)
            .collect::<Result<Vec<_>>>()?;
        Ok(codec::assemble_transaction(
            self.version,
            &inputs,
            &outputs,
            self.locktime,
        ))
    }

    pub fn to_hex(&self) -> Result<String> {
        Ok(HEXLOWER.encode(&self.encode()?))
    }

    /// Transaction id in display order.
    pub fn hash(&self) -> Result<[u8; 32]> {
        let mut id = hash256(&self.encode()?);
        id.reverse();
        Ok(id)
    }

    pub fn hash_hex(&self) -> Result<String> {
        Ok(reversed_hex(&hash256(&self.encode()?)))
    }

    pub fn get_version(&self) -> u32 {
        self.version
    }

    pub fn get_vin(&self) -> &[TXInput] {
        self.vin.as_slice()
    }

    pub fn get_vout(&self) -> &[TXOutput] {
        self.vout.as_slice()
    }

    pub fn get_output(&self, index: u32) -> Option<&TXOutput> {
        self.vout.get(index as usize)
    }

    pub fn get_locktime(&self) -> u32 {
        self.locktime
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::monetary::FINAL_SEQUENCE;

    // The genesis block coinbase, a well known fixture
    const GENESIS_COINBASE: &str = "01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff4d04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73ffffffff0100f2052a01000000434104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac00000000";

    #[test]
    fn test_decode_genesis_coinbase() {
        let tx = Transaction::from_hex(GENESIS_COINBASE).unwrap();
        assert_eq!(tx.get_version(), 1);
        assert_eq!(tx.get_vin().len(), 1);
        assert_eq!(tx.get_vin()[0].get_vout(), 0xffff_ffff);
        assert_eq!(tx.get_vout()[0].get_value(), 5_000_000_000);
        assert_eq!(
            tx.hash_hex().unwrap(),
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
        );
        assert_eq!(tx.to_hex().unwrap(), GENESIS_COINBASE);
    }

    #[test]
    fn test_input_hash_is_display_order() {
        let mut txid = [0u8; 32];
        txid[0] = 0x11;
        let tx = Transaction::new(
            2,
            vec![TXInput::new(txid, 3, vec![], FINAL_SEQUENCE)],
            vec![TXOutput::new(1_000, vec![0x51])],
            0,
        );
        let decoded = Transaction::decode(&tx.encode().unwrap()).unwrap();
        assert_eq!(decoded, tx);
        assert!(decoded.get_vin()[0].spends(&txid, 3));
        assert_eq!(decoded.hash().unwrap().to_vec(), decode_hex(&tx.hash_hex().unwrap()).unwrap());
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut raw = decode_hex(GENESIS_COINBASE).unwrap();
        raw.push(0x00);
        assert!(Transaction::decode(&raw).is_err());
        assert!(Transaction::decode(&raw[..20]).is_err());
    }
}
