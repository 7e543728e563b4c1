//! Binary codec for the transaction wire format
//!
//! All integers are unsigned little-endian. Output values are written as two
//! 32-bit halves and bounded by [`MAX_SAFE_SATOSHIS`] even though the wire
//! field is a full 64 bits, so every amount the engine handles stays exact in
//! the JSON layer.

use crate::core::monetary::MAX_SAFE_SATOSHIS;
use crate::error::{EngineError, Result};

pub fn encode_var_int(n: u64) -> Vec<u8> {
    match n {
        0..=0xfc => vec![n as u8],
        0xfd..=0xffff => {
            let mut out = vec![0xfd];
            out.extend_from_slice(&(n as u16).to_le_bytes());
            out
        }
        0x1_0000..=0xffff_ffff => {
            let mut out = vec![0xfe];
            out.extend_from_slice(&(n as u32).to_le_bytes());
            out
        }
        _ => {
            let mut out = vec![0xff];
            out.extend_from_slice(&n.to_le_bytes());
            out
        }
    }
}

/// Returns the decoded value and the number of bytes consumed.
pub fn decode_var_int(bytes: &[u8]) -> Result<(u64, usize)> {
    let prefix = *bytes
        .first()
        .ok_or_else(|| EngineError::Codec("Empty buffer where a varint was expected".into()))?;
    let width = match prefix {
        0xfd => 2,
        0xfe => 4,
        0xff => 8,
        _ => return Ok((prefix as u64, 1)),
    };
    if bytes.len() < 1 + width {
        return Err(EngineError::Codec(format!(
            "Varint needs {width} bytes after its prefix"
        )));
    }
    let mut buf = [0u8; 8];
    buf[..width].copy_from_slice(&bytes[1..1 + width]);
    Ok((u64::from_le_bytes(buf), 1 + width))
}

pub fn encode_var_bytes(data: &[u8]) -> Vec<u8> {
    let mut out = encode_var_int(data.len() as u64);
    out.extend_from_slice(data);
    out
}

pub fn encode_output_value(satoshis: u64) -> Result<[u8; 8]> {
    if satoshis > MAX_SAFE_SATOSHIS {
        return Err(EngineError::InvalidAmount(format!(
            "{satoshis} exceeds the safe integer ceiling {MAX_SAFE_SATOSHIS}"
        )));
    }
    let low = (satoshis & 0xffff_ffff) as u32;
    let high = (satoshis >> 32) as u32;

    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&low.to_le_bytes());
    out[4..].copy_from_slice(&high.to_le_bytes());
    Ok(out)
}

pub fn decode_output_value(bytes: &[u8]) -> Result<u64> {
    if bytes.len() != 8 {
        return Err(EngineError::Codec(format!(
            "Output value must be 8 bytes, got {}",
            bytes.len()
        )));
    }
    let mut low = [0u8; 4];
    let mut high = [0u8; 4];
    low.copy_from_slice(&bytes[..4]);
    high.copy_from_slice(&bytes[4..]);
    let value = ((u32::from_le_bytes(high) as u64) << 32) | u32::from_le_bytes(low) as u64;
    if value > MAX_SAFE_SATOSHIS {
        return Err(EngineError::InvalidAmount(format!(
            "{value} exceeds the safe integer ceiling {MAX_SAFE_SATOSHIS}"
        )));
    }
    Ok(value)
}

pub fn encode_output_index(index: u32) -> [u8; 4] {
    index.to_le_bytes()
}

/// Serialize one input. `prev_hash` is in display order and is reversed onto
/// the wire.
pub fn serialize_input(
    prev_hash: &[u8; 32],
    prev_index: u32,
    unlock_script: &[u8],
    sequence: u32,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(41 + unlock_script.len());
    out.extend(prev_hash.iter().rev());
    out.extend_from_slice(&encode_output_index(prev_index));
    out.extend_from_slice(&encode_var_bytes(unlock_script));
    out.extend_from_slice(&sequence.to_le_bytes());
    out
}

pub fn serialize_output(value: u64, locking_script: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(9 + locking_script.len());
    out.extend_from_slice(&encode_output_value(value)?);
    out.extend_from_slice(&encode_var_bytes(locking_script));
    Ok(out)
}

/// Concatenate already serialized inputs and outputs into a raw transaction.
pub fn assemble_transaction(
    version: u32,
    inputs: &[Vec<u8>],
    outputs: &[Vec<u8>],
    locktime: u32,
) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&version.to_le_bytes());
    out.extend_from_slice(&encode_var_int(inputs.len() as u64));
    for input in inputs {
        out.extend_from_slice(input);
    }
    out.extend_from_slice(&encode_var_int(outputs.len() as u64));
    for output in outputs {
        out.extend_from_slice(output);
    }
    out.extend_from_slice(&locktime.to_le_bytes());
    out
}

/// Cursor over a raw byte buffer.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Reader<'a> {
        Reader { data, pos: 0 }
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                EngineError::Codec(format!(
                    "Unexpected end of data reading {len} bytes at offset {}",
                    self.pos
                ))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.read_bytes(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_hash(&mut self) -> Result<[u8; 32]> {
        let mut buf = [0u8; 32];
        buf.copy_from_slice(self.read_bytes(32)?);
        Ok(buf)
    }

    pub fn read_output_value(&mut self) -> Result<u64> {
        decode_output_value(self.read_bytes(8)?)
    }

    pub fn read_var_int(&mut self) -> Result<u64> {
        let (value, consumed) = decode_var_int(&self.data[self.pos..])?;
        self.pos += consumed;
        Ok(value)
    }

    pub fn read_var_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_var_int()?;
        let len = usize::try_from(len)
            .map_err(|_| EngineError::Codec(format!("Length {len} does not fit in memory")))?;
        self.read_bytes(len)
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_encoding::HEXLOWER;

    #[test]
    fn test_var_int_thresholds() {
        assert_eq!(encode_var_int(0xfc), vec![0xfc]);
        assert_eq!(encode_var_int(0xfd), vec![0xfd, 0xfd, 0x00]);
        assert_eq!(encode_var_int(0xffff), vec![0xfd, 0xff, 0xff]);
        assert_eq!(encode_var_int(0x1_0000), vec![0xfe, 0x00, 0x00, 0x01, 0x00]);
        assert_eq!(encode_var_int(0x1_0000_0000).len(), 9);

        for n in [0u64, 0xfc, 0xfd, 0xffff, 0x1_0000, 0xffff_ffff, 0x1_0000_0000] {
            let encoded = encode_var_int(n);
            assert_eq!(decode_var_int(&encoded).unwrap(), (n, encoded.len()));
        }
    }

    #[test]
    fn test_decode_var_int_truncated() {
        assert!(decode_var_int(&[]).is_err());
        assert!(decode_var_int(&[0xfe, 0x01]).is_err());
    }

    #[test]
    fn test_output_value_layout() {
        let encoded = encode_output_value(500_000_000).unwrap();
        assert_eq!(HEXLOWER.encode(&encoded), "0065cd1d00000000");

        let high = encode_output_value(0x0000_0001_0000_0002).unwrap();
        assert_eq!(high, [2, 0, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn test_output_value_bounds() {
        for value in [0u64, 1, 546, u32::MAX as u64, u32::MAX as u64 + 1, MAX_SAFE_SATOSHIS] {
            let encoded = encode_output_value(value).unwrap();
            assert_eq!(decode_output_value(&encoded).unwrap(), value);
        }
        assert!(encode_output_value(MAX_SAFE_SATOSHIS + 1).is_err());
        assert!(decode_output_value(&u64::MAX.to_le_bytes()).is_err());
        assert!(decode_output_value(&[0u8; 7]).is_err());
    }

    #[test]
    fn test_serialize_input_reverses_hash() {
        let mut hash = [0u8; 32];
        hash[0] = 0xaa;
        hash[31] = 0xbb;
        let encoded = serialize_input(&hash, 1, &[0x51], 0xffff_ffff);

        assert_eq!(encoded.len(), 32 + 4 + 1 + 1 + 4);
        assert_eq!(encoded[0], 0xbb);
        assert_eq!(encoded[31], 0xaa);
        assert_eq!(&encoded[32..36], &[1, 0, 0, 0]);
        assert_eq!(&encoded[36..38], &[0x01, 0x51]);
        assert_eq!(&encoded[38..], &[0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn test_assemble_empty_transaction() {
        let raw = assemble_transaction(2, &[], &[], 0);
        assert_eq!(HEXLOWER.encode(&raw), "02000000000000000000");
    }

    #[test]
    fn test_reader_rejects_overrun() {
        let mut reader = Reader::new(&[0x05, 0x01, 0x02]);
        assert!(reader.read_var_bytes().is_err());

        let mut reader = Reader::new(&[0x02, 0x01, 0x02]);
        assert_eq!(reader.read_var_bytes().unwrap(), &[0x01, 0x02]);
        assert!(reader.is_empty());
    }
}
