// Storage encoding for records kept in sled trees
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};

/// Serialize a record using bincode 2.0 with standard configuration
pub fn serialize<T: Serialize + bincode::Encode>(data: &T) -> Result<Vec<u8>> {
    let config = bincode::config::standard();
    bincode::encode_to_vec(data, config)
        .map_err(|e| EngineError::Serialization(format!("Serialization failed: {e}")))
}

/// Deserialize a record using bincode 2.0 with standard configuration
pub fn deserialize<T>(bytes: &[u8]) -> Result<T>
where
    T: for<'de> Deserialize<'de> + bincode::Decode<()>,
{
    let config = bincode::config::standard();
    let (data, _) = bincode::decode_from_slice(bytes, config)
        .map_err(|e| EngineError::Serialization(format!("Deserialization failed: {e}")))?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
    struct Tombstone {
        timestamp: i64,
        spender: Option<String>,
    }

    #[test]
    fn test_optional_fields_survive_storage() {
        let record = Tombstone {
            timestamp: 1_700_000_000,
            spender: None,
        };
        let bytes = serialize(&record).expect("Serialization should work");
        let back: Tombstone = deserialize(&bytes).expect("Deserialization should work");
        assert_eq!(record, back);
    }

    #[test]
    fn test_deserialize_truncated_record() {
        let record = Tombstone {
            timestamp: 42,
            spender: Some("ab".repeat(32)),
        };
        let bytes = serialize(&record).unwrap();
        let result: Result<Tombstone> = deserialize(&bytes[..bytes.len() / 2]);
        assert!(result.is_err());
    }
}
