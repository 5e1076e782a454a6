use crate::error::{ConclaveError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes an internally persisted record. The format must be stable across
/// all members of a cluster lineage.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| ConclaveError::Codec {
        message: e.to_string(),
    })
}

/// Decodes an internally persisted record
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| ConclaveError::Codec {
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let value = vec!["a".to_string(), "b".to_string()];

        let bytes = encode(&value).unwrap();
        let decoded: Vec<String> = decode(&bytes).unwrap();

        assert_eq!(decoded, value);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let res: Result<Vec<String>> = decode(&[0xff, 0xff, 0xff, 0xff, 0xff]);

        assert!(matches!(res, Err(ConclaveError::Codec { .. })));
    }
}
