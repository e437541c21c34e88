//! Storage key layout and value encoding for server keys.
//!
//! Each record lives at `server-keys/{hex(origin_server)}/{hex(key_id)}`.
//! Hex keeps arbitrary origin and key-id strings unambiguous (neither can
//! smuggle a `/`) and preserves byte ordering, so all keys of one origin
//! are contiguous.
//!
//! Values are JSON documents holding the base64 key material and the
//! record metadata. The key id is not repeated in the value; algorithm
//! and version are rebuilt from the storage key on read.

use base64::Engine;
use fedkeys_storage::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};

use crate::types::{FetchKeyResult, ServerKeyId, ServerKeyRecord, UNPADDED_BASE64, VerifyKey};

/// Storage key prefix for server signing keys.
pub const SERVER_KEY_PREFIX: &str = "server-keys/";

/// Persisted form of one record.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct StoredServerKey {
    key: String,
    valid_until_ts: i64,
    fetched_from: String,
    fetched_at_ts: i64,
}

/// Encodes an identity as a storage key.
pub(crate) fn storage_key(id: &ServerKeyId) -> Vec<u8> {
    format!("{SERVER_KEY_PREFIX}{}/{}", hex::encode(&id.origin_server), hex::encode(&id.key_id))
        .into_bytes()
}

pub(crate) fn encode_record(
    result: &FetchKeyResult,
    fetched_from: &str,
    fetched_at_ts: i64,
) -> StorageResult<Vec<u8>> {
    let stored = StoredServerKey {
        key: result.verify_key.to_base64(),
        valid_until_ts: result.valid_until_ts,
        fetched_from: fetched_from.to_owned(),
        fetched_at_ts,
    };
    serde_json::to_vec(&stored)
        .map_err(|e| StorageError::serialization_with_source("encode server key", e))
}

/// Decodes a stored value. `key_id` supplies the returned key's algorithm
/// and version.
pub(crate) fn decode_record(key_id: &str, bytes: &[u8]) -> StorageResult<ServerKeyRecord> {
    let stored: StoredServerKey = serde_json::from_slice(bytes)
        .map_err(|e| StorageError::serialization_with_source("decode server key", e))?;
    let key = UNPADDED_BASE64
        .decode(&stored.key)
        .map_err(|e| StorageError::serialization_with_source("decode server key material", e))?;
    let verify_key = VerifyKey::decode(key_id, key)
        .map_err(|e| StorageError::serialization_with_source("stored key id", e))?;

    Ok(ServerKeyRecord {
        verify_key,
        valid_until_ts: stored.valid_until_ts,
        fetched_from: stored.fetched_from,
        fetched_at_ts: stored.fetched_at_ts,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn stored_version_comes_from_key_id() {
        let written = FetchKeyResult::new(VerifyKey::new("ed25519", "key2", vec![9u8; 32]), 200);
        let bytes = encode_record(&written, "from_server", 10).unwrap();

        let read = decode_record("ed25519:KEY_ID_2", &bytes).unwrap();
        assert_eq!(read.verify_key, written.verify_key);
        assert_eq!(read.verify_key.version(), "KEY_ID_2");
        assert_eq!(read.valid_until_ts, 200);
        assert_eq!(read.fetched_from, "from_server");
        assert_eq!(read.fetched_at_ts, 10);
    }

    #[test]
    fn corrupt_value_is_serialization_error() {
        let err = decode_record("ed25519:a", b"{not json").unwrap_err();
        assert!(matches!(err, StorageError::Serialization { .. }));

        let err = decode_record(
            "ed25519:a",
            br#"{"key":"***","valid_until_ts":1,"fetched_from":"x","fetched_at_ts":1}"#,
        )
        .unwrap_err();
        assert!(matches!(err, StorageError::Serialization { .. }));
    }

    #[test]
    fn unknown_fields_rejected() {
        let err = decode_record(
            "ed25519:a",
            br#"{"key":"AAAA","valid_until_ts":1,"fetched_from":"x","fetched_at_ts":1,"extra":true}"#,
        )
        .unwrap_err();
        assert!(matches!(err, StorageError::Serialization { .. }));
    }

    #[test]
    fn storage_key_layout() {
        let key = storage_key(&ServerKeyId::new("a", "b"));
        assert_eq!(key, b"server-keys/61/62".to_vec());
    }

    proptest! {
        /// Distinct identities never share a storage key, even when the
        /// strings contain the separator.
        #[test]
        fn storage_keys_are_injective(
            o1 in ".{0,12}", k1 in ".{0,12}",
            o2 in ".{0,12}", k2 in ".{0,12}",
        ) {
            let a = ServerKeyId::new(o1, k1);
            let b = ServerKeyId::new(o2, k2);
            prop_assert_eq!(a == b, storage_key(&a) == storage_key(&b));
        }

        /// Every key of one origin sorts under that origin's prefix.
        #[test]
        fn origin_prefix_groups_keys(origin in "[a-z.]{1,12}", key_id in ".{0,12}") {
            let key = storage_key(&ServerKeyId::new(origin.clone(), key_id));
            let prefix = format!("{SERVER_KEY_PREFIX}{}/", hex::encode(&origin));
            prop_assert!(key.starts_with(prefix.as_bytes()));
        }
    }
}
