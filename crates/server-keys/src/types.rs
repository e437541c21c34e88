//! Identity, key and record types for server signing keys.

use std::fmt;

use base64::{
    Engine,
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};
use bytes::Bytes;
use chrono::Utc;

use crate::error::{KeyStoreError, Result};

/// Unpadded standard base64, accepting padded input on decode.
pub(crate) const UNPADDED_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Identity of a stored key: which server, and which of its keys.
///
/// `(origin_server, key_id)` is unique; writing the same identity again
/// replaces the previous record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerKeyId {
    /// The server whose identity the key authenticates.
    pub origin_server: String,
    /// Caller-chosen key name, conventionally `<algorithm>:<version>`.
    pub key_id: String,
}

impl ServerKeyId {
    /// Creates a new identity.
    #[must_use]
    pub fn new(origin_server: impl Into<String>, key_id: impl Into<String>) -> Self {
        Self { origin_server: origin_server.into(), key_id: key_id.into() }
    }
}

impl fmt::Display for ServerKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.origin_server, self.key_id)
    }
}

impl<O: Into<String>, K: Into<String>> From<(O, K)> for ServerKeyId {
    fn from((origin_server, key_id): (O, K)) -> Self {
        Self::new(origin_server, key_id)
    }
}

/// A public verification key: algorithm tag, version and raw key bytes.
///
/// Equality compares the algorithm and the key material only. The version
/// is a label; the same key bytes stored under another key id are still
/// the same key.
///
/// ```
/// use fedkeys_server_keys::VerifyKey;
///
/// let a = VerifyKey::from_base64("ed25519:key1", "fP5l4JzpZPq/zdbBg5xx6lQGAAOM9/3w94cqiJ5jPrw").unwrap();
/// let b = VerifyKey::decode("ed25519:renamed", a.as_bytes().clone()).unwrap();
///
/// assert_eq!(a, b);
/// assert_eq!(b.version(), "renamed");
/// assert_eq!(a.key_id(), "ed25519:key1");
/// ```
#[derive(Clone)]
pub struct VerifyKey {
    algorithm: String,
    version: String,
    key: Bytes,
}

impl VerifyKey {
    /// Creates a key from its parts.
    #[must_use]
    pub fn new(
        algorithm: impl Into<String>,
        version: impl Into<String>,
        key: impl Into<Bytes>,
    ) -> Self {
        Self { algorithm: algorithm.into(), version: version.into(), key: key.into() }
    }

    /// Builds a key from raw bytes, taking algorithm and version from `key_id`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::InvalidKeyId`] unless `key_id` has the form
    /// `<algorithm>:<version>` with both parts non-empty.
    pub fn decode(key_id: &str, key: impl Into<Bytes>) -> Result<Self> {
        let (algorithm, version) = split_key_id(key_id)?;
        Ok(Self::new(algorithm, version, key))
    }

    /// Builds a key from base64 key material (padding optional).
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::InvalidKeyId`] for a malformed `key_id` and
    /// [`KeyStoreError::InvalidKeyMaterial`] if `key_base64` is not base64.
    pub fn from_base64(key_id: &str, key_base64: &str) -> Result<Self> {
        let bytes = UNPADDED_BASE64
            .decode(key_base64)
            .map_err(|e| KeyStoreError::InvalidKeyMaterial(format!("base64 decode: {e}")))?;
        Self::decode(key_id, bytes)
    }

    /// Algorithm tag, e.g. `ed25519`.
    #[must_use]
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Short key name, e.g. `key1`.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// `<algorithm>:<version>`.
    #[must_use]
    pub fn key_id(&self) -> String {
        format!("{}:{}", self.algorithm, self.version)
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &Bytes {
        &self.key
    }

    /// Key bytes as unpadded base64.
    #[must_use]
    pub fn to_base64(&self) -> String {
        UNPADDED_BASE64.encode(&self.key)
    }
}

impl PartialEq for VerifyKey {
    fn eq(&self, other: &Self) -> bool {
        self.algorithm == other.algorithm && self.key == other.key
    }
}

impl Eq for VerifyKey {}

impl fmt::Debug for VerifyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifyKey")
            .field("key_id", &self.key_id())
            .field("key", &self.to_base64())
            .finish()
    }
}

/// Splits `<algorithm>:<version>`.
pub(crate) fn split_key_id(key_id: &str) -> Result<(&str, &str)> {
    match key_id.split_once(':') {
        Some((algorithm, version)) if !algorithm.is_empty() && !version.is_empty() => {
            Ok((algorithm, version))
        },
        _ => Err(KeyStoreError::InvalidKeyId { key_id: key_id.to_owned() }),
    }
}

/// A freshly fetched key and the deadline after which it must be treated as
/// expired.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchKeyResult {
    /// The key.
    pub verify_key: VerifyKey,
    /// Milliseconds since the Unix epoch.
    pub valid_until_ts: i64,
}

impl FetchKeyResult {
    /// Creates a new fetch result.
    #[must_use]
    pub fn new(verify_key: VerifyKey, valid_until_ts: i64) -> Self {
        Self { verify_key, valid_until_ts }
    }
}

/// A stored key as returned by lookups.
///
/// The store never purges expired records. Whether an expired key is still
/// acceptable (e.g. for old signatures) is the caller's decision; see
/// [`is_valid_at`](Self::is_valid_at).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerKeyRecord {
    /// The key. Its version is taken from the key id it was stored under.
    pub verify_key: VerifyKey,
    /// Expiry deadline, ms since the Unix epoch.
    pub valid_until_ts: i64,
    /// Who supplied this observation.
    pub fetched_from: String,
    /// When the observation was written, ms since the Unix epoch.
    pub fetched_at_ts: i64,
}

impl ServerKeyRecord {
    /// Whether the key is still within its validity window at `now_ms`.
    #[must_use]
    pub fn is_valid_at(&self, now_ms: i64) -> bool {
        now_ms <= self.valid_until_ts
    }

    /// [`is_valid_at`](Self::is_valid_at) using the wall clock.
    #[must_use]
    pub fn is_valid_now(&self) -> bool {
        self.is_valid_at(Utc::now().timestamp_millis())
    }
}

impl From<ServerKeyRecord> for FetchKeyResult {
    fn from(record: ServerKeyRecord) -> Self {
        Self { verify_key: record.verify_key, valid_until_ts: record.valid_until_ts }
    }
}

/// Rejects malformed writes before they reach the store.
pub(crate) fn validate_record(
    fetched_from: &str,
    fetched_at_ts: i64,
    id: &ServerKeyId,
    result: &FetchKeyResult,
) -> Result<()> {
    let reject = |reason: &str| -> Result<()> {
        Err(KeyStoreError::invalid_record(&id.origin_server, &id.key_id, reason))
    };

    if id.origin_server.is_empty() {
        return reject("origin_server is empty");
    }
    if id.key_id.is_empty() {
        return reject("key_id is empty");
    }
    if split_key_id(&id.key_id).is_err() {
        return reject("key_id must be of the form <algorithm>:<version>");
    }
    if result.valid_until_ts < 0 {
        return reject("valid_until_ts is negative");
    }
    if fetched_from.is_empty() {
        return reject("fetched_from is empty");
    }
    if fetched_at_ts < 0 {
        return reject("fetched_at_ts is negative");
    }
    Ok(())
}
