use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

/// `previous_hash` sentinel carried by the first record of every chain.
pub const GENESIS_HASH: &str = "0";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ChainError {
    #[error("invalid append request: {0}")]
    InvalidRequest(String),
    #[error("stored chain for subject `{subject_id}` could not be decoded: {message}")]
    CorruptChain { subject_id: String, message: String },
    #[error("failed to encode chain for subject `{subject_id}`: {message}")]
    EncodeChain { subject_id: String, message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Key-value persistence boundary consumed by the audit log.
///
/// Implementations must guarantee atomic whole-value reads and writes per
/// key. The audit log performs no locking of its own: concurrent appends to
/// the same subject can race at this boundary, so callers either serialize
/// writers per subject or supply a backend with conditional writes.
pub trait KeyValueStore {
    /// Fetch the value stored under `key`, if any.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the backend read fails.
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the backend write fails.
    fn set(&mut self, key: &str, value: &Value) -> Result<(), StoreError>;

    /// List `(key, value)` pairs whose key starts with `prefix`, in key order.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the backend scan fails.
    fn query_by_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError>;
}

/// In-memory [`KeyValueStore`] used by tests and embedded callers.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: BTreeMap<String, Value>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &Value) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value.clone());
        Ok(())
    }

    fn query_by_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
        Ok(self
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

/// Storage key holding the chain for one subject.
#[must_use]
pub fn chain_key(subject_id: &str) -> String {
    format!("subject-{subject_id}-chain")
}

/// Key prefix covering every stored chain, for aggregation callers.
pub const CHAIN_KEY_PREFIX: &str = "subject-";

/// One tamper-evident entry in a per-subject audit chain.
///
/// `hash` is a pure function of the other six fields; it is computed once at
/// append time and recomputed only during verification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecisionRecord {
    pub timestamp_ms: i64,
    pub action: String,
    pub actor_id: String,
    pub subject_id: String,
    pub payload: Value,
    pub previous_hash: String,
    pub hash: String,
}

impl DecisionRecord {
    /// Build a record and seal it with its content hash.
    #[must_use]
    pub fn new(
        timestamp_ms: i64,
        action: String,
        actor_id: String,
        subject_id: String,
        payload: Value,
        previous_hash: String,
    ) -> Self {
        let hash = compute_record_hash(
            timestamp_ms,
            &action,
            &actor_id,
            &subject_id,
            &payload,
            &previous_hash,
        );
        Self { timestamp_ms, action, actor_id, subject_id, payload, previous_hash, hash }
    }

    /// Recompute the hash from the record's current field values.
    #[must_use]
    pub fn content_hash(&self) -> String {
        compute_record_hash(
            self.timestamp_ms,
            &self.action,
            &self.actor_id,
            &self.subject_id,
            &self.payload,
            &self.previous_hash,
        )
    }

    /// True when the stored hash matches the recomputed content hash.
    #[must_use]
    pub fn verify_self(&self) -> bool {
        self.content_hash() == self.hash
    }
}

/// Serialize a JSON value deterministically: object keys are emitted in
/// sorted order at every nesting depth, with no insignificant whitespace.
/// Two structurally equal values always yield the same byte sequence, no
/// matter how their maps were built.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(number) => {
            let _ = write!(out, "{number}");
        }
        Value::String(text) => write_json_string(text, out),
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(object) => {
            let mut keys: Vec<&String> = object.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (index, key) in keys.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_json_string(key, out);
                out.push(':');
                if let Some(child) = object.get(key.as_str()) {
                    write_canonical(child, out);
                }
            }
            out.push('}');
        }
    }
}

fn write_json_string(text: &str, out: &mut String) {
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            ch if (ch as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", ch as u32);
            }
            ch => out.push(ch),
        }
    }
    out.push('"');
}

/// Compute the 64-character lowercase hex SHA-256 digest of a record's
/// content. Fields are hashed as a canonical JSON array in a fixed order, so
/// the digest never depends on map insertion order or formatting.
#[must_use]
pub fn compute_record_hash(
    timestamp_ms: i64,
    action: &str,
    actor_id: &str,
    subject_id: &str,
    payload: &Value,
    previous_hash: &str,
) -> String {
    let previous = if previous_hash.is_empty() { GENESIS_HASH } else { previous_hash };
    let content = Value::Array(vec![
        Value::from(timestamp_ms),
        Value::String(action.to_string()),
        Value::String(actor_id.to_string()),
        Value::String(subject_id.to_string()),
        payload.clone(),
        Value::String(previous.to_string()),
    ]);

    let mut hasher = Sha256::new();
    hasher.update(canonical_json(&content).as_bytes());
    let digest = hasher.finalize();
    format!("{digest:x}")
}

/// Inputs for one chain append. `actor_id` falls back to `"system"` and
/// `timestamp_ms` to the current wall clock when not supplied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppendRequest {
    pub subject_id: String,
    pub action: String,
    pub actor_id: Option<String>,
    pub payload: Value,
    pub timestamp_ms: Option<i64>,
}

/// Append one decision record to a subject's chain and persist the result.
///
/// The new record links to the hash of the chain's last record, or to the
/// genesis sentinel when the chain is empty. Exactly one store write happens
/// per call; a storage failure surfaces as an error and nothing is reported
/// as appended.
///
/// Appends for the same subject must be serialized by the caller: two
/// concurrent appends would read the same chain snapshot and the second
/// write would silently drop the first record.
///
/// # Errors
/// Returns [`ChainError::InvalidRequest`] for a blank subject or action,
/// [`ChainError::CorruptChain`] when the stored chain cannot be decoded, and
/// [`ChainError::Store`] when the backend read or write fails.
pub fn append_decision<S: KeyValueStore>(
    store: &mut S,
    request: AppendRequest,
) -> Result<DecisionRecord, ChainError> {
    let subject_id = request.subject_id.trim();
    if subject_id.is_empty() {
        return Err(ChainError::InvalidRequest("subject_id MUST be non-empty".to_string()));
    }
    let action = request.action.trim();
    if action.is_empty() {
        return Err(ChainError::InvalidRequest("action MUST be non-empty".to_string()));
    }
    let actor_id = match request.actor_id {
        Some(actor) if !actor.trim().is_empty() => actor,
        _ => "system".to_string(),
    };

    let mut chain = fetch_chain(store, subject_id)?;
    let previous_hash =
        chain.last().map_or_else(|| GENESIS_HASH.to_string(), |last| last.hash.clone());
    let timestamp_ms = request.timestamp_ms.unwrap_or_else(now_ms);

    let record = DecisionRecord::new(
        timestamp_ms,
        action.to_string(),
        actor_id,
        subject_id.to_string(),
        request.payload,
        previous_hash,
    );
    chain.push(record.clone());

    let encoded = serde_json::to_value(&chain).map_err(|err| ChainError::EncodeChain {
        subject_id: subject_id.to_string(),
        message: err.to_string(),
    })?;
    store.set(&chain_key(subject_id), &encoded)?;

    Ok(record)
}

/// Load a subject's full chain; a subject with no stored chain yields an
/// empty list.
///
/// # Errors
/// Returns [`ChainError::CorruptChain`] when the stored value does not
/// decode as a record list, or [`ChainError::Store`] on backend failure.
pub fn fetch_chain<S: KeyValueStore>(
    store: &S,
    subject_id: &str,
) -> Result<Vec<DecisionRecord>, ChainError> {
    match store.get(&chain_key(subject_id))? {
        None => Ok(Vec::new()),
        Some(value) => {
            serde_json::from_value(value).map_err(|err| ChainError::CorruptChain {
                subject_id: subject_id.to_string(),
                message: err.to_string(),
            })
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ChainFault {
    /// First record does not carry the genesis sentinel.
    MissingGenesisSentinel,
    /// A record's `previous_hash` does not match its predecessor's hash.
    BrokenLink,
    /// A record's stored hash does not match its recomputed content hash.
    ContentMismatch,
}

impl ChainFault {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingGenesisSentinel => "missing_genesis_sentinel",
            Self::BrokenLink => "broken_link",
            Self::ContentMismatch => "content_mismatch",
        }
    }
}

/// Outcome of a chain integrity walk. `valid == false` is a normal result
/// that callers branch on, not a transient fault: it means the stored trail
/// must be treated as untrusted.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChainVerification {
    pub valid: bool,
    pub records_checked: usize,
    pub first_invalid_index: Option<usize>,
    pub fault: Option<ChainFault>,
}

impl ChainVerification {
    fn valid_over(records_checked: usize) -> Self {
        Self { valid: true, records_checked, first_invalid_index: None, fault: None }
    }

    fn failed_at(index: usize, fault: ChainFault) -> Self {
        Self {
            valid: false,
            records_checked: index + 1,
            first_invalid_index: Some(index),
            fault: Some(fault),
        }
    }
}

/// Walk a stored chain and report the first integrity failure, if any.
///
/// Every record's content hash is recomputed and compared against its stored
/// hash, including the genesis record; the link check is skipped only at
/// index 0, where the genesis sentinel is required instead. An empty chain
/// is trivially valid. Read-only and pure: the input is never mutated and no
/// I/O is performed.
#[must_use]
pub fn verify_chain_detailed(chain: &[DecisionRecord]) -> ChainVerification {
    for (index, record) in chain.iter().enumerate() {
        if index == 0 {
            if record.previous_hash != GENESIS_HASH {
                return ChainVerification::failed_at(index, ChainFault::MissingGenesisSentinel);
            }
        } else if record.previous_hash != chain[index - 1].hash {
            return ChainVerification::failed_at(index, ChainFault::BrokenLink);
        }

        if !record.verify_self() {
            return ChainVerification::failed_at(index, ChainFault::ContentMismatch);
        }
    }

    ChainVerification::valid_over(chain.len())
}

/// Boolean form of [`verify_chain_detailed`].
#[must_use]
pub fn verify_chain(chain: &[DecisionRecord]) -> bool {
    verify_chain_detailed(chain).valid
}

fn now_ms() -> i64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    i64::try_from(nanos / 1_000_000).unwrap_or(0)
}
