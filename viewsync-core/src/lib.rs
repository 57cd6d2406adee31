use std::{
    cell::Cell,
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Sync files are expected to be small; anything larger is treated as foreign.
pub const MAX_RECORD_BYTES: usize = 1024 * 1024;
pub const TIMESTAMP_KEY: &str = "timestamp";
pub const VIEW_STATE_KEY: &str = "viewState";
pub const LAYOUT_KEY: &str = "layout";
pub const EPHEMERAL_STATE_KEY: &str = "eState";

/// Logical time in milliseconds.
pub type Timestamp = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    View,
    Layout,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::View => "view",
            ChannelKind::Layout => "layout",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable state of a single view as the host reports it.
///
/// Only `type` is interpreted; every other field is carried through untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ViewState {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ViewState {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Map::new(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

/// Payload of the view channel. On the wire the ephemeral state sits next to
/// the view-state fields under `eState`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ViewStatePayload {
    #[serde(rename = "eState", default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_state: Option<Value>,
    #[serde(flatten)]
    pub view_state: ViewState,
}

impl ViewStatePayload {
    pub fn new(view_state: ViewState, ephemeral_state: Option<Value>) -> Self {
        Self {
            ephemeral_state,
            view_state,
        }
    }

    pub fn view_kind(&self) -> &str {
        &self.view_state.kind
    }

    /// Merge caller-supplied fields over the captured payload. Top-level keys
    /// of the override replace the captured ones.
    pub fn with_override(self, overrides: &StateOverride) -> Result<Self, CoreError> {
        if overrides.is_empty() {
            return Ok(self);
        }

        let Value::Object(mut merged) = serde_json::to_value(&self)
            .map_err(|err| CoreError::Serialization(err.to_string()))?
        else {
            return Err(CoreError::NotAnObject);
        };
        for (key, value) in &overrides.fields {
            merged.insert(key.clone(), value.clone());
        }
        serde_json::from_value(Value::Object(merged))
            .map_err(|err| CoreError::InvalidPayload(err.to_string()))
    }
}

/// Payload of the layout channel: the whole window arrangement, opaque.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct LayoutPayload {
    pub tree: Value,
}

impl LayoutPayload {
    pub fn new(tree: Value) -> Self {
        Self { tree }
    }
}

/// Partial view payload injected by a collaborator at capture time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct StateOverride {
    fields: Map<String, Value>,
}

impl StateOverride {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn ephemeral_state(self, value: Value) -> Self {
        self.field(EPHEMERAL_STATE_KEY, value)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A payload kind that can live in a sync file.
pub trait Payload: Serialize + DeserializeOwned {
    /// Key of the payload object next to `timestamp`.
    const KEY: &'static str;
}

impl Payload for ViewStatePayload {
    const KEY: &'static str = VIEW_STATE_KEY;
}

impl Payload for LayoutPayload {
    const KEY: &'static str = LAYOUT_KEY;
}

/// The unit written to and read from a sync file.
///
/// `timestamp` is always present on records this crate writes; it is optional
/// only because legacy records may omit it.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRecord<T> {
    pub timestamp: Option<Timestamp>,
    pub payload: T,
}

impl<T> SyncRecord<T> {
    pub fn new(timestamp: Timestamp, payload: T) -> Self {
        Self {
            timestamp: Some(timestamp),
            payload,
        }
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("sync record is {size} bytes (max {max})")]
    RecordTooLarge { size: usize, max: usize },
    #[error("sync record is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("sync record must be a JSON object")]
    NotAnObject,
    #[error("sync record has no `{0}` payload")]
    MissingPayload(&'static str),
    #[error("sync record timestamp must be a non-negative number")]
    InvalidTimestamp,
    #[error("sync record payload has an unexpected shape: {0}")]
    InvalidPayload(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("stale record: timestamp {timestamp:?} is not newer than {last_published}")]
    StaleRecord {
        timestamp: Option<Timestamp>,
        last_published: Timestamp,
    },
}

pub fn encode_record<T: Payload>(record: &SyncRecord<T>) -> Result<String, CoreError> {
    let payload = serde_json::to_value(&record.payload)
        .map_err(|err| CoreError::Serialization(err.to_string()))?;

    let mut object = Map::new();
    if let Some(timestamp) = record.timestamp {
        object.insert(TIMESTAMP_KEY.to_owned(), Value::from(timestamp));
    }
    object.insert(T::KEY.to_owned(), payload);

    serde_json::to_string(&Value::Object(object))
        .map_err(|err| CoreError::Serialization(err.to_string()))
}

/// Decode a sync file. Unknown top-level fields are ignored.
pub fn decode_record<T: Payload>(text: &str) -> Result<SyncRecord<T>, CoreError> {
    if text.len() > MAX_RECORD_BYTES {
        return Err(CoreError::RecordTooLarge {
            size: text.len(),
            max: MAX_RECORD_BYTES,
        });
    }

    let value: Value =
        serde_json::from_str(text).map_err(|err| CoreError::InvalidJson(err.to_string()))?;
    let Value::Object(mut object) = value else {
        return Err(CoreError::NotAnObject);
    };

    let timestamp = match object.remove(TIMESTAMP_KEY) {
        None | Some(Value::Null) => None,
        Some(value) => Some(parse_timestamp(&value)?),
    };

    let payload = match object.remove(T::KEY) {
        None | Some(Value::Null) => return Err(CoreError::MissingPayload(T::KEY)),
        Some(payload) => payload,
    };
    let payload =
        serde_json::from_value(payload).map_err(|err| CoreError::InvalidPayload(err.to_string()))?;

    Ok(SyncRecord { timestamp, payload })
}

fn parse_timestamp(value: &Value) -> Result<Timestamp, CoreError> {
    if let Some(ms) = value.as_u64() {
        return Ok(ms);
    }
    match value.as_f64() {
        Some(ms) if ms.is_finite() && ms >= 0.0 => Ok(ms.trunc() as Timestamp),
        _ => Err(CoreError::InvalidTimestamp),
    }
}

/// Per-channel guard: stamps outgoing records and filters incoming ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelClock {
    last_published: Timestamp,
}

impl ChannelClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_published(&self) -> Timestamp {
        self.last_published
    }

    /// Issue the timestamp for a new record and remember it as published.
    ///
    /// The result is strictly greater than every timestamp issued before,
    /// even when the wall clock steps backwards.
    pub fn stamp(&mut self, now_ms: Timestamp) -> Timestamp {
        let timestamp = now_ms.max(self.last_published.saturating_add(1));
        self.last_published = timestamp;
        timestamp
    }

    /// With `accept_only_if_newer`, only records strictly newer than the last
    /// published one pass. A record without a timestamp counts as older.
    pub fn admit(
        &self,
        timestamp: Option<Timestamp>,
        accept_only_if_newer: bool,
    ) -> Result<(), CoreError> {
        if !accept_only_if_newer {
            return Ok(());
        }
        match timestamp {
            Some(ts) if ts > self.last_published => Ok(()),
            _ => Err(CoreError::StaleRecord {
                timestamp,
                last_published: self.last_published,
            }),
        }
    }
}

pub trait Clock {
    fn now_ms(&self) -> Timestamp;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as Timestamp
    }
}

/// Clock driven by hand, for tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<Timestamp>,
}

impl ManualClock {
    pub fn new(now_ms: Timestamp) -> Self {
        Self {
            now: Cell::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: Timestamp) {
        self.now.set(now_ms);
    }

    pub fn advance(&self, ms: Timestamp) {
        self.now.set(self.now.get().saturating_add(ms));
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Timestamp {
        self.now.get()
    }
}

/// SHA-256 fingerprint of a sync file's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    pub fn of(text: &str) -> Self {
        Self(Sha256::digest(text.as_bytes()).into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // A short prefix is enough to tell records apart in logs.
        f.write_str(&hex::encode(&self.0[..6]))
    }
}

/// Normalize a storage path: forward slashes only, no empty or `.` segments,
/// no leading or trailing separator. Returns `""` for an unset path.
pub fn normalize_path(path: &str) -> String {
    let cleaned: String = path
        .trim()
        .chars()
        .map(|c| match c {
            '\\' => '/',
            '\u{00A0}' | '\u{202F}' => ' ',
            other => other,
        })
        .collect();

    cleaned
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Folder part of a normalized path, if the path is not at the storage root.
pub fn parent_folder(path: &str) -> Option<&str> {
    path.rsplit_once('/')
        .map(|(folder, _)| folder)
        .filter(|folder| !folder.is_empty())
}

/// Parse a comma-separated list of view kinds, e.g. `"markdown, pdf"`.
pub fn parse_view_kinds(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|kind| !kind.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn pdf_payload(page: u64) -> ViewStatePayload {
        ViewStatePayload::new(
            ViewState::new("pdf").with_field("state", json!({ "file": "paper.pdf", "page": page })),
            Some(json!({ "scroll": 12 })),
        )
    }

    #[test]
    fn view_record_wire_shape() {
        let text = encode_record(&SyncRecord::new(1000, pdf_payload(3))).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["timestamp"], json!(1000));
        assert_eq!(value["viewState"]["type"], json!("pdf"));
        assert_eq!(value["viewState"]["state"]["page"], json!(3));
        assert_eq!(value["viewState"]["eState"], json!({ "scroll": 12 }));
    }

    #[test]
    fn decode_view_record_keeps_unknown_view_fields() {
        let text = r#"{"timestamp":7,"viewState":{"type":"canvas","state":{"x":1},"pinned":true},"extra":1}"#;
        let record: SyncRecord<ViewStatePayload> = decode_record(text).unwrap();
        assert_eq!(record.timestamp, Some(7));
        assert_eq!(record.payload.view_kind(), "canvas");
        assert_eq!(record.payload.view_state.fields["pinned"], json!(true));
        assert_eq!(record.payload.ephemeral_state, None);
    }

    #[test]
    fn decode_layout_record() {
        let text = r#"{"timestamp":42,"layout":{"main":{"type":"split","children":[]}}}"#;
        let record: SyncRecord<LayoutPayload> = decode_record(text).unwrap();
        assert_eq!(record.timestamp, Some(42));
        assert_eq!(record.payload.tree["main"]["type"], json!("split"));
    }

    #[test]
    fn decode_accepts_missing_and_fractional_timestamp() {
        let legacy: SyncRecord<LayoutPayload> = decode_record(r#"{"layout":{}}"#).unwrap();
        assert_eq!(legacy.timestamp, None);

        let fractional: SyncRecord<LayoutPayload> =
            decode_record(r#"{"timestamp":12.9,"layout":{}}"#).unwrap();
        assert_eq!(fractional.timestamp, Some(12));
    }

    #[test]
    fn decode_rejects_malformed_records() {
        assert!(matches!(
            decode_record::<ViewStatePayload>("not json"),
            Err(CoreError::InvalidJson(_))
        ));
        assert!(matches!(
            decode_record::<ViewStatePayload>("[1,2]"),
            Err(CoreError::NotAnObject)
        ));
        assert!(matches!(
            decode_record::<ViewStatePayload>(r#"{"timestamp":1,"layout":{}}"#),
            Err(CoreError::MissingPayload(VIEW_STATE_KEY))
        ));
        assert!(matches!(
            decode_record::<ViewStatePayload>(r#"{"timestamp":-4,"viewState":{"type":"pdf"}}"#),
            Err(CoreError::InvalidTimestamp)
        ));
        assert!(matches!(
            decode_record::<ViewStatePayload>(r#"{"timestamp":1,"viewState":{"state":{}}}"#),
            Err(CoreError::InvalidPayload(_))
        ));
    }

    #[test]
    fn decode_rejects_oversized_text() {
        let text = " ".repeat(MAX_RECORD_BYTES + 1);
        assert!(matches!(
            decode_record::<LayoutPayload>(&text),
            Err(CoreError::RecordTooLarge { .. })
        ));
    }

    #[test]
    fn override_wins_over_captured_fields() {
        let overrides = StateOverride::new()
            .ephemeral_state(json!({ "line": 40 }))
            .field("active", json!(true));
        let merged = pdf_payload(3).with_override(&overrides).unwrap();
        assert_eq!(merged.ephemeral_state, Some(json!({ "line": 40 })));
        assert_eq!(merged.view_state.fields["active"], json!(true));
        assert_eq!(merged.view_state.fields["state"]["page"], json!(3));
    }

    #[test]
    fn stamp_is_strictly_increasing() {
        let mut clock = ChannelClock::new();
        assert_eq!(clock.stamp(1000), 1000);
        assert_eq!(clock.stamp(1000), 1001);
        assert_eq!(clock.stamp(500), 1002);
        assert_eq!(clock.stamp(2000), 2000);
        assert_eq!(clock.last_published(), 2000);
    }

    #[test]
    fn admit_only_newer_records() {
        let mut clock = ChannelClock::new();
        clock.stamp(100);
        assert!(matches!(
            clock.admit(Some(100), true),
            Err(CoreError::StaleRecord {
                timestamp: Some(100),
                last_published: 100
            })
        ));
        assert!(clock.admit(Some(99), true).is_err());
        assert!(clock.admit(Some(101), true).is_ok());
        assert!(clock.admit(Some(5), false).is_ok());
    }

    #[test]
    fn missing_timestamp_counts_as_older() {
        let clock = ChannelClock::new();
        assert!(clock.admit(None, true).is_err());
        assert!(clock.admit(None, false).is_ok());
    }

    #[test]
    fn digest_tracks_content() {
        assert_eq!(ContentDigest::of("abc"), ContentDigest::of("abc"));
        assert_ne!(ContentDigest::of("abc"), ContentDigest::of("abd"));
        assert_eq!(ContentDigest::of("abc").to_hex().len(), 64);
    }

    #[test]
    fn normalize_path_cleans_separators() {
        assert_eq!(normalize_path("view-sync.json"), "view-sync.json");
        assert_eq!(normalize_path("/sync//dev\\a/./view.json/"), "sync/dev/a/view.json");
        assert_eq!(normalize_path("my\u{00A0}file.json"), "my file.json");
        assert_eq!(normalize_path("  "), "");
        assert_eq!(normalize_path("///"), "");
    }

    #[test]
    fn parent_folder_of_nested_path() {
        assert_eq!(parent_folder("a/b/c.json"), Some("a/b"));
        assert_eq!(parent_folder("c.json"), None);
    }

    #[test]
    fn view_kinds_from_csv() {
        assert_eq!(
            parse_view_kinds("markdown, pdf ,, canvas "),
            vec!["markdown", "pdf", "canvas"]
        );
        assert!(parse_view_kinds("").is_empty());
    }
}
