//! Envelope data structures and the wire format
//!
//! An envelope is one header line followed by any number of items. Each item
//! is an item-header line that declares its exact `length`, the raw payload
//! bytes, and a newline:
//!
//! ```text
//! {"event_id":"9ec79c33ec9942ab8353589fcb2e04dc","sent_at":"2024-05-01T10:00:00.123Z"}
//! {"type":"event","length":41,"content_type":"application/json"}
//! {"message":"hello","level":"error","x":1}
//! {"type":"attachment","length":3,"filename":"a.bin"}
//! \x00\n\xff
//! ```
//!
//! Payloads are never escaped, so binary data (including newlines) survives
//! as-is.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::io::{BufRead, Read, Write};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::EnvelopeError;

/// 128-bit globally unique event identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(Uuid);

impl EventId {
    /// Generate a fresh random identifier
    pub fn new() -> Self {
        EventId(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        EventId(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for EventId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(EventId)
    }
}

impl Serialize for EventId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// SDK identification carried in the envelope header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdkInfo {
    pub name: String,
    pub version: String,
}

impl SdkInfo {
    /// Identification of this crate
    pub fn postbox() -> Self {
        Self {
            name: "postbox".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Envelope header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    pub event_id: EventId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk: Option<SdkInfo>,

    // Millisecond precision on the wire
    #[serde(default, skip_serializing_if = "Option::is_none", with = "sent_at_format")]
    pub sent_at: Option<DateTime<Utc>>,

    /// Trace propagation context (trace id, public key, sample rate, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<Map<String, Value>>,

    /// Header keys this crate does not interpret, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EnvelopeHeader {
    pub fn new(event_id: EventId) -> Self {
        Self {
            event_id,
            sdk: None,
            sent_at: None,
            trace: None,
            extra: Map::new(),
        }
    }
}

mod sent_at_format {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(serde::de::Error::custom)
        })
        .transpose()
    }
}

/// Item type tag
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ItemType {
    Event,
    Attachment,
    Transaction,
    Session,
    CheckIn,
    Profile,
    ProfileChunkUi,
    ReplayVideo,
    ClientReport,
    UserReport,
    /// Any type this crate does not know; kept so readers never fail on it
    Unknown(String),
}

impl ItemType {
    pub fn as_str(&self) -> &str {
        match self {
            ItemType::Event => "event",
            ItemType::Attachment => "attachment",
            ItemType::Transaction => "transaction",
            ItemType::Session => "session",
            ItemType::CheckIn => "check_in",
            ItemType::Profile => "profile",
            ItemType::ProfileChunkUi => "profile_chunk_ui",
            ItemType::ReplayVideo => "replay_video",
            ItemType::ClientReport => "client_report",
            ItemType::UserReport => "user_report",
            ItemType::Unknown(name) => name,
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "event" => ItemType::Event,
            "attachment" => ItemType::Attachment,
            "transaction" => ItemType::Transaction,
            "session" => ItemType::Session,
            "check_in" => ItemType::CheckIn,
            "profile" => ItemType::Profile,
            "profile_chunk_ui" => ItemType::ProfileChunkUi,
            "replay_video" => ItemType::ReplayVideo,
            "client_report" => ItemType::ClientReport,
            "user_report" => ItemType::UserReport,
            other => ItemType::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ItemType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ItemType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(ItemType::from_name(&raw))
    }
}

/// One item of an envelope
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeItem {
    pub item_type: ItemType,
    pub content_type: Option<String>,
    pub filename: Option<String>,
    /// Item header keys this crate does not interpret (e.g. `attachment_type`)
    pub extra: Map<String, Value>,
    pub payload: Vec<u8>,
}

impl EnvelopeItem {
    pub fn new(item_type: ItemType, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            item_type,
            content_type: None,
            filename: None,
            extra: Map::new(),
            payload: payload.into(),
        }
    }

    /// Item whose payload is `value` encoded as JSON
    pub fn json<T: Serialize + ?Sized>(
        item_type: ItemType,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(item_type, payload).with_content_type("application/json"))
    }

    pub fn attachment(filename: &str, content_type: &str, bytes: impl Into<Vec<u8>>) -> Self {
        let mut item = Self::new(ItemType::Attachment, bytes).with_content_type(content_type);
        item.filename = Some(filename.to_string());
        item
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Item header as written to the wire
#[derive(Serialize)]
struct ItemHeaderOut<'a> {
    #[serde(rename = "type")]
    item_type: &'a ItemType,
    length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filename: Option<&'a str>,
    #[serde(flatten)]
    extra: &'a Map<String, Value>,
}

/// Item header as read from the wire
#[derive(Deserialize)]
struct ItemHeaderIn {
    #[serde(rename = "type")]
    item_type: ItemType,
    #[serde(default)]
    length: Option<usize>,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    filename: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Multi-item container for one submission
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    header: EnvelopeHeader,
    items: Vec<EnvelopeItem>,
}

impl Envelope {
    /// Empty envelope with a fresh event id
    pub fn new() -> Self {
        Self::with_event_id(EventId::new())
    }

    pub fn with_event_id(event_id: EventId) -> Self {
        Self::from_parts(EnvelopeHeader::new(event_id), Vec::new())
    }

    pub fn from_parts(header: EnvelopeHeader, items: Vec<EnvelopeItem>) -> Self {
        Self { header, items }
    }

    /// Envelope carrying a single JSON `event` item
    pub fn from_event<T: Serialize + ?Sized>(event: &T) -> Result<Self, serde_json::Error> {
        let mut envelope = Self::new();
        envelope.header.sdk = Some(SdkInfo::postbox());
        envelope.add_item(EnvelopeItem::json(ItemType::Event, event)?);
        Ok(envelope)
    }

    pub fn event_id(&self) -> EventId {
        self.header.event_id
    }

    pub fn header(&self) -> &EnvelopeHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut EnvelopeHeader {
        &mut self.header
    }

    /// Stamp `sent_at`, truncated to what the wire format keeps
    pub fn set_sent_at(&mut self, at: Option<DateTime<Utc>>) {
        self.header.sent_at = at.map(|ts| ts.trunc_subsecs(3));
    }

    pub fn items(&self) -> &[EnvelopeItem] {
        &self.items
    }

    pub fn add_item(&mut self, item: EnvelopeItem) {
        self.items.push(item);
    }

    pub fn with_item(mut self, item: EnvelopeItem) -> Self {
        self.add_item(item);
        self
    }

    pub fn into_parts(self) -> (EnvelopeHeader, Vec<EnvelopeItem>) {
        (self.header, self.items)
    }

    /// Stream the envelope to `writer`. Payloads are written straight from
    /// their buffers, nothing is copied into an intermediate document.
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<(), EnvelopeError> {
        serde_json::to_writer(&mut writer, &self.header)?;
        writer.write_all(b"\n")?;

        for item in &self.items {
            let header = ItemHeaderOut {
                item_type: &item.item_type,
                length: item.payload.len(),
                content_type: item.content_type.as_deref(),
                filename: item.filename.as_deref(),
                extra: &item.extra,
            };
            serde_json::to_writer(&mut writer, &header)?;
            writer.write_all(b"\n")?;
            writer.write_all(&item.payload)?;
            writer.write_all(b"\n")?;
        }

        writer.flush()?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        let mut buf = Vec::with_capacity(self.items.iter().map(|i| i.len() + 64).sum::<usize>() + 128);
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    /// Read an envelope from a buffered stream.
    ///
    /// Malformed input of any kind is reported as [`EnvelopeError::Corrupt`];
    /// this never panics and never trusts a declared length for allocation.
    pub fn from_reader<R: BufRead>(mut reader: R) -> Result<Self, EnvelopeError> {
        let mut line = Vec::new();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Err(EnvelopeError::corrupt("empty input"));
        }
        let header: EnvelopeHeader = serde_json::from_slice(trim_newline(&line))
            .map_err(|e| EnvelopeError::corrupt(format!("envelope header: {}", e)))?;

        let mut items = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            let raw = trim_newline(&line);
            if raw.is_empty() {
                continue;
            }

            let item_header: ItemHeaderIn = serde_json::from_slice(raw).map_err(|e| {
                EnvelopeError::corrupt(format!("item header {}: {}", items.len(), e))
            })?;
            let length = item_header.length.ok_or_else(|| {
                EnvelopeError::corrupt(format!("item header {} has no length", items.len()))
            })?;

            let mut payload = Vec::new();
            (&mut reader).take(length as u64).read_to_end(&mut payload)?;
            if payload.len() != length {
                return Err(EnvelopeError::corrupt(format!(
                    "item {} truncated: expected {} bytes, got {}",
                    items.len(),
                    length,
                    payload.len()
                )));
            }

            // Payload terminator; absent only at end of input
            let next = reader.fill_buf()?;
            match next.first() {
                None => {}
                Some(b'\n') => reader.consume(1),
                Some(_) => {
                    return Err(EnvelopeError::corrupt(format!(
                        "item {} payload is longer than its declared length",
                        items.len()
                    )))
                }
            }

            items.push(EnvelopeItem {
                item_type: item_header.item_type,
                content_type: item_header.content_type,
                filename: item_header.filename,
                extra: item_header.extra,
                payload,
            });
        }

        Ok(Self { header, items })
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        Self::from_reader(bytes)
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_newline(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// RFC 3339 rendering with millisecond precision, as used on the wire
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}
