//! Core event types for the inventory consumer.
//!
//! An [`InventoryEvent`] is the unit of work: producers publish it to the
//! primary stream, the consumer applies it to the durable store, and on
//! terminal failure it is republished verbatim to the dead-letter stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Kind of mutation an event requests.
///
/// Unrecognised kinds still decode (as [`EventKind::Unknown`]) so that the
/// processor, not the decoder, decides what to do with them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    Create,
    Update,
    Delete,
    Unknown(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Create => "create",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
            EventKind::Unknown(kind) => kind,
        }
    }
}

impl From<String> for EventKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "create" => EventKind::Create,
            "update" => EventKind::Update,
            "delete" => EventKind::Delete,
            _ => EventKind::Unknown(value),
        }
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Unknown(kind) => kind,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inventory mutation event.
///
/// # Wire format
///
/// ```json
/// {
///   "type": "update",
///   "item_id": "A1",
///   "quantity": -3,
///   "date_time": "2025-12-11T10:00:00Z"
/// }
/// ```
///
/// `quantity` is the absolute stock for `create`, a signed delta for
/// `update`, and ignored for `delete`. `date_time` is advisory only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,

    /// Entity key; the only sharding and locking discriminant.
    pub item_id: String,

    #[serde(default)]
    pub quantity: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_time: Option<DateTime<Utc>>,
}

/// Errors raised while turning a raw stream payload into an event.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed event JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("event has an empty item_id")]
    EmptyKey,
}

impl InventoryEvent {
    pub fn new(kind: EventKind, item_id: impl Into<String>, quantity: i64) -> Self {
        Self {
            kind,
            item_id: item_id.into(),
            quantity,
            date_time: None,
        }
    }

    pub fn create(item_id: impl Into<String>, quantity: i64) -> Self {
        Self::new(EventKind::Create, item_id, quantity)
    }

    pub fn update(item_id: impl Into<String>, delta: i64) -> Self {
        Self::new(EventKind::Update, item_id, delta)
    }

    pub fn delete(item_id: impl Into<String>) -> Self {
        Self::new(EventKind::Delete, item_id, 0)
    }

    /// Set the occurrence time
    pub fn with_date_time(mut self, date_time: DateTime<Utc>) -> Self {
        self.date_time = Some(date_time);
        self
    }

    /// Decode an event from a stream payload.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let event: InventoryEvent = serde_json::from_slice(payload)?;
        if event.item_id.is_empty() {
            return Err(DecodeError::EmptyKey);
        }
        Ok(event)
    }

    /// Serialize to the wire format.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_decode_update() {
        let payload = br#"{
            "type": "update",
            "item_id": "A1",
            "quantity": -3,
            "date_time": "2025-12-11T10:00:00Z"
        }"#;

        let event = InventoryEvent::decode(payload).unwrap();
        assert_eq!(event.kind, EventKind::Update);
        assert_eq!(event.item_id, "A1");
        assert_eq!(event.quantity, -3);
        assert_eq!(
            event.date_time,
            Some(Utc.with_ymd_and_hms(2025, 12, 11, 10, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_decode_unknown_kind_is_not_a_decode_error() {
        let payload = br#"{"type": "restock", "item_id": "A1", "quantity": 4}"#;

        let event = InventoryEvent::decode(payload).unwrap();
        assert_eq!(event.kind, EventKind::Unknown("restock".to_string()));
    }

    #[test]
    fn test_decode_delete_without_quantity() {
        let payload = br#"{"type": "delete", "item_id": "B7"}"#;

        let event = InventoryEvent::decode(payload).unwrap();
        assert_eq!(event.kind, EventKind::Delete);
        assert_eq!(event.quantity, 0);
        assert!(event.date_time.is_none());
    }

    #[test]
    fn test_decode_rejects_empty_key() {
        let payload = br#"{"type": "create", "item_id": "", "quantity": 1}"#;
        assert!(matches!(
            InventoryEvent::decode(payload),
            Err(DecodeError::EmptyKey)
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            InventoryEvent::decode(b"not json"),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            InventoryEvent::decode(br#"{"type": "create"}"#),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn test_encode_uses_wire_field_names() {
        let event = InventoryEvent::create("A1", 10)
            .with_date_time(Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap());

        let json = event.encode().unwrap();
        assert!(json.contains(r#""type":"create""#));
        assert!(json.contains(r#""item_id":"A1""#));
        assert!(json.contains(r#""quantity":10"#));
        assert!(json.contains("date_time"));
    }

    #[test]
    fn test_encode_preserves_unknown_kind() {
        let event = InventoryEvent::new(EventKind::Unknown("restock".into()), "A1", 1);
        let json = event.encode().unwrap();
        assert!(json.contains(r#""type":"restock""#));
    }
}
