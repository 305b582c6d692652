//! Tagged push-channel events and their JSON envelope.
//!
//! Inbound and outbound frames share one envelope: `{"event": <name>, "room"?: <room>,
//! "data"?: <payload>}`. Decoding first reads the header, looks the name up in the
//! [`EventKind`] table, then decodes `data` with the payload type for that kind. Unknown
//! names never reach payload decoding.

use serde::{Deserialize, Serialize};
use sonic_rs::Value;

use super::health::{HealthSnapshot, ServiceUpdate, WireHealthPayload};
use super::key::{CacheKey, KeyPattern};
use super::types::{SyncError, SyncResult, Version};

/// Tag of a [`SyncEvent`]; also the subscription key of the event router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    EntityCreated,
    EntityUpdated,
    EntityDeleted,
    Invalidate,
    HealthSnapshot,
    HealthService,
    Notification,
    Heartbeat,
    AuthAccepted,
    AuthRejected,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::EntityCreated,
        EventKind::EntityUpdated,
        EventKind::EntityDeleted,
        EventKind::Invalidate,
        EventKind::HealthSnapshot,
        EventKind::HealthService,
        EventKind::Notification,
        EventKind::Heartbeat,
        EventKind::AuthAccepted,
        EventKind::AuthRejected,
    ];

    pub fn wire_name(self) -> &'static str {
        match self {
            EventKind::EntityCreated => "entity:created",
            EventKind::EntityUpdated => "entity:updated",
            EventKind::EntityDeleted => "entity:deleted",
            EventKind::Invalidate => "cache:invalidate",
            EventKind::HealthSnapshot => "health:snapshot",
            EventKind::HealthService => "health:service",
            EventKind::Notification => "notification",
            EventKind::Heartbeat => "heartbeat",
            EventKind::AuthAccepted => "auth:ok",
            EventKind::AuthRejected => "auth:error",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.wire_name() == name)
    }
}

/// Decoded push-channel event.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Full entity value (upsert).
    EntityCreated {
        key: CacheKey,
        value: Value,
        version: Version,
    },
    /// Partial update merged into the cached value.
    EntityUpdated {
        key: CacheKey,
        diff: Value,
        version: Version,
    },
    EntityDeleted {
        key: CacheKey,
        version: Version,
    },
    Invalidate {
        pattern: KeyPattern,
    },
    HealthSnapshot(HealthSnapshot),
    HealthService(ServiceUpdate),
    /// Opaque application notification for subscribers only; never touches the cache.
    Notification {
        payload: Value,
    },
    Heartbeat,
    AuthAccepted,
    AuthRejected {
        message: String,
        code: Option<i32>,
    },
}

impl SyncEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SyncEvent::EntityCreated { .. } => EventKind::EntityCreated,
            SyncEvent::EntityUpdated { .. } => EventKind::EntityUpdated,
            SyncEvent::EntityDeleted { .. } => EventKind::EntityDeleted,
            SyncEvent::Invalidate { .. } => EventKind::Invalidate,
            SyncEvent::HealthSnapshot(_) => EventKind::HealthSnapshot,
            SyncEvent::HealthService(_) => EventKind::HealthService,
            SyncEvent::Notification { .. } => EventKind::Notification,
            SyncEvent::Heartbeat => EventKind::Heartbeat,
            SyncEvent::AuthAccepted => EventKind::AuthAccepted,
            SyncEvent::AuthRejected { .. } => EventKind::AuthRejected,
        }
    }

    /// Cache key targeted by entity events.
    pub fn entity_key(&self) -> Option<&CacheKey> {
        match self {
            SyncEvent::EntityCreated { key, .. }
            | SyncEvent::EntityUpdated { key, .. }
            | SyncEvent::EntityDeleted { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// Event plus the room it was published to, as delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedEvent {
    pub room: Option<String>,
    pub event: SyncEvent,
}

impl RoutedEvent {
    pub fn new(event: SyncEvent) -> Self {
        Self { room: None, event }
    }

    pub fn in_room(room: impl Into<String>, event: SyncEvent) -> Self {
        Self {
            room: Some(room.into()),
            event,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EnvelopeHeader {
    event: String,
    #[serde(default)]
    room: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

/// Wire shape shared by the three entity events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityPayload {
    pub entity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub id: String,
    pub version: Version,
    #[serde(default, alias = "diff", skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl EntityPayload {
    pub fn new(key: &CacheKey, version: Version, value: Option<Value>) -> Self {
        Self {
            entity: key.entity.clone(),
            scope: key.scope.clone(),
            id: key.id.clone(),
            version,
            value,
        }
    }

    fn key(&self) -> CacheKey {
        CacheKey {
            entity: self.entity.clone(),
            scope: self.scope.clone(),
            id: self.id.clone(),
        }
    }

    fn require_value(self, kind: EventKind) -> SyncResult<(CacheKey, Value, Version)> {
        let key = self.key();
        match self.value {
            Some(value) => Ok((key, value, self.version)),
            None => Err(SyncError::ParseFailed(format!(
                "{} for {key} carries no value",
                kind.wire_name()
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuthRejectedPayload {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<i32>,
}

fn decode_data<T>(kind: EventKind, payload: &[u8]) -> SyncResult<T>
where
    T: for<'de> Deserialize<'de>,
{
    sonic_rs::from_slice::<Envelope<T>>(payload)
        .map(|envelope| envelope.data)
        .map_err(|err| SyncError::ParseFailed(format!("{}: {err}", kind.wire_name())))
}

/// Decode one inbound text payload.
///
/// Returns `Ok(None)` for well-formed envelopes with an unknown event name.
pub fn decode_event(payload: &[u8]) -> SyncResult<Option<RoutedEvent>> {
    let header: EnvelopeHeader = sonic_rs::from_slice(payload)
        .map_err(|err| SyncError::ParseFailed(format!("envelope: {err}")))?;

    let Some(kind) = EventKind::from_wire(&header.event) else {
        tracing::debug!(event = %header.event, "dropping event with unknown name");
        return Ok(None);
    };

    let event = match kind {
        EventKind::EntityCreated => {
            let (key, value, version) =
                decode_data::<EntityPayload>(kind, payload)?.require_value(kind)?;
            SyncEvent::EntityCreated {
                key,
                value,
                version,
            }
        }
        EventKind::EntityUpdated => {
            let (key, diff, version) =
                decode_data::<EntityPayload>(kind, payload)?.require_value(kind)?;
            SyncEvent::EntityUpdated { key, diff, version }
        }
        EventKind::EntityDeleted => {
            let data = decode_data::<EntityPayload>(kind, payload)?;
            SyncEvent::EntityDeleted {
                key: data.key(),
                version: data.version,
            }
        }
        EventKind::Invalidate => SyncEvent::Invalidate {
            pattern: decode_data::<KeyPattern>(kind, payload)?,
        },
        EventKind::HealthSnapshot => SyncEvent::HealthSnapshot(
            decode_data::<WireHealthPayload>(kind, payload)?.into_snapshot(),
        ),
        EventKind::HealthService => {
            SyncEvent::HealthService(decode_data::<ServiceUpdate>(kind, payload)?)
        }
        EventKind::Notification => SyncEvent::Notification {
            payload: decode_data::<Value>(kind, payload)?,
        },
        EventKind::Heartbeat => SyncEvent::Heartbeat,
        EventKind::AuthAccepted => SyncEvent::AuthAccepted,
        EventKind::AuthRejected => {
            let data = decode_data::<Option<AuthRejectedPayload>>(kind, payload)
                .ok()
                .flatten();
            let (message, code) = match data {
                Some(data) => (
                    data.message.unwrap_or_else(|| "authentication rejected".to_string()),
                    data.code,
                ),
                None => ("authentication rejected".to_string(), None),
            };
            SyncEvent::AuthRejected { message, code }
        }
    };

    Ok(Some(RoutedEvent {
        room: header.room,
        event,
    }))
}

#[derive(Serialize)]
struct OutboundEnvelope<'a, T: Serialize> {
    event: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a T>,
}

/// Serialize an outbound envelope.
pub fn encode_envelope<T: Serialize>(event: &str, data: Option<&T>) -> SyncResult<Vec<u8>> {
    sonic_rs::to_vec(&OutboundEnvelope { event, data })
        .map_err(|err| SyncError::ParseFailed(format!("encode {event}: {err}")))
}

#[derive(Serialize)]
struct RoomPayload<'a> {
    room: &'a str,
}

pub fn encode_room_join(room: &str) -> SyncResult<Vec<u8>> {
    encode_envelope("room:join", Some(&RoomPayload { room }))
}

pub fn encode_room_leave(room: &str) -> SyncResult<Vec<u8>> {
    encode_envelope("room:leave", Some(&RoomPayload { room }))
}

/// Canonical entity broadcast sent after a confirmed mutation so other clients converge.
pub fn encode_entity_event(
    kind: EventKind,
    key: &CacheKey,
    version: Version,
    value: &Value,
) -> SyncResult<Vec<u8>> {
    let payload = EntityPayload::new(key, version, Some(value.clone()));
    encode_envelope(kind.wire_name(), Some(&payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonic_rs::json;

    #[test]
    fn wire_names_round_trip_through_dispatch_table() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_wire(kind.wire_name()), Some(kind));
        }
        assert_eq!(EventKind::from_wire("appointment.reminder"), None);
    }

    #[test]
    fn decodes_entity_update_with_room() {
        let raw = br#"{"event":"entity:updated","room":"clinic:7","data":{"entity":"appointment","scope":"clinic-7","id":"appt-42","version":6,"diff":{"status":"ARRIVED"}}}"#;
        let routed = decode_event(raw).expect("valid").expect("known event");
        assert_eq!(routed.room.as_deref(), Some("clinic:7"));
        assert_eq!(
            routed.event,
            SyncEvent::EntityUpdated {
                key: CacheKey::scoped("appointment", "clinic-7", "appt-42"),
                diff: json!({"status": "ARRIVED"}),
                version: 6,
            }
        );
    }

    #[test]
    fn unknown_event_names_are_dropped_not_errors() {
        let raw = br#"{"event":"marketing:banner","data":{"x":1}}"#;
        assert!(decode_event(raw).expect("well-formed").is_none());
    }

    #[test]
    fn malformed_payloads_are_parse_errors() {
        assert!(matches!(decode_event(b"{oops"), Err(SyncError::ParseFailed(_))));
        let missing_version = br#"{"event":"entity:updated","data":{"entity":"patient","id":"p-1","diff":{}}}"#;
        assert!(matches!(
            decode_event(missing_version),
            Err(SyncError::ParseFailed(_))
        ));
        let missing_value = br#"{"event":"entity:created","data":{"entity":"patient","id":"p-1","version":1}}"#;
        assert!(matches!(
            decode_event(missing_value),
            Err(SyncError::ParseFailed(_))
        ));
    }

    #[test]
    fn decodes_connection_level_events() {
        let hb = decode_event(br#"{"event":"heartbeat"}"#).expect("valid").expect("known");
        assert_eq!(hb.event, SyncEvent::Heartbeat);

        let rejected = decode_event(br#"{"event":"auth:error","data":{"message":"expired","code":401}}"#)
            .expect("valid")
            .expect("known");
        assert_eq!(
            rejected.event,
            SyncEvent::AuthRejected {
                message: "expired".to_string(),
                code: Some(401)
            }
        );
    }

    #[test]
    fn decodes_invalidate_and_health_events() {
        let routed = decode_event(br#"{"event":"cache:invalidate","data":{"entity":"queue","scope":"clinic-1"}}"#)
            .expect("valid")
            .expect("known");
        assert!(matches!(
            routed.event,
            SyncEvent::Invalidate { ref pattern }
                if pattern.matches(&CacheKey::scoped("queue", "clinic-1", "q-1"))
        ));

        let routed = decode_event(br#"{"event":"health:snapshot","data":{"t":"2024-05-01T10:00:00Z","o":"healthy"}}"#)
            .expect("valid")
            .expect("known");
        assert_eq!(routed.event.kind(), EventKind::HealthSnapshot);
    }

    #[test]
    fn outbound_envelopes_decode_back() {
        let key = CacheKey::new("appointment", "appt-42");
        let bytes = encode_entity_event(
            EventKind::EntityUpdated,
            &key,
            7,
            &json!({"id": "appt-42", "status": "CONFIRMED"}),
        )
        .expect("encode");
        let routed = decode_event(&bytes).expect("valid").expect("known");
        assert_eq!(routed.event.entity_key(), Some(&key));

        let join = encode_room_join("clinic:7").expect("encode");
        let text = String::from_utf8(join).expect("utf8");
        assert!(text.contains("\"room:join\""));
        assert!(text.contains("\"clinic:7\""));
    }
}
