//! Wire protocol for the Home Assistant WebSocket API.
//!
//! JSON over WebSocket text frames, UTF-8, one message per frame,
//! `lower_snake_case` keys, no indentation, null fields omitted.

use serde::{Deserialize, Serialize};

use crate::error::HassError;

// ---------------------------------------------------------------------------
// Outbound (client -> server)
// ---------------------------------------------------------------------------

/// A message sent from the client to the server.
///
/// The `auth` message carries no id; every other variant gets its id
/// assigned by the coordinator at enqueue time via [`Outbound::set_id`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Auth {
        access_token: String,
    },
    GetConfig {
        id: u64,
    },
    GetStates {
        id: u64,
    },
    SubscribeEvents {
        id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        event_type: Option<String>,
    },
    UnsubscribeEvents {
        id: u64,
        subscription: u64,
    },
    CallService {
        id: u64,
        domain: String,
        service: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        service_data: Option<serde_json::Value>,
    },
    Ping {
        id: u64,
    },
}

impl Outbound {
    /// Assign the id the coordinator reserved for this command.
    ///
    /// No-op for [`Outbound::Auth`], which never carries an id.
    pub fn set_id(&mut self, new_id: u64) {
        match self {
            Outbound::Auth { .. } => {}
            Outbound::GetConfig { id }
            | Outbound::GetStates { id }
            | Outbound::SubscribeEvents { id, .. }
            | Outbound::UnsubscribeEvents { id, .. }
            | Outbound::CallService { id, .. }
            | Outbound::Ping { id } => *id = new_id,
        }
    }

    /// The id this command was assigned, if any.
    pub fn id(&self) -> Option<u64> {
        match self {
            Outbound::Auth { .. } => None,
            Outbound::GetConfig { id }
            | Outbound::GetStates { id }
            | Outbound::SubscribeEvents { id, .. }
            | Outbound::UnsubscribeEvents { id, .. }
            | Outbound::CallService { id, .. }
            | Outbound::Ping { id } => Some(*id),
        }
    }

    /// The command kind, used by the reader to type-decode the reply.
    ///
    /// `None` for commands whose reply is not a `result` message
    /// (`auth`, `ping`).
    pub fn kind(&self) -> Option<CommandKind> {
        match self {
            Outbound::Auth { .. } | Outbound::Ping { .. } => None,
            Outbound::GetConfig { .. } => Some(CommandKind::GetConfig),
            Outbound::GetStates { .. } => Some(CommandKind::GetStates),
            Outbound::SubscribeEvents { .. } => Some(CommandKind::SubscribeEvents),
            Outbound::UnsubscribeEvents { .. } => Some(CommandKind::UnsubscribeEvents),
            Outbound::CallService { .. } => Some(CommandKind::CallService),
        }
    }
}

/// The command type recorded in the pending-commands map, used to decode
/// a polymorphic `result` payload to the right shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    GetConfig,
    GetStates,
    SubscribeEvents,
    UnsubscribeEvents,
    CallService,
}

// ---------------------------------------------------------------------------
// Inbound (server -> client)
// ---------------------------------------------------------------------------

/// The untyped shape every inbound message is first decoded into.
///
/// `result` is kept as an undecoded JSON subtree — only the reader, which
/// consults the pending-commands map, knows what shape it should be.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawInbound {
    AuthRequired,
    AuthOk,
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    Pong {
        id: u64,
    },
    Result {
        id: u64,
        success: bool,
        #[serde(default)]
        result: serde_json::Value,
    },
    Event {
        event: RawEvent,
    },
}

/// A fully typed inbound message, produced by the reader after consulting
/// the pending-commands map for `Result` variants.
#[derive(Debug, Clone)]
pub enum Inbound {
    AuthRequired,
    AuthOk,
    AuthInvalid { message: Option<String> },
    Pong { id: u64 },
    Result {
        id: u64,
        success: bool,
        result: CommandResult,
    },
}

/// The decoded `result` field of a `result` reply, typed according to the
/// command kind recorded in the pending-commands map.
#[derive(Debug, Clone)]
pub enum CommandResult {
    Config(HassConfig),
    States(Vec<HassState>),
    /// `call_service`, `subscribe_events`, `unsubscribe_events`: payload is
    /// left raw, or the command kind was unknown (forwarded anyway).
    Raw(serde_json::Value),
}

impl RawInbound {
    /// Type the `result` field of a `Result` variant using the recorded
    /// command kind. Passing `None` (unknown pending id) leaves the result
    /// raw.
    pub fn into_typed(self, kind: Option<CommandKind>) -> Result<Inbound, HassError> {
        match self {
            RawInbound::AuthRequired => Ok(Inbound::AuthRequired),
            RawInbound::AuthOk => Ok(Inbound::AuthOk),
            RawInbound::AuthInvalid { message } => Ok(Inbound::AuthInvalid { message }),
            RawInbound::Pong { id } => Ok(Inbound::Pong { id }),
            RawInbound::Result {
                id,
                success,
                result,
            } => {
                let typed = match kind {
                    Some(CommandKind::GetConfig) => {
                        let cfg = serde_json::from_value(result)
                            .map_err(|source| HassError::ResultMismatch { id, source })?;
                        CommandResult::Config(cfg)
                    }
                    Some(CommandKind::GetStates) => {
                        let states = serde_json::from_value(result)
                            .map_err(|source| HassError::ResultMismatch { id, source })?;
                        CommandResult::States(states)
                    }
                    Some(CommandKind::CallService)
                    | Some(CommandKind::SubscribeEvents)
                    | Some(CommandKind::UnsubscribeEvents)
                    | None => CommandResult::Raw(result),
                };
                Ok(Inbound::Result {
                    id,
                    success,
                    result: typed,
                })
            }
            RawInbound::Event { .. } => {
                unreachable!("Event is routed to the event channel before typing")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Entity state & config
// ---------------------------------------------------------------------------

/// A single entity's latest state, as returned by `get_states`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HassState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    pub last_changed: String,
    pub last_updated: String,
}

/// Server configuration, as returned by `get_config`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HassConfig {
    pub version: String,
    pub location_name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub time_zone: String,
    #[serde(default)]
    pub components: Vec<String>,
    pub unit_system: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// The untyped shape of an `event` message's `event` field.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub origin: String,
    pub time_fired: String,
}

/// A fully typed event, delivered once to the single event consumer.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub event_type: String,
    pub origin: String,
    pub time_fired: String,
    pub data: EventData,
}

/// The typed payload of an [`EventRecord`].
#[derive(Debug, Clone)]
pub enum EventData {
    StateChanged {
        entity_id: String,
        old_state: Option<HassState>,
        new_state: Option<HassState>,
    },
    ServiceCalled {
        domain: String,
        service: String,
        service_data: serde_json::Value,
    },
    Raw(serde_json::Value),
}

impl From<RawEvent> for EventRecord {
    fn from(raw: RawEvent) -> Self {
        let data = match raw.event_type.as_str() {
            "state_changed" => {
                let entity_id = raw
                    .data
                    .get("entity_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let old_state = raw
                    .data
                    .get("old_state")
                    .and_then(|v| serde_json::from_value(v.clone()).ok());
                let new_state = raw
                    .data
                    .get("new_state")
                    .and_then(|v| serde_json::from_value(v.clone()).ok());
                EventData::StateChanged {
                    entity_id,
                    old_state,
                    new_state,
                }
            }
            "call_service" => {
                let domain = raw
                    .data
                    .get("domain")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let service = raw
                    .data
                    .get("service")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let service_data = raw.data.get("service_data").cloned().unwrap_or(serde_json::Value::Null);
                EventData::ServiceCalled {
                    domain,
                    service,
                    service_data,
                }
            }
            _ => EventData::Raw(raw.data),
        };
        EventRecord {
            event_type: raw.event_type,
            origin: raw.origin,
            time_fired: raw.time_fired,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_auth_has_no_id() {
        let mut auth = Outbound::Auth {
            access_token: "TOKEN".to_string(),
        };
        auth.set_id(7);
        assert_eq!(auth.id(), None);
    }

    #[test]
    fn outbound_command_id_roundtrips() {
        let mut cmd = Outbound::GetConfig { id: 0 };
        cmd.set_id(2);
        assert_eq!(cmd.id(), Some(2));
        assert_eq!(cmd.kind(), Some(CommandKind::GetConfig));
    }

    #[test]
    fn outbound_serializes_snake_case_and_omits_nulls() {
        let cmd = Outbound::CallService {
            id: 5,
            domain: "light".to_string(),
            service: "turn_on".to_string(),
            service_data: None,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"type\":\"call_service\""));
        assert!(!json.contains("service_data"));
    }

    #[test]
    fn raw_inbound_types_get_config_result() {
        let raw = RawInbound::Result {
            id: 2,
            success: true,
            result: serde_json::json!({
                "version": "2024.1.0",
                "location_name": "Home",
                "latitude": 1.0,
                "longitude": 2.0,
                "time_zone": "UTC",
                "components": ["light"],
                "unit_system": {}
            }),
        };
        let typed = raw.into_typed(Some(CommandKind::GetConfig)).unwrap();
        match typed {
            Inbound::Result {
                result: CommandResult::Config(cfg),
                ..
            } => assert_eq!(cfg.location_name, "Home"),
            _ => panic!("expected a typed config result"),
        }
    }

    #[test]
    fn raw_inbound_unknown_command_stays_raw() {
        let raw = RawInbound::Result {
            id: 99,
            success: false,
            result: serde_json::Value::Null,
        };
        let typed = raw.into_typed(None).unwrap();
        assert!(matches!(
            typed,
            Inbound::Result {
                result: CommandResult::Raw(serde_json::Value::Null),
                ..
            }
        ));
    }

    #[test]
    fn raw_event_types_state_changed() {
        let raw = RawEvent {
            event_type: "state_changed".to_string(),
            data: serde_json::json!({
                "entity_id": "sensor.temp",
                "old_state": null,
                "new_state": null,
            }),
            origin: "LOCAL".to_string(),
            time_fired: "2024-01-01T00:00:00Z".to_string(),
        };
        let record: EventRecord = raw.into();
        match record.data {
            EventData::StateChanged { entity_id, .. } => assert_eq!(entity_id, "sensor.temp"),
            _ => panic!("expected a state_changed event"),
        }
    }
}
