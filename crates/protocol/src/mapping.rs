//! Push → transport event mapping rules (spec §6).

use cb_domain::Value;

use crate::frame::ServerFrame;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Health(bool),
    Tick,
    Chat {
        run_id: String,
        session_key: String,
        state: String,
    },
    SeqGap {
        expected: u64,
        received: u64,
    },
}

/// Apply the mapping rules of §6. Returns `None` for anything that should
/// be dropped (unknown event names — per the spec's own "treat as drop"
/// resolution of its Open Question).
pub fn map_to_transport_event(frame: &ServerFrame) -> Option<TransportEvent> {
    match frame {
        ServerFrame::PushSnapshot(snap) => snap
            .snapshot
            .health
            .get("ok")
            .and_then(Value::as_bool)
            .map(TransportEvent::Health),
        ServerFrame::Event(ev) => match ev.event.as_str() {
            "health" => ev
                .payload
                .as_ref()
                .and_then(|p| p.get("ok"))
                .and_then(Value::as_bool)
                .map(TransportEvent::Health),
            "tick" => Some(TransportEvent::Tick),
            "chat" => {
                let payload = ev.payload.as_ref()?;
                let run_id = payload.get("runId")?.as_str()?.to_owned();
                let session_key = payload.get("sessionKey")?.as_str()?.to_owned();
                let state = payload.get("state")?.as_str()?.to_owned();
                Some(TransportEvent::Chat {
                    run_id,
                    session_key,
                    state,
                })
            }
            _ => None,
        },
        ServerFrame::SeqGap(gap) => Some(TransportEvent::SeqGap {
            expected: gap.expected,
            received: gap.received,
        }),
        ServerFrame::HelloOk(_) | ServerFrame::RpcRes(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{EventFrame, Snapshot, StateVersionPair};
    use std::collections::BTreeMap;

    fn health_value(ok: bool) -> Value {
        let mut m = BTreeMap::new();
        m.insert("ok".to_string(), Value::Bool(ok));
        Value::Map(m)
    }

    #[test]
    fn snapshot_health_false_maps_to_health_false() {
        let frame = ServerFrame::PushSnapshot(crate::frame::PushSnapshot {
            snapshot: Snapshot {
                presence: vec![],
                health: health_value(false),
                state_version: StateVersionPair {
                    presence: 0,
                    health: 0,
                },
                uptime_ms: 0,
                config_path: None,
                state_dir: None,
                session_defaults: None,
            },
        });
        assert_eq!(
            map_to_transport_event(&frame),
            Some(TransportEvent::Health(false))
        );
    }

    #[test]
    fn snapshot_health_true_maps_to_health_true() {
        let frame = ServerFrame::PushSnapshot(crate::frame::PushSnapshot {
            snapshot: Snapshot {
                presence: vec![],
                health: health_value(true),
                state_version: StateVersionPair {
                    presence: 0,
                    health: 0,
                },
                uptime_ms: 0,
                config_path: None,
                state_dir: None,
                session_defaults: None,
            },
        });
        assert_eq!(
            map_to_transport_event(&frame),
            Some(TransportEvent::Health(true))
        );
    }

    #[test]
    fn unknown_event_maps_to_none() {
        let frame = ServerFrame::Event(EventFrame {
            event: "unknown".into(),
            payload: None,
            seq: 1,
            state_version: None,
        });
        assert_eq!(map_to_transport_event(&frame), None);
    }

    #[test]
    fn tick_event_maps() {
        let frame = ServerFrame::Event(EventFrame {
            event: "tick".into(),
            payload: None,
            seq: 1,
            state_version: None,
        });
        assert_eq!(map_to_transport_event(&frame), Some(TransportEvent::Tick));
    }

    #[test]
    fn chat_event_maps_with_fields() {
        let mut payload = BTreeMap::new();
        payload.insert("runId".to_string(), Value::String("r1".into()));
        payload.insert("sessionKey".to_string(), Value::String("s1".into()));
        payload.insert("state".to_string(), Value::String("final".into()));
        let frame = ServerFrame::Event(EventFrame {
            event: "chat".into(),
            payload: Some(Value::Map(payload)),
            seq: 2,
            state_version: None,
        });
        assert_eq!(
            map_to_transport_event(&frame),
            Some(TransportEvent::Chat {
                run_id: "r1".into(),
                session_key: "s1".into(),
                state: "final".into(),
            })
        );
    }

    #[test]
    fn seq_gap_maps() {
        let frame = ServerFrame::SeqGap(crate::frame::SeqGapFrame {
            expected: 3,
            received: 5,
        });
        assert_eq!(
            map_to_transport_event(&frame),
            Some(TransportEvent::SeqGap {
                expected: 3,
                received: 5
            })
        );
    }
}
