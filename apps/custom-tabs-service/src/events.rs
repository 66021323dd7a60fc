use std::collections::VecDeque;
use std::sync::Arc;

use custom_tabs_core::{NavigationEvent, Origin, Relation, SessionCallback};
use parking_lot::Mutex;
use serde::Serialize;

use crate::metrics::EVENTS_DROPPED;

/// Notification queued for a client until it polls `/sessions/{id}/events`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    WarmupCompleted,
    RelationshipValidated {
        relation: Relation,
        origin: String,
        verified: bool,
    },
    Navigation {
        event: NavigationEvent,
    },
    Extra {
        name: String,
        args: serde_json::Value,
    },
}

/// Bounded FIFO of client events. The oldest event is dropped on overflow.
pub struct EventBuffer {
    events: Mutex<VecDeque<ClientEvent>>,
    capacity: usize,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        })
    }

    pub fn drain(&self) -> Vec<ClientEvent> {
        self.events.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, event: ClientEvent) {
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
            EVENTS_DROPPED.inc();
        }
        events.push_back(event);
    }
}

impl SessionCallback for EventBuffer {
    fn on_warmup_completed(&self) {
        self.push(ClientEvent::WarmupCompleted);
    }

    fn on_relationship_validation_result(&self, relation: Relation, origin: &Origin, ok: bool) {
        self.push(ClientEvent::RelationshipValidated {
            relation,
            origin: origin.serialize(),
            verified: ok,
        });
    }

    fn on_navigation_event(&self, event: NavigationEvent) {
        self.push(ClientEvent::Navigation { event });
    }

    fn extra_callback(&self, name: &str, args: &serde_json::Value) {
        self.push(ClientEvent::Extra {
            name: name.to_string(),
            args: args.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn overflow_drops_the_oldest_event() {
        let buffer = EventBuffer::new(2);
        buffer.on_warmup_completed();
        buffer.on_navigation_event(NavigationEvent::Started);
        buffer.on_navigation_event(NavigationEvent::Finished);
        assert_eq!(
            buffer.drain(),
            vec![
                ClientEvent::Navigation {
                    event: NavigationEvent::Started
                },
                ClientEvent::Navigation {
                    event: NavigationEvent::Finished
                },
            ]
        );
        assert!(buffer.is_empty());
    }

    #[test_timeout::timeout]
    fn events_serialize_with_a_type_tag() {
        let event = ClientEvent::RelationshipValidated {
            relation: Relation::UseAsOrigin,
            origin: "https://a.example".into(),
            verified: true,
        };
        assert_eq!(
            serde_json::to_value(&event).expect("json"),
            serde_json::json!({
                "type": "relationship_validated",
                "relation": "use_as_origin",
                "origin": "https://a.example",
                "verified": true
            })
        );
    }
}
