//! UE event exposure
//!
//! In-process publish/subscribe of the four UE event kinds. Subscribers are
//! registered per kind and optionally per SUPI; a subscription without SUPI
//! receives the event for every subscriber.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::gmm_sm::{CmState, GmmState};
use crate::types::{IdGenerators, NrCgi, SubscriptionId, Supi, Tai};

/// Queue depth of one subscription
pub const SUBSCRIPTION_QUEUE_CAPACITY: usize = 64;

/// Event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    LocationReport,
    Reachability,
    RegistrationState,
    ConnectivityState,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::LocationReport => "LOCATION_REPORT",
            EventKind::Reachability => "REACHABILITY_REPORT",
            EventKind::RegistrationState => "REGISTRATION_STATE_REPORT",
            EventKind::ConnectivityState => "CONNECTIVITY_STATE_REPORT",
        }
    }
}

/// UE reachability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Reachable,
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    Location { tai: Tai, cgi: Option<NrCgi> },
    Reachability(Reachability),
    RegistrationState(GmmState),
    ConnectivityState(CmState),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Location { .. } => EventKind::LocationReport,
            EventPayload::Reachability(_) => EventKind::Reachability,
            EventPayload::RegistrationState(_) => EventKind::RegistrationState,
            EventPayload::ConnectivityState(_) => EventKind::ConnectivityState,
        }
    }
}

/// One published event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UeEvent {
    pub supi: Supi,
    pub payload: EventPayload,
}

struct Subscription {
    kind: EventKind,
    supi: Option<Supi>,
    tx: mpsc::Sender<UeEvent>,
}

impl Subscription {
    fn matches(&self, event: &UeEvent) -> bool {
        self.kind == event.payload.kind()
            && self.supi.as_ref().map_or(true, |supi| supi == &event.supi)
    }
}

/// Subscription registry and publisher
#[derive(Default)]
pub struct EventBus {
    subscriptions: Mutex<HashMap<SubscriptionId, Subscription>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber
    pub fn subscribe(
        &self,
        ids: &IdGenerators,
        kind: EventKind,
        supi: Option<Supi>,
    ) -> (SubscriptionId, mpsc::Receiver<UeEvent>) {
        let id = ids.next_subscription_id();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE_CAPACITY);
        log::info!(
            "Event subscription {} for {} (supi={})",
            id,
            kind.name(),
            supi.as_ref().map(|s| s.as_str()).unwrap_or("any")
        );
        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.insert(id, Subscription { kind, supi, tx });
        }
        (id, rx)
    }

    /// Remove a subscriber; false if unknown
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self
            .subscriptions
            .lock()
            .map(|mut subs| subs.remove(&id).is_some())
            .unwrap_or(false);
        if removed {
            log::info!("Event subscription {} removed", id);
        }
        removed
    }

    /// Deliver an event to every matching subscriber, returning the count
    ///
    /// Subscriptions whose receiver was dropped are removed.
    pub fn publish(&self, supi: &Supi, payload: EventPayload) -> usize {
        let event = UeEvent {
            supi: supi.clone(),
            payload,
        };
        let mut delivered = 0;
        let Ok(mut subs) = self.subscriptions.lock() else {
            return 0;
        };
        subs.retain(|id, sub| {
            if !sub.matches(&event) {
                return true;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!("Event subscription {} queue full, event dropped", id);
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    log::debug!("Event subscription {} closed", id);
                    false
                }
            }
        });
        log::debug!(
            "{} for {} delivered to {} subscriber(s)",
            event.payload.kind().name(),
            supi,
            delivered
        );
        delivered
    }

    pub fn len(&self) -> usize {
        self.subscriptions.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supi(n: u8) -> Supi {
        Supi::from_imsi(&format!("00101000000000{}", n))
    }

    #[test]
    fn test_publish_filters_by_kind_and_supi() {
        let ids = IdGenerators::new();
        let bus = EventBus::new();
        let (_, mut any_rx) = bus.subscribe(&ids, EventKind::Reachability, None);
        let (_, mut one_rx) = bus.subscribe(&ids, EventKind::Reachability, Some(supi(1)));
        let (_, mut cm_rx) = bus.subscribe(&ids, EventKind::ConnectivityState, None);

        let n = bus.publish(&supi(2), EventPayload::Reachability(Reachability::Unreachable));
        assert_eq!(n, 1);
        assert_eq!(any_rx.try_recv().unwrap().supi, supi(2));
        assert!(one_rx.try_recv().is_err());
        assert!(cm_rx.try_recv().is_err());

        let n = bus.publish(&supi(1), EventPayload::Reachability(Reachability::Reachable));
        assert_eq!(n, 2);
        assert_eq!(
            one_rx.try_recv().unwrap().payload,
            EventPayload::Reachability(Reachability::Reachable)
        );
    }

    #[test]
    fn test_unsubscribe() {
        let ids = IdGenerators::new();
        let bus = EventBus::new();
        let (id, _rx) = bus.subscribe(&ids, EventKind::RegistrationState, None);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(
            bus.publish(&supi(1), EventPayload::RegistrationState(GmmState::Registered)),
            0
        );
    }

    #[test]
    fn test_closed_subscription_is_dropped() {
        let ids = IdGenerators::new();
        let bus = EventBus::new();
        let (_, rx) = bus.subscribe(&ids, EventKind::ConnectivityState, None);
        drop(rx);
        bus.publish(&supi(1), EventPayload::ConnectivityState(CmState::Idle));
        assert!(bus.is_empty());
    }
}
