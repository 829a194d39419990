//! MQTT event routing
//!
//! [`route_mqtt_event`] classifies what the event loop hands us;
//! [`InboundRouter`] fans inbound publishes out to the receivers whose
//! filter matches.

use super::connection::topic_matches;
use crate::observers::lock_unpoisoned;
use crate::transport::CreditWindow;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{Packet, SubscribeReasonCode};
use rumqttc::v5::Event;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

/// What the session loop should do with one event
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// CONNACK: the session is usable
    ConnectionAcknowledged,
    MessageReceived { topic: String, payload: Bytes },
    /// Broker sent DISCONNECT
    Disconnected { reason: String },
    /// SUBACK; `rejected` counts refused filters
    SubscriptionConfirmed { packet_id: u16, rejected: usize },
    Infrastructure,
    Outgoing,
}

pub fn route_mqtt_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(packet) => match packet {
            Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
            Packet::Publish(publish) => EventRoute::MessageReceived {
                topic: String::from_utf8_lossy(&publish.topic).to_string(),
                payload: publish.payload.clone(),
            },
            Packet::Disconnect(disconnect) => EventRoute::Disconnected {
                reason: format!("broker sent DISCONNECT ({:?})", disconnect.reason_code),
            },
            Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                packet_id: suback.pkid,
                rejected: suback
                    .return_codes
                    .iter()
                    .filter(|code| !matches!(code, SubscribeReasonCode::Success(_)))
                    .count(),
            },
            _ => EventRoute::Infrastructure,
        },
        Event::Outgoing(_) => EventRoute::Outgoing,
    }
}

struct Route {
    id: u64,
    filter: String,
    window: Arc<CreditWindow>,
}

/// Receiver registry for one MQTT session
#[derive(Default)]
pub struct InboundRouter {
    next_id: AtomicU64,
    routes: Mutex<Vec<Route>>,
}

impl InboundRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, filter: &str, window: Arc<CreditWindow>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        lock_unpoisoned(&self.routes).push(Route {
            id,
            filter: filter.to_string(),
            window,
        });
        id
    }

    /// Remove a route; returns whether another route still uses its filter
    pub fn unregister(&self, id: u64) -> bool {
        let mut routes = lock_unpoisoned(&self.routes);
        let Some(position) = routes.iter().position(|route| route.id == id) else {
            return false;
        };
        let removed = routes.remove(position);
        routes.iter().any(|route| route.filter == removed.filter)
    }

    /// Offer `payload` to every matching receiver; returns how many took it
    pub fn route(&self, topic: &str, payload: &Bytes) -> usize {
        let targets: Vec<Arc<CreditWindow>> = lock_unpoisoned(&self.routes)
            .iter()
            .filter(|route| topic_matches(&route.filter, topic))
            .map(|route| Arc::clone(&route.window))
            .collect();

        if targets.is_empty() {
            trace!(%topic, "No receiver for inbound message");
        }
        targets
            .iter()
            .filter(|window| window.offer(payload.clone()))
            .count()
    }

    /// Drop every route and reset its window
    pub fn clear(&self) {
        let routes = std::mem::take(&mut *lock_unpoisoned(&self.routes));
        for route in routes {
            route.window.reset();
        }
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.routes).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::metrics::LinkMetrics;
    use crate::transport::{HandlerError, MessageDispatch};
    use rumqttc::v5::mqttbytes::v5::{ConnAck, ConnectReturnCode, Publish};
    use rumqttc::v5::mqttbytes::QoS;

    fn counting_window() -> (Arc<CreditWindow>, Arc<Mutex<Vec<Vec<u8>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = move |payload: &[u8]| -> Result<(), HandlerError> {
            sink.lock().unwrap().push(payload.to_vec());
            Ok(())
        };
        let window = Arc::new(CreditWindow::new());
        window.attach(MessageDispatch::new(
            Arc::new(handler),
            "test-rx",
            Arc::new(LinkMetrics::new()),
        ));
        window.grant(10);
        (window, seen)
    }

    #[test]
    fn test_route_connack() {
        let event = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert_eq!(route_mqtt_event(&event), EventRoute::ConnectionAcknowledged);
    }

    #[test]
    fn test_route_publish() {
        let publish = Publish::new("sensors/temp", QoS::AtMostOnce, "21.5", None);
        let route = route_mqtt_event(&Event::Incoming(Packet::Publish(publish)));

        assert_eq!(
            route,
            EventRoute::MessageReceived {
                topic: "sensors/temp".to_string(),
                payload: Bytes::from_static(b"21.5"),
            }
        );
    }

    #[test]
    fn test_router_fans_out_to_matching_filters() {
        let router = InboundRouter::new();
        let (exact, exact_seen) = counting_window();
        let (wildcard, wildcard_seen) = counting_window();
        let (other, other_seen) = counting_window();
        router.register("sensors/temp", exact);
        router.register("sensors/#", wildcard);
        router.register("alerts", other);

        let delivered = router.route("sensors/temp", &Bytes::from_static(b"21.5"));

        assert_eq!(delivered, 2);
        assert_eq!(exact_seen.lock().unwrap().len(), 1);
        assert_eq!(wildcard_seen.lock().unwrap().len(), 1);
        assert!(other_seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unregister_reports_shared_filters() {
        let router = InboundRouter::new();
        let first = router.register("orders", Arc::new(CreditWindow::new()));
        let second = router.register("orders", Arc::new(CreditWindow::new()));

        assert!(router.unregister(first));
        assert!(!router.unregister(second));
        assert!(!router.unregister(second));
        assert!(router.is_empty());
    }

    #[test]
    fn test_clear_resets_windows() {
        let router = InboundRouter::new();
        let (window, _) = counting_window();
        router.register("orders", Arc::clone(&window));

        router.clear();

        assert!(router.is_empty());
        assert!(!window.is_attached());
        assert_eq!(router.route("orders", &Bytes::from_static(b"x")), 0);
    }
}
