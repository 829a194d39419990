//! MQTT sessions over rumqttc
//!
//! Each [`MqttSession`] owns one rumqttc client and a spawned task polling
//! its event loop. The task never reconnects: the first error or broker
//! DISCONNECT after CONNACK fires the session's close signal and the task
//! exits, leaving reconnection to the supervisor.

use super::connection::{configure_mqtt_options, qos_for, MqttSettings, SessionState};
use super::message_handler::{route_mqtt_event, EventRoute, InboundRouter};
use crate::address::EndpointAddress;
use crate::observers::lock_unpoisoned;
use crate::transport::{
    BrokerTransport, CloseSignal, CreditWindow, MessageDispatch, ReceiverLink, SenderLink,
    Session, TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_LOOP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// [`BrokerTransport`] for `mqtt://` and `mqtts://` endpoints
#[derive(Debug, Clone, Default)]
pub struct MqttBrokerTransport {
    settings: MqttSettings,
}

impl MqttBrokerTransport {
    pub fn new(settings: MqttSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &MqttSettings {
        &self.settings
    }
}

#[async_trait]
impl BrokerTransport for MqttBrokerTransport {
    fn name(&self) -> &str {
        "mqtt"
    }

    async fn open(
        &self,
        address: &EndpointAddress,
        on_close: CloseSignal,
    ) -> Result<Arc<dyn Session>, TransportError> {
        let client_id = self.settings.client_id();
        let options = configure_mqtt_options(&self.settings, address, &client_id)?;
        let (client, event_loop) = AsyncClient::new(options, self.settings.request_capacity);

        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        let shared = Arc::new(SessionShared {
            router: InboundRouter::new(),
            closing: AtomicBool::new(false),
            state: state_rx.clone(),
            on_close,
        });
        let handle = tokio::spawn(run_event_loop(event_loop, state_tx, Arc::clone(&shared)));

        debug!(%client_id, broker = %address.redacted_url(), "Waiting for CONNACK");
        if let Err(e) = wait_for_connection_confirmation(state_rx, self.settings.connect_timeout).await
        {
            shared.closing.store(true, Ordering::SeqCst);
            handle.abort();
            return Err(e);
        }
        info!(%client_id, broker = %address.redacted_url(), "MQTT session established");

        Ok(Arc::new(MqttSession {
            client,
            client_id,
            shared,
            event_loop: Mutex::new(Some(handle)),
        }))
    }
}

async fn wait_for_connection_confirmation(
    mut state: watch::Receiver<SessionState>,
    timeout: Duration,
) -> Result<(), TransportError> {
    let confirmed = tokio::time::timeout(timeout, async {
        loop {
            let current = state.borrow_and_update().clone();
            match current {
                SessionState::Connected => return Ok(()),
                SessionState::Disconnected(reason) => {
                    return Err(TransportError::ConnectionFailed(reason.into()))
                }
                SessionState::Connecting => {}
            }
            if state.changed().await.is_err() {
                return Err(TransportError::ConnectionFailed(
                    "event loop ended before CONNACK".into(),
                ));
            }
        }
    })
    .await;

    confirmed.unwrap_or(Err(TransportError::Timeout(timeout)))
}

struct SessionShared {
    router: InboundRouter,
    /// Set once we initiated the close; silences the close signal
    closing: AtomicBool,
    state: watch::Receiver<SessionState>,
    on_close: CloseSignal,
}

impl SessionShared {
    fn is_connected(&self) -> bool {
        *self.state.borrow() == SessionState::Connected
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.closing.load(Ordering::SeqCst) || !self.is_connected() {
            return Err(TransportError::SessionClosed);
        }
        Ok(())
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    state: watch::Sender<SessionState>,
    shared: Arc<SessionShared>,
) {
    loop {
        let reason = match event_loop.poll().await {
            Ok(event) => match route_mqtt_event(&event) {
                EventRoute::ConnectionAcknowledged => {
                    state.send_replace(SessionState::Connected);
                    continue;
                }
                EventRoute::MessageReceived { topic, payload } => {
                    shared.router.route(&topic, &payload);
                    continue;
                }
                EventRoute::SubscriptionConfirmed { packet_id, rejected } => {
                    if rejected > 0 {
                        warn!(packet_id, rejected, "Broker rejected subscription");
                    }
                    continue;
                }
                EventRoute::Outgoing if shared.closing.load(Ordering::SeqCst) => {
                    debug!("Local disconnect flushed, stopping event loop");
                    return;
                }
                EventRoute::Outgoing | EventRoute::Infrastructure => continue,
                EventRoute::Disconnected { reason } => reason,
            },
            Err(e) => e.to_string(),
        };

        let was_connected = *state.borrow() == SessionState::Connected;
        state.send_replace(SessionState::Disconnected(reason.clone()));
        shared.router.clear();

        if shared.closing.load(Ordering::SeqCst) {
            debug!(%reason, "Event loop stopped during close");
        } else if was_connected {
            error!(%reason, "MQTT session lost");
            shared.on_close.closed(&reason);
        } else {
            debug!(%reason, "MQTT connect failed");
        }
        return;
    }
}

/// One MQTT client connection
pub struct MqttSession {
    client: AsyncClient,
    client_id: String,
    shared: Arc<SessionShared>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttSession {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

#[async_trait]
impl Session for MqttSession {
    async fn create_sender(
        &self,
        topic: &str,
        link_name: &str,
    ) -> Result<Box<dyn SenderLink>, TransportError> {
        self.shared.ensure_connected()?;
        debug!(link = link_name, topic, "MQTT sender attached");

        Ok(Box::new(MqttSender {
            client: self.client.clone(),
            topic: topic.to_string(),
            closed: AtomicBool::new(false),
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn create_receiver(
        &self,
        topic: &str,
        link_name: &str,
    ) -> Result<Box<dyn ReceiverLink>, TransportError> {
        self.shared.ensure_connected()?;

        // Routed before subscribing so retained messages are not missed
        let window = Arc::new(CreditWindow::new());
        let route = self.shared.router.register(topic, Arc::clone(&window));
        if let Err(e) = self
            .client
            .subscribe(topic.to_string(), QoS::AtLeastOnce)
            .await
        {
            self.shared.router.unregister(route);
            return Err(TransportError::SubscriptionFailed(Box::new(e)));
        }
        debug!(link = link_name, topic, "MQTT receiver attached");

        Ok(Box::new(MqttReceiver {
            client: self.client.clone(),
            topic: topic.to_string(),
            route,
            window,
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.router.clear();

        if self.shared.is_connected() {
            if let Err(e) = self.client.disconnect().await {
                debug!(error = %e, "MQTT disconnect request failed");
            }
        }

        let handle = lock_unpoisoned(&self.event_loop).take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(EVENT_LOOP_SHUTDOWN_TIMEOUT, handle).await.is_err() {
                warn!("MQTT event loop did not stop in time, aborting");
                abort.abort();
            }
        }
        debug!(client_id = %self.client_id, "MQTT session closed");
        Ok(())
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        if let Some(handle) = lock_unpoisoned(&self.event_loop).take() {
            handle.abort();
        }
    }
}

struct MqttSender {
    client: AsyncClient,
    topic: String,
    closed: AtomicBool,
    shared: Arc<SessionShared>,
}

#[async_trait]
impl SenderLink for MqttSender {
    async fn send(&self, payload: Bytes, durable: bool) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::SessionClosed);
        }
        self.shared.ensure_connected()?;

        self.client
            .publish(self.topic.clone(), qos_for(durable), false, payload)
            .await
            .map_err(|e| TransportError::SendFailed(Box::new(e)))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// MQTT has no per-link credit; the window is enforced locally
struct MqttReceiver {
    client: AsyncClient,
    topic: String,
    route: u64,
    window: Arc<CreditWindow>,
    shared: Arc<SessionShared>,
}

#[async_trait]
impl ReceiverLink for MqttReceiver {
    async fn start(&self, dispatch: MessageDispatch) -> Result<(), TransportError> {
        self.shared.ensure_connected()?;
        self.window.attach(dispatch);
        Ok(())
    }

    async fn set_credit(&self, credit: u32) -> Result<(), TransportError> {
        self.shared.ensure_connected()?;
        self.window.grant(credit);
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.window.detach();
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.window.reset();
        let shared_filter = self.shared.router.unregister(self.route);
        if shared_filter || !self.shared.is_connected() || self.shared.closing.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.client
            .unsubscribe(self.topic.clone())
            .await
            .map_err(|e| TransportError::SubscriptionFailed(Box::new(e)))
    }
}
