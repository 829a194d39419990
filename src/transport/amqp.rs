//! AMQP 0-9-1 transport over `lapin`
//!
//! Topics map onto queues on the default exchange: a sender publishes with
//! routing key = topic, a receiver consumes the queue named after the topic.
//! Queues are declared non-exclusive and non-auto-delete so publishers and
//! subscribers can come and go independently.
//!
//! Each receiver gets its own channel, so the credit window maps directly
//! onto that channel's `basic.qos` prefetch. A window of zero pauses
//! delivery locally; AMQP would read a zero prefetch as "unlimited".
//!
//! Connection-level errors reported by lapin fire the session's close
//! signal unless we initiated the close ourselves.

use super::{
    BrokerTransport, CloseSignal, CreditWindow, MessageDispatch, ReceiverLink, SenderLink,
    Session, TransportError,
};
use crate::address::{EndpointAddress, Scheme};
use crate::observers::lock_unpoisoned;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const REPLY_SUCCESS: u16 = 200;
const PERSISTENT_DELIVERY_MODE: u8 = 2;
const TRANSIENT_DELIVERY_MODE: u8 = 1;

fn amqp_error(e: lapin::Error) -> Box<dyn std::error::Error + Send + Sync> {
    Box::new(e)
}

/// [`BrokerTransport`] for `amqp://` and `amqps://` endpoints
#[derive(Debug, Clone, Default)]
pub struct AmqpBrokerTransport {
    connection_name: Option<String>,
}

impl AmqpBrokerTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name shown in the broker's management UI
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }
}

#[async_trait]
impl BrokerTransport for AmqpBrokerTransport {
    fn name(&self) -> &str {
        "amqp"
    }

    async fn open(
        &self,
        address: &EndpointAddress,
        on_close: CloseSignal,
    ) -> Result<Arc<dyn Session>, TransportError> {
        if !matches!(address.scheme(), Scheme::Amqp | Scheme::Amqps) {
            return Err(TransportError::InvalidBrokerUrl(format!(
                "scheme {} is not served by the AMQP transport",
                address.scheme().as_str()
            )));
        }

        let mut properties = ConnectionProperties::default();
        if let Some(name) = &self.connection_name {
            properties = properties.with_connection_name(name.clone().into());
        }

        let connection = Connection::connect(&address.url(), properties)
            .await
            .map_err(|e| TransportError::ConnectionFailed(amqp_error(e)))?;

        let closing = Arc::new(AtomicBool::new(false));
        let watcher = Arc::clone(&closing);
        connection.on_error(move |e| {
            if watcher.load(Ordering::SeqCst) {
                debug!(error = %e, "AMQP connection error during close");
                return;
            }
            error!(error = %e, "AMQP connection lost");
            on_close.closed(&e.to_string());
        });

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                closing.store(true, Ordering::SeqCst);
                if let Err(close_error) = connection.close(REPLY_SUCCESS, "channel failed").await {
                    debug!(error = %close_error, "Closing AMQP connection failed");
                }
                return Err(TransportError::ConnectionFailed(amqp_error(e)));
            }
        };
        info!(broker = %address.redacted_url(), "AMQP session established");

        Ok(Arc::new(AmqpSession {
            connection: Arc::new(connection),
            channel,
            closing,
        }))
    }
}

async fn declare_queue(channel: &Channel, topic: &str) -> Result<(), TransportError> {
    channel
        .queue_declare(topic, QueueDeclareOptions::default(), FieldTable::default())
        .await
        .map(|_| ())
        .map_err(|e| TransportError::LinkFailed(format!("queue {topic}: {e}")))
}

struct AmqpSession {
    connection: Arc<Connection>,
    /// Shared by every sender on this session
    channel: Channel,
    closing: Arc<AtomicBool>,
}

impl AmqpSession {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closing.load(Ordering::SeqCst) || !self.connection.status().connected() {
            return Err(TransportError::SessionClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl Session for AmqpSession {
    async fn create_sender(
        &self,
        topic: &str,
        link_name: &str,
    ) -> Result<Box<dyn SenderLink>, TransportError> {
        self.ensure_open()?;
        declare_queue(&self.channel, topic).await?;
        debug!(link = link_name, topic, "AMQP sender attached");

        Ok(Box::new(AmqpSender {
            channel: self.channel.clone(),
            topic: topic.to_string(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn create_receiver(
        &self,
        topic: &str,
        link_name: &str,
    ) -> Result<Box<dyn ReceiverLink>, TransportError> {
        self.ensure_open()?;
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| TransportError::LinkFailed(e.to_string()))?;
        declare_queue(&channel, topic).await?;
        debug!(link = link_name, topic, "AMQP receiver attached");

        Ok(Box::new(AmqpReceiver {
            channel,
            topic: topic.to_string(),
            consumer_tag: link_name.to_string(),
            window: Arc::new(CreditWindow::new()),
            consumer: Mutex::new(None),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|e| TransportError::ConnectionFailed(amqp_error(e)))
    }
}

struct AmqpSender {
    channel: Channel,
    topic: String,
    closed: AtomicBool,
}

#[async_trait]
impl SenderLink for AmqpSender {
    async fn send(&self, payload: Bytes, durable: bool) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) || !self.channel.status().connected() {
            return Err(TransportError::SessionClosed);
        }
        let delivery_mode = if durable {
            PERSISTENT_DELIVERY_MODE
        } else {
            TRANSIENT_DELIVERY_MODE
        };

        self.channel
            .basic_publish(
                "",
                &self.topic,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(delivery_mode),
            )
            .await
            .map_err(|e| TransportError::SendFailed(amqp_error(e)))?
            .await
            .map_err(|e| TransportError::SendFailed(amqp_error(e)))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct AmqpReceiver {
    channel: Channel,
    topic: String,
    consumer_tag: String,
    window: Arc<CreditWindow>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl AmqpReceiver {
    async fn cancel_consumer(&self) -> Result<(), TransportError> {
        let task = lock_unpoisoned(&self.consumer).take();
        let Some(task) = task else {
            return Ok(());
        };
        task.abort();
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| TransportError::LinkFailed(e.to_string()))
    }
}

#[async_trait]
impl ReceiverLink for AmqpReceiver {
    async fn start(&self, dispatch: MessageDispatch) -> Result<(), TransportError> {
        self.window.attach(dispatch);
        if lock_unpoisoned(&self.consumer).is_some() {
            return Ok(());
        }

        let mut consumer = self
            .channel
            .basic_consume(
                &self.topic,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::SubscriptionFailed(amqp_error(e)))?;

        let window = Arc::clone(&self.window);
        let topic = self.topic.clone();
        let task = tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        window.offer(Bytes::from(delivery.data.clone()));
                        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                            warn!(%topic, error = %e, "AMQP ack failed");
                        }
                    }
                    Err(e) => {
                        warn!(%topic, error = %e, "AMQP consumer stopped");
                        break;
                    }
                }
            }
            debug!(%topic, "AMQP consumer task ended");
        });
        *lock_unpoisoned(&self.consumer) = Some(task);
        Ok(())
    }

    async fn set_credit(&self, credit: u32) -> Result<(), TransportError> {
        let prefetch = u16::try_from(credit.max(1)).unwrap_or(u16::MAX);
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| TransportError::FlowControl(e.to_string()))?;
        self.window.grant(credit);
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.window.detach();
        self.cancel_consumer().await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.window.reset();
        self.cancel_consumer().await?;
        if self.channel.status().connected() {
            self.channel
                .close(REPLY_SUCCESS, "link closed")
                .await
                .map_err(|e| TransportError::LinkFailed(e.to_string()))?;
        }
        Ok(())
    }
}
