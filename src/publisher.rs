// src/publisher.rs

//! The publish façade: a single nsqd connection with PUB/MPUB/DPUB
//! dispatch.

use crate::config::{PublisherConfig, validate_topic};
use crate::connection::actor::ActorOptions;
use crate::connection::{Connection, ConnectionState};
use crate::core::NsqError;
use crate::core::events::ConnectionEvent;
use crate::core::protocol::{Command, MessageBody};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

/// A publish payload: one message or a batch.
#[derive(Debug, Clone)]
pub enum Payload {
    Single(MessageBody),
    Multi(Vec<MessageBody>),
}

impl From<MessageBody> for Payload {
    fn from(body: MessageBody) -> Self {
        Payload::Single(body)
    }
}

impl From<Vec<MessageBody>> for Payload {
    fn from(bodies: Vec<MessageBody>) -> Self {
        Payload::Multi(bodies)
    }
}

/// Publishes messages to a single nsqd node.
///
/// With `auto_connect` (the default) the first publish dials the broker;
/// otherwise call [`Publisher::connect`] first.
#[derive(Debug)]
pub struct Publisher {
    config: PublisherConfig,
    connection: Option<Connection>,
    unref: bool,
}

impl Publisher {
    pub fn new(config: PublisherConfig) -> Result<Self, NsqError> {
        config.validate()?;
        Ok(Publisher {
            config,
            connection: None,
            unref: false,
        })
    }

    /// Builds a publisher from a `nsq://host:port/topic?opt=...` URI.
    pub fn from_uri(uri: &str) -> Result<Self, NsqError> {
        Publisher::new(PublisherConfig::from_uri(uri)?)
    }

    /// Dials the broker and waits for the identify handshake to complete.
    pub async fn connect(&mut self) -> Result<(), NsqError> {
        self.spawn_connection();
        match &self.connection {
            Some(connection) => connection.wait_ready().await,
            None => Err(NsqError::Terminated),
        }
    }

    fn spawn_connection(&mut self) {
        if self.connection.is_some() {
            return;
        }
        let connection = Connection::spawn(
            self.config.address(),
            self.config.connection.clone(),
            ActorOptions {
                subscription: None,
                keepalive_offset: Duration::ZERO,
                message_sink: None,
                observer: None,
            },
        );
        if self.unref {
            connection.unref();
        }
        self.connection = Some(connection);
    }

    /// Publishes a single message (PUB). Returns the server's response,
    /// normally `OK`.
    pub async fn publish(
        &mut self,
        topic: &str,
        body: impl Into<MessageBody>,
    ) -> Result<String, NsqError> {
        self.publish_payload(Some(topic), Payload::Single(body.into()), None)
            .await
    }

    /// Publishes a message delivered no earlier than `delay` from now
    /// (DPUB).
    pub async fn publish_deferred(
        &mut self,
        topic: &str,
        body: impl Into<MessageBody>,
        delay: Duration,
    ) -> Result<String, NsqError> {
        self.publish_payload(Some(topic), Payload::Single(body.into()), Some(delay))
            .await
    }

    /// Publishes a batch atomically (MPUB).
    pub async fn publish_multi<I, B>(&mut self, topic: &str, bodies: I) -> Result<String, NsqError>
    where
        I: IntoIterator<Item = B>,
        B: Into<MessageBody>,
    {
        let bodies = bodies.into_iter().map(Into::into).collect();
        self.publish_payload(Some(topic), Payload::Multi(bodies), None)
            .await
    }

    /// The full dispatch: a batch with a delay is rejected before touching
    /// the wire; a batch becomes MPUB; a delay becomes DPUB; anything else
    /// is a plain PUB. A `None` topic falls back to the configured default.
    pub async fn publish_payload(
        &mut self,
        topic: Option<&str>,
        payload: Payload,
        delay: Option<Duration>,
    ) -> Result<String, NsqError> {
        let topic = topic
            .or(self.config.topic.as_deref())
            .ok_or_else(|| {
                NsqError::InvalidRequest("no topic given and no default configured".into())
            })?
            .to_string();
        validate_topic(&topic)?;

        let command = match (payload, delay) {
            (Payload::Multi(_), Some(_)) => return Err(NsqError::DelayedMultiPublish),
            (Payload::Multi(bodies), None) => Command::Mpub { topic, bodies },
            (Payload::Single(body), Some(delay)) => Command::Dpub {
                topic,
                delay_ms: delay.as_millis() as u64,
                body,
            },
            (Payload::Single(body), None) => Command::Pub { topic, body },
        };

        if self.connection.is_none() {
            if !self.config.auto_connect {
                return Err(NsqError::InvalidRequest(
                    "publisher is not connected and auto_connect is off".into(),
                ));
            }
            debug!("auto-connecting publisher to {}", self.config.address());
            self.connect().await?;
        }
        let connection = self.connection.as_ref().ok_or(NsqError::Terminated)?;

        let response = connection.submit(command).await?;
        Ok(response
            .map(|body| String::from_utf8_lossy(&body).to_string())
            .unwrap_or_default())
    }

    /// The connection's lifecycle state; `Disconnected` before the first
    /// connect.
    pub fn state(&self) -> ConnectionState {
        self.connection
            .as_ref()
            .map_or(ConnectionState::Disconnected, |c| c.state())
    }

    /// Lifecycle events of the underlying connection, once one exists.
    pub fn events(&self) -> Option<broadcast::Receiver<ConnectionEvent>> {
        self.connection.as_ref().map(|c| c.events())
    }

    /// Marks teardown as abortive for the current and any future
    /// connection.
    pub fn unref(&mut self) {
        self.unref = true;
        if let Some(connection) = &self.connection {
            connection.unref();
        }
    }

    /// Drains the outbound queue and closes the connection.
    pub async fn close(mut self) -> Result<(), NsqError> {
        match self.connection.take() {
            Some(connection) => connection.close().await,
            None => Ok(()),
        }
    }
}
