// src/subscriber/mod.rs

//! The subscriber: discovery polling, connection set maintenance, RDY
//! distribution, pause/unpause, and aggregate message delivery.
//!
//! A controller task owns the connection set. Each poll diffs the
//! discovered producer set against the live connections, then re-spreads
//! the concurrency budget (see `ready`). Messages from every connection
//! funnel into one channel read by [`Subscriber::recv`].

pub mod ready;

use crate::config::{NsqdAddress, SubscriberConfig};
use crate::connection::Connection;
use crate::connection::actor::ActorOptions;
use crate::core::NsqError;
use crate::core::events::{EVENT_BUS_CAPACITY, HostEvent, SubscriberEvent};
use crate::core::message::Message;
use crate::lookup::{Discovery, LookupDiscovery, StaticDiscovery};
use ready::ReadyState;
use std::collections::HashMap;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const CONTROLLER_QUEUE_CAPACITY: usize = 32;
/// Messages funnel through one bounded channel; RDY already bounds how many
/// can be outstanding, this only absorbs bursts.
const MESSAGE_CHANNEL_CAPACITY: usize = 1024;
const HOST_EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
enum ControllerRequest {
    Pause,
    Unpause,
    Unref,
    Close { done: oneshot::Sender<()> },
}

/// Receives messages for one `(topic, channel)` pair from every nsqd that
/// carries the topic.
pub struct Subscriber {
    config: SubscriberConfig,
    events: broadcast::Sender<SubscriberEvent>,
    messages: Option<mpsc::Receiver<Message>>,
    requests: Option<mpsc::Sender<ControllerRequest>>,
    task: Option<tokio::task::JoinHandle<()>>,
    unref: bool,
}

impl Subscriber {
    pub fn new(config: SubscriberConfig) -> Result<Self, NsqError> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Ok(Subscriber {
            config,
            events,
            messages: None,
            requests: None,
            task: None,
            unref: false,
        })
    }

    /// Builds a subscriber from a `nsqlookup://...` or `nsq://...` URI.
    pub fn from_uri(uri: &str) -> Result<Self, NsqError> {
        Subscriber::new(SubscriberConfig::from_uri(uri)?)
    }

    /// Starts the controller: the first discovery poll runs immediately and
    /// the ready budget is applied to whatever it finds.
    pub async fn connect(&mut self) -> Result<(), NsqError> {
        if self.task.is_some() {
            return Ok(());
        }

        let discovery: Box<dyn Discovery> = match &self.config.nsqd {
            Some(address) => Box::new(StaticDiscovery::new(vec![address.clone()])),
            None => Box::new(LookupDiscovery::new(
                self.config
                    .lookup
                    .iter()
                    .map(|url| crate::lookup::normalize_lookup_url(url))
                    .collect(),
            )?),
        };

        let (requests_tx, requests_rx) = mpsc::channel(CONTROLLER_QUEUE_CAPACITY);
        let (messages_tx, messages_rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        let (conn_events_tx, conn_events_rx) = mpsc::channel(HOST_EVENT_CHANNEL_CAPACITY);

        let controller = SubscriberController {
            config: self.config.clone(),
            discovery,
            connections: HashMap::new(),
            paused: false,
            unref: self.unref,
            requests: requests_rx,
            events: self.events.clone(),
            conn_events: conn_events_rx,
            conn_events_tx,
            messages_tx,
        };
        self.task = Some(tokio::spawn(controller.run()));
        self.requests = Some(requests_tx);
        self.messages = Some(messages_rx);
        Ok(())
    }

    /// The next message from any connection, in arrival order. `None` once
    /// the subscriber is closed. With `auto_connect` the first call starts
    /// the controller.
    pub async fn recv(&mut self) -> Option<Message> {
        if self.task.is_none() && self.config.auto_connect {
            if let Err(e) = self.connect().await {
                warn!("subscriber auto-connect failed: {e}");
                return None;
            }
        }
        self.messages.as_mut()?.recv().await
    }

    /// Controller and per-host connection events.
    pub fn events(&self) -> broadcast::Receiver<SubscriberEvent> {
        self.events.subscribe()
    }

    /// Sets the effective concurrency to zero; delivery stops once the
    /// already-granted credits are spent.
    pub async fn pause(&self) {
        self.send_request(ControllerRequest::Pause).await;
    }

    /// Restores the configured concurrency.
    pub async fn unpause(&self) {
        self.send_request(ControllerRequest::Unpause).await;
    }

    /// Marks teardown as abortive for all current and future connections.
    pub async fn unref(&mut self) {
        self.unref = true;
        self.send_request(ControllerRequest::Unref).await;
    }

    /// Waits out any in-progress poll, cancels the next one, and closes
    /// every connection.
    pub async fn close(mut self) -> Result<(), NsqError> {
        let Some(requests) = self.requests.take() else {
            return Ok(());
        };
        let (done, finished) = oneshot::channel();
        if requests
            .send(ControllerRequest::Close { done })
            .await
            .is_ok()
        {
            let _ = finished.await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        Ok(())
    }

    async fn send_request(&self, request: ControllerRequest) {
        if let Some(requests) = &self.requests {
            let _ = requests.send(request).await;
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

struct ConnectionEntry {
    connection: Connection,
    /// The ready count this controller last granted.
    ready: u64,
}

struct SubscriberController {
    config: SubscriberConfig,
    discovery: Box<dyn Discovery>,
    connections: HashMap<String, ConnectionEntry>,
    paused: bool,
    unref: bool,
    requests: mpsc::Receiver<ControllerRequest>,
    events: broadcast::Sender<SubscriberEvent>,
    conn_events: mpsc::Receiver<HostEvent>,
    conn_events_tx: mpsc::Sender<HostEvent>,
    messages_tx: mpsc::Sender<Message>,
}

impl SubscriberController {
    async fn run(mut self) {
        info!(
            "subscriber controller started for {}.{}",
            self.config.topic, self.config.channel
        );
        self.poll().await;

        let periodic = self.discovery.is_periodic();
        let mut poll_at = Instant::now() + self.config.discover_frequency();

        loop {
            tokio::select! {
                biased;
                maybe_req = self.requests.recv() => match maybe_req {
                    Some(ControllerRequest::Pause) => {
                        info!("pausing subscriber for {}.{}", self.config.topic, self.config.channel);
                        self.paused = true;
                        self.redistribute().await;
                    }
                    Some(ControllerRequest::Unpause) => {
                        info!("unpausing subscriber for {}.{}", self.config.topic, self.config.channel);
                        self.paused = false;
                        self.redistribute().await;
                    }
                    Some(ControllerRequest::Unref) => {
                        self.unref = true;
                        for entry in self.connections.values() {
                            entry.connection.unref();
                        }
                    }
                    Some(ControllerRequest::Close { done }) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                Some(event) = self.conn_events.recv() => self.handle_host_event(event).await,
                _ = tokio::time::sleep_until(poll_at), if periodic => {
                    self.poll().await;
                    poll_at = Instant::now() + self.config.discover_frequency();
                }
            }
        }
    }

    /// One discovery pass: resolve producers, diff against the connection
    /// set, redistribute the ready budget.
    async fn poll(&mut self) {
        self.emit(SubscriberEvent::PollBegin);
        let (addresses, errors) = self.discovery.discover(&self.config.topic).await;

        let had_errors = !errors.is_empty();
        for error in errors {
            let host = error.host().unwrap_or("").to_string();
            warn!("lookup failed for topic '{}': {error}", self.config.topic);
            self.emit(SubscriberEvent::LookupFailed { host, error });
        }

        // An empty union produced purely by failures must not tear down
        // healthy connections.
        if addresses.is_empty() && had_errors && !self.connections.is_empty() {
            debug!("discovery returned no producers; keeping the current set");
            self.redistribute().await;
            self.emit(SubscriberEvent::PollComplete);
            return;
        }

        let desired: Vec<String> = addresses.iter().map(ToString::to_string).collect();
        let stale: Vec<String> = self
            .connections
            .keys()
            .filter(|address| !desired.contains(address))
            .cloned()
            .collect();
        for address in stale {
            if let Some(entry) = self.connections.remove(&address) {
                info!("producer {address} no longer advertised, closing");
                tokio::spawn(async move {
                    let _ = entry.connection.close().await;
                });
                self.emit(SubscriberEvent::ProducerRemoved { address });
            }
        }

        for address in addresses {
            let key = address.to_string();
            if self.connections.contains_key(&key) {
                continue;
            }
            info!("adding producer {key} for topic '{}'", self.config.topic);
            let connection = self.spawn_connection(address);
            self.connections
                .insert(key.clone(), ConnectionEntry { connection, ready: 0 });
            self.emit(SubscriberEvent::ProducerAdded { address: key });
        }

        self.redistribute().await;
        self.emit(SubscriberEvent::PollComplete);
    }

    fn spawn_connection(&self, address: NsqdAddress) -> Connection {
        let connection = Connection::spawn(
            address,
            self.config.connection.clone(),
            ActorOptions {
                subscription: Some((self.config.topic.clone(), self.config.channel.clone())),
                keepalive_offset: self.config.keepalive_offset(),
                message_sink: Some(self.messages_tx.clone()),
                observer: Some(self.conn_events_tx.clone()),
            },
        );
        if self.unref {
            connection.unref();
        }
        connection
    }

    /// Re-spreads the concurrency budget over the current connection set.
    async fn redistribute(&mut self) {
        let concurrency = if self.paused { 0 } else { self.config.concurrency };
        let states: Vec<ReadyState> = self
            .connections
            .iter()
            .map(|(address, entry)| ReadyState {
                address: address.clone(),
                ready: entry.ready,
                last_message_at_ms: entry.connection.last_message_at_ms(),
            })
            .collect();

        for (address, count) in ready::distribute(&states, concurrency) {
            let Some(entry) = self.connections.get_mut(&address) else {
                continue;
            };
            if entry.ready == count {
                continue;
            }
            debug!("RDY {count} -> {address}");
            entry.ready = count;
            if let Err(e) = entry.connection.set_ready(count).await {
                warn!("failed to set RDY {count} on {address}: {e}");
            }
        }
    }

    async fn handle_host_event(&mut self, event: HostEvent) {
        use crate::core::events::ConnectionEvent;

        let failed = matches!(event.event, ConnectionEvent::Failed);
        let address = format!("{}:{}", event.host, event.port);
        self.emit(SubscriberEvent::Connection(event));

        // A terminally failed connection frees its slot so the budget can
        // move on; the next poll may re-add the producer if it comes back.
        if failed && self.connections.remove(&address).is_some() {
            warn!("connection to {address} failed permanently, dropping it");
            self.emit(SubscriberEvent::ProducerRemoved { address });
            self.redistribute().await;
        }
    }

    async fn shutdown(&mut self) {
        info!(
            "closing subscriber for {}.{} ({} connections)",
            self.config.topic,
            self.config.channel,
            self.connections.len()
        );
        let mut closes = tokio::task::JoinSet::new();
        let drained: Vec<_> = self.connections.drain().collect();
        for (address, entry) in drained {
            self.emit(SubscriberEvent::ProducerRemoved { address });
            closes.spawn(async move {
                let _ = entry.connection.close().await;
            });
        }
        while closes.join_next().await.is_some() {}
    }

    fn emit(&self, event: SubscriberEvent) {
        let _ = self.events.send(event);
    }
}
