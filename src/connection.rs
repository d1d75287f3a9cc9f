// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Manager
//!
//! Owns the broker connection and channel shared by the publisher and every
//! dispatcher of a process.
//!
//! - Each successful connect is numbered with a generation. Callers remember
//!   the generation they used, so a failure seen by many tasks at once leads to
//!   a single reconnect (see [`RabbitMQConnection::reconnect_if_stale`]).
//! - Connects are serialized; readers take the current channel under a read lock.
//! - Connection drops are broadcast as [`ConnectionEvent`]s to every subscriber.

use crate::{
    broker::{Broker, BrokerChannel},
    configs::RabbitMQConfigs,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::QueueDefinition,
    topology, watchdog,
};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Buffered connection events per subscriber.
pub const EVENTS_CAPACITY: usize = 16;

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection with the given generation dropped.
    Closed { generation: u64, reason: String },
    /// `close` was called; no reconnect will follow.
    Shutdown,
}

struct ConnState {
    channel: Arc<dyn BrokerChannel>,
    generation: u64,
}

pub struct RabbitMQConnection {
    broker: Arc<dyn Broker>,
    exchange: ExchangeDefinition,
    queue_prefix: String,
    max_retries: i32,
    reconnect_delay: Duration,
    state: RwLock<Option<ConnState>>,
    reconnecting: Mutex<()>,
    generations: AtomicU64,
    closed: AtomicBool,
    consumer_tags: Mutex<HashSet<String>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl RabbitMQConnection {
    /// Creates a connection manager. Nothing is opened until [`connect`](Self::connect).
    ///
    /// # Parameters
    /// * `broker` - Opens the underlying connections
    /// * `cfg` - Exchange, queue prefix, retry ceiling and reconnect delay
    ///
    /// # Returns
    /// An Arc-wrapped manager shared by the publisher and the dispatchers, or
    /// `InvalidExchangeKind` when `cfg.queue_type` is not an exchange kind
    pub fn new(broker: Arc<dyn Broker>, cfg: &RabbitMQConfigs) -> Result<Arc<Self>, AmqpError> {
        let kind: ExchangeKind = cfg.queue_type.parse()?;
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);

        Ok(Arc::new(RabbitMQConnection {
            broker,
            exchange: ExchangeDefinition::new(&cfg.exchange).kind(kind).durable(),
            queue_prefix: cfg.queue_prefix.clone(),
            max_retries: cfg.retry_count,
            reconnect_delay: Duration::from_millis(cfg.reconnect_delay_ms),
            state: RwLock::new(None),
            reconnecting: Mutex::new(()),
            generations: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            consumer_tags: Mutex::new(HashSet::new()),
            events,
        }))
    }

    pub fn exchange(&self) -> &str {
        &self.exchange.name
    }

    pub fn queue_prefix(&self) -> &str {
        &self.queue_prefix
    }

    /// Ceiling for the `x-attempts` counter.
    pub fn max_retries(&self) -> i32 {
        self.max_retries
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Subscribes to connection events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Generation of the current connection, if any.
    pub async fn generation(&self) -> Option<u64> {
        self.state.read().await.as_ref().map(|s| s.generation)
    }

    /// Opens the connection and channel and declares the exchange.
    ///
    /// # Returns
    /// `ConnectionError` when the broker is unreachable, `DeclareExchangeError`
    /// when an exchange with the same name but another kind already exists
    pub async fn connect(&self) -> Result<(), AmqpError> {
        let _guard = self.reconnecting.lock().await;
        self.establish().await
    }

    /// Replaces the current connection with a new one unconditionally.
    ///
    /// The replaced connection has its consumers cancelled and is closed once
    /// the new one is up. On failure the current connection is kept.
    pub async fn reconnect(&self) -> Result<(), AmqpError> {
        let _guard = self.reconnecting.lock().await;
        info!("reconnecting to the broker");
        self.establish().await
    }

    /// Reconnects only if the current connection is still the one numbered
    /// `observed`. When another task already replaced it, this is a no-op.
    ///
    /// # Parameters
    /// * `observed` - Generation of the connection the caller saw fail
    ///
    /// # Example
    /// ```ignore
    /// let (channel, generation) = conn.channel().await?;
    /// if channel.basic_publish(exchange, key, payload, props).await.is_err() {
    ///     conn.reconnect_if_stale(generation).await?;
    /// }
    /// ```
    pub async fn reconnect_if_stale(&self, observed: u64) -> Result<(), AmqpError> {
        let _guard = self.reconnecting.lock().await;

        if let Some(current) = self.generation().await {
            if current != observed {
                debug!(observed, current, "connection already replaced");
                return Ok(());
            }
        }

        info!(observed, "reconnecting to the broker");
        self.establish().await
    }

    /// Current channel and its generation.
    pub(crate) async fn channel(&self) -> Result<(Arc<dyn BrokerChannel>, u64), AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::ConnectionClosed);
        }

        self.state
            .read()
            .await
            .as_ref()
            .map(|s| (s.channel.clone(), s.generation))
            .ok_or(AmqpError::NotConnected)
    }

    /// Declares and binds the queue for `routing_key` on the current channel.
    ///
    /// # Parameters
    /// * `routing_key` - Key the queue is bound with; the queue is named
    ///   `{prefix}:{routing_key}`
    ///
    /// # Returns
    /// The definition of the durable queue, the same one on every call
    pub async fn bind_queue(&self, routing_key: &str) -> Result<QueueDefinition, AmqpError> {
        let (channel, _) = self.channel().await?;
        topology::bind_queue(
            channel.as_ref(),
            &self.exchange.name,
            &self.queue_prefix,
            routing_key,
        )
        .await
    }

    /// Records a consumer started on the connection numbered `generation`.
    /// Ignored when that connection was already replaced.
    pub(crate) async fn register_consumer(&self, consumer_tag: &str, generation: u64) {
        let mut tags = self.consumer_tags.lock().await;
        if self.generation().await == Some(generation) {
            tags.insert(consumer_tag.to_owned());
        }
    }

    /// Cancels every registered consumer and closes the connection.
    ///
    /// Stops at the first failure. Afterwards the manager refuses to
    /// reconnect and every dispatcher returns.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let _guard = self.reconnecting.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.events.send(ConnectionEvent::Shutdown);

        let Some(state) = self.state.write().await.take() else {
            return Ok(());
        };

        let tags: Vec<String> = self.consumer_tags.lock().await.iter().cloned().collect();
        for tag in tags {
            debug!(consumer_tag = %tag, "cancelling consumer");
            state.channel.basic_cancel(&tag).await?;
        }

        state.channel.close().await?;
        info!("amqp connection closed");
        Ok(())
    }

    async fn establish(&self) -> Result<(), AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::ConnectionClosed);
        }

        let channel = self.broker.connect().await?;
        if let Err(err) = topology::install_exchange(channel.as_ref(), &self.exchange).await {
            let _ = channel.close().await;
            return Err(err);
        }

        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        match channel.notify_close() {
            Some(closed) => {
                watchdog::spawn(closed, self.events.clone(), generation);
            }
            None => warn!(generation, "connection has no close notification"),
        }

        let mut registered = self.consumer_tags.lock().await;
        let previous = self.state.write().await.replace(ConnState {
            channel,
            generation,
        });
        let tags: Vec<String> = registered.drain().collect();
        drop(registered);

        if let Some(previous) = previous {
            release(previous, tags).await;
        }

        info!(exchange = %self.exchange.name, generation, "amqp connected");
        Ok(())
    }
}

/// Cancels the consumers of a replaced connection and closes it. Failures are
/// only logged, the connection is usually already gone.
async fn release(previous: ConnState, tags: Vec<String>) {
    for tag in tags {
        if let Err(err) = previous.channel.basic_cancel(&tag).await {
            warn!(error = err.to_string(), generation = previous.generation, consumer_tag = %tag, "error cancelling replaced consumer");
        }
    }

    match previous.channel.close().await {
        Ok(()) => debug!(generation = previous.generation, "replaced connection closed"),
        Err(err) => warn!(
            error = err.to_string(),
            generation = previous.generation,
            "error closing replaced connection"
        ),
    }
}
