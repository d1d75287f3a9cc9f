// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstraction
//!
//! The connection manager, publisher and dispatcher never touch the AMQP
//! client directly. They talk to a [`Broker`], which opens a connection plus a
//! channel and hands back a [`BrokerChannel`]. The lapin implementation lives
//! in [`crate::channel`].

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::BasicProperties;
use std::{fmt, sync::Arc};
use tokio::sync::oneshot;

/// Stream of deliveries produced by a consumer. It ends when the consumer is
/// cancelled or the underlying connection goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Opens connections to a message broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Establishes a connection and creates one channel on it.
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;
}

/// A live channel, together with the connection it belongs to.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn queue_bind(&self, binding: &QueueBinding<'_>) -> Result<(), AmqpError>;

    async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// Starts a manual-ack consumer on `queue`.
    async fn basic_consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Closes the channel and its connection.
    async fn close(&self) -> Result<(), AmqpError>;

    /// Hands out the receiver that resolves with a reason once the connection
    /// drops. Only the first call gets it.
    fn notify_close(&self) -> Option<oneshot::Receiver<String>>;
}

/// Acknowledges one delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;
}

/// A message received from a queue.
pub struct Delivery {
    pub routing_key: String,
    pub data: Vec<u8>,
    pub properties: BasicProperties,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        routing_key: String,
        data: Vec<u8>,
        properties: BasicProperties,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Delivery {
            routing_key,
            data,
            properties,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acker.ack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("data", &String::from_utf8_lossy(&self.data))
            .field("properties", &self.properties)
            .finish()
    }
}
