// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! Declares the single exchange a connection publishes to and the per-routing-key
//! queues consumers read from. Every declaration is idempotent on the broker, so
//! these run again after every reconnect.

use crate::{
    broker::BrokerChannel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use tracing::debug;

/// One unacknowledged message in flight per consumer.
pub const PREFETCH_COUNT: u16 = 1;

/// Declares the exchange described by `def`.
pub async fn install_exchange(
    channel: &dyn BrokerChannel,
    def: &ExchangeDefinition,
) -> Result<(), AmqpError> {
    debug!("creating exchange: {}", def.name);
    channel.exchange_declare(def).await?;
    debug!("exchange: {} was created", def.name);
    Ok(())
}

/// Declares the durable queue for `routing_key`, binds it to `exchange` under
/// that key and limits the channel to [`PREFETCH_COUNT`] unacked deliveries.
///
/// Returns the definition of the bound queue; calling it again for the same
/// key yields the same queue.
pub async fn bind_queue(
    channel: &dyn BrokerChannel,
    exchange: &str,
    prefix: &str,
    routing_key: &str,
) -> Result<QueueDefinition, AmqpError> {
    let def = QueueDefinition::for_routing_key(prefix, routing_key);

    debug!("creating queue: {}", def.name);
    channel.queue_declare(&def).await?;

    debug!(
        "binding queue: {} to the exchange: {} with the key: {}",
        def.name, exchange, routing_key
    );
    let binding = QueueBinding::new(&def.name)
        .exchange(exchange)
        .routing_key(routing_key);
    channel.queue_bind(&binding).await?;

    channel.basic_qos(PREFETCH_COUNT, false).await?;

    debug!("queue: {} was bounded", def.name);
    Ok(def)
}
