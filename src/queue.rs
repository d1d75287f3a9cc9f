// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Every consumer gets its own queue named `{prefix}:{routing_key}`, bound to
//! the shared exchange under that routing key. The prefix keeps logical
//! consumers of different services apart on one exchange.

/// Builds the queue name used for `routing_key`.
pub fn queue_name(prefix: &str, routing_key: &str) -> String {
    format!("{}:{}", prefix, routing_key)
}

/// Builds the consumer tag used for a queue.
pub fn consumer_tag(queue: &str) -> String {
    format!("ctag:{}", queue)
}

/// Definition of a RabbitMQ queue with its declaration flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is non-durable. Queues are never exclusive nor
    /// auto-deleted, several workers may share one.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
        }
    }

    /// The durable, shared queue a consumer of `routing_key` reads from.
    pub fn for_routing_key(prefix: &str, routing_key: &str) -> QueueDefinition {
        QueueDefinition::new(&queue_name(prefix, routing_key)).durable()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding<'qeb> {
    pub(crate) queue_name: &'qeb str,
    pub(crate) exchange_name: &'qeb str,
    pub(crate) routing_key: &'qeb str,
}

impl<'qeb> QueueBinding<'qeb> {
    /// Creates a new queue binding for the given queue.
    ///
    /// The exchange name and routing key start empty and are set with
    /// `exchange` and `routing_key`.
    pub fn new(queue: &'qeb str) -> QueueBinding<'qeb> {
        QueueBinding {
            queue_name: queue,
            exchange_name: "",
            routing_key: "",
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &'qeb str) -> Self {
        self.exchange_name = exchange;
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &'qeb str) -> Self {
        self.routing_key = key;
        self
    }
}
