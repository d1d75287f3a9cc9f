// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! Runs a handler over every delivery of one routing key and keeps the
//! subscription alive across connection drops.
//!
//! [`RabbitMQDispatcher::handle_consumed_deliveries`] binds the queue and
//! spawns a dispatch task over the delivery stream, then waits for the
//! connection to fail. On failure it reconnects, binds the queue again and
//! resumes with a fresh stream, until the connection is closed for good.

use crate::{
    broker::DeliveryStream,
    connection::{ConnectionEvent, RabbitMQConnection},
    consumer::consume,
    errors::AmqpError,
    handler::ConsumerHandler,
    publisher::Publisher,
    queue::consumer_tag,
    topology,
};
use futures_util::StreamExt;
use opentelemetry::global;
use std::sync::Arc;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

enum Outcome {
    Restart,
    Stop,
}

#[derive(Clone)]
pub struct RabbitMQDispatcher {
    conn: Arc<RabbitMQConnection>,
    publisher: Arc<dyn Publisher>,
}

impl RabbitMQDispatcher {
    /// Creates a dispatcher. Failed messages are republished through `publisher`.
    pub fn new(conn: Arc<RabbitMQConnection>, publisher: Arc<dyn Publisher>) -> Self {
        RabbitMQDispatcher { conn, publisher }
    }

    /// Consumes `routing_key` with `handler` until the connection is closed.
    ///
    /// Fails only when the first subscription cannot be set up. Later
    /// subscription failures are retried every reconnect delay.
    ///
    /// # Parameters
    /// * `routing_key` - Key to consume; the queue `{prefix}:{routing_key}` is
    ///   declared and bound first
    /// * `handler` - Runs once per delivery. An error republishes the message
    ///   with the next attempt until the retry ceiling
    ///
    /// # Returns
    /// `Ok(())` once the connection is closed, or the error of the first
    /// subscription
    pub async fn handle_consumed_deliveries(
        &self,
        routing_key: &str,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<(), AmqpError> {
        let mut events = self.conn.subscribe();
        let (mut deliveries, mut generation) = self.start_consuming(routing_key).await?;

        loop {
            let dispatch = tokio::spawn(self.clone().dispatch(
                routing_key.to_owned(),
                deliveries,
                handler.clone(),
            ));

            if let Outcome::Stop = self.wait_for_failure(&mut events, generation, dispatch).await {
                break;
            }

            match self.resubscribe(routing_key, generation).await {
                Some(subscription) => (deliveries, generation) = subscription,
                None => break,
            }
        }

        info!(routing_key, "dispatcher stopped");
        Ok(())
    }

    /// Binds the queue on the current channel and starts a consumer on it.
    async fn start_consuming(&self, routing_key: &str) -> Result<(DeliveryStream, u64), AmqpError> {
        let (channel, generation) = self.conn.channel().await?;

        let queue = topology::bind_queue(
            channel.as_ref(),
            self.conn.exchange(),
            self.conn.queue_prefix(),
            routing_key,
        )
        .await?;

        let tag = consumer_tag(queue.name());
        self.conn.register_consumer(&tag, generation).await;

        let deliveries = channel.basic_consume(queue.name(), &tag).await?;
        info!(routing_key, queue = queue.name(), generation, "consuming");

        Ok((deliveries, generation))
    }

    async fn wait_for_failure(
        &self,
        events: &mut broadcast::Receiver<ConnectionEvent>,
        generation: u64,
        mut dispatch: JoinHandle<()>,
    ) -> Outcome {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(ConnectionEvent::Closed { generation: closed, reason }) if closed == generation => {
                        warn!(generation, %reason, "connection lost, resubscribing");
                        return Outcome::Restart;
                    }
                    Ok(ConnectionEvent::Closed { generation: closed, .. }) => {
                        debug!(closed, generation, "ignoring close of another connection");
                    }
                    Ok(ConnectionEvent::Shutdown) | Err(RecvError::Closed) => return Outcome::Stop,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "connection events were dropped");
                        if self.conn.generation().await != Some(generation) {
                            return Outcome::Restart;
                        }
                    }
                },
                _ = &mut dispatch => {
                    if self.conn.is_closed() {
                        return Outcome::Stop;
                    }
                    warn!(generation, "delivery stream ended, resubscribing");
                    return Outcome::Restart;
                }
            }
        }
    }

    /// Reconnects if needed and subscribes again, retrying until it works.
    /// Returns `None` once the connection has been closed.
    async fn resubscribe(&self, routing_key: &str, failed: u64) -> Option<(DeliveryStream, u64)> {
        let mut observed = failed;

        loop {
            if self.conn.is_closed() {
                return None;
            }

            match self.conn.reconnect_if_stale(observed).await {
                Ok(()) => match self.start_consuming(routing_key).await {
                    Ok(subscription) => return Some(subscription),
                    Err(AmqpError::ConnectionClosed) => return None,
                    Err(err) => error!(error = err.to_string(), routing_key, "error resubscribing"),
                },
                Err(AmqpError::ConnectionClosed) => return None,
                Err(err) => error!(error = err.to_string(), "error reconnecting"),
            }

            observed = self.conn.generation().await.unwrap_or(observed);
            tokio::time::sleep(self.conn.reconnect_delay()).await;
        }
    }

    async fn dispatch(
        self,
        routing_key: String,
        mut deliveries: DeliveryStream,
        handler: Arc<dyn ConsumerHandler>,
    ) {
        let tracer = global::tracer("amqp consumer");
        let max_retries = self.conn.max_retries();

        while let Some(result) = deliveries.next().await {
            match result {
                Ok(delivery) => {
                    if let Err(err) = consume(
                        &tracer,
                        &delivery,
                        &routing_key,
                        handler.as_ref(),
                        self.publisher.as_ref(),
                        max_retries,
                    )
                    .await
                    {
                        error!(error = err.to_string(), "error consume msg");
                    }
                }

                Err(err) => error!(error = err.to_string(), "errors consume msg"),
            }
        }

        debug!(%routing_key, "delivery stream closed");
    }
}
