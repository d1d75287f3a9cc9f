// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Publishes JSON payloads to the configured exchange. The attempt counter
//! rides in the `x-attempts` header and the caller's OpenTelemetry context is
//! propagated in the remaining headers.
//!
//! A failed publish reconnects and tries again with the counter increased by
//! one. Once the counter passes the configured ceiling the message is given up
//! and the call still succeeds.

use crate::{
    connection::{ConnectionEvent, RabbitMQConnection},
    consumer::AMQP_HEADERS_ATTEMPTS,
    errors::AmqpError,
    otel,
};
use async_trait::async_trait;
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::{broadcast, broadcast::error::TryRecvError, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `payload` under `routing_key` as attempt number `attempts`.
    async fn publish(
        &self,
        ctx: &Context,
        routing_key: &str,
        payload: &[u8],
        attempts: i32,
    ) -> Result<(), AmqpError>;
}

pub struct RabbitMQPublisher {
    conn: Arc<RabbitMQConnection>,
    signals: Mutex<broadcast::Receiver<ConnectionEvent>>,
}

impl RabbitMQPublisher {
    pub fn new(conn: Arc<RabbitMQConnection>) -> Arc<RabbitMQPublisher> {
        let signals = Mutex::new(conn.subscribe());
        Arc::new(RabbitMQPublisher { conn, signals })
    }

    /// Handles the close events received since the last publish.
    async fn drain_signals(&self) {
        let mut signals = self.signals.lock().await;
        loop {
            match signals.try_recv() {
                Ok(ConnectionEvent::Closed { generation, reason }) => {
                    info!(generation, %reason, "connection closed, reconnecting before publish");
                    if let Err(err) = self.conn.reconnect_if_stale(generation).await {
                        error!(error = err.to_string(), "error reconnecting");
                    }
                }
                Ok(ConnectionEvent::Shutdown) => {}
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "connection events were dropped");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return,
            }
        }
    }
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    async fn publish(
        &self,
        ctx: &Context,
        routing_key: &str,
        payload: &[u8],
        attempts: i32,
    ) -> Result<(), AmqpError> {
        let max_retries = self.conn.max_retries();
        let mut attempts = attempts;

        loop {
            if attempts > max_retries {
                warn!(routing_key, attempts, max_retries, "too many attempts, message discarded");
                return Ok(());
            }

            self.drain_signals().await;

            let (channel, generation) = match self.conn.channel().await {
                Ok(current) => current,
                Err(AmqpError::NotConnected) => {
                    warn!(routing_key, attempts, "not connected, connecting before publish");
                    match self.conn.reconnect().await {
                        Err(AmqpError::ConnectionClosed) => return Err(AmqpError::ConnectionClosed),
                        Err(err) => error!(error = err.to_string(), "error reconnecting"),
                        Ok(()) => {}
                    }
                    attempts += 1;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let properties = message_properties(ctx, attempts);
            match channel
                .basic_publish(self.conn.exchange(), routing_key, payload, properties)
                .await
            {
                Ok(()) => {
                    debug!(routing_key, attempts, "message published");
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        routing_key, attempts, "error publishing message, reconnecting"
                    );
                    match self.conn.reconnect_if_stale(generation).await {
                        Err(AmqpError::ConnectionClosed) => return Err(AmqpError::ConnectionClosed),
                        Err(err) => error!(error = err.to_string(), "error reconnecting"),
                        Ok(()) => {}
                    }
                    attempts += 1;
                }
            }
        }
    }
}

fn message_properties(ctx: &Context, attempts: i32) -> BasicProperties {
    let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
    otel::inject_context(ctx, &mut headers);
    headers.insert(
        ShortString::from(AMQP_HEADERS_ATTEMPTS),
        AMQPValue::LongInt(attempts),
    );

    BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_headers(FieldTable::from(headers))
}
