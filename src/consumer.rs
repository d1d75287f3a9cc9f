// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Processing of a single delivery: decode, run the handler, ack, then
//! republish on failure while the attempt counter is below the ceiling.
//!
//! The ack happens right after the handler returns, whatever the outcome.
//! Redelivery is only ever an explicit republish, which makes delivery
//! at-most-once: a crash between the ack and the republish loses the message.

use crate::{
    broker::Delivery,
    errors::AmqpError,
    handler::{ConsumerHandler, ConsumerMessage, Payload},
    otel,
    publisher::Publisher,
};
use lapin::{protocol::basic::AMQPProperties, types::AMQPValue};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::borrow::Cow;
use tracing::{debug, error, warn};

/// Header carrying the attempt counter of a message.
pub const AMQP_HEADERS_ATTEMPTS: &str = "x-attempts";

pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &Delivery,
    routing_key: &str,
    handler: &dyn ConsumerHandler,
    publisher: &dyn Publisher,
    max_retries: i32,
) -> Result<(), AmqpError> {
    let attempts = extract_attempts(&delivery.properties);
    let (ctx, mut span) = otel::new_span(&delivery.properties, tracer, routing_key, attempts);

    debug!(routing_key, attempts, "received message");

    let msg = ConsumerMessage::new(routing_key, attempts, decode_payload(&delivery.data));
    let result = handler.exec(&ctx, &msg).await;

    let acked = delivery.ack().await;
    if let Err(e) = &acked {
        error!(error = e.to_string(), routing_key, "error whiling ack msg");
        span.record_error(e);
        span.set_status(Status::Error {
            description: Cow::from("error to ack msg"),
        });
    }

    let Err(err) = result else {
        debug!(routing_key, "message successfully processed");
        if acked.is_ok() {
            span.set_status(Status::Ok);
        }
        return acked;
    };

    span.record_error(&err);
    span.set_status(Status::Error {
        description: Cow::from(err.to_string()),
    });

    if attempts >= max_retries {
        error!(
            error = err.to_string(),
            routing_key, attempts, max_retries, "too many attempts, message dropped"
        );
        return acked;
    }

    warn!(
        error = err.to_string(),
        routing_key, attempts, "error whiling handling msg, republishing"
    );
    if let Err(e) = publisher
        .publish(&ctx, routing_key, &delivery.data, attempts + 1)
        .await
    {
        error!(error = e.to_string(), routing_key, "error whiling republishing");
        span.record_error(&e);
        return Err(e);
    }

    acked
}

/// Reads `x-attempts` from the message headers. Any AMQP integer type is
/// accepted; a missing or unreadable header counts as the first attempt.
pub(crate) fn extract_attempts(props: &AMQPProperties) -> i32 {
    props
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get(AMQP_HEADERS_ATTEMPTS))
        .and_then(attempts_value)
        .unwrap_or(1)
}

fn attempts_value(value: &AMQPValue) -> Option<i32> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(i32::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i32::from(*v)),
        AMQPValue::ShortInt(v) => Some(i32::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i32::from(*v)),
        AMQPValue::LongInt(v) => Some(*v),
        AMQPValue::LongUInt(v) => i32::try_from(*v).ok(),
        AMQPValue::LongLongInt(v) => i32::try_from(*v).ok(),
        _ => None,
    }
}

fn decode_payload(data: &[u8]) -> Payload {
    serde_json::from_slice(data).unwrap_or_else(|err| {
        warn!(error = err.to_string(), "malformed payload, handling it as empty");
        Payload::new()
    })
}
