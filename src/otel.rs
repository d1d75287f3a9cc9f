// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels in the AMQP headers next to `x-attempts`. The
//! publisher injects the caller's context, the consumer extracts it and opens a
//! consumer span per delivery, so a retried message stays in the trace of the
//! request that first produced it.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, ShortString},
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context, KeyValue,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// Adapter that lets OpenTelemetry propagators read and write AMQP headers.
pub(crate) struct RabbitMQTracePropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> RabbitMQTracePropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for RabbitMQTracePropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for RabbitMQTracePropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Writes the trace context of `ctx` into `headers`.
pub(crate) fn inject_context(ctx: &Context, headers: &mut BTreeMap<ShortString, AMQPValue>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut RabbitMQTracePropagator::new(headers))
    });
}

/// Extracts the producer's context from `props` and opens a consumer span
/// for one delivery of `routing_key`.
pub(crate) fn new_span(
    props: &AMQPProperties,
    tracer: &BoxedTracer,
    routing_key: &str,
    attempts: i32,
) -> (Context, BoxedSpan) {
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&RabbitMQTracePropagator::new(
            &mut props.headers().clone().unwrap_or_default().inner().clone(),
        ))
    });

    let span = tracer
        .span_builder(Cow::from(routing_key.to_owned()))
        .with_kind(SpanKind::Consumer)
        .with_attributes(vec![
            KeyValue::new("messaging.destination.name", routing_key.to_owned()),
            KeyValue::new("messaging.rabbitmq.attempts", attempts as i64),
        ])
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
