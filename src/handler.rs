// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! A [`ConsumerHandler`] is the application code run for every delivery of a
//! routing key. Returning an error makes the dispatcher republish the message
//! with a higher attempt count until the retry ceiling is reached.

use crate::errors::HandlerError;
use async_trait::async_trait;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use serde_json::Value;

#[cfg(test)]
use mockall::automock;

/// Decoded JSON body of a delivery. Numbers keep their original precision.
pub type Payload = serde_json::Map<String, Value>;

/// A delivery as seen by a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerMessage {
    pub routing_key: String,
    /// Starts at 1 and grows by one on every republish.
    pub attempts: i32,
    pub payload: Payload,
}

impl ConsumerMessage {
    pub fn new(routing_key: &str, attempts: i32, payload: Payload) -> Self {
        ConsumerMessage {
            routing_key: routing_key.to_owned(),
            attempts,
            payload,
        }
    }

    /// Decodes the payload into the schema of this routing key.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(Value::Object(self.payload.clone()))
            .map_err(|err| HandlerError::Decode(err.to_string()))
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError>;
}
