// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! The connection manager owns exactly one exchange. Its kind comes from
//! configuration as a string and is validated here before any broker call.

use crate::errors::AmqpError;
use std::{fmt, str::FromStr};

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: routes on an exact match of routing keys
/// - Fanout: broadcasts to all bound queues regardless of routing keys
/// - Topic: routes on wildcard pattern matching of routing keys
/// - Headers: routes on message header values instead of routing keys
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    #[default]
    Topic,
    Headers,
}

impl FromStr for ExchangeKind {
    type Err = AmqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            _ => Err(AmqpError::InvalidExchangeKind(s.to_owned())),
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        };
        f.write_str(kind)
    }
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Definition of a RabbitMQ exchange.
///
/// Exchanges are never auto-deleted or internal; only the kind and
/// durability vary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
}

impl ExchangeDefinition {
    /// Creates a new topic exchange definition with the given name.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Topic,
            durable: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_kind(&self) -> &ExchangeKind {
        &self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }
}
