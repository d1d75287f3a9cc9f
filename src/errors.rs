// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Queue Subsystem
//!
//! `AmqpError` covers everything that can go wrong while talking to the broker:
//! connecting, declaring topology, publishing, consuming and acknowledging.
//! `HandlerError` is what application handlers return; it never leaves the
//! consumer, it only decides whether a message is republished or dropped.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating or using a channel
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// The configured exchange kind is not supported
    #[error("unsupported exchange kind `{0}`")]
    InvalidExchangeKind(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error declaring a consumer
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error receiving a message from a consumer stream
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// No connection has been established yet
    #[error("not connected")]
    NotConnected,

    /// The connection manager was shut down
    #[error("connection closed")]
    ConnectionClosed,
}

/// Failures reported by consumer handlers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The payload did not match the shape the handler expects
    #[error("failure to decode payload: {0}")]
    Decode(String),

    /// The downstream sink rejected the record
    #[error("failure to store: {0}")]
    Storage(String),

    /// Any other processing failure
    #[error("handler failure: {0}")]
    Failed(String),
}
