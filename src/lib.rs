// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Queue subsystem of the skeleton services: a RabbitMQ connection manager
//! with generation-checked reconnects, a publisher with a bounded attempt
//! counter, a self-healing consumer dispatcher, and the log pipeline built on
//! top of them.

mod consumer;
mod otel;
mod watchdog;

#[cfg(test)]
mod testing;

pub mod broker;
pub mod channel;
pub mod configs;
pub mod connection;
pub mod consumers;
pub mod dispatcher;
pub mod entities;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod publisher;
pub mod queue;
pub mod repository;
pub mod telemetry;
pub mod topics;
pub mod topology;
pub mod usecase;
