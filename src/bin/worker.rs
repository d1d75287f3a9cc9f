// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Background worker consuming one topic of the skeleton exchange.
//!
//! ```text
//! worker process.sync_log
//! ```

use clap::Parser;
use skeleton_queue::{
    channel::AmqpBroker,
    configs::Configs,
    connection::RabbitMQConnection,
    consumers::{ExampleConsumer, LogConsumer},
    dispatcher::RabbitMQDispatcher,
    handler::ConsumerHandler,
    publisher::RabbitMQPublisher,
    repository::JsonFileLogRepository,
    telemetry,
    topics::Topic,
};
use std::{error::Error, sync::Arc};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "worker", version, about = "Consumes one topic of the skeleton exchange", long_about = None)]
struct Cli {
    /// Topic to listen to: process.sync_log or process.example
    topic: Topic,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let cfg = Configs::load()?;
    telemetry::init_tracing(&cfg.app);
    info!(env = %cfg.app.env, topic = %cli.topic, "starting worker");

    let conn = RabbitMQConnection::new(Arc::new(AmqpBroker::new(&cfg)), &cfg.rabbitmq)?;
    conn.connect().await?;

    let publisher = RabbitMQPublisher::new(conn.clone());
    let dispatcher = RabbitMQDispatcher::new(conn.clone(), publisher);

    let handler: Arc<dyn ConsumerHandler> = match cli.topic {
        Topic::SyncLog => Arc::new(LogConsumer::new(Arc::new(JsonFileLogRepository::new(
            &cfg.app.log_dir,
        )))),
        Topic::Example => Arc::new(ExampleConsumer),
    };

    let routing_key = cli.topic.routing_key();
    info!(routing_key, "listening");
    let mut consuming = tokio::spawn(async move {
        dispatcher
            .handle_consumed_deliveries(routing_key, handler)
            .await
    });

    tokio::select! {
        signal = shutdown_signal() => signal?,
        stopped = &mut consuming => {
            stopped??;
            return Ok(());
        }
    }

    info!("shutting down the worker");
    match conn.close().await {
        Ok(()) => info!("worker successfully shutdown"),
        Err(err) => error!(error = err.to_string(), "fail shutting down worker"),
    }

    consuming.await??;
    Ok(())
}

/// Waits for SIGINT or SIGTERM.
#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => info!(signal = "SIGINT", "signal received"),
        _ = sigterm.recv() => info!(signal = "SIGTERM", "signal received"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!(signal = "ctrl-c", "signal received");
    Ok(())
}
