// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Handlers run by the worker for each topic.

use crate::{
    entities::{LogEntry, LogRecord},
    errors::HandlerError,
    handler::{ConsumerHandler, ConsumerMessage},
    repository::LogRepository,
};
use async_trait::async_trait;
use chrono::Utc;
use opentelemetry::Context;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Stores every entry of the sync-log topic.
pub struct LogConsumer {
    repository: Arc<dyn LogRepository>,
}

impl LogConsumer {
    pub fn new(repository: Arc<dyn LogRepository>) -> Self {
        LogConsumer { repository }
    }
}

#[async_trait]
impl ConsumerHandler for LogConsumer {
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
        let entry: LogEntry = msg.decode()?;
        let record = LogRecord::from_entry(entry, Utc::now());

        if let Err(err) = self.repository.create(record).await {
            error!(error = err.to_string(), attempts = msg.attempts, "failed to store log record");
            return Err(err);
        }

        info!(attempts = msg.attempts, "log record synced");
        Ok(())
    }
}

/// Dumps the entries of the example topic.
#[derive(Default)]
pub struct ExampleConsumer;

#[async_trait]
impl ConsumerHandler for ExampleConsumer {
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
        match msg.decode::<LogEntry>() {
            Ok(entry) => debug!(?entry, "example message"),
            Err(err) => warn!(error = err.to_string(), "example message is not a log entry"),
        }
        Ok(())
    }
}
