// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Log Repository
//!
//! Sink for the records built by the log consumer. The shipped implementation
//! appends one JSON document per line to `{log_dir}/sync_log.jsonl`.

use crate::{entities::LogRecord, errors::HandlerError};
use async_trait::async_trait;
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, error};

#[cfg(test)]
use mockall::automock;

pub const SYNC_LOG_FILE: &str = "sync_log.jsonl";

#[cfg_attr(test, automock)]
#[async_trait]
pub trait LogRepository: Send + Sync {
    async fn create(&self, record: LogRecord) -> Result<(), HandlerError>;
}

pub struct JsonFileLogRepository {
    path: PathBuf,
}

impl JsonFileLogRepository {
    pub fn new(log_dir: impl AsRef<Path>) -> Self {
        JsonFileLogRepository {
            path: log_dir.as_ref().join(SYNC_LOG_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LogRepository for JsonFileLogRepository {
    async fn create(&self, record: LogRecord) -> Result<(), HandlerError> {
        let mut line = serde_json::to_string(&record).map_err(|err| {
            error!(error = err.to_string(), "error serializing log record");
            HandlerError::Storage(err.to_string())
        })?;
        line.push('\n');

        append_to_file(&self.path, line.as_bytes())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), path = %self.path.display(), "error writing log record");
                HandlerError::Storage(err.to_string())
            })?;

        debug!(path = %self.path.display(), "log record stored");
        Ok(())
    }
}

/// Appends `data` to the file at `path`, creating it and its directory first
/// when needed.
pub(crate) async fn append_to_file(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).await?;
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(data).await?;
    file.flush().await
}
