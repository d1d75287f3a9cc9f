// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Log Usecase
//!
//! Application-side entry point of the log pipeline. Entries are published to
//! the sync-log topic; when the broker cannot take them they are appended to
//! the daily general log file instead.

use crate::{
    entities::{CaptureFields, LogEntry, LogType, RECORD_UTC_OFFSET_HOURS},
    publisher::Publisher,
    repository::append_to_file,
    topics::PROCESS_SYNC_LOG,
};
use chrono::{DateTime, Duration, Utc};
use opentelemetry::Context;
use std::{path::PathBuf, sync::Arc};
use tracing::{error, warn};

const GENERAL_LOG_PREFIX: &str = "general";

pub struct LogUsecase {
    publisher: Arc<dyn Publisher>,
    log_dir: PathBuf,
}

impl LogUsecase {
    pub fn new(publisher: Arc<dyn Publisher>, log_dir: impl Into<PathBuf>) -> Self {
        LogUsecase {
            publisher,
            log_dir: log_dir.into(),
        }
    }

    /// Publishes a log entry as the first attempt on the sync-log topic.
    ///
    /// * `status` - severity of the entry
    /// * `message` - what went wrong, or what happened
    /// * `func_name` - function reporting the entry (e.g. `WalletUsecase.Create`)
    /// * `error_message` - error returned by that function, empty if none
    /// * `capture_fields` - extra data to track the entry down (ids, timings)
    /// * `process` - name of the process the entry belongs to
    pub async fn log(
        &self,
        status: LogType,
        message: &str,
        func_name: &str,
        error_message: &str,
        capture_fields: CaptureFields,
        process: &str,
    ) {
        let entry = LogEntry {
            func_name: func_name.to_owned(),
            message: message.to_owned(),
            error_message: error_message.to_owned(),
            process: process.to_owned(),
            status,
            capture_fields,
        };

        let payload = match serde_json::to_vec(&entry) {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = err.to_string(), "error serializing log entry");
                return;
            }
        };

        if let Err(err) = self
            .publisher
            .publish(&Context::current(), PROCESS_SYNC_LOG, &payload, 1)
            .await
        {
            warn!(error = err.to_string(), "error publishing log entry, writing it to file");
            self.write_to_file(status, &payload, Utc::now()).await;
        }
    }

    async fn write_to_file(&self, status: LogType, payload: &[u8], now: DateTime<Utc>) {
        let line = format!(
            "[{}] {}: {} \r\n",
            now.format("%Y-%m-%dT%H:%M:%S"),
            status,
            String::from_utf8_lossy(payload)
        );
        let path = self.fallback_path(now);

        if let Err(err) = append_to_file(&path, line.as_bytes()).await {
            error!(error = err.to_string(), path = %path.display(), "error writing log entry to file");
        }
    }

    /// Daily file named after the date in UTC+7.
    fn fallback_path(&self, now: DateTime<Utc>) -> PathBuf {
        let day = (now + Duration::hours(RECORD_UTC_OFFSET_HOURS)).format("%Y-%m-%d");
        self.log_dir
            .join(format!("{}_{}.log", GENERAL_LOG_PREFIX, day))
    }
}
