// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Log Entities
//!
//! [`LogEntry`] is the message published on the sync-log topic. [`LogRecord`]
//! is what the log consumer stores for it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt};

/// Fields attached to a log entry to help tracking it down.
pub type CaptureFields = HashMap<String, String>;

/// Capture field holding the execution time of the logged operation.
pub const EXECUTION_TIME_FIELD: &str = "execution_time";

/// Offset of the timezone log records are stored in (UTC+7).
pub const RECORD_UTC_OFFSET_HOURS: i64 = 7;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogType {
    Success,
    Error,
    #[default]
    Info,
    Warning,
    Debug,
}

impl LogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::Success => "SUCCESS",
            LogType::Error => "ERROR",
            LogType::Info => "INFO",
            LogType::Warning => "WARNING",
            LogType::Debug => "DEBUG",
        }
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogEntry {
    pub func_name: String,
    pub message: String,
    pub error_message: String,
    pub process: String,
    pub status: LogType,
    pub capture_fields: CaptureFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub status: String,
    pub message: String,
    pub func_name: String,
    pub error_message: String,
    pub process_name: String,
    pub log_fields: CaptureFields,
    pub created: DateTime<Utc>,
    pub exec_time: i64,
}

impl LogRecord {
    /// Builds the stored form of `entry`. `now` is shifted to UTC+7 and the
    /// execution time is read from the capture fields, 0 when missing or invalid.
    pub fn from_entry(entry: LogEntry, now: DateTime<Utc>) -> Self {
        let exec_time = entry
            .capture_fields
            .get(EXECUTION_TIME_FIELD)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or_default();

        LogRecord {
            status: entry.status.to_string(),
            message: entry.message,
            func_name: entry.func_name,
            error_message: entry.error_message,
            process_name: entry.process,
            log_fields: entry.capture_fields,
            created: now + Duration::hours(RECORD_UTC_OFFSET_HOURS),
            exec_time,
        }
    }
}
