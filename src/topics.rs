// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Routing keys consumed by the worker.

use std::{fmt, str::FromStr};

pub const PROCESS_SYNC_LOG: &str = "process.sync_log";
pub const PROCESS_EXAMPLE: &str = "process.example";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    SyncLog,
    Example,
}

impl Topic {
    pub fn routing_key(&self) -> &'static str {
        match self {
            Topic::SyncLog => PROCESS_SYNC_LOG,
            Topic::Example => PROCESS_EXAMPLE,
        }
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            PROCESS_SYNC_LOG => Ok(Topic::SyncLog),
            PROCESS_EXAMPLE => Ok(Topic::Example),
            other => Err(format!(
                "topic not found: {} (expected {} or {})",
                other, PROCESS_SYNC_LOG, PROCESS_EXAMPLE
            )),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.routing_key())
    }
}
