// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Tracing subscriber setup for the worker process.

use crate::configs::AppConfigs;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "skeleton_queue=info,worker=info";

/// Installs the global subscriber: human readable output in development and
/// JSON lines in production.
pub fn init_tracing(cfg: &AppConfigs) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);

    if cfg.is_production() {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
