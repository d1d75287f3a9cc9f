// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Failure Watchdog
//!
//! One task per connection. It waits for the connection's close notification
//! and broadcasts a single [`ConnectionEvent::Closed`] tagged with the
//! connection's generation. A new watchdog is installed by every connect.

use crate::connection::ConnectionEvent;
use tokio::{
    sync::{broadcast, oneshot},
    task::JoinHandle,
};
use tracing::{debug, warn};

pub(crate) fn spawn(
    closed: oneshot::Receiver<String>,
    events: broadcast::Sender<ConnectionEvent>,
    generation: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match closed.await {
            Ok(reason) => {
                warn!(generation, %reason, "amqp connection closed");
                let _ = events.send(ConnectionEvent::Closed { generation, reason });
            }
            // The connection was dropped without failing, i.e. closed on purpose.
            Err(_) => debug!(generation, "amqp connection released"),
        }
    })
}
