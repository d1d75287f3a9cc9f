// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker for unit tests.
//!
//! Queues and bindings outlive connections, unacked deliveries go back to the
//! head of their queue when their connection dies, and `kill` fires the close
//! notification of every open connection the way a dropped TCP link would.

use crate::{
    broker::{Acknowledger, Broker, BrokerChannel, Delivery, DeliveryStream},
    configs::RabbitMQConfigs,
    connection::RabbitMQConnection,
    consumer::extract_attempts,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::BasicProperties;
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};

pub fn rabbitmq_configs(retry_count: i32) -> RabbitMQConfigs {
    RabbitMQConfigs {
        uri: "amqp://memory".to_owned(),
        exchange: "events".to_owned(),
        queue_type: "topic".to_owned(),
        queue_prefix: "api".to_owned(),
        retry_count,
        reconnect_delay_ms: 10,
    }
}

pub async fn connected(broker: &MemoryBroker, retry_count: i32) -> Arc<RabbitMQConnection> {
    let conn =
        RabbitMQConnection::new(Arc::new(broker.clone()), &rabbitmq_configs(retry_count)).unwrap();
    conn.connect().await.unwrap();
    conn
}

/// Polls `check` until it holds, failing the test after five seconds.
pub async fn wait_until<F: Fn() -> bool>(check: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub data: Vec<u8>,
    pub properties: BasicProperties,
}

impl PublishedMessage {
    pub fn attempts(&self) -> i32 {
        extract_attempts(&self.properties)
    }
}

#[derive(Clone)]
struct StoredMessage {
    routing_key: String,
    data: Vec<u8>,
    properties: BasicProperties,
}

struct ConsumerSlot {
    tag: String,
    channel_id: u64,
    tx: mpsc::UnboundedSender<Result<Delivery, AmqpError>>,
}

#[derive(Default)]
struct MemoryQueue {
    durable: bool,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next: usize,
}

struct Unacked {
    queue: String,
    channel_id: u64,
    message: StoredMessage,
}

#[derive(Default)]
struct BrokerState {
    // name -> (kind, durable)
    exchanges: HashMap<String, (ExchangeKind, bool)>,
    queues: HashMap<String, MemoryQueue>,
    // (exchange, routing key, queue)
    bindings: Vec<(String, String, String)>,
    channels: HashMap<u64, Option<oneshot::Sender<String>>>,
    next_channel: u64,
    next_delivery: u64,
    unacked: HashMap<u64, Unacked>,
    acks: HashMap<u64, usize>,
    published: Vec<PublishedMessage>,
    qos: Vec<(u16, bool)>,
    cancelled: Vec<String>,
    connects: usize,
    failing_publishes: usize,
    refuse_connections: bool,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    /// Makes the next `n` publishes fail.
    pub fn fail_next_publishes(&self, n: usize) {
        self.lock().failing_publishes = n;
    }

    pub fn fail_all_publishes(&self) {
        self.lock().failing_publishes = usize::MAX;
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    /// Drops every open connection and fires their close notifications.
    pub fn kill(&self, reason: &str) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in ids {
            if let Some(Some(tx)) = state.channels.remove(&id) {
                let _ = tx.send(reason.to_owned());
            }
            detach_channel(&mut state, id);
        }
        self.flush(&mut state);
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn bindings_of(&self, queue: &str) -> Vec<String> {
        self.lock()
            .bindings
            .iter()
            .filter(|(_, _, q)| q == queue)
            .map(|(_, key, _)| key.clone())
            .collect()
    }

    pub fn qos_calls(&self) -> Vec<(u16, bool)> {
        self.lock().qos.clone()
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or_default()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or_default()
    }

    /// Number of ack calls per delivery, in delivery order.
    pub fn ack_counts(&self) -> Vec<usize> {
        let state = self.lock();
        let mut counts: Vec<(u64, usize)> = state.acks.iter().map(|(k, v)| (*k, *v)).collect();
        counts.sort();
        counts.into_iter().map(|(_, count)| count).collect()
    }

    pub fn delivered(&self) -> u64 {
        self.lock().next_delivery
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.lock().cancelled.clone()
    }

    fn flush(&self, state: &mut BrokerState) {
        let names: Vec<String> = state.queues.keys().cloned().collect();
        for name in names {
            loop {
                let Some(queue) = state.queues.get_mut(&name) else {
                    break;
                };
                if queue.consumers.is_empty() {
                    break;
                }
                let Some(message) = queue.messages.pop_front() else {
                    break;
                };

                let idx = queue.next % queue.consumers.len();
                queue.next = queue.next.wrapping_add(1);
                state.next_delivery += 1;
                let tag = state.next_delivery;

                let delivery = Delivery::new(
                    message.routing_key.clone(),
                    message.data.clone(),
                    message.properties.clone(),
                    Arc::new(MemoryAcker {
                        state: self.state.clone(),
                        tag,
                    }),
                );

                let channel_id = queue.consumers[idx].channel_id;
                if queue.consumers[idx].tx.send(Ok(delivery)).is_ok() {
                    state.unacked.insert(
                        tag,
                        Unacked {
                            queue: name.clone(),
                            channel_id,
                            message,
                        },
                    );
                } else {
                    queue.consumers.remove(idx);
                    queue.messages.push_front(message);
                }
            }
        }
    }
}

fn detach_channel(state: &mut BrokerState, id: u64) {
    for queue in state.queues.values_mut() {
        queue.consumers.retain(|c| c.channel_id != id);
    }

    let tags: Vec<u64> = state
        .unacked
        .iter()
        .filter(|(_, u)| u.channel_id == id)
        .map(|(tag, _)| *tag)
        .collect();
    for tag in tags {
        if let Some(unacked) = state.unacked.remove(&tag) {
            if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                queue.messages.push_front(unacked.message);
            }
        }
    }
}

fn topic_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|i| words_match(rest, &key[i..])),
        Some((&"*", rest)) => !key.is_empty() && words_match(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && words_match(rest, &key[1..]),
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut state = self.lock();
        if state.refuse_connections {
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        state.connects += 1;
        state.next_channel += 1;
        let id = state.next_channel;
        let (tx, rx) = oneshot::channel();
        state.channels.insert(id, Some(tx));

        Ok(Arc::new(MemoryChannel {
            id,
            broker: self.clone(),
            closed: Mutex::new(Some(rx)),
        }))
    }
}

struct MemoryChannel {
    id: u64,
    broker: MemoryBroker,
    closed: Mutex<Option<oneshot::Receiver<String>>>,
}

impl MemoryChannel {
    fn alive(&self) -> Result<MutexGuard<'_, BrokerState>, AmqpError> {
        let state = self.broker.lock();
        if state.channels.contains_key(&self.id) {
            Ok(state)
        } else {
            Err(AmqpError::ChannelError("channel closed".to_owned()))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.alive()?;
        let declared = (def.exchange_kind().clone(), def.is_durable());
        match state.exchanges.get(def.name()).cloned() {
            Some(existing) if existing != declared => {
                Err(AmqpError::DeclareExchangeError(def.name().to_owned()))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(def.name().to_owned(), declared);
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut state = self.alive()?;
        match state.queues.get(def.name()).map(|q| q.durable) {
            Some(durable) if durable != def.is_durable() => {
                Err(AmqpError::DeclareQueueError(def.name().to_owned()))
            }
            Some(_) => Ok(()),
            None => {
                let queue = MemoryQueue {
                    durable: def.is_durable(),
                    ..Default::default()
                };
                state.queues.insert(def.name().to_owned(), queue);
                Ok(())
            }
        }
    }

    async fn queue_bind(&self, binding: &QueueBinding<'_>) -> Result<(), AmqpError> {
        let mut state = self.alive()?;
        if !state.exchanges.contains_key(binding.exchange_name)
            || !state.queues.contains_key(binding.queue_name)
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.to_owned(),
                binding.queue_name.to_owned(),
            ));
        }

        let entry = (
            binding.exchange_name.to_owned(),
            binding.routing_key.to_owned(),
            binding.queue_name.to_owned(),
        );
        if !state.bindings.contains(&entry) {
            state.bindings.push(entry);
        }
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError> {
        self.alive()?.qos.push((prefetch_count, global));
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let mut state = self.alive()?;
        if state.failing_publishes > 0 {
            if state.failing_publishes != usize::MAX {
                state.failing_publishes -= 1;
            }
            return Err(AmqpError::PublishingError("injected failure".to_owned()));
        }

        let Some((kind, _)) = state.exchanges.get(exchange).cloned() else {
            return Err(AmqpError::ChannelError(format!("no exchange `{}`", exchange)));
        };

        state.published.push(PublishedMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            data: payload.to_vec(),
            properties: properties.clone(),
        });

        let targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|(ex, key, _)| {
                ex == exchange
                    && match kind {
                        ExchangeKind::Topic => topic_matches(key, routing_key),
                        ExchangeKind::Direct => key == routing_key,
                        ExchangeKind::Fanout | ExchangeKind::Headers => true,
                    }
            })
            .map(|(_, _, queue)| queue.clone())
            .collect();

        for target in targets {
            if let Some(queue) = state.queues.get_mut(&target) {
                queue.messages.push_back(StoredMessage {
                    routing_key: routing_key.to_owned(),
                    data: payload.to_vec(),
                    properties: properties.clone(),
                });
            }
        }

        self.broker.flush(&mut state);
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.alive()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let Some(memory_queue) = state.queues.get_mut(queue) else {
            return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
        };
        memory_queue.consumers.push(ConsumerSlot {
            tag: consumer_tag.to_owned(),
            channel_id: self.id,
            tx,
        });

        self.broker.flush(&mut state);

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.alive()?;
        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|c| !(c.channel_id == self.id && c.tag == consumer_tag));
        }
        state.cancelled.push(consumer_tag.to_owned());
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.alive()?;
        state.channels.remove(&self.id);
        detach_channel(&mut state, self.id);
        self.broker.flush(&mut state);
        Ok(())
    }

    fn notify_close(&self) -> Option<oneshot::Receiver<String>> {
        self.closed.lock().unwrap().take()
    }
}

struct MemoryAcker {
    state: Arc<Mutex<BrokerState>>,
    tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        *state.acks.entry(self.tag).or_default() += 1;
        match state.unacked.remove(&self.tag) {
            Some(_) => Ok(()),
            None => Err(AmqpError::AckMessageError),
        }
    }
}

#[test]
fn topic_patterns() {
    assert!(topic_matches("jobs", "jobs"));
    assert!(!topic_matches("jobs", "k1"));
    assert!(topic_matches("process.*", "process.sync_log"));
    assert!(!topic_matches("process.*", "process.sync_log.retry"));
    assert!(topic_matches("process.#", "process.sync_log.retry"));
    assert!(topic_matches("#", "anything.at.all"));
}
