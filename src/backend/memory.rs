use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Backend, BackendError, Envelope};

pub const DEFAULT_ACK_DEADLINE: Duration = Duration::from_secs(10);

/// In-process stand-in for the managed service.
///
/// Every subscription receives its own copy of each message published to its topic
/// after the subscription was created. Leased messages that are not settled before
/// the ack deadline become deliverable again.
pub struct MemoryBackend {
    state: Mutex<State>,
    changed: Notify,
    ack_deadline: Duration,
}

#[derive(Default)]
struct State {
    topics: HashSet<String>,
    subscriptions: HashMap<String, Subscription>,
    next_message_id: u64,
    next_ack_id: u64,
}

struct Subscription {
    topic: String,
    pending: VecDeque<Stored>,
    leased: HashMap<String, Lease>,
}

#[derive(Clone)]
struct Stored {
    message_id: String,
    payload: Vec<u8>,
    attributes: HashMap<String, String>,
    publish_time: DateTime<Utc>,
}

struct Lease {
    message: Stored,
    deadline: Instant,
}

impl Subscription {
    fn expire_leases(&mut self, now: Instant) {
        let expired = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(ack_id, _)| ack_id.clone())
            .collect::<Vec<_>>();

        for ack_id in expired {
            if let Some(lease) = self.leased.remove(&ack_id) {
                self.pending.push_back(lease.message);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.leased.values().map(|lease| lease.deadline).min()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_ack_deadline(DEFAULT_ACK_DEADLINE)
    }

    pub fn with_ack_deadline(ack_deadline: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            changed: Notify::new(),
            ack_deadline,
        }
    }

    /// Publishes a message to every subscription of `topic` and returns its id.
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<String> {
        self.publish_with_attributes(topic, payload, HashMap::new())
    }

    pub fn publish_with_attributes(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        attributes: HashMap<String, String>,
    ) -> Result<String> {
        let mut state = self.lock()?;
        if !state.topics.contains(topic) {
            return Err(BackendError::NotFound(topic.to_owned()).into());
        }

        state.next_message_id += 1;
        let message = Stored {
            message_id: state.next_message_id.to_string(),
            payload: payload.into(),
            attributes,
            publish_time: Utc::now(),
        };

        state
            .subscriptions
            .values_mut()
            .filter(|subscription| subscription.topic == topic)
            .for_each(|subscription| subscription.pending.push_back(message.clone()));
        drop(state);

        self.changed.notify_waiters();
        Ok(message.message_id)
    }

    /// Messages waiting to be leased.
    pub fn pending(&self, subscription: &str) -> usize {
        self.inspect(subscription, |s| s.pending.len())
    }

    /// Messages leased and not yet settled.
    pub fn leased(&self, subscription: &str) -> usize {
        self.inspect(subscription, |s| s.leased.len())
    }

    pub fn subscription_topic(&self, subscription: &str) -> Option<String> {
        let state = self.state.lock().ok()?;
        state
            .subscriptions
            .get(subscription)
            .map(|s| s.topic.clone())
    }

    fn inspect(&self, subscription: &str, f: impl Fn(&Subscription) -> usize) -> usize {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.subscriptions.get(subscription).map(&f))
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory backend state poisoned"))
    }

    fn settle(&self, subscription: &str, ack_id: &str, redeliver: bool) -> Result<()> {
        let mut state = self.lock()?;
        let subscription_state = state
            .subscriptions
            .get_mut(subscription)
            .ok_or_else(|| BackendError::NotFound(subscription.to_owned()))?;

        let lease = subscription_state
            .leased
            .remove(ack_id)
            .ok_or_else(|| BackendError::UnknownAckId(ack_id.to_owned()))?;

        if redeliver {
            subscription_state.pending.push_front(lease.message);
            drop(state);
            self.changed.notify_waiters();
        }

        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    async fn topic_exists(&self, topic: &str) -> Result<bool> {
        Ok(self.lock()?.topics.contains(topic))
    }

    async fn create_topic(&self, topic: &str) -> Result<()> {
        if !self.lock()?.topics.insert(topic.to_owned()) {
            return Err(BackendError::AlreadyExists(topic.to_owned()).into());
        }
        Ok(())
    }

    async fn subscription_exists(&self, subscription: &str) -> Result<bool> {
        Ok(self.lock()?.subscriptions.contains_key(subscription))
    }

    async fn create_subscription(&self, subscription: &str, topic: &str) -> Result<()> {
        let mut state = self.lock()?;
        if !state.topics.contains(topic) {
            return Err(BackendError::NotFound(topic.to_owned()).into());
        }
        if state.subscriptions.contains_key(subscription) {
            return Err(BackendError::AlreadyExists(subscription.to_owned()).into());
        }

        state.subscriptions.insert(
            subscription.to_owned(),
            Subscription {
                topic: topic.to_owned(),
                pending: VecDeque::new(),
                leased: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn delete_subscription(&self, subscription: &str) -> Result<()> {
        let removed = self.lock()?.subscriptions.remove(subscription);
        removed.ok_or_else(|| BackendError::NotFound(subscription.to_owned()))?;

        // Wake pullers so they observe the deletion.
        self.changed.notify_waiters();
        Ok(())
    }

    async fn pull(&self, subscription: &str, max_messages: usize) -> Result<Vec<Envelope>> {
        loop {
            // Registered before inspecting state so no notification is missed.
            let changed = self.changed.notified();

            let next_deadline = {
                let mut state = self.lock()?;
                let now = Instant::now();
                let deadline = now + self.ack_deadline;

                let State {
                    subscriptions,
                    next_ack_id,
                    ..
                } = &mut *state;
                let subscription_state = subscriptions
                    .get_mut(subscription)
                    .ok_or_else(|| BackendError::NotFound(subscription.to_owned()))?;

                subscription_state.expire_leases(now);

                if !subscription_state.pending.is_empty() {
                    let take = max_messages.max(1).min(subscription_state.pending.len());
                    let taken = subscription_state.pending.drain(..take).collect::<Vec<_>>();

                    let mut envelopes = Vec::with_capacity(taken.len());
                    for message in taken {
                        *next_ack_id += 1;
                        let ack_id = format!("{}-{}", message.message_id, next_ack_id);
                        envelopes.push(Envelope {
                            ack_id: ack_id.clone(),
                            message_id: message.message_id.clone(),
                            payload: message.payload.clone(),
                            attributes: message.attributes.clone(),
                            publish_time: Some(message.publish_time),
                        });
                        subscription_state
                            .leased
                            .insert(ack_id, Lease { message, deadline });
                    }
                    return Ok(envelopes);
                }

                subscription_state.next_deadline()
            };

            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = changed => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => changed.await,
            }
        }
    }

    async fn acknowledge(&self, subscription: &str, ack_id: &str) -> Result<()> {
        self.settle(subscription, ack_id, false)
    }

    async fn negative_acknowledge(&self, subscription: &str, ack_id: &str) -> Result<()> {
        self.settle(subscription, ack_id, true)
    }
}
