use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::backend::rest::RestBackend;
use crate::backend::{Backend, BackendError, Envelope};
use crate::config::Config;
use crate::consumer::{Consumer, Delivery, Message};
use crate::error::{Error, Resource};

const CHANNEL_BUFFER: usize = 1;
const IDLE_BACKOFF: Duration = Duration::from_millis(250);

/// Consumer bound to one topic/subscription pair of a [`Backend`].
pub struct PubSubConsumer<B> {
    backend: Arc<B>,
    topic: String,
    subscription: Arc<str>,
    provision_timeout: Duration,
    shutdown: CancellationToken,
    _stop_on_drop: DropGuard,
    active: Arc<Mutex<Option<CancellationToken>>>,
}

impl PubSubConsumer<RestBackend> {
    /// Builds a consumer from the environment, creating the topic and subscription if needed.
    pub async fn new(
        topic: impl Into<String>,
        subscription: impl Into<String>,
    ) -> Result<Self, Error> {
        let config = Config::from_env()?;
        Self::with_config(&config, topic, subscription).await
    }

    pub async fn with_config(
        config: &Config,
        topic: impl Into<String>,
        subscription: impl Into<String>,
    ) -> Result<Self, Error> {
        let backend = RestBackend::connect(config).map_err(Error::Client)?;
        Self::with_backend(Arc::new(backend), config, topic, subscription).await
    }
}

impl<B> PubSubConsumer<B>
where
    B: Backend + 'static,
{
    pub async fn with_backend(
        backend: Arc<B>,
        config: &Config,
        topic: impl Into<String>,
        subscription: impl Into<String>,
    ) -> Result<Self, Error> {
        let shutdown = CancellationToken::new();
        let consumer = Self {
            backend,
            topic: topic.into(),
            subscription: Arc::from(subscription.into()),
            provision_timeout: config.provision_timeout,
            _stop_on_drop: shutdown.clone().drop_guard(),
            shutdown,
            active: Arc::new(Mutex::new(None)),
        };

        consumer.ensure_topic().await?;
        consumer.ensure_subscription().await?;

        Ok(consumer)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    async fn ensure_topic(&self) -> Result<(), Error> {
        let topic = self.topic.as_str();
        let provisioning = |source: anyhow::Error| Error::Provisioning {
            resource: Resource::Topic,
            name: topic.to_owned(),
            source,
        };

        let exists = bounded(self.provision_timeout, self.backend.topic_exists(topic))
            .await
            .map_err(provisioning)?;
        if exists {
            debug!(topic, "using existing topic");
            return Ok(());
        }

        match bounded(self.provision_timeout, self.backend.create_topic(topic)).await {
            Ok(()) => info!(topic, "created topic"),
            Err(e) if BackendError::is_already_exists(&e) => {
                debug!(topic, "topic created concurrently, using it")
            }
            Err(e) => return Err(provisioning(e)),
        }
        Ok(())
    }

    async fn ensure_subscription(&self) -> Result<(), Error> {
        let subscription = &*self.subscription;
        let provisioning = |source: anyhow::Error| Error::Provisioning {
            resource: Resource::Subscription,
            name: subscription.to_owned(),
            source,
        };

        let exists = bounded(
            self.provision_timeout,
            self.backend.subscription_exists(subscription),
        )
        .await
        .map_err(provisioning)?;
        if exists {
            debug!(subscription, "using existing subscription");
            return Ok(());
        }

        let create = self
            .backend
            .create_subscription(subscription, &self.topic);
        match bounded(self.provision_timeout, create).await {
            Ok(()) => info!(subscription, topic = %self.topic, "created subscription"),
            Err(e) if BackendError::is_already_exists(&e) => {
                debug!(subscription, "subscription created concurrently, using it")
            }
            Err(e) => return Err(provisioning(e)),
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<B> Consumer for PubSubConsumer<B>
where
    B: Backend + 'static,
{
    type Message = PubSubMessage;

    async fn consume(&self) -> Result<Delivery<PubSubMessage>, Error> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Removed(self.subscription.to_string()));
        }
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(Error::AlreadyConsuming(self.subscription.to_string()));
        }

        let (sender, receiver) = mpsc::channel(CHANNEL_BUFFER);
        let (outcome_sender, outcome) = oneshot::channel();
        let cancel = self.shutdown.child_token();
        *active = Some(cancel.clone());

        let backend: Arc<dyn Backend> = self.backend.clone();
        let receive_loop = ReceiveLoop {
            backend,
            subscription: self.subscription.clone(),
            release_timeout: self.provision_timeout,
            cancel: cancel.clone(),
            sender,
            runtime: Handle::current(),
        };
        let stream_slot = self.active.clone();

        tokio::spawn(async move {
            let result = receive_loop.run().await;
            stream_slot.lock().await.take();
            let _ = outcome_sender.send(result);
            // Closes the stream only after the outcome is available.
            drop(receive_loop);
        });

        Ok(Delivery::new(receiver, outcome, cancel))
    }

    async fn remove(&self) -> Result<(), Error> {
        let subscription = &*self.subscription;
        // The active stream ends first so its pull does not fail on the vanishing subscription.
        if let Some(stream) = self.active.lock().await.as_ref() {
            stream.cancel();
        }

        bounded(
            self.provision_timeout,
            self.backend.delete_subscription(subscription),
        )
        .await
        .map_err(|source| Error::Remove {
            name: subscription.to_owned(),
            source,
        })?;
        self.shutdown.cancel();

        info!(subscription, "removed subscription");
        Ok(())
    }

    async fn alive(&self) -> bool {
        let exists = bounded(
            self.provision_timeout,
            self.backend.subscription_exists(&self.subscription),
        )
        .await;

        match exists {
            Ok(exists) => exists,
            Err(e) => {
                debug!(subscription = %self.subscription, "liveness check failed: {:#}", e);
                false
            }
        }
    }
}

async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("timed out after {:?}", limit)),
    }
}

struct ReceiveLoop {
    backend: Arc<dyn Backend>,
    subscription: Arc<str>,
    release_timeout: Duration,
    cancel: CancellationToken,
    sender: mpsc::Sender<PubSubMessage>,
    runtime: Handle,
}

impl ReceiveLoop {
    async fn run(&self) -> Result<(), Error> {
        info!(subscription = %self.subscription, "receive loop started");

        let result = self.deliver().await;

        match &result {
            Ok(()) => info!(subscription = %self.subscription, "receive loop stopped"),
            Err(e) => warn!("{}", e),
        }
        result
    }

    async fn deliver(&self) -> Result<(), Error> {
        loop {
            // Nothing is leased until the reader has room for it, so no envelope
            // waits inside the loop while its ack deadline runs out.
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                permit = self.sender.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return Ok(()),
                },
            };

            let pulled = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                pulled = self.backend.pull(&self.subscription, 1) => pulled,
            };
            let mut envelopes = pulled
                .map_err(|source| Error::Receive {
                    name: self.subscription.to_string(),
                    source,
                })?
                .into_iter();

            match envelopes.next() {
                Some(envelope) => {
                    debug!(
                        subscription = %self.subscription,
                        message_id = %envelope.message_id,
                        "delivering message"
                    );
                    permit.send(self.wrap(envelope));
                }
                None => {
                    drop(permit);
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(IDLE_BACKOFF) => {}
                    }
                }
            }

            // A backend may lease more than was asked for.
            self.release(envelopes).await;
        }
    }

    fn wrap(&self, envelope: Envelope) -> PubSubMessage {
        PubSubMessage {
            envelope,
            settle: Some(Settle {
                backend: self.backend.clone(),
                subscription: self.subscription.clone(),
                runtime: self.runtime.clone(),
            }),
        }
    }

    /// Hands undelivered envelopes back so they need not wait for their ack deadline.
    async fn release(&self, envelopes: impl Iterator<Item = Envelope>) {
        for envelope in envelopes {
            let nack = self
                .backend
                .negative_acknowledge(&self.subscription, &envelope.ack_id);
            if let Err(e) = bounded(self.release_timeout, nack).await {
                warn!(
                    subscription = %self.subscription,
                    message_id = %envelope.message_id,
                    "could not release undelivered message: {:#}", e
                );
            }
        }
    }
}

struct Settle {
    backend: Arc<dyn Backend>,
    subscription: Arc<str>,
    runtime: Handle,
}

impl Settle {
    fn dispatch(self, ack_id: String, message_id: String, ack: bool) {
        let Settle {
            backend,
            subscription,
            runtime,
        } = self;

        runtime.spawn(async move {
            let result = if ack {
                backend.acknowledge(&subscription, &ack_id).await
            } else {
                backend.negative_acknowledge(&subscription, &ack_id).await
            };

            match result {
                Ok(()) => debug!(%subscription, %message_id, ack, "settled message"),
                Err(e) => warn!(%subscription, %message_id, ack, "could not settle message: {:#}", e),
            }
        });
    }
}

/// Message leased from a subscription.
pub struct PubSubMessage {
    envelope: Envelope,
    settle: Option<Settle>,
}

impl PubSubMessage {
    pub fn id(&self) -> &str {
        &self.envelope.message_id
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.envelope.attributes
    }

    pub fn publish_time(&self) -> Option<DateTime<Utc>> {
        self.envelope.publish_time
    }
}

impl Message for PubSubMessage {
    fn data(&self) -> &[u8] {
        &self.envelope.payload
    }

    fn done(mut self, ack: bool) {
        if let Some(settle) = self.settle.take() {
            settle.dispatch(
                self.envelope.ack_id.clone(),
                self.envelope.message_id.clone(),
                ack,
            );
        }
    }
}

impl Drop for PubSubMessage {
    fn drop(&mut self) {
        if self.settle.is_some() {
            debug!(
                message_id = %self.envelope.message_id,
                "message dropped without done, it will be redelivered after its ack deadline"
            );
        }
    }
}
