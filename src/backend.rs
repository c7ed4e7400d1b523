use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};

pub mod memory;
pub mod rest;

/// A message as handed out by the backend, together with the lease needed to settle it.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub ack_id: String,
    pub message_id: String,
    pub payload: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub publish_time: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("`{0}` not found")]
    NotFound(String),
    #[error("`{0}` already exists")]
    AlreadyExists(String),
    #[error("unknown ack id `{0}`")]
    UnknownAckId(String),
}

impl BackendError {
    pub fn is_already_exists(error: &anyhow::Error) -> bool {
        matches!(
            error.downcast_ref::<BackendError>(),
            Some(BackendError::AlreadyExists(_))
        )
    }
}

/// Narrow view of the managed messaging service needed by the consumer.
///
/// Resource names are short names; implementations qualify them with their project.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    async fn topic_exists(&self, topic: &str) -> Result<bool>;
    async fn create_topic(&self, topic: &str) -> Result<()>;

    async fn subscription_exists(&self, subscription: &str) -> Result<bool>;
    async fn create_subscription(&self, subscription: &str, topic: &str) -> Result<()>;
    async fn delete_subscription(&self, subscription: &str) -> Result<()>;

    /// Leases up to `max_messages` envelopes. May return an empty batch.
    async fn pull(&self, subscription: &str, max_messages: usize) -> Result<Vec<Envelope>>;
    async fn acknowledge(&self, subscription: &str, ack_id: &str) -> Result<()>;
    async fn negative_acknowledge(&self, subscription: &str, ack_id: &str) -> Result<()>;
}
