pub mod auth;
pub mod backend;
pub mod config;
pub mod consumer;
pub mod error;
pub mod logging;
pub mod pubsub;

pub use config::Config;
pub use consumer::{Consumer, Delivery, Message};
pub use error::Error;
pub use pubsub::{PubSubConsumer, PubSubMessage};
