use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resource {
    Topic,
    Subscription,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Topic => f.write_str("topic"),
            Resource::Subscription => f.write_str("subscription"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("could not create pubsub client: {0:#}")]
    Client(#[source] anyhow::Error),

    #[error("could not provision {resource} `{name}`: {source:#}")]
    Provisioning {
        resource: Resource,
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("subscription `{0}` already has an active delivery stream")]
    AlreadyConsuming(String),

    #[error("subscription `{0}` has been removed")]
    Removed(String),

    #[error("could not remove subscription `{name}`: {source:#}")]
    Remove {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("receiving from subscription `{name}` stopped: {source:#}")]
    Receive {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}
