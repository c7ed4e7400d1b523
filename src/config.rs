use std::path::PathBuf;
use std::time::Duration;

use structopt::StructOpt;

use crate::error::Error;

pub const DEFAULT_PROJECT_ID: &str = "emulator-project-id";
pub const DEFAULT_PROVISION_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings, read once when a consumer is built.
#[derive(Clone, Debug, PartialEq, StructOpt)]
pub struct Config {
    /// Project owning the topic and subscription
    #[structopt(
        long = "project-id",
        env = "PUBSUB_PROJECT_ID",
        default_value = "emulator-project-id"
    )]
    pub project_id: String,

    /// Service account key used instead of ambient credentials
    #[structopt(long, env = "PUBSUB_KEYFILE", parse(from_os_str))]
    pub keyfile: Option<PathBuf>,

    /// host:port of a local emulator; disables authentication
    #[structopt(long = "emulator-host", env = "PUBSUB_EMULATOR_HOST")]
    pub emulator_host: Option<String>,

    /// Ambient service account key, as used by other Google client libraries
    #[structopt(
        long = "application-credentials",
        env = "GOOGLE_APPLICATION_CREDENTIALS",
        parse(from_os_str)
    )]
    pub application_credentials: Option<PathBuf>,

    /// Upper bound, in seconds, for every provisioning and removal call
    #[structopt(
        long = "provision-timeout",
        env = "PUBSUB_PROVISION_TIMEOUT_SECS",
        default_value = "30",
        parse(try_from_str = parse_seconds)
    )]
    pub provision_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, Error> {
        Self::from_iter_safe(std::iter::once(env!("CARGO_PKG_NAME")))
            .map_err(|e| Error::Config(e.to_string()))
    }

    pub fn emulator_host(&self) -> Option<&str> {
        non_empty(self.emulator_host.as_deref())
    }

    pub fn keyfile(&self) -> Option<&PathBuf> {
        self.keyfile
            .as_ref()
            .filter(|path| !path.as_os_str().is_empty())
    }

    pub fn application_credentials(&self) -> Option<&PathBuf> {
        self.application_credentials
            .as_ref()
            .filter(|path| !path.as_os_str().is_empty())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_id: DEFAULT_PROJECT_ID.to_string(),
            keyfile: None,
            emulator_host: None,
            application_credentials: None,
            provision_timeout: DEFAULT_PROVISION_TIMEOUT,
        }
    }
}

fn parse_seconds(s: &str) -> Result<Duration, std::num::ParseIntError> {
    s.parse().map(Duration::from_secs)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}
