//! Validated runtime settings for the refresh command.

use std::time::Duration;

use thiserror::Error;

use crate::cli::UpdateContentMetadataArgs;
use crate::orchestrator::WaitPolicy;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("poll interval must be at least one second")]
    ZeroPollInterval,

    #[error("at least one worker is required")]
    NoWorkers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshConfig {
    pub workers: usize,
    pub wait: WaitPolicy,
    /// Extra time outstanding jobs get once the wait is over.
    pub drain: Duration,
    pub discovery_api_url: Option<String>,
    pub discovery_api_token: Option<String>,
}

impl RefreshConfig {
    pub fn from_args(args: &UpdateContentMetadataArgs) -> Result<Self, ConfigError> {
        if args.poll_interval_secs == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        if args.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }

        Ok(Self {
            workers: args.workers,
            wait: WaitPolicy {
                poll_interval: Duration::from_secs(args.poll_interval_secs),
                max_wait: Duration::from_secs(args.max_wait_secs),
            },
            drain: Duration::from_secs(args.drain_secs),
            discovery_api_url: args.discovery_api_url.clone().filter(|u| !u.trim().is_empty()),
            discovery_api_token: args.discovery_api_token.clone().filter(|t| !t.is_empty()),
        })
    }
}
