//! Per-rule broker options.
//!
//! Numeric fields follow the long-poll convention where zero or a negative
//! value disables the corresponding bound.

use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;
use crate::broker::{BrokerOptions, DEFAULT_SWEEP_INTERVAL};

/// One publish/subscribe path pair and the options of its broker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuleConfig {
    /// Path that accepts `category`/`body` publications.
    pub publish_path: String,
    /// Path that long-polls for events.
    pub subscribe_path: String,
    /// Longest a subscriber may block. Non-positive means the default (45s).
    pub max_longpoll_timeout_seconds: i64,
    /// Events kept per category. Non-positive disables the cap.
    pub max_event_buffer_size: i64,
    /// Seconds an event is retained. Non-positive disables expiry.
    pub event_time_to_live_seconds: i64,
    /// Drop events once delivered to a subscriber.
    pub delete_event_after_first_retrieval: bool,
    /// Milliseconds between eviction sweeps.
    pub sweep_interval_millis: u64,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            publish_path: String::new(),
            subscribe_path: String::new(),
            max_longpoll_timeout_seconds: 45,
            max_event_buffer_size: 250,
            event_time_to_live_seconds: 300,
            delete_event_after_first_retrieval: false,
            sweep_interval_millis: DEFAULT_SWEEP_INTERVAL.as_millis() as u64,
        }
    }
}

impl RuleConfig {
    /// Rule with default options for the given paths.
    pub fn new(publish_path: impl Into<String>, subscribe_path: impl Into<String>) -> Self {
        Self {
            publish_path: publish_path.into(),
            subscribe_path: subscribe_path.into(),
            ..Default::default()
        }
    }

    pub(super) fn validate(&self, index: usize) -> Result<(), ConfigError> {
        for (field, value) in [
            ("publish_path", &self.publish_path),
            ("subscribe_path", &self.subscribe_path),
        ] {
            if !value.starts_with('/') {
                return Err(ConfigError::InvalidPath {
                    index,
                    field,
                    value: value.clone(),
                });
            }
        }
        if self.publish_path == self.subscribe_path {
            return Err(ConfigError::SamePaths {
                index,
                path: self.publish_path.clone(),
            });
        }
        Ok(())
    }

    /// Translate into the options of the rule's broker.
    pub fn broker_options(&self) -> BrokerOptions {
        let defaults = BrokerOptions::default();
        BrokerOptions {
            max_longpoll_timeout: positive_secs(self.max_longpoll_timeout_seconds)
                .unwrap_or(defaults.max_longpoll_timeout),
            max_event_buffer_size: usize::try_from(self.max_event_buffer_size)
                .ok()
                .filter(|n| *n > 0),
            event_ttl: positive_secs(self.event_time_to_live_seconds),
            delete_event_after_first_retrieval: self.delete_event_after_first_retrieval,
            sweep_interval: match self.sweep_interval_millis {
                0 => defaults.sweep_interval,
                millis => Duration::from_millis(millis),
            },
        }
    }
}

fn positive_secs(secs: i64) -> Option<Duration> {
    u64::try_from(secs)
        .ok()
        .filter(|s| *s > 0)
        .map(Duration::from_secs)
}
