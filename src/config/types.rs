use std::str::FromStr;
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::device::constants::EVENT_BUFFER_SIZE;
use crate::device::session::SessionOptions;

fn default_log_level() -> String {
    "info".to_string()
}

fn default_event_buffer_size() -> usize {
    EVENT_BUFFER_SIZE
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub connection_poll_interval_ms: Option<u64>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,
}

impl Config {
    pub fn log_level_filter(&self) -> LevelFilter {
        LevelFilter::from_str(&self.log_level).unwrap_or(LevelFilter::Info)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            connection_poll_interval: self.connection_poll_interval_ms.map(Duration::from_millis),
            event_buffer_size: self.event_buffer_size,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            connection_poll_interval_ms: None,
            log_level: default_log_level(),
            event_buffer_size: default_event_buffer_size(),
        }
    }
}
