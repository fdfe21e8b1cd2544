//! Module that contains the bootstrap configuration of a cluster.

use crate::{
    error::DsmError,
    fault::{DeathMode, Fault},
};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub processors: usize,
    pub pages: usize,
    pub central_managers: usize,
    /// Poisson rate of requests, per processor and per second.
    pub request_rate: f64,
    /// Longest gap between two requests of a processor.
    pub request_interval_bound_ms: u64,
    /// Request timeout, also used as the election window.
    pub timeout_ms: u64,
    /// Capacity of every mailbox; `10 * processors` when unset.
    pub mailbox_capacity: Option<usize>,
    pub seed: u64,
    pub debug: bool,
    pub faults: Vec<Fault>,
}

impl Default for Config {
    fn default() -> Self {
        let timeout_ms = 5000;
        Self {
            processors: 10,
            pages: 4,
            central_managers: 4,
            request_rate: 1.0,
            request_interval_bound_ms: 5000,
            timeout_ms,
            mailbox_capacity: None,
            seed: 0,
            debug: false,
            faults: vec![
                Fault {
                    central_manager: 0,
                    after_messages: 100,
                    mode: DeathMode::Soft {
                        resurrect_after_ms: 3 * timeout_ms,
                    },
                },
                Fault {
                    central_manager: 1,
                    after_messages: 200,
                    mode: DeathMode::Hard,
                },
            ],
        }
    }
}

impl Config {
    /// Function that reads and validates a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, DsmError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Function that parses and validates a JSON configuration.
    pub fn from_json_str(raw: &str) -> Result<Self, DsmError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DsmError> {
        if self.processors == 0 {
            return Err(DsmError::Config("at least one processor is needed".into()));
        }
        if self.pages == 0 {
            return Err(DsmError::Config("at least one page is needed".into()));
        }
        if self.central_managers == 0 {
            return Err(DsmError::Config("at least one central manager is needed".into()));
        }
        if self.timeout_ms == 0 || self.request_interval_bound_ms == 0 {
            return Err(DsmError::Config("durations must be positive".into()));
        }
        if !(self.request_rate.is_finite() && self.request_rate > 0.0) {
            return Err(DsmError::Config("request_rate must be positive".into()));
        }
        if self.mailbox_capacity == Some(0) {
            return Err(DsmError::Config("mailbox_capacity must be positive".into()));
        }
        for fault in &self.faults {
            if fault.central_manager >= self.central_managers {
                return Err(DsmError::Config(format!(
                    "fault targets CM {} but there are only {}",
                    fault.central_manager, self.central_managers
                )));
            }
            if fault.after_messages == 0 {
                return Err(DsmError::Config("fault countdowns must be positive".into()));
            }
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn request_interval_bound(&self) -> Duration {
        Duration::from_millis(self.request_interval_bound_ms)
    }

    pub fn mailbox_capacity(&self) -> usize {
        self.mailbox_capacity.unwrap_or(10 * self.processors)
    }
}
