//! Library-level knobs for the orchestrator.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Upper bound on fetching the chain config before falling back.
    pub config_fetch_timeout: Duration,
    /// Timeout for individual beacon node HTTP requests.
    pub http_timeout: Duration,
    pub graffiti: Option<String>,
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            config_fetch_timeout: Duration::from_secs(5),
            http_timeout: Duration::from_secs(10),
            graffiti: None,
            event_capacity: 256,
        }
    }
}
