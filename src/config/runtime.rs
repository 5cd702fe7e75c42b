//! Dispatch engine and correlator configuration types.

use serde::Deserialize;

use crate::utils::retry::RetryConfig;

/// Processor name used when none is configured.
pub const DEFAULT_PROCESSOR_NAME: &str = "DefaultEventProcessor";

/// Sequential event dispatch configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Name under which published versions are recorded.
    pub processor_name: String,
    /// Backoff for retried cursor reads, dispatches, and cursor updates.
    pub retry: RetryConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            processor_name: DEFAULT_PROCESSOR_NAME.to_string(),
            retry: RetryConfig::default(),
        }
    }
}

/// Reply correlator configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    /// Address the reply server binds to.
    pub listen_address: String,
    /// Address advertised to command consumers. Defaults to the bound address.
    pub reply_address: Option<String>,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:0".to_string(),
            reply_address: None,
        }
    }
}
