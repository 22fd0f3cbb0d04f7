//! Executor configuration

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

/// Executor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Steps allowed to run at once across every plan of the executor
    pub max_concurrent_steps: usize,
    /// Delete a plan and its status from storage once it is evicted
    pub forget_finished_plans: bool,
}

impl ExecutorConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With max concurrent steps
    #[inline]
    #[must_use]
    pub fn with_max_concurrent_steps(mut self, max: usize) -> Self {
        self.max_concurrent_steps = max;
        self
    }

    /// With storage cleanup of evicted plans
    #[inline]
    #[must_use]
    pub fn with_forget_finished_plans(mut self, forget: bool) -> Self {
        self.forget_finished_plans = forget;
        self
    }

    /// Check the configuration before use
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_steps == 0 {
            return Err(ConfigError::InvalidConcurrency(self.max_concurrent_steps));
        }
        Ok(())
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: 64,
            forget_finished_plans: false,
        }
    }
}
