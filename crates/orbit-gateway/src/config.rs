//! Gateway manager configuration.

use orbit_hub::HubConfig;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

/// Configuration for a [`GatewayManager`](crate::GatewayManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Hub connection.
    pub hub: HubConfig,
    /// Dispatch every ready command at once instead of one per system.
    #[serde(default)]
    pub parallel: bool,
    /// Capacity of the inbound mirror broadcast.
    #[serde(default = "default_mirror_capacity")]
    pub mirror_capacity: usize,
}

const fn default_mirror_capacity() -> usize {
    256
}

impl GatewayConfig {
    /// Create a serial-mode configuration for `hub`.
    #[must_use]
    pub fn new(hub: HubConfig) -> Self {
        Self {
            hub,
            parallel: false,
            mirror_capacity: default_mirror_capacity(),
        }
    }

    /// Enable or disable parallel (no-queue) mode.
    #[must_use]
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Set the inbound mirror capacity. Zero is ignored.
    #[must_use]
    pub fn with_mirror_capacity(mut self, capacity: usize) -> Self {
        if capacity > 0 {
            self.mirror_capacity = capacity;
        }
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub configuration is invalid or the mirror
    /// capacity is zero.
    pub fn validate(&self) -> GatewayResult<()> {
        self.hub
            .validate()
            .map_err(|e| GatewayError::InvalidConfig(e.to_string()))?;
        if self.mirror_capacity == 0 {
            return Err(GatewayError::InvalidConfig(
                "mirror_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
