// SPDX-License-Identifier: CEPL-1.0
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::{RenderError, RenderResult};

pub const SWAPCHAIN_EXTENSION: &str = "VK_KHR_swapchain";
pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 2;
pub const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Tunables of the frame engine, read from the `[render]` table of `ember.toml`.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RenderConfig {
    pub frames_in_flight: usize,
    /// Bound for every host-side fence wait, including transfer batches.
    pub fence_timeout_ms: u64,
    pub device_extensions: Vec<String>,
    pub validation: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        RenderConfig {
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            fence_timeout_ms: DEFAULT_FENCE_TIMEOUT.as_millis() as u64,
            device_extensions: vec![SWAPCHAIN_EXTENSION.to_owned()],
            validation: cfg!(debug_assertions),
        }
    }
}

impl RenderConfig {
    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }

    /// Rejects unusable values and adds the swapchain extension when a
    /// user-supplied list forgot it.
    pub fn validated(mut self) -> RenderResult<Self> {
        if self.frames_in_flight == 0 {
            return Err(RenderError::Config(
                "frames_in_flight must be at least 1".into(),
            ));
        }
        if self.fence_timeout_ms == 0 {
            return Err(RenderError::Config("fence_timeout_ms must be non-zero".into()));
        }
        if !self.device_extensions.iter().any(|e| e == SWAPCHAIN_EXTENSION) {
            warn!("device_extensions lacks {SWAPCHAIN_EXTENSION}; adding it");
            self.device_extensions.push(SWAPCHAIN_EXTENSION.to_owned());
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_tunables() {
        let cfg = RenderConfig::default();
        assert_eq!(cfg.frames_in_flight, 2);
        assert_eq!(cfg.fence_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.device_extensions, vec![SWAPCHAIN_EXTENSION.to_owned()]);
    }

    #[test]
    fn partial_table_keeps_other_defaults() {
        let cfg: RenderConfig = toml::from_str("frames_in_flight = 3").unwrap();
        assert_eq!(cfg.frames_in_flight, 3);
        assert_eq!(cfg.fence_timeout_ms, 10_000);
    }

    #[test]
    fn swapchain_extension_is_enforced() {
        let cfg = RenderConfig {
            device_extensions: vec!["VK_KHR_maintenance1".into()],
            ..RenderConfig::default()
        }
        .validated()
        .unwrap();
        assert!(cfg.device_extensions.iter().any(|e| e == SWAPCHAIN_EXTENSION));
    }

    #[test]
    fn zero_frames_rejected() {
        let cfg = RenderConfig {
            frames_in_flight: 0,
            ..RenderConfig::default()
        };
        assert!(matches!(cfg.validated(), Err(RenderError::Config(_))));
    }
}
