use jamz_core::Config;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleError {
    #[error("Signaling toggle is only available in development or with allow_debug_toggle")]
    NotAllowed,
}

/// Runtime switches shared by the gateway and the admin routes
#[derive(Debug)]
pub struct SignalingContext {
    enabled: AtomicBool,
    toggle_allowed: bool,
}

impl SignalingContext {
    #[must_use]
    pub const fn new(enabled: bool, toggle_allowed: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            toggle_allowed,
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.signaling.enabled, config.debug_toggle_allowed())
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    #[must_use]
    pub const fn toggle_allowed(&self) -> bool {
        self.toggle_allowed
    }

    /// Flip the enabled flag. Returns the new value.
    pub fn toggle(&self) -> Result<bool, ToggleError> {
        if !self.toggle_allowed {
            return Err(ToggleError::NotAllowed);
        }
        let enabled = !self.enabled.fetch_xor(true, Ordering::AcqRel);
        info!(enabled, "Audio signaling toggled");
        Ok(enabled)
    }
}
