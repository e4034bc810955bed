//! Presentation mode: what the screen shows while disconnected.
//!
//! Operators choose between keeping the last delivered layout on screen
//! (lobby displays where stale content beats a status panel) and the full
//! overlay sequence (back-of-house displays where staff need to see the
//! connection state). The choice gates only the connection-progress panels;
//! discovery and no-layout panels are informational and always allowed.

use std::sync::Arc;

use tracing::debug;

use crate::overlay::{DeviceSnapshot, StatusOverlay};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationMode {
    /// Keep showing the cached layout; suppress connection-progress panels.
    CachedContent,
    /// Replace content with the status panels while disconnected.
    OverlaySequence,
}

impl PresentationMode {
    pub fn from_settings(show_cached_layout_on_disconnect: bool) -> Self {
        if show_cached_layout_on_disconnect {
            Self::CachedContent
        } else {
            Self::OverlaySequence
        }
    }
}

pub struct PresentationSelector {
    mode: PresentationMode,
    overlay: Arc<StatusOverlay>,
}

impl PresentationSelector {
    pub fn new(mode: PresentationMode, overlay: Arc<StatusOverlay>) -> Self {
        debug!(?mode, "presentation mode selected");
        Self { mode, overlay }
    }

    pub fn mode(&self) -> PresentationMode {
        self.mode
    }

    fn progress_panels_allowed(&self) -> bool {
        self.mode == PresentationMode::OverlaySequence
    }

    pub fn show_auto_discovery(&self, device: DeviceSnapshot) {
        self.overlay.show_auto_discovery(device);
    }

    pub fn show_no_layout_assigned(&self, device: DeviceSnapshot) {
        self.overlay.show_no_layout_assigned(device);
    }

    pub fn show_connecting(&self, target_url: String, attempt: u32) {
        if self.progress_panels_allowed() {
            self.overlay.show_connecting(target_url, attempt);
        }
    }

    pub fn show_server_offline(
        &self,
        target_url: String,
        attempt: u32,
        retry_in_secs: u64,
        discovery_active: bool,
    ) {
        if self.progress_panels_allowed() {
            self.overlay
                .show_server_offline(target_url, attempt, retry_in_secs, discovery_active);
        }
    }

    pub fn update_offline_countdown(&self, retry_in_secs: u64) {
        if self.progress_panels_allowed() {
            self.overlay.update_offline_countdown(retry_in_secs);
        }
    }

    pub fn clear_overlay(&self) {
        self.overlay.clear();
    }
}
