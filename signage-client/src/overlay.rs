//! Status Overlay: full-screen status panels shown instead of content.
//!
//! The overlay is a small state machine over a renderer. Repeated calls
//! with identical parameters must not repaint (the panels sit on screen for
//! minutes at a time and repaints flicker), so the last rendered view is
//! kept and compared before every draw. All decisions happen under one
//! lock; the renderer is called while it is held so two callers cannot
//! interleave paint operations.

use std::net::IpAddr;
use std::sync::Mutex;

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayState {
    None,
    AutoDiscovery,
    Connecting,
    NoLayoutAssigned,
    ServerOffline,
}

/// Identity shown on panels so a technician can register the display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub client_id: String,
    pub display_name: String,
    pub addresses: Vec<IpAddr>,
}

/// Fully resolved panel contents. Two equal views paint identically, which
/// is what the deduplication compares.
#[derive(Debug, Clone, PartialEq)]
pub enum OverlayView {
    AutoDiscovery {
        device: DeviceSnapshot,
    },
    Connecting {
        target_url: String,
        attempt: u32,
    },
    NoLayoutAssigned {
        device: DeviceSnapshot,
    },
    ServerOffline {
        target_url: String,
        attempt: u32,
        retry_in_secs: u64,
        discovery_active: bool,
    },
}

/// Rendering backend. The production implementation drives the display
/// surface; tests record calls.
pub trait OverlayRenderer: Send + Sync {
    fn render(&self, view: &OverlayView);
    fn clear(&self);
    /// Re-arm the platform watchdog that restores the overlay if the surface
    /// is lost. Called after every successful paint and clear.
    fn restart_watchdog(&self);
}

struct Inner {
    state: OverlayState,
    last_rendered: Option<OverlayView>,
}

pub struct StatusOverlay {
    inner: Mutex<Inner>,
    renderer: Box<dyn OverlayRenderer>,
}

impl StatusOverlay {
    pub fn new(renderer: Box<dyn OverlayRenderer>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: OverlayState::None,
                last_rendered: None,
            }),
            renderer,
        }
    }

    pub fn state(&self) -> OverlayState {
        self.lock().state
    }

    /// Discovery panel. Only entered from idle or re-shown in place; once a
    /// connection attempt has begun, its panels take precedence.
    pub fn show_auto_discovery(&self, device: DeviceSnapshot) {
        let mut inner = self.lock();
        if !matches!(
            inner.state,
            OverlayState::None | OverlayState::AutoDiscovery
        ) {
            return;
        }
        inner.state = OverlayState::AutoDiscovery;
        self.apply(&mut inner, OverlayView::AutoDiscovery { device });
    }

    /// Connecting panel. The state always advances; the repaint itself is
    /// rate-limited by attempt number so long retry runs do not flicker.
    pub fn show_connecting(&self, target_url: String, attempt: u32) {
        let mut inner = self.lock();
        inner.state = OverlayState::Connecting;
        if attempt_redraw_due(attempt) {
            self.apply(&mut inner, OverlayView::Connecting { target_url, attempt });
        }
    }

    pub fn show_no_layout_assigned(&self, device: DeviceSnapshot) {
        let mut inner = self.lock();
        inner.state = OverlayState::NoLayoutAssigned;
        self.apply(&mut inner, OverlayView::NoLayoutAssigned { device });
    }

    /// Offline panel, throttled like the connecting panel. The first wait
    /// paints immediately so the screen never sits on a stale panel after
    /// the first failure.
    pub fn show_server_offline(
        &self,
        target_url: String,
        attempt: u32,
        retry_in_secs: u64,
        discovery_active: bool,
    ) {
        let mut inner = self.lock();
        let entering = inner.state != OverlayState::ServerOffline;
        inner.state = OverlayState::ServerOffline;
        if entering || attempt_redraw_due(attempt) {
            self.apply(
                &mut inner,
                OverlayView::ServerOffline {
                    target_url,
                    attempt,
                    retry_in_secs,
                    discovery_active,
                },
            );
        }
    }

    /// Update the countdown on an offline panel already on screen.
    pub fn update_offline_countdown(&self, retry_in_secs: u64) {
        let mut inner = self.lock();
        if inner.state != OverlayState::ServerOffline {
            return;
        }
        let Some(OverlayView::ServerOffline {
            target_url,
            attempt,
            discovery_active,
            ..
        }) = inner.last_rendered.clone()
        else {
            return;
        };
        self.apply(
            &mut inner,
            OverlayView::ServerOffline {
                target_url,
                attempt,
                retry_in_secs,
                discovery_active,
            },
        );
    }

    /// Remove any panel. Idempotent: clearing an idle overlay touches
    /// nothing.
    pub fn clear(&self) {
        let mut inner = self.lock();
        if inner.state == OverlayState::None && inner.last_rendered.is_none() {
            return;
        }
        inner.state = OverlayState::None;
        inner.last_rendered = None;
        self.renderer.clear();
        self.renderer.restart_watchdog();
        debug!("overlay cleared");
    }

    fn apply(&self, inner: &mut Inner, view: OverlayView) {
        if inner.last_rendered.as_ref() == Some(&view) {
            return;
        }
        self.renderer.render(&view);
        self.renderer.restart_watchdog();
        inner.last_rendered = Some(view);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Repaint the connecting panel on the first attempt and every fifth one.
pub fn attempt_redraw_due(attempt: u32) -> bool {
    attempt <= 1 || attempt % 5 == 0
}

/// Countdown repaint cadence: at the start, every ten seconds, and for the
/// final three seconds.
pub fn countdown_redraw_due(elapsed_secs: u64, total_secs: u64) -> bool {
    let remaining = total_secs.saturating_sub(elapsed_secs);
    elapsed_secs == 0 || elapsed_secs % 10 == 0 || remaining <= 3
}
