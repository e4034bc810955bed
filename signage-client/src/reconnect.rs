//! Reconnection Controller: brings a lost or never-established session back.
//!
//! Two distinct policies:
//!
//! * live reconnect, after a session drops: a fixed escalating schedule
//!   (10/20/30/60/120 seconds, then 120 forever) with a periodic discovery
//!   rescan folded in, running until connected or shut down;
//! * startup connect, before any session existed: short exponential bursts
//!   in batches of five, a long pause between batches, so a display booting
//!   ahead of its server converges quickly once the server appears.
//!
//! All waits are interruptible in one-second steps.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use signage_core::ServerCandidate;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::SettingsStore;
use crate::discovery::DiscoveryResolver;
use crate::gateway::ConnectionGateway;
use crate::overlay::countdown_redraw_due;
use crate::presentation::PresentationSelector;

/// Delay before each live reconnect attempt, indexed by attempt number.
/// The last entry repeats indefinitely.
pub const LIVE_RETRY_SCHEDULE: [u64; 5] = [10, 20, 30, 60, 120];

pub const STARTUP_BATCH_SIZE: u32 = 5;
pub const STARTUP_BATCH_PAUSE: Duration = Duration::from_secs(60);
const STARTUP_BACKOFF_CAP_SECS: u64 = 32;

const WAIT_STEP: Duration = Duration::from_secs(1);

/// Seconds to wait before live attempt `attempt` (1-based).
pub fn retry_delay_secs(attempt: u32) -> u64 {
    let index = (attempt.saturating_sub(1) as usize).min(LIVE_RETRY_SCHEDULE.len() - 1);
    LIVE_RETRY_SCHEDULE[index]
}

/// Discovery rescans run on the first attempt and every fifth one after.
pub fn discovery_due(attempt: u32) -> bool {
    attempt == 1 || attempt % 5 == 0
}

/// Backoff inside a startup batch: 2, 4, 8, 16, 32 seconds, capped.
pub fn startup_backoff_secs(slot: u32) -> u64 {
    let shift = slot.saturating_add(1).min(5);
    (1_u64 << shift).min(STARTUP_BACKOFF_CAP_SECS)
}

/// Source of discovered servers, stubbed out in tests.
pub trait Resolver: Send + Sync {
    fn resolve(&self) -> impl std::future::Future<Output = Option<ServerCandidate>> + Send;
}

impl Resolver for DiscoveryResolver {
    async fn resolve(&self) -> Option<ServerCandidate> {
        self.discover_first().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitOutcome {
    Completed,
    Stopped,
    Connected,
}

pub struct ReconnectController<R: Resolver> {
    gateway: Arc<ConnectionGateway>,
    settings: Arc<SettingsStore>,
    presentation: Arc<PresentationSelector>,
    resolver: R,
    retrying: AtomicBool,
    stop: Arc<AtomicBool>,
}

impl<R: Resolver> ReconnectController<R> {
    pub fn new(
        gateway: Arc<ConnectionGateway>,
        settings: Arc<SettingsStore>,
        presentation: Arc<PresentationSelector>,
        resolver: R,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            gateway,
            settings,
            presentation,
            resolver,
            retrying: AtomicBool::new(false),
            stop,
        }
    }

    pub fn is_retrying(&self) -> bool {
        self.retrying.load(Ordering::Acquire)
    }

    /// Run the live reconnect loop until a session opens or shutdown.
    /// Returns false immediately when a loop is already running; the two
    /// triggers (error event, close event) of the same drop must not stack
    /// retry loops.
    pub async fn run(&self) -> bool {
        if self.retrying.swap(true, Ordering::AcqRel) {
            debug!("reconnect already in progress");
            return false;
        }
        let connected = self.retry_loop().await;
        self.retrying.store(false, Ordering::Release);
        connected
    }

    async fn retry_loop(&self) -> bool {
        self.gateway.mark_reconnecting();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if self.stop.load(Ordering::Acquire) {
                return false;
            }

            let auto_discover = self.settings.snapshot().auto_discover;
            let discovery_active = auto_discover && discovery_due(attempt);
            if discovery_active {
                self.rediscover().await;
            }

            let url = self.settings.server_url();
            self.presentation.show_connecting(url.clone(), attempt);
            info!(attempt, target_url = %url, "reconnect attempt");

            match self.gateway.connect(&url).await {
                Ok(()) => {
                    info!(attempt, "session restored");
                    self.presentation.clear_overlay();
                    return true;
                }
                Err(err) => {
                    warn!(attempt, error = %err, "reconnect attempt failed");
                }
            }

            let delay = retry_delay_secs(attempt);
            self.presentation
                .show_server_offline(url, attempt, delay, discovery_active);
            match self.wait_interruptible(delay, true).await {
                WaitOutcome::Completed => {}
                WaitOutcome::Stopped => return false,
                WaitOutcome::Connected => return true,
            }
        }
    }

    /// Startup connect: batches of short exponential attempts with a long
    /// pause between batches. Never gives up until connected or shut down.
    pub async fn connect_on_startup(&self) -> bool {
        let mut batch: u32 = 0;
        loop {
            batch += 1;
            if self.settings.snapshot().auto_discover {
                self.rediscover().await;
            }

            for slot in 0..STARTUP_BATCH_SIZE {
                if self.stop.load(Ordering::Acquire) {
                    return false;
                }
                let attempt = (batch - 1) * STARTUP_BATCH_SIZE + slot + 1;
                let url = self.settings.server_url();
                self.presentation.show_connecting(url.clone(), attempt);
                info!(attempt, target_url = %url, "startup connect attempt");

                match self.gateway.connect(&url).await {
                    Ok(()) => {
                        info!(attempt, "startup connect succeeded");
                        self.presentation.clear_overlay();
                        return true;
                    }
                    Err(err) => {
                        warn!(attempt, error = %err, "startup connect failed");
                    }
                }

                let delay = startup_backoff_secs(slot);
                self.presentation
                    .show_server_offline(url, attempt, delay, false);
                match self.wait_interruptible(delay, false).await {
                    WaitOutcome::Completed => {}
                    WaitOutcome::Stopped => return false,
                    WaitOutcome::Connected => return true,
                }
            }

            info!(batch, "startup batch exhausted, pausing");
            match self
                .wait_interruptible(STARTUP_BATCH_PAUSE.as_secs(), true)
                .await
            {
                WaitOutcome::Completed => {}
                WaitOutcome::Stopped => return false,
                WaitOutcome::Connected => return true,
            }
        }
    }

    async fn rediscover(&self) {
        debug!("discovery rescan");
        if let Some(candidate) = self.resolver.resolve().await {
            info!(server = %candidate.name, "discovery found a server");
            if let Err(err) = self.settings.apply_candidate(&candidate) {
                warn!(error = %err, "could not persist discovered server");
            }
        }
    }

    /// Wait `total_secs` in one-second steps, bailing out early on shutdown
    /// or if a session opened underneath us. Optionally repaints the
    /// offline countdown at its cadence.
    async fn wait_interruptible(&self, total_secs: u64, countdown: bool) -> WaitOutcome {
        for elapsed in 0..total_secs {
            if self.stop.load(Ordering::Acquire) {
                return WaitOutcome::Stopped;
            }
            if self.gateway.is_connected() {
                return WaitOutcome::Connected;
            }
            if countdown && countdown_redraw_due(elapsed, total_secs) {
                self.presentation
                    .update_offline_countdown(total_secs - elapsed);
            }
            sleep(WAIT_STEP).await;
        }
        if self.stop.load(Ordering::Acquire) {
            WaitOutcome::Stopped
        } else {
            WaitOutcome::Completed
        }
    }
}
