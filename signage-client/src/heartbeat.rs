//! Heartbeat Emitter: periodic liveness beacons for the open session.
//!
//! One beacon per period. The wait is sliced into one-second polls of the
//! stop flag so shutdown latency is bounded regardless of the period. A
//! failed beacon is logged and skipped; the emitter never gives up on its
//! own.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use signage_core::Envelope;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::mailbox::MessageSink;

pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);
const STOP_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct HeartbeatEmitter {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl HeartbeatEmitter {
    /// Spawn the beacon loop. The first beacon goes out after one full
    /// period; the session layer already announced itself via registration.
    pub fn start<S>(sink: Arc<S>, client_id: String, period: Duration) -> Self
    where
        S: MessageSink + Send + Sync + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = tokio::spawn(async move {
            beacon_loop(sink, client_id, period, stop_flag).await;
        });
        Self { stop, handle }
    }

    /// Signal the loop to exit. Returns within one poll interval.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

impl Drop for HeartbeatEmitter {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.handle.abort();
    }
}

async fn beacon_loop<S: MessageSink>(
    sink: Arc<S>,
    client_id: String,
    period: Duration,
    stop: Arc<AtomicBool>,
) {
    loop {
        if !wait_period(period, &stop).await {
            break;
        }
        match sink.send_envelope(&Envelope::heartbeat(&client_id)).await {
            Ok(()) => debug!("heartbeat sent"),
            Err(err) => warn!(error = %err, "heartbeat skipped"),
        }
    }
    debug!("heartbeat emitter stopped");
}

/// Sleep `period` in short slices, checking the stop flag between slices.
/// Returns false when stopped.
async fn wait_period(period: Duration, stop: &AtomicBool) -> bool {
    let mut remaining = period;
    while !remaining.is_zero() {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        let slice = remaining.min(STOP_POLL_INTERVAL);
        sleep(slice).await;
        remaining -= slice;
    }
    !stop.load(Ordering::Acquire)
}
