//! Session orchestration: ties the transport, mailbox, heartbeat and
//! overlay together around the gateway's event stream.
//!
//! On open: register, flush the mailbox, start the heartbeat. On drop: stop
//! the heartbeat and hand control to the reconnection controller. Incoming
//! messages are decoded and dispatched here; an undecodable message is
//! logged and dropped, never fatal.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use signage_core::{Envelope, UpdateConfig, decode_envelope};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::SettingsStore;
use crate::discovery::{DiscoveryResolver, local_addresses};
use crate::gateway::{ConnectionGateway, GatewayEvent, SendError};
use crate::heartbeat::{HEARTBEAT_PERIOD, HeartbeatEmitter};
use crate::mailbox::OutboundMailbox;
use crate::overlay::{DeviceSnapshot, OverlayState, StatusOverlay};
use crate::presentation::PresentationSelector;
use crate::reconnect::ReconnectController;

/// How long after an accepted registration the display waits for content
/// before concluding no layout is assigned to it.
pub const REGISTRATION_GRACE: Duration = Duration::from_secs(10);

pub struct Session {
    gateway: Arc<ConnectionGateway>,
    settings: Arc<SettingsStore>,
    mailbox: Arc<OutboundMailbox>,
    presentation: Arc<PresentationSelector>,
    overlay: Arc<StatusOverlay>,
    reconnect: Arc<ReconnectController<DiscoveryResolver>>,
    content_received: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    heartbeat: Mutex<Option<HeartbeatEmitter>>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<ConnectionGateway>,
        settings: Arc<SettingsStore>,
        mailbox: Arc<OutboundMailbox>,
        presentation: Arc<PresentationSelector>,
        overlay: Arc<StatusOverlay>,
        reconnect: Arc<ReconnectController<DiscoveryResolver>>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            gateway,
            settings,
            mailbox,
            presentation,
            overlay,
            reconnect,
            content_received: Arc::new(AtomicBool::new(false)),
            stop,
            heartbeat: Mutex::new(None),
        }
    }

    fn device_snapshot(&self) -> DeviceSnapshot {
        let settings = self.settings.snapshot();
        DeviceSnapshot {
            client_id: settings.client_id,
            display_name: settings.display_name,
            addresses: local_addresses(),
        }
    }

    /// Main loop: establish the first session, then react to transport
    /// events until shutdown.
    pub async fn run(self: Arc<Self>, mut events: UnboundedReceiver<GatewayEvent>) {
        if self.settings.snapshot().auto_discover {
            self.presentation.show_auto_discovery(self.device_snapshot());
        }
        if !self.reconnect.connect_on_startup().await {
            info!("shutdown before first session");
            return;
        }

        while let Some(event) = events.recv().await {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            match event {
                GatewayEvent::Opened => self.on_opened().await,
                GatewayEvent::MessageReceived(text) => self.handle_message(&text).await,
                GatewayEvent::Errored(reason) => {
                    warn!(reason, "session error");
                    self.on_dropped().await;
                }
                GatewayEvent::Closed { code, reason } => {
                    info!(?code, reason, "session closed");
                    self.on_dropped().await;
                }
            }
        }
        self.stop_heartbeat();
        debug!("session loop ended");
    }

    async fn on_opened(&self) {
        let settings = self.settings.snapshot();
        let register = Envelope::register(
            &settings.client_id,
            &settings.display_name,
            settings.registration_token.clone(),
        );
        // Registration goes first on every new session, ahead of any
        // backlog.
        if let Err(err) = self.gateway.send(&register).await {
            warn!(error = %err, "registration send failed");
        }

        let outcome = self.mailbox.flush(self.gateway.as_ref()).await;
        if outcome.sent > 0 || outcome.requeued > 0 {
            info!(sent = outcome.sent, requeued = outcome.requeued, "mailbox replayed");
        }

        self.start_heartbeat(settings.client_id);
    }

    async fn on_dropped(&self) {
        self.stop_heartbeat();
        if self.stop.load(Ordering::Acquire) {
            return;
        }
        // Drops surface as an error event and a close event; the second of
        // the pair finds the session already restored and does nothing.
        if self.gateway.is_connected() {
            return;
        }
        self.reconnect.run().await;
    }

    fn start_heartbeat(&self, client_id: String) {
        let emitter = HeartbeatEmitter::start(
            Arc::clone(&self.gateway),
            client_id,
            HEARTBEAT_PERIOD,
        );
        let mut slot = self.heartbeat_slot();
        if let Some(old) = slot.replace(emitter) {
            old.stop();
        }
    }

    fn stop_heartbeat(&self) {
        if let Some(emitter) = self.heartbeat_slot().take() {
            emitter.stop();
        }
    }

    fn heartbeat_slot(&self) -> std::sync::MutexGuard<'_, Option<HeartbeatEmitter>> {
        self.heartbeat
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Decode and dispatch one incoming message.
    pub async fn handle_message(&self, text: &str) {
        let envelope = match decode_envelope(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "dropping incoming message");
                return;
            }
        };
        debug!(message_type = envelope.type_name(), "message received");

        match envelope {
            Envelope::RegistrationResponse(response) => {
                if !response.accepted {
                    warn!("registration rejected by server");
                    return;
                }
                info!(
                    display_group = ?response.display_group,
                    location = ?response.location,
                    "registration accepted"
                );
                if let Err(err) = self.settings.apply_registration(&response) {
                    warn!(error = %err, "could not persist registration details");
                }
                self.arm_no_layout_grace();
            }
            Envelope::DisplayUpdate(update) => {
                info!(layout_id = ?update.layout_id, "display update received");
                self.content_received.store(true, Ordering::Release);
                if self.overlay.state() == OverlayState::NoLayoutAssigned {
                    self.presentation.clear_overlay();
                }
            }
            Envelope::Command(command) => {
                info!(command = %command.command, "command received");
                let report = self.build_status_report();
                self.send_or_queue(report).await;
            }
            Envelope::UpdateConfig(update) => {
                let (applied, message) = self.apply_config_update(&update);
                let client_id = self.settings.snapshot().client_id;
                self.send_or_queue(Envelope::update_config_response(
                    &client_id, applied, message,
                ))
                .await;
            }
            other => {
                debug!(message_type = other.type_name(), "ignoring message");
            }
        }
    }

    /// After registration, give the server a grace window to deliver
    /// content before showing the no-layout panel.
    fn arm_no_layout_grace(&self) {
        self.content_received.store(false, Ordering::Release);
        let content_received = Arc::clone(&self.content_received);
        let stop = Arc::clone(&self.stop);
        let gateway = Arc::clone(&self.gateway);
        let settings = Arc::clone(&self.settings);
        let presentation = Arc::clone(&self.presentation);
        tokio::spawn(async move {
            sleep(REGISTRATION_GRACE).await;
            if stop.load(Ordering::Acquire) || content_received.load(Ordering::Acquire) {
                return;
            }
            // A session lost during the window owns the screen now; the
            // reconnection panels must not be painted over.
            if !gateway.is_connected() {
                return;
            }
            info!("no layout delivered after registration");
            let snapshot = settings.snapshot();
            presentation.show_no_layout_assigned(DeviceSnapshot {
                client_id: snapshot.client_id,
                display_name: snapshot.display_name,
                addresses: local_addresses(),
            });
        });
    }

    fn build_status_report(&self) -> Envelope {
        let settings = self.settings.snapshot();
        let report = serde_json::json!({
            "connection_state": format!("{:?}", self.gateway.state()),
            "display_name": settings.display_name,
            "display_group": settings.display_group,
            "location": settings.location,
            "has_content": self.content_received.load(Ordering::Acquire),
            "overlay": format!("{:?}", self.overlay.state()),
        });
        Envelope::status_report(&settings.client_id, report)
    }

    /// Apply recognized keys from a remote config push. Unknown keys are
    /// ignored so old clients tolerate newer servers.
    fn apply_config_update(&self, update: &UpdateConfig) -> (bool, Option<String>) {
        let Some(object) = update.config.as_object() else {
            return (false, Some("config payload is not an object".to_owned()));
        };

        let object = object.clone();
        let result = self.settings.update(|settings| {
            if let Some(name) = object.get("display_name").and_then(|v| v.as_str()) {
                settings.display_name = name.to_owned();
            }
            if let Some(auto) = object.get("auto_discover").and_then(|v| v.as_bool()) {
                settings.auto_discover = auto;
            }
            if let Some(cached) = object
                .get("show_cached_layout_on_disconnect")
                .and_then(|v| v.as_bool())
            {
                settings.show_cached_layout_on_disconnect = cached;
            }
            if let Some(timeout) = object.get("discovery_timeout").and_then(|v| v.as_u64()) {
                settings.discovery_timeout_secs = timeout;
            }
        });

        match result {
            Ok(()) => (true, None),
            Err(err) => {
                warn!(error = %err, "config update could not be persisted");
                (false, Some(err.to_string()))
            }
        }
    }

    /// Deliver now if connected, otherwise hold in the mailbox. Messages
    /// that cannot serialize are dropped with an error log.
    pub async fn send_or_queue(&self, envelope: Envelope) {
        match self.gateway.send(&envelope).await {
            Ok(()) => {}
            Err(SendError::Encode(err)) => {
                error!(error = %err, "unsendable message dropped");
            }
            Err(SendError::NotConnected) | Err(SendError::Transport(_)) => {
                self.mailbox.enqueue(envelope);
            }
        }
    }

    /// Forward a log record to the server, queueing it when offline.
    pub async fn ship_log(&self, level: &str, message: String) {
        let client_id = self.settings.snapshot().client_id;
        self.send_or_queue(Envelope::log(&client_id, level, message))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ConnectionState;
    use crate::overlay::tests::RecordingRenderer;
    use crate::presentation::PresentationMode;
    use signage_core::now_timestamp;
    use tokio::time::advance;

    fn session() -> (Arc<Session>, tempfile::TempDir) {
        let (gateway, _events) = ConnectionGateway::new();
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(SettingsStore::load_or_default(dir.path()));
        let overlay = Arc::new(StatusOverlay::new(Box::new(RecordingRenderer::default())));
        let presentation = Arc::new(PresentationSelector::new(
            PresentationMode::OverlaySequence,
            Arc::clone(&overlay),
        ));
        let stop = Arc::new(AtomicBool::new(false));
        let reconnect = Arc::new(ReconnectController::new(
            Arc::clone(&gateway),
            Arc::clone(&settings),
            Arc::clone(&presentation),
            DiscoveryResolver::default(),
            Arc::clone(&stop),
        ));
        let session = Arc::new(Session::new(
            gateway,
            settings,
            Arc::new(OutboundMailbox::new()),
            presentation,
            overlay,
            reconnect,
            stop,
        ));
        (session, dir)
    }

    #[tokio::test]
    async fn undecodable_message_is_dropped() {
        let (session, _dir) = session();
        session.handle_message("not json at all").await;
        session.handle_message(r#"{"Type":"NO_SUCH_TYPE"}"#).await;
        assert!(session.mailbox.is_empty());
    }

    #[tokio::test]
    async fn display_update_clears_no_layout_panel() {
        let (session, _dir) = session();
        session
            .presentation
            .show_no_layout_assigned(session.device_snapshot());
        assert_eq!(session.overlay.state(), OverlayState::NoLayoutAssigned);

        let update = serde_json::json!({
            "Type": "DISPLAY_UPDATE",
            "ClientId": "server",
            "Timestamp": now_timestamp(),
            "LayoutId": "layout-7",
        });
        session.handle_message(&update.to_string()).await;

        assert_eq!(session.overlay.state(), OverlayState::None);
        assert!(session.content_received.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn command_reply_queues_while_disconnected() {
        let (session, _dir) = session();
        let command = serde_json::json!({
            "Type": "COMMAND",
            "ClientId": "server",
            "Timestamp": now_timestamp(),
            "Command": "report_status",
        });
        session.handle_message(&command.to_string()).await;
        assert_eq!(session.mailbox.len(), 1);
    }

    #[tokio::test]
    async fn config_push_applies_known_keys() {
        let (session, _dir) = session();
        let push = serde_json::json!({
            "Type": "UPDATE_CONFIG",
            "ClientId": "server",
            "Timestamp": now_timestamp(),
            "Config": {
                "display_name": "Atrium North",
                "show_cached_layout_on_disconnect": true,
                "discovery_timeout": 8,
                "unknown_future_key": 42,
            },
        });
        session.handle_message(&push.to_string()).await;

        let snapshot = session.settings.snapshot();
        assert_eq!(snapshot.display_name, "Atrium North");
        assert!(snapshot.show_cached_layout_on_disconnect);
        assert_eq!(snapshot.discovery_timeout_secs, 8);
        // response to the push is held for reconnect
        assert_eq!(session.mailbox.len(), 1);
    }

    fn accepted_registration() -> String {
        serde_json::json!({
            "Type": "REGISTRATION_RESPONSE",
            "ClientId": "server",
            "Timestamp": now_timestamp(),
            "Accepted": true,
        })
        .to_string()
    }

    fn display_update() -> String {
        serde_json::json!({
            "Type": "DISPLAY_UPDATE",
            "ClientId": "server",
            "Timestamp": now_timestamp(),
            "LayoutId": "layout-1",
        })
        .to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn content_inside_grace_window_suppresses_no_layout_panel() {
        let (session, _dir) = session();
        session.gateway.force_state(ConnectionState::Connected);
        session.handle_message(&accepted_registration()).await;
        tokio::task::yield_now().await;

        advance(Duration::from_secs(4)).await;
        session.handle_message(&display_update()).await;

        advance(REGISTRATION_GRACE + Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert_eq!(session.overlay.state(), OverlayState::None);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_grace_window_shows_no_layout_panel() {
        let (session, _dir) = session();
        session.gateway.force_state(ConnectionState::Connected);
        session.handle_message(&accepted_registration()).await;
        tokio::task::yield_now().await;

        advance(REGISTRATION_GRACE + Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(session.overlay.state(), OverlayState::NoLayoutAssigned);
    }

    #[tokio::test(start_paused = true)]
    async fn grace_timer_defers_to_a_dropped_session() {
        let (session, _dir) = session();
        session.gateway.force_state(ConnectionState::Connected);
        session.handle_message(&accepted_registration()).await;
        tokio::task::yield_now().await;

        // The session drops mid-window; the retry loop owns the screen.
        session.gateway.force_state(ConnectionState::Reconnecting);
        advance(REGISTRATION_GRACE + Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(session.overlay.state(), OverlayState::None);
    }

    #[tokio::test]
    async fn rejected_registration_changes_nothing() {
        let (session, _dir) = session();
        let rejection = serde_json::json!({
            "Type": "REGISTRATION_RESPONSE",
            "ClientId": "server",
            "Timestamp": now_timestamp(),
            "Accepted": false,
            "DisplayGroup": "lobby",
        });
        session.handle_message(&rejection.to_string()).await;
        assert_eq!(session.settings.snapshot().display_group, None);
    }
}
