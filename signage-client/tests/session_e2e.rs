use std::sync::{Arc, atomic::AtomicBool};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use signage_core::{Envelope, deflate_text};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message};

use signage_client::config::SettingsStore;
use signage_client::discovery::DiscoveryResolver;
use signage_client::gateway::{ConnectionGateway, GatewayEvent};
use signage_client::mailbox::OutboundMailbox;
use signage_client::overlay::{OverlayRenderer, OverlayView, StatusOverlay};
use signage_client::presentation::{PresentationMode, PresentationSelector};
use signage_client::reconnect::ReconnectController;
use signage_client::session::Session;

struct NullRenderer;

impl OverlayRenderer for NullRenderer {
    fn render(&self, _view: &OverlayView) {}
    fn clear(&self) {}
    fn restart_watchdog(&self) {}
}

/// One-connection echo-less server: every inbound text frame is forwarded
/// to the test through a channel; frames queued on `to_client` are pushed
/// to the client.
async fn start_server() -> (String, mpsc::UnboundedReceiver<String>, mpsc::UnboundedSender<Message>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("local addr");
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let (to_client_tx, mut to_client_rx) = mpsc::unbounded_channel::<Message>();

    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(socket) = accept_async(stream).await else {
            return;
        };
        let (mut write, mut read) = socket.split();
        loop {
            tokio::select! {
                inbound = read.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        let _ = frames_tx.send(text.to_string());
                    }
                    Some(Ok(_)) => {}
                    _ => break,
                },
                outbound = to_client_rx.recv() => match outbound {
                    Some(message) => {
                        if write.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });

    (format!("ws://{address}/display"), frames_rx, to_client_tx)
}

async fn recv_frame(frames: &mut mpsc::UnboundedReceiver<String>) -> Value {
    let text = timeout(Duration::from_secs(2), frames.recv())
        .await
        .expect("frame within deadline")
        .expect("server channel open");
    serde_json::from_str(&text).expect("frame is JSON")
}

fn frame_type(frame: &Value) -> String {
    frame["Type"].as_str().expect("Type field").to_owned()
}

#[tokio::test]
async fn queued_messages_flush_in_order_after_connect() {
    let (url, mut frames, _to_client) = start_server().await;

    let mailbox = OutboundMailbox::new();
    mailbox.enqueue(Envelope::log("d1", "warn", "offline event 1".to_owned()));
    mailbox.enqueue(Envelope::log("d1", "warn", "offline event 2".to_owned()));
    mailbox.enqueue(Envelope::status_report("d1", serde_json::json!({"n": 3})));

    let (gateway, _events) = ConnectionGateway::new();
    gateway.connect(&url).await.expect("connect");

    let outcome = mailbox.flush(gateway.as_ref()).await;
    assert_eq!(outcome.sent, 3);
    assert_eq!(outcome.requeued, 0);

    gateway
        .send(&Envelope::heartbeat("d1"))
        .await
        .expect("live send");

    let first = recv_frame(&mut frames).await;
    assert_eq!(frame_type(&first), "LOG");
    assert_eq!(first["Message"], "offline event 1");
    let second = recv_frame(&mut frames).await;
    assert_eq!(second["Message"], "offline event 2");
    assert_eq!(frame_type(&recv_frame(&mut frames).await), "STATUS_REPORT");
    assert_eq!(frame_type(&recv_frame(&mut frames).await), "HEARTBEAT");
}

#[tokio::test]
async fn bad_binary_frame_does_not_kill_the_session() {
    let (url, mut frames, to_client) = start_server().await;

    let (gateway, mut events) = ConnectionGateway::new();
    gateway.connect(&url).await.expect("connect");
    match events.recv().await {
        Some(GatewayEvent::Opened) => {}
        other => panic!("expected Opened, got {other:?}"),
    }

    // Gzip magic but truncated garbage, then a valid compressed message.
    to_client
        .send(Message::Binary(vec![0x1F, 0x8B, 0xFF, 0x00].into()))
        .expect("push bad frame");
    let valid = deflate_text(r#"{"Type":"COMMAND","ClientId":"s","Timestamp":"t","Command":"noop"}"#)
        .expect("compress");
    to_client
        .send(Message::Binary(valid.into()))
        .expect("push good frame");

    let received = timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event within deadline");
    match received {
        Some(GatewayEvent::MessageReceived(text)) => {
            assert!(text.contains("\"COMMAND\""));
        }
        other => panic!("expected the valid frame, got {other:?}"),
    }

    // Session is still usable after the bad frame.
    gateway
        .send(&Envelope::heartbeat("d1"))
        .await
        .expect("send after bad frame");
    assert_eq!(frame_type(&recv_frame(&mut frames).await), "HEARTBEAT");
}

#[tokio::test]
async fn concurrent_producers_never_interleave_frames() {
    let (url, mut frames, _to_client) = start_server().await;

    let (gateway, _events) = ConnectionGateway::new();
    gateway.connect(&url).await.expect("connect");

    let mut tasks = Vec::new();
    for producer in 0..3_u32 {
        let gateway = Arc::clone(&gateway);
        tasks.push(tokio::spawn(async move {
            for n in 0..10_u32 {
                let message = format!("producer {producer} message {n}");
                gateway
                    .send(&Envelope::log("d1", "info", message))
                    .await
                    .expect("concurrent send");
            }
        }));
    }
    for task in tasks {
        task.await.expect("producer task");
    }

    for _ in 0..30 {
        let frame = recv_frame(&mut frames).await;
        assert_eq!(frame_type(&frame), "LOG");
        assert!(frame["Message"].as_str().unwrap().starts_with("producer "));
    }
}

fn build_session(
    dir: &tempfile::TempDir,
    url: &str,
) -> (Arc<Session>, tokio::sync::mpsc::UnboundedReceiver<GatewayEvent>, Arc<AtomicBool>, Arc<ConnectionGateway>) {
    let parsed = url::Url::parse(url).expect("test url");
    let settings = Arc::new(SettingsStore::load_or_default(dir.path()));
    settings
        .update(|settings| {
            settings.client_id = "display-e2e".to_owned();
            settings.display_name = "E2E Display".to_owned();
            settings.auto_discover = false;
            settings.server_host = parsed.host_str().expect("host").to_owned();
            settings.port = parsed.port().expect("port");
            settings.use_ssl = false;
            settings.endpoint_path = parsed.path().to_owned();
        })
        .expect("seed settings");

    let overlay = Arc::new(StatusOverlay::new(Box::new(NullRenderer)));
    let presentation = Arc::new(PresentationSelector::new(
        PresentationMode::OverlaySequence,
        Arc::clone(&overlay),
    ));
    let (gateway, events) = ConnectionGateway::new();
    let stop = Arc::new(AtomicBool::new(false));
    let reconnect = Arc::new(ReconnectController::new(
        Arc::clone(&gateway),
        Arc::clone(&settings),
        Arc::clone(&presentation),
        DiscoveryResolver::default(),
        Arc::clone(&stop),
    ));
    let session = Arc::new(Session::new(
        Arc::clone(&gateway),
        settings,
        Arc::new(OutboundMailbox::new()),
        presentation,
        overlay,
        reconnect,
        Arc::clone(&stop),
    ));
    (session, events, stop, gateway)
}

#[tokio::test]
async fn full_session_registers_first_then_answers_config_push() {
    let (url, mut frames, to_client) = start_server().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let (session, events, stop, gateway) = build_session(&dir, &url);

    let session_task = tokio::spawn(Arc::clone(&session).run(events));

    let first = recv_frame(&mut frames).await;
    assert_eq!(frame_type(&first), "REGISTER");
    assert_eq!(first["ClientId"], "display-e2e");
    assert_eq!(first["DisplayName"], "E2E Display");

    let push = serde_json::json!({
        "Type": "UPDATE_CONFIG",
        "ClientId": "server",
        "Timestamp": "2026-01-01T00:00:00.000Z",
        "Config": { "display_name": "Renamed Display" },
    });
    to_client
        .send(Message::Text(push.to_string().into()))
        .expect("push config");

    let reply = recv_frame(&mut frames).await;
    assert_eq!(frame_type(&reply), "UPDATE_CONFIG_RESPONSE");
    assert_eq!(reply["Applied"], true);

    stop.store(true, std::sync::atomic::Ordering::Release);
    gateway.close().await;
    let _ = timeout(Duration::from_secs(2), session_task).await;
}
