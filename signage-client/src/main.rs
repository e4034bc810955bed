use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::fmt::MakeWriter;
use url::Url;

use signage_client::config::{SettingsStore, config_dir};
use signage_client::discovery::DiscoveryResolver;
use signage_client::gateway::ConnectionGateway;
use signage_client::mailbox::OutboundMailbox;
use signage_client::overlay::{OverlayRenderer, OverlayView, StatusOverlay};
use signage_client::presentation::{PresentationMode, PresentationSelector};
use signage_client::reconnect::ReconnectController;
use signage_client::session::Session;

#[derive(Parser, Debug)]
#[command(name = "signage-client", about = "Digital signage display client")]
struct ClientArgs {
    /// Directory holding config.json.
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Connect to this ws:// or wss:// URL instead of the configured or
    /// discovered server.
    #[arg(long)]
    server_url: Option<String>,

    /// Skip network discovery for this run.
    #[arg(long)]
    no_discover: bool,

    /// Append logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(Clone)]
struct FileMakeWriter {
    file: Arc<Mutex<File>>,
}

struct FileWriterGuard {
    file: Arc<Mutex<File>>,
}

impl Write for FileWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.flush()
    }
}

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = FileWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        FileWriterGuard {
            file: Arc::clone(&self.file),
        }
    }
}

fn init_logging(log_file: Option<&PathBuf>) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let Some(log_path) = log_file else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
        return;
    };

    let file = match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("failed to open log file {}: {err}", log_path.display());
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
            return;
        }
    };

    let make_writer = FileMakeWriter {
        file: Arc::new(Mutex::new(file)),
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(make_writer)
        .init();
}

/// Renderer used when no display surface is wired up: panels go to the log
/// so headless runs and service deployments still expose the state.
struct LogOverlayRenderer;

impl OverlayRenderer for LogOverlayRenderer {
    fn render(&self, view: &OverlayView) {
        match view {
            OverlayView::AutoDiscovery { device } => {
                info!(
                    client_id = %device.client_id,
                    display_name = %device.display_name,
                    "overlay: searching for a server"
                );
            }
            OverlayView::Connecting { target_url, attempt } => {
                info!(%target_url, attempt, "overlay: connecting");
            }
            OverlayView::NoLayoutAssigned { device } => {
                info!(
                    client_id = %device.client_id,
                    "overlay: registered, no layout assigned"
                );
            }
            OverlayView::ServerOffline {
                target_url,
                attempt,
                retry_in_secs,
                discovery_active,
            } => {
                info!(
                    %target_url,
                    attempt,
                    retry_in_secs,
                    discovery_active,
                    "overlay: server offline"
                );
            }
        }
    }

    fn clear(&self) {
        info!("overlay: cleared");
    }

    fn restart_watchdog(&self) {}
}

/// Push a `--server-url` override into the settings so every layer sees the
/// same connection target.
fn apply_server_url_override(settings: &SettingsStore, raw: &str) -> bool {
    let parsed = match Url::parse(raw) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(url = raw, error = %err, "ignoring invalid --server-url");
            return false;
        }
    };
    if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
        warn!(url = raw, "ignoring --server-url: scheme must be ws or wss");
        return false;
    }
    let Some(host) = parsed.host_str().map(str::to_owned) else {
        warn!(url = raw, "ignoring --server-url: no host");
        return false;
    };
    let use_ssl = parsed.scheme() == "wss";
    let port = parsed.port().unwrap_or(if use_ssl { 443 } else { 80 });
    let path = parsed.path().to_owned();

    let result = settings.update(|settings| {
        settings.server_host = host;
        settings.port = port;
        settings.use_ssl = use_ssl;
        settings.endpoint_path = path;
        settings.auto_discover = false;
    });
    if let Err(err) = result {
        warn!(error = %err, "could not persist --server-url override");
    }
    true
}

#[tokio::main]
async fn main() {
    let args = ClientArgs::parse();
    init_logging(args.log_file.as_ref());

    let dir = config_dir(args.config_dir.clone());
    info!(config_dir = %dir.display(), "starting");

    let settings = Arc::new(SettingsStore::load_or_default(&dir));
    if let Some(raw) = args.server_url.as_deref() {
        apply_server_url_override(&settings, raw);
    }
    if args.no_discover {
        let _ = settings.update(|settings| settings.auto_discover = false);
    }

    let snapshot = settings.snapshot();
    info!(client_id = %snapshot.client_id, "display identity loaded");

    let overlay = Arc::new(StatusOverlay::new(Box::new(LogOverlayRenderer)));
    let presentation = Arc::new(PresentationSelector::new(
        PresentationMode::from_settings(snapshot.show_cached_layout_on_disconnect),
        Arc::clone(&overlay),
    ));

    let (gateway, events) = ConnectionGateway::new();
    let stop = Arc::new(AtomicBool::new(false));
    let resolver = DiscoveryResolver::new(Duration::from_secs(snapshot.discovery_timeout_secs));
    let reconnect = Arc::new(ReconnectController::new(
        Arc::clone(&gateway),
        Arc::clone(&settings),
        Arc::clone(&presentation),
        resolver,
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

    let session_task = tokio::spawn(Arc::clone(&session).run(events));

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "shutdown signal listener failed");
    }
    info!("shutting down");
    stop.store(true, Ordering::Release);
    gateway.close().await;

    let _ = session_task.await;
    info!("stopped");
}
