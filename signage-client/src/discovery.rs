//! Server discovery over the local network.
//!
//! Two probes run per scan: a multicast listen on the advertisement group,
//! and an active UDP broadcast probe. Multicast answers win when both name
//! the same server. Socket failures degrade to an empty result; discovery
//! is advisory and never aborts the caller.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use signage_core::{
    ADVERT_GROUP, ADVERT_PORT, Advertisement, DISCOVERY_PORT, DISCOVERY_REQUEST,
    DiscoveryResponse, ServerCandidate,
};
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(5);

const RECV_BUFFER: usize = 4096;

#[derive(Debug, Clone)]
pub struct DiscoveryResolver {
    scan_timeout: Duration,
}

impl Default for DiscoveryResolver {
    fn default() -> Self {
        Self {
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
        }
    }
}

impl DiscoveryResolver {
    pub fn new(scan_timeout: Duration) -> Self {
        Self { scan_timeout }
    }

    /// First server found, multicast preferred. `None` when the network is
    /// quiet for the whole scan window.
    pub async fn discover_first(&self) -> Option<ServerCandidate> {
        let adverts = self.scan_multicast().await;
        if let Some(first) = adverts.into_iter().next() {
            return Some(first);
        }
        self.scan_broadcast().await.into_iter().next()
    }

    /// Every distinct server seen in one scan window. Servers answering on
    /// both channels appear once, with the multicast advertisement kept.
    pub async fn discover_all(&self) -> Vec<ServerCandidate> {
        let mut by_name: HashMap<String, ServerCandidate> = HashMap::new();
        for candidate in self.scan_broadcast().await {
            by_name.insert(candidate.name.clone(), candidate);
        }
        for candidate in self.scan_multicast().await {
            by_name.insert(candidate.name.clone(), candidate);
        }
        let mut all: Vec<ServerCandidate> = by_name.into_values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Passive listen on the multicast advertisement group.
    async fn scan_multicast(&self) -> Vec<ServerCandidate> {
        let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, ADVERT_PORT)).await {
            Ok(socket) => socket,
            Err(err) => {
                warn!(error = %err, "multicast listen unavailable");
                return Vec::new();
            }
        };
        if let Err(err) = socket.join_multicast_v4(ADVERT_GROUP, Ipv4Addr::UNSPECIFIED) {
            warn!(error = %err, group = %ADVERT_GROUP, "multicast join failed");
            return Vec::new();
        }

        collect_candidates(&socket, self.scan_timeout, |payload, source| {
            let advert: Advertisement = serde_json::from_slice(payload).ok()?;
            advert.into_candidate(source.ip()).ok()
        })
        .await
    }

    /// Active probe: broadcast the discovery request, then collect replies
    /// for the rest of the scan window.
    async fn scan_broadcast(&self) -> Vec<ServerCandidate> {
        let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
            Ok(socket) => socket,
            Err(err) => {
                warn!(error = %err, "broadcast probe socket unavailable");
                return Vec::new();
            }
        };
        if let Err(err) = socket.set_broadcast(true) {
            warn!(error = %err, "broadcast flag rejected");
            return Vec::new();
        }

        let target = SocketAddr::from((Ipv4Addr::BROADCAST, DISCOVERY_PORT));
        if let Err(err) = socket.send_to(DISCOVERY_REQUEST.as_bytes(), target).await {
            warn!(error = %err, "discovery probe send failed");
            return Vec::new();
        }
        debug!(port = DISCOVERY_PORT, "discovery probe broadcast");

        collect_candidates(&socket, self.scan_timeout, |payload, source| {
            let response: DiscoveryResponse = serde_json::from_slice(payload).ok()?;
            response.into_candidate(source.ip()).ok()
        })
        .await
    }
}

async fn collect_candidates<F>(
    socket: &UdpSocket,
    window: Duration,
    parse: F,
) -> Vec<ServerCandidate>
where
    F: Fn(&[u8], SocketAddr) -> Option<ServerCandidate>,
{
    let deadline = Instant::now() + window;
    let mut buf = vec![0_u8; RECV_BUFFER];
    let mut found = Vec::new();

    loop {
        match timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, source))) => match parse(&buf[..len], source) {
                Some(candidate) => {
                    debug!(server = %candidate.name, source = %source, "server discovered");
                    if !found
                        .iter()
                        .any(|known: &ServerCandidate| known.name == candidate.name)
                    {
                        found.push(candidate);
                    }
                }
                None => {
                    debug!(source = %source, "ignoring unrecognized datagram");
                }
            },
            Ok(Err(err)) => {
                warn!(error = %err, "discovery receive failed");
                break;
            }
            Err(_) => break, // scan window elapsed
        }
    }
    found
}

/// Best-effort local addresses for overlay display. Probes a routing
/// decision without sending traffic.
pub fn local_addresses() -> Vec<IpAddr> {
    let Ok(socket) = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)) else {
        return Vec::new();
    };
    if socket.connect((Ipv4Addr::new(8, 8, 8, 8), 53)).is_err() {
        return Vec::new();
    }
    match socket.local_addr() {
        Ok(addr) => vec![addr.ip()],
        Err(_) => Vec::new(),
    }
}
