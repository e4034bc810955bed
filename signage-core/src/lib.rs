//! Wire protocol for the signage control channel.
//!
//! Messages are JSON objects whose `Type` field selects the variant. Binary
//! frames may arrive gzip-compressed; compression is detected by the two-byte
//! magic prefix and inflated transparently before dispatch. This crate also
//! defines the discovery protocol message shapes (UDP broadcast
//! request/response and multicast service advertisements) and the
//! [`ServerCandidate`] they resolve to.

use std::io::{Read, Write};
use std::net::IpAddr;

use chrono::{SecondsFormat, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Two-byte gzip magic prefix on compressed binary frames.
pub const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// Well-known UDP port for broadcast discovery.
pub const DISCOVERY_PORT: u16 = 5555;
/// Literal request token sent to the subnet broadcast address.
pub const DISCOVERY_REQUEST: &str = "DIGITALSIGNAGE_DISCOVER";
/// `Type` value a valid broadcast discovery response must carry.
pub const DISCOVERY_SERVER_TYPE: &str = "DIGITALSIGNAGE_SERVER";

/// Multicast group servers advertise themselves on.
pub const ADVERT_GROUP: std::net::Ipv4Addr = std::net::Ipv4Addr::new(239, 255, 90, 90);
/// UDP port of the multicast advertisement channel.
pub const ADVERT_PORT: u16 = 5556;
/// Service type string identifying the application in advertisements.
pub const ADVERT_SERVICE: &str = "digitalsignage._display._tcp";

pub type ClientId = String;

/// Current time as an ISO-8601 UTC timestamp, the format every envelope
/// `Timestamp` field carries.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Register {
    pub client_id: ClientId,
    pub timestamp: String,
    pub display_name: String,
    #[serde(default)]
    pub registration_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct RegistrationResponse {
    pub client_id: ClientId,
    pub timestamp: String,
    pub accepted: bool,
    #[serde(default)]
    pub display_group: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct DisplayUpdate {
    pub client_id: ClientId,
    pub timestamp: String,
    #[serde(default)]
    pub layout_id: Option<String>,
    #[serde(default)]
    pub layout: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Command {
    pub client_id: ClientId,
    pub timestamp: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Heartbeat {
    pub client_id: ClientId,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateConfig {
    pub client_id: ClientId,
    pub timestamp: String,
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateConfigResponse {
    pub client_id: ClientId,
    pub timestamp: String,
    pub applied: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct LogRecord {
    pub client_id: ClientId,
    pub timestamp: String,
    pub level: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct StatusReport {
    pub client_id: ClientId,
    pub timestamp: String,
    pub report: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Screenshot {
    pub client_id: ClientId,
    pub timestamp: String,
    /// Base64-encoded image produced by the capture layer.
    pub image: String,
}

/// The wire message envelope. `Type` on the wire selects the variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "Type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Envelope {
    Register(Register),
    RegistrationResponse(RegistrationResponse),
    DisplayUpdate(DisplayUpdate),
    Command(Command),
    Heartbeat(Heartbeat),
    UpdateConfig(UpdateConfig),
    UpdateConfigResponse(UpdateConfigResponse),
    Log(LogRecord),
    StatusReport(StatusReport),
    Screenshot(Screenshot),
}

impl Envelope {
    pub fn register(client_id: &str, display_name: &str, token: Option<String>) -> Self {
        Envelope::Register(Register {
            client_id: client_id.to_owned(),
            timestamp: now_timestamp(),
            display_name: display_name.to_owned(),
            registration_token: token,
        })
    }

    pub fn heartbeat(client_id: &str) -> Self {
        Envelope::Heartbeat(Heartbeat {
            client_id: client_id.to_owned(),
            timestamp: now_timestamp(),
        })
    }

    pub fn log(client_id: &str, level: &str, message: String) -> Self {
        Envelope::Log(LogRecord {
            client_id: client_id.to_owned(),
            timestamp: now_timestamp(),
            level: level.to_owned(),
            message,
        })
    }

    pub fn status_report(client_id: &str, report: serde_json::Value) -> Self {
        Envelope::StatusReport(StatusReport {
            client_id: client_id.to_owned(),
            timestamp: now_timestamp(),
            report,
        })
    }

    pub fn update_config_response(client_id: &str, applied: bool, message: Option<String>) -> Self {
        Envelope::UpdateConfigResponse(UpdateConfigResponse {
            client_id: client_id.to_owned(),
            timestamp: now_timestamp(),
            applied,
            message,
        })
    }

    /// Wire name of this variant, for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Envelope::Register(_) => "REGISTER",
            Envelope::RegistrationResponse(_) => "REGISTRATION_RESPONSE",
            Envelope::DisplayUpdate(_) => "DISPLAY_UPDATE",
            Envelope::Command(_) => "COMMAND",
            Envelope::Heartbeat(_) => "HEARTBEAT",
            Envelope::UpdateConfig(_) => "UPDATE_CONFIG",
            Envelope::UpdateConfigResponse(_) => "UPDATE_CONFIG_RESPONSE",
            Envelope::Log(_) => "LOG",
            Envelope::StatusReport(_) => "STATUS_REPORT",
            Envelope::Screenshot(_) => "SCREENSHOT",
        }
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("malformed JSON message: {0}")]
    MalformedJson(String),
    #[error("message has no Type field")]
    MissingType,
    #[error("unknown message type {0:?}")]
    UnknownMessageType(String),
    #[error("gzip inflation failed: {0}")]
    Decompression(String),
    #[error("frame is not valid UTF-8: {0}")]
    InvalidUtf8(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("discovery datagram is not a server response")]
    NotServerResponse,
}

const KNOWN_TYPES: &[&str] = &[
    "REGISTER",
    "REGISTRATION_RESPONSE",
    "DISPLAY_UPDATE",
    "COMMAND",
    "HEARTBEAT",
    "UPDATE_CONFIG",
    "UPDATE_CONFIG_RESPONSE",
    "LOG",
    "STATUS_REPORT",
    "SCREENSHOT",
];

pub fn encode_envelope(envelope: &Envelope) -> Result<String, CoreError> {
    serde_json::to_string(envelope).map_err(|err| CoreError::Serialization(err.to_string()))
}

/// Decode one envelope from message text. Distinguishes "not JSON at all",
/// "no Type field" and "Type we do not know" so callers can log the drop with
/// a useful cause.
pub fn decode_envelope(text: &str) -> Result<Envelope, CoreError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|err| CoreError::MalformedJson(err.to_string()))?;

    let message_type = value
        .get("Type")
        .and_then(|t| t.as_str())
        .ok_or(CoreError::MissingType)?;
    if !KNOWN_TYPES.contains(&message_type) {
        return Err(CoreError::UnknownMessageType(message_type.to_owned()));
    }

    serde_json::from_value(value).map_err(|err| CoreError::MalformedJson(err.to_string()))
}

/// Turn an incoming binary frame into message text, inflating gzip frames
/// identified by the magic prefix. Frames without the prefix are raw UTF-8.
pub fn inflate_frame(bytes: &[u8]) -> Result<String, CoreError> {
    if bytes.len() >= 2 && bytes[..2] == GZIP_MAGIC {
        let mut decoder = GzDecoder::new(bytes);
        let mut text = String::new();
        decoder
            .read_to_string(&mut text)
            .map_err(|err| CoreError::Decompression(err.to_string()))?;
        return Ok(text);
    }

    String::from_utf8(bytes.to_vec()).map_err(|err| CoreError::InvalidUtf8(err.to_string()))
}

/// Gzip-compress message text into a binary frame carrying the magic prefix.
pub fn deflate_text(text: &str) -> Result<Vec<u8>, CoreError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(text.as_bytes())
        .and_then(|()| encoder.finish())
        .map_err(|err| CoreError::Serialization(err.to_string()))
}

/// Broadcast discovery response, as received on UDP port 5555.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct DiscoveryResponse {
    #[serde(rename = "Type")]
    pub kind: String,
    pub server_name: String,
    #[serde(rename = "LocalIPs")]
    pub local_ips: Vec<String>,
    pub port: u16,
    pub protocol: String,
    pub endpoint_path: String,
    pub ssl_enabled: bool,
    pub timestamp: String,
}

/// Multicast service advertisement properties. Addresses come from the
/// advertisement itself, falling back to the datagram source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Advertisement {
    pub service: String,
    pub server_name: String,
    pub protocol: String,
    pub endpoint: String,
    pub ssl_enabled: bool,
    pub port: u16,
    #[serde(default)]
    pub local_ips: Vec<String>,
}

/// A discovered server. Identity key is `name`; candidates from different
/// discovery methods deduplicate on it.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerCandidate {
    pub name: String,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    pub use_ssl: bool,
    pub endpoint_path: String,
    pub discovered_at: String,
}

impl ServerCandidate {
    /// WebSocket URL for the first resolved address, or `None` when the
    /// candidate carries no address at all.
    pub fn ws_url(&self) -> Option<String> {
        let address = self.addresses.first()?;
        let scheme = if self.use_ssl { "wss" } else { "ws" };
        let host = match address {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{v6}]"),
        };
        let path = normalize_path(&self.endpoint_path);
        Some(format!("{scheme}://{host}:{}{path}", self.port))
    }
}

impl DiscoveryResponse {
    pub fn into_candidate(self, source: IpAddr) -> Result<ServerCandidate, CoreError> {
        if self.kind != DISCOVERY_SERVER_TYPE {
            return Err(CoreError::NotServerResponse);
        }

        let mut addresses = parse_addresses(&self.local_ips);
        if addresses.is_empty() {
            addresses.push(source);
        }

        Ok(ServerCandidate {
            name: self.server_name,
            addresses,
            port: self.port,
            use_ssl: self.ssl_enabled || self.protocol == "wss",
            endpoint_path: self.endpoint_path,
            discovered_at: now_timestamp(),
        })
    }
}

impl Advertisement {
    pub fn into_candidate(self, source: IpAddr) -> Result<ServerCandidate, CoreError> {
        if self.service != ADVERT_SERVICE {
            return Err(CoreError::NotServerResponse);
        }

        let mut addresses = parse_addresses(&self.local_ips);
        if addresses.is_empty() {
            addresses.push(source);
        }

        Ok(ServerCandidate {
            name: self.server_name,
            addresses,
            port: self.port,
            use_ssl: self.ssl_enabled || self.protocol == "wss",
            endpoint_path: self.endpoint,
            discovered_at: now_timestamp(),
        })
    }
}

fn parse_addresses(raw: &[String]) -> Vec<IpAddr> {
    // Unparseable entries are skipped, not fatal; the server lists every
    // interface it knows and some may be garbage.
    raw.iter().filter_map(|ip| ip.parse().ok()).collect()
}

fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        "/".to_owned()
    } else if path.starts_with('/') {
        path.to_owned()
    } else {
        format!("/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_type_tag_on_the_wire() {
        let envelope = Envelope::register("client-7", "Lobby Screen", None);
        let text = encode_envelope(&envelope).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["Type"], "REGISTER");
        assert_eq!(value["ClientId"], "client-7");
        assert!(value["Timestamp"].as_str().unwrap().ends_with('Z'));

        let decoded = decode_envelope(&text).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn unknown_type_is_classified() {
        let err = decode_envelope(r#"{"Type":"TELEPORT","ClientId":"x"}"#).unwrap_err();
        match err {
            CoreError::UnknownMessageType(kind) => assert_eq!(kind, "TELEPORT"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_type_and_malformed_json_are_distinct() {
        assert!(matches!(
            decode_envelope(r#"{"ClientId":"x"}"#),
            Err(CoreError::MissingType)
        ));
        assert!(matches!(
            decode_envelope("not json"),
            Err(CoreError::MalformedJson(_))
        ));
    }

    #[test]
    fn gzip_frames_are_inflated_and_raw_frames_pass_through() {
        let text = r#"{"Type":"HEARTBEAT","ClientId":"c","Timestamp":"t"}"#;
        let compressed = deflate_text(text).unwrap();
        assert_eq!(&compressed[..2], &GZIP_MAGIC);
        assert_eq!(inflate_frame(&compressed).unwrap(), text);

        assert_eq!(inflate_frame(text.as_bytes()).unwrap(), text);
    }

    #[test]
    fn truncated_gzip_frame_is_a_decompression_error() {
        let mut compressed = deflate_text("payload payload payload").unwrap();
        compressed.truncate(6);
        assert!(matches!(
            inflate_frame(&compressed),
            Err(CoreError::Decompression(_))
        ));
    }

    #[test]
    fn broadcast_response_parses_and_resolves() {
        let raw = r#"{
            "Type": "DIGITALSIGNAGE_SERVER",
            "ServerName": "hq-signage",
            "LocalIPs": ["192.168.4.20", "garbage", "10.0.0.5"],
            "Port": 9090,
            "Protocol": "ws",
            "EndpointPath": "/display",
            "SslEnabled": false,
            "Timestamp": "2026-01-05T10:00:00Z"
        }"#;
        let response: DiscoveryResponse = serde_json::from_str(raw).unwrap();
        let candidate = response
            .into_candidate("172.16.0.1".parse().unwrap())
            .unwrap();
        assert_eq!(candidate.name, "hq-signage");
        assert_eq!(candidate.addresses.len(), 2);
        assert_eq!(
            candidate.ws_url().unwrap(),
            "ws://192.168.4.20:9090/display"
        );
    }

    #[test]
    fn broadcast_response_with_wrong_type_is_rejected() {
        let response = DiscoveryResponse {
            kind: "SOMETHING_ELSE".to_owned(),
            server_name: "x".to_owned(),
            local_ips: Vec::new(),
            port: 1,
            protocol: "ws".to_owned(),
            endpoint_path: "/".to_owned(),
            ssl_enabled: false,
            timestamp: now_timestamp(),
        };
        assert!(matches!(
            response.into_candidate("127.0.0.1".parse().unwrap()),
            Err(CoreError::NotServerResponse)
        ));
    }

    #[test]
    fn advertisement_falls_back_to_datagram_source() {
        let advert = Advertisement {
            service: ADVERT_SERVICE.to_owned(),
            server_name: "warehouse".to_owned(),
            protocol: "wss".to_owned(),
            endpoint: "display".to_owned(),
            ssl_enabled: false,
            port: 443,
            local_ips: Vec::new(),
        };
        let candidate = advert.into_candidate("10.1.2.3".parse().unwrap()).unwrap();
        assert!(candidate.use_ssl, "wss protocol implies ssl");
        assert_eq!(candidate.ws_url().unwrap(), "wss://10.1.2.3:443/display");
    }
}
