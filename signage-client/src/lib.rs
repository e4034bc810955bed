pub mod config;
pub mod discovery;
pub mod gateway;
pub mod heartbeat;
pub mod mailbox;
pub mod overlay;
pub mod presentation;
pub mod reconnect;
pub mod session;
