//! Rust client for the DIO Chacon cloud websocket API.
//!
//! The crate is organized by layer:
//! - `session`: websocket connection, request correlation and push dispatch.
//! - `client`: domain operations (devices, shutters, switches) over a session.
//! - `auth`: credential exchange for the token-appended connection variant.
//! - `config`: endpoints, credentials and timeouts.
//! - `retry`: login retry and reconnect backoff policies.

/// Credential exchange.
pub mod auth;
/// High-level client.
pub mod client;
/// Client configuration.
pub mod config;
/// Device taxonomy.
pub mod devices;
/// Error types.
pub mod error;
/// Retry, timeout and reconnect backoff helpers.
pub mod retry;
/// Websocket session layer.
pub mod session;

pub use auth::{AuthError, AuthSession, HttpAuthSession};
pub use client::ChaconClient;
pub use config::{ClientConfig, ConnectMode, Credentials};
pub use devices::{DeviceInfo, DeviceType, ShutterMove};
pub use error::SessionError;
pub use session::connection::{ConnectionState, StopReason};
pub use session::events::DeviceState;
