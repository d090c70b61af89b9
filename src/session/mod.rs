//! Websocket session layer.
//!
//! - `connection`: socket ownership, handshake, reconnect state machine.
//! - `correlator`: request ids and out-of-order response buffering.
//! - `dispatch`: classification of every inbound frame.
//! - `events`: device state projection and subscriber table.
//! - `proto`: wire frames.

/// Connection lifecycle and background receive loop.
pub mod connection;
/// Request/response correlation.
pub mod correlator;
/// Inbound frame demultiplexer.
pub mod dispatch;
/// Device state push events.
pub mod events;
/// Wire frame types.
pub mod proto;
