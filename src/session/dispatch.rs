//! Single demultiplexing point for inbound frames.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::session::correlator::Correlator;
use crate::session::events::{project_device_state, EventRouter};
use crate::session::proto::{ConnectionAck, InboundFrame};

/// Routes every decoded frame to the correlator, the event router, or back to
/// the connection as a handshake acknowledgement.
#[derive(Debug)]
pub struct Dispatcher {
    correlator: Arc<Correlator>,
    router: Arc<EventRouter>,
}

impl Dispatcher {
    pub fn new(correlator: Arc<Correlator>, router: Arc<EventRouter>) -> Self {
        Self { correlator, router }
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    /// Decodes and dispatches a text frame. Undecodable text is logged and dropped.
    pub fn dispatch_text(&self, text: &str) -> Option<ConnectionAck> {
        match serde_json::from_str::<Value>(text) {
            Ok(frame) => self.dispatch(frame),
            Err(err) => {
                warn!(event = "protocol_error", error = %err, "dropping undecodable frame");
                None
            }
        }
    }

    /// Dispatches a decoded frame. Returns the acknowledgement for connection frames.
    pub fn dispatch(&self, frame: Value) -> Option<ConnectionAck> {
        match InboundFrame::classify(frame) {
            InboundFrame::Connection(ack) => {
                debug!(event = "connection_frame", ?ack);
                Some(ack)
            }
            InboundFrame::Response(response) => {
                debug!(event = "response_frame", id = response.id);
                self.correlator.buffer_response(response);
                None
            }
            InboundFrame::DeviceState(data) => {
                let state = project_device_state(&data);
                debug!(event = "device_state_frame", device = %state.id);
                self.router.publish(&state);
                None
            }
            InboundFrame::Unrecognized { frame, reason } => {
                warn!(
                    event = "protocol_error",
                    %reason,
                    %frame,
                    "dropping unrecognized frame"
                );
                None
            }
        }
    }
}
