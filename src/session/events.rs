//! Device state push events: projection and subscriber dispatch.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::session::proto::{DeviceStateData, Link};

/// Resource type carrying a shutter open level percentage.
pub const RT_OPEN_LEVEL: &str = "oic.r.openlevel";
/// Resource type carrying a shutter movement.
pub const RT_MOVEMENT_LINEAR: &str = "oic.r.movement.linear";
/// Resource type carrying a switch on/off value.
pub const RT_SWITCH_BINARY: &str = "oic.r.switch.binary";

const OPEN_LEVEL_FIELD: &str = "openLevel";
const MOVEMENT_FIELD: &str = "movement";
const VALUE_FIELD: &str = "value";
const SWITCH_ON: i64 = 1;

/// Normalized device state delivered to subscribers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    pub id: String,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub openlevel: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub movement: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_on: Option<bool>,
}

/// Projects a raw device payload onto a [`DeviceState`].
///
/// Only recognized link tags contribute; `id` and `connected` are always set.
pub fn project_device_state(data: &DeviceStateData) -> DeviceState {
    let mut state = DeviceState {
        id: data.di.clone(),
        connected: data.rc == 1,
        ..DeviceState::default()
    };
    for link in &data.links {
        apply_link(&mut state, link);
    }
    state
}

fn apply_link(state: &mut DeviceState, link: &Link) {
    match link.rt.as_str() {
        RT_OPEN_LEVEL => {
            if let Some(level) = link.field(OPEN_LEVEL_FIELD).and_then(Value::as_i64) {
                state.openlevel = Some(level);
            }
        }
        RT_MOVEMENT_LINEAR => {
            if let Some(movement) = link.field(MOVEMENT_FIELD).and_then(Value::as_str) {
                state.movement = Some(movement.to_string());
            }
        }
        RT_SWITCH_BINARY => {
            if let Some(value) = link.field(VALUE_FIELD).and_then(Value::as_i64) {
                state.is_on = Some(value == SWITCH_ON);
            }
        }
        _ => {}
    }
}

/// Callback receiving device state pushes. Runs on the receive task; must not block.
pub type DeviceStateHandler = Arc<dyn Fn(&DeviceState) + Send + Sync>;

#[derive(Default)]
struct SubscriberTable {
    global: Option<DeviceStateHandler>,
    by_device: HashMap<String, DeviceStateHandler>,
}

/// Subscriber registry and dispatch policy for push events.
#[derive(Default)]
pub struct EventRouter {
    subscribers: RwLock<SubscriberTable>,
}

impl fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("EventRouter")
            .field("global", &table.global.is_some())
            .field("devices", &table.by_device.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the handler receiving every device's updates.
    pub fn set_global<F>(&self, handler: F)
    where
        F: Fn(&DeviceState) + Send + Sync + 'static,
    {
        self.write().global = Some(Arc::new(handler));
    }

    pub fn clear_global(&self) {
        self.write().global = None;
    }

    /// Registers (or replaces) the handler for one device id.
    pub fn set_for_device<F>(&self, device_id: impl Into<String>, handler: F)
    where
        F: Fn(&DeviceState) + Send + Sync + 'static,
    {
        self.write()
            .by_device
            .insert(device_id.into(), Arc::new(handler));
    }

    pub fn remove_for_device(&self, device_id: &str) -> bool {
        self.write().by_device.remove(device_id).is_some()
    }

    /// Delivers a state to the global handler and to the device's handler.
    ///
    /// Returns how many handlers ran; zero means the event was dropped.
    pub fn publish(&self, state: &DeviceState) -> usize {
        let (global, device) = {
            let table = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
            (table.global.clone(), table.by_device.get(&state.id).cloned())
        };

        let mut delivered = 0;
        if let Some(handler) = global {
            debug!(event = "device_state_global", device = %state.id);
            invoke(&handler, state);
            delivered += 1;
        }
        if let Some(handler) = device {
            debug!(event = "device_state_device", device = %state.id);
            invoke(&handler, state);
            delivered += 1;
        }
        if delivered == 0 {
            warn!(
                event = "device_state_dropped",
                device = %state.id,
                "no subscriber registered for device state"
            );
        }
        delivered
    }

    /// Delivers a state to the device's handler only.
    pub fn publish_to_device(&self, state: &DeviceState) -> bool {
        let handler = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_device
            .get(&state.id)
            .cloned();
        match handler {
            Some(handler) => {
                invoke(&handler, state);
                true
            }
            None => false,
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SubscriberTable> {
        self.subscribers.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn invoke(handler: &DeviceStateHandler, state: &DeviceState) {
    if catch_unwind(AssertUnwindSafe(|| handler(state))).is_err() {
        warn!(event = "subscriber_panicked", device = %state.id);
    }
}
