//! Domain operations over the websocket session.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::auth::HttpAuthSession;
use crate::config::{ClientConfig, ConnectMode, Credentials};
use crate::devices::{DeviceInfo, DeviceType, RawDevice, ShutterMove};
use crate::error::SessionError;
use crate::session::connection::{ConnectionManager, ConnectionState, StopReason};
use crate::session::correlator::Correlator;
use crate::session::dispatch::Dispatcher;
use crate::session::events::{project_device_state, DeviceState, EventRouter};
use crate::session::proto::{response_status, DeviceStateData, Method, RequestFrame, STATUS_OK};

const MAX_OPEN_LEVEL: u8 = 100;
const SWITCH_ON: i64 = 1;
const SWITCH_OFF: i64 = 0;

/// Client for the DIO Chacon cloud.
///
/// The connection is opened lazily by the first request and shared by every
/// concurrent call made through the same instance.
#[derive(Debug)]
pub struct ChaconClient {
    connection: ConnectionManager,
    correlator: Arc<Correlator>,
    router: Arc<EventRouter>,
}

impl ChaconClient {
    pub fn new(config: ClientConfig) -> Self {
        let correlator = Arc::new(Correlator::new(config.response_grace));
        let router = Arc::new(EventRouter::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&correlator),
            Arc::clone(&router),
        ));

        Self {
            connection: ConnectionManager::new(&config, dispatcher),
            correlator,
            router,
        }
    }

    /// Production client logging in through the HTTP login endpoint.
    pub fn with_credentials(credentials: Credentials) -> Result<Self, SessionError> {
        let auth = HttpAuthSession::new()?;
        Ok(Self::new(ClientConfig::new(
            credentials,
            ConnectMode::SessionToken(Arc::new(auth)),
        )))
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Registers the handler receiving every device state push.
    pub fn on_device_state<F>(&self, handler: F)
    where
        F: Fn(&DeviceState) + Send + Sync + 'static,
    {
        self.router.set_global(handler);
    }

    /// Registers the handler receiving pushes for one device.
    pub fn on_device_state_for<F>(&self, device_id: impl Into<String>, handler: F)
    where
        F: Fn(&DeviceState) + Send + Sync + 'static,
    {
        self.router.set_for_device(device_id, handler);
    }

    pub fn remove_device_state_handler(&self, device_id: &str) -> bool {
        self.router.remove_for_device(device_id)
    }

    /// Removes the handler registered with [`ChaconClient::on_device_state`].
    pub fn clear_device_state_handler(&self) {
        self.router.clear_global();
    }

    /// Opens the session now instead of on the first request.
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.connection.connect().await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// Sends one request and returns the raw response payload.
    ///
    /// # Errors
    ///
    /// Connection errors from [`ConnectionManager::connect`],
    /// [`SessionError::ResponseTimeout`] when no response arrives, and
    /// [`SessionError::Api`] for a non-200 status.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        parameters: Value,
    ) -> Result<Value, SessionError> {
        if self.connection.state() != ConnectionState::Connected {
            if let Some(reason) = self.connection.stop_reason() {
                if reason != StopReason::Requested {
                    warn!(event = "session_lost", ?reason, "reconnecting");
                }
            }
        }
        self.connection.connect().await?;

        let frame = RequestFrame {
            method,
            path: path.to_string(),
            parameters,
            id: self.correlator.next_id(),
        };
        self.connection.send(&frame)?;

        let payload = self.correlator.await_response(frame.id).await?;
        match response_status(&payload) {
            Some(STATUS_OK) => Ok(payload),
            Some(status) => {
                warn!(event = "api_error", id = frame.id, status, path);
                Err(SessionError::Api { status, payload })
            }
            None => Err(SessionError::Protocol(format!(
                "response {} carries no status",
                frame.id
            ))),
        }
    }

    /// Technical id of the logged-in user.
    pub async fn get_user_id(&self) -> Result<String, SessionError> {
        let payload = self.request(Method::Get, "/user", json!({})).await?;
        payload["data"]["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| SessionError::Protocol("user response missing data.id".to_string()))
    }

    /// Lists known devices, optionally restricted to `types` (empty means all known types).
    ///
    /// With `with_state`, each device is merged with its current state.
    pub async fn search_all_devices(
        &self,
        types: &[DeviceType],
        with_state: bool,
    ) -> Result<Vec<DeviceInfo>, SessionError> {
        let payload = self.request(Method::Get, "/device", json!({})).await?;
        let raw: Vec<RawDevice> = serde_json::from_value(payload["data"].clone())?;

        let mut devices: Vec<DeviceInfo> = raw
            .into_iter()
            .filter_map(|device| {
                let device_type = DeviceType::from_api(&device.device_type);
                let wanted = device_type != DeviceType::Unknown
                    && (types.is_empty() || types.contains(&device_type));
                wanted.then(|| device.into_info(device_type))
            })
            .collect();
        debug!(event = "devices_listed", count = devices.len());

        if with_state && !devices.is_empty() {
            let ids: Vec<String> = devices.iter().map(|device| device.id.clone()).collect();
            let mut states = self.fetch_states(ids, &devices, false).await?;
            for device in &mut devices {
                if let Some(state) = states.remove(&device.id) {
                    device.connected = Some(state.connected);
                    device.openlevel = state.openlevel;
                    device.movement = state.movement;
                    device.is_on = state.is_on;
                }
            }
        }
        Ok(devices)
    }

    /// Current state of each requested device, keyed by device id.
    ///
    /// With `notify_subscribers`, each state is also handed to that device's handler.
    pub async fn get_status_details<I, S>(
        &self,
        ids: I,
        notify_subscribers: bool,
    ) -> Result<HashMap<String, DeviceState>, SessionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids = ids.into_iter().map(Into::into).collect();
        self.fetch_states(ids, &[], notify_subscribers).await
    }

    pub async fn move_shutter_direction(
        &self,
        shutter_id: &str,
        direction: ShutterMove,
    ) -> Result<(), SessionError> {
        self.request(
            Method::Post,
            &format!("/device/{shutter_id}/action/mvtlinear"),
            json!({"movement": direction.as_str()}),
        )
        .await?;
        Ok(())
    }

    /// Moves a shutter to `openlevel` percent (0 closed, 100 open).
    pub async fn move_shutter_percentage(
        &self,
        shutter_id: &str,
        openlevel: u8,
    ) -> Result<(), SessionError> {
        if openlevel > MAX_OPEN_LEVEL {
            return Err(SessionError::InvalidArgument(format!(
                "open level {openlevel} is above {MAX_OPEN_LEVEL}"
            )));
        }
        self.request(
            Method::Post,
            &format!("/device/{shutter_id}/action/openlevel"),
            json!({"openLevel": openlevel}),
        )
        .await?;
        Ok(())
    }

    pub async fn switch_switch(&self, switch_id: &str, on: bool) -> Result<(), SessionError> {
        let value = if on { SWITCH_ON } else { SWITCH_OFF };
        self.request(
            Method::Post,
            &format!("/device/{switch_id}/action/switch"),
            json!({"value": value}),
        )
        .await?;
        Ok(())
    }

    async fn fetch_states(
        &self,
        ids: Vec<String>,
        known: &[DeviceInfo],
        notify_subscribers: bool,
    ) -> Result<HashMap<String, DeviceState>, SessionError> {
        let payload = self
            .request(Method::Post, "/device/states", json!({"devices": ids}))
            .await?;
        let states = parse_status_details(&payload["data"], known)?;

        if notify_subscribers {
            for state in states.values() {
                if self.router.publish_to_device(state) {
                    debug!(event = "status_details_notified", device = %state.id);
                }
            }
        }
        Ok(states)
    }
}

/// Projects the `data` object of a `/device/states` response.
fn parse_status_details(
    data: &Value,
    known: &[DeviceInfo],
) -> Result<HashMap<String, DeviceState>, SessionError> {
    let entries = data
        .as_object()
        .ok_or_else(|| SessionError::Protocol("device states data is not an object".to_string()))?;

    let mut states = HashMap::with_capacity(entries.len());
    for (device_id, entry) in entries {
        let state = if entry.is_null() {
            let info = known.iter().find(|device| &device.id == device_id);
            warn!(
                event = "device_not_recognized",
                device = %device_id,
                name = info.map_or("Unknown", |device| device.name.as_str()),
                model = info.map_or("Unknown", |device| device.model.as_str()),
                "device is not fully recognized, probably because of a too old firmware"
            );
            unrecognized_device_state(device_id)
        } else {
            let mut entry = entry.clone();
            if let Some(fields) = entry.as_object_mut() {
                fields
                    .entry("di")
                    .or_insert_with(|| Value::String(device_id.clone()));
            }
            let data: DeviceStateData = serde_json::from_value(entry)?;
            DeviceState {
                id: device_id.clone(),
                ..project_device_state(&data)
            }
        };
        states.insert(device_id.clone(), state);
    }
    Ok(states)
}

fn unrecognized_device_state(device_id: &str) -> DeviceState {
    DeviceState {
        id: device_id.to_string(),
        connected: false,
        openlevel: Some(0),
        movement: Some(ShutterMove::Stop.as_str().to_string()),
        is_on: Some(false),
    }
}
