//! Typed wrappers over common server commands.
//!
//! Each wrapper builds a [`Command`], sends it through
//! [`WebSocketClient::send_command`] and checks the shape of the result.

use std::collections::HashMap;

use serde_json::{Map, Value};

use super::client::WebSocketClient;
use super::messages::Command;
use crate::error::ClientError;

/// JSON object as returned by the server.
pub type Object = Map<String, Value>;

/// Registries that share the `list`/`create`/`update`/`delete` command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registry {
    /// `config/area_registry/*`, keyed by `area_id`.
    Area,
    /// `config/floor_registry/*`, keyed by `floor_id`.
    Floor,
    /// `config/label_registry/*`, keyed by `label_id`.
    Label,
}

impl Registry {
    const fn prefix(self) -> &'static str {
        match self {
            Self::Area => "config/area_registry",
            Self::Floor => "config/floor_registry",
            Self::Label => "config/label_registry",
        }
    }

    const fn id_key(self) -> &'static str {
        match self {
            Self::Area => "area_id",
            Self::Floor => "floor_id",
            Self::Label => "label_id",
        }
    }

    fn command(self, action: &str) -> Command {
        Command::new(format!("{}/{action}", self.prefix()))
    }
}

/// A `call_service` request.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceCall {
    /// Integration domain, e.g. `light`.
    pub domain: String,
    /// Service name, e.g. `turn_on`.
    pub service: String,
    /// Service payload.
    pub service_data: Option<Object>,
    /// Target selector (`entity_id`, `area_id`, ...).
    pub target: Option<Object>,
    /// Ask the server to include the service response.
    pub return_response: bool,
}

impl ServiceCall {
    /// Creates a call with no data and no target.
    #[must_use]
    pub fn new(domain: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            service: service.into(),
            service_data: None,
            target: None,
            return_response: false,
        }
    }

    /// Sets the service payload.
    #[must_use]
    pub fn with_data(mut self, data: Object) -> Self {
        self.service_data = Some(data);
        self
    }

    /// Sets the target selector.
    #[must_use]
    pub fn with_target(mut self, target: Object) -> Self {
        self.target = Some(target);
        self
    }

    /// Requests the service response in the result.
    #[must_use]
    pub const fn returning_response(mut self) -> Self {
        self.return_response = true;
        self
    }

    fn into_command(self) -> Command {
        let command = Command::new("call_service")
            .param("domain", self.domain)
            .param("service", self.service)
            .param_opt("service_data", self.service_data)
            .param_opt("target", self.target);
        if self.return_response {
            command.param("return_response", true)
        } else {
            command
        }
    }
}

fn expect_array(command_type: &str, value: Value) -> Result<Vec<Value>, ClientError> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(ClientError::UnexpectedResponse(format!(
            "{command_type}: expected an array, got {}",
            kind(&other)
        ))),
    }
}

fn expect_object(command_type: &str, value: Value) -> Result<Object, ClientError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(ClientError::UnexpectedResponse(format!(
            "{command_type}: expected an object, got {}",
            kind(&other)
        ))),
    }
}

const fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Folds one `system_health/info` event into `data`.
///
/// Returns `true` once the `finish` event arrives.
pub(crate) fn apply_health_event(data: &mut Object, event: &Value) -> bool {
    match event.get("type").and_then(Value::as_str) {
        Some("initial") => {
            if let Some(initial) = event.get("data").and_then(Value::as_object) {
                for (key, value) in initial {
                    data.insert(key.clone(), value.clone());
                }
            }
            false
        }
        Some("update") => {
            let domain = event.get("domain").and_then(Value::as_str).unwrap_or_default();
            let key = event.get("key").and_then(Value::as_str).unwrap_or_default();
            if domain.is_empty() || key.is_empty() {
                return false;
            }
            let value = if event.get("success").and_then(Value::as_bool).unwrap_or(false) {
                event.get("data").cloned().unwrap_or(Value::Null)
            } else if let Some(error) = event.get("error").and_then(Value::as_object) {
                serde_json::json!({
                    "error": true,
                    "value": error.get("msg").cloned().unwrap_or(Value::Null),
                })
            } else {
                return false;
            };

            let entry = data
                .entry(domain.to_owned())
                .or_insert_with(|| Value::Object(Object::new()));
            if let Value::Object(domain_data) = entry
                && let Value::Object(info) = domain_data
                    .entry("info")
                    .or_insert_with(|| Value::Object(Object::new()))
            {
                info.insert(key.to_owned(), value);
            }
            false
        }
        Some("finish") => true,
        _ => false,
    }
}

impl WebSocketClient {
    /// Returns every entity state.
    ///
    /// # Errors
    ///
    /// Command errors, or [`ClientError::UnexpectedResponse`] if the result
    /// is not an array.
    pub async fn get_states(&self) -> Result<Vec<Value>, ClientError> {
        let result = self.send_command(Command::new("get_states")).await?;
        expect_array("get_states", result)
    }

    /// Returns the core configuration.
    ///
    /// # Errors
    ///
    /// Command errors, or [`ClientError::UnexpectedResponse`] if the result
    /// is not an object.
    pub async fn get_config(&self) -> Result<Object, ClientError> {
        let result = self.send_command(Command::new("get_config")).await?;
        expect_object("get_config", result)
    }

    /// Returns the service catalogue, keyed by domain.
    ///
    /// # Errors
    ///
    /// Command errors, or [`ClientError::UnexpectedResponse`] if the result
    /// is not an object.
    pub async fn get_services(&self) -> Result<Object, ClientError> {
        let result = self.send_command(Command::new("get_services")).await?;
        expect_object("get_services", result)
    }

    /// Returns the registered frontend panels.
    ///
    /// # Errors
    ///
    /// Command errors, or [`ClientError::UnexpectedResponse`] if the result
    /// is not an object.
    pub async fn get_panels(&self) -> Result<Object, ClientError> {
        let result = self.send_command(Command::new("get_panels")).await?;
        expect_object("get_panels", result)
    }

    /// Calls a service. The result is returned as sent by the server.
    ///
    /// # Errors
    ///
    /// Same as [`send_command`](Self::send_command).
    pub async fn call_service(&self, call: ServiceCall) -> Result<Value, ClientError> {
        self.send_command(call.into_command()).await
    }

    /// Lists the entries of an area, floor or label registry.
    ///
    /// # Errors
    ///
    /// Command errors, or [`ClientError::UnexpectedResponse`] if the result
    /// is not an array.
    pub async fn registry_list(&self, registry: Registry) -> Result<Vec<Value>, ClientError> {
        let command = registry.command("list");
        let command_type = command.command_type().to_owned();
        let result = self.send_command(command).await?;
        expect_array(&command_type, result)
    }

    /// Creates a registry entry named `name`. `extra` may carry optional
    /// fields such as `icon` or `aliases`.
    ///
    /// # Errors
    ///
    /// Command errors, or [`ClientError::UnexpectedResponse`] if the result
    /// is not an object.
    pub async fn registry_create(
        &self,
        registry: Registry,
        name: &str,
        extra: Object,
    ) -> Result<Object, ClientError> {
        let command = registry.command("create").params(extra).param("name", name);
        let command_type = command.command_type().to_owned();
        let result = self.send_command(command).await?;
        expect_object(&command_type, result)
    }

    /// Updates the registry entry `id` with the fields in `changes`.
    ///
    /// # Errors
    ///
    /// Command errors, or [`ClientError::UnexpectedResponse`] if the result
    /// is not an object.
    pub async fn registry_update(
        &self,
        registry: Registry,
        id: &str,
        changes: Object,
    ) -> Result<Object, ClientError> {
        let command = registry
            .command("update")
            .params(changes)
            .param(registry.id_key(), id);
        let command_type = command.command_type().to_owned();
        let result = self.send_command(command).await?;
        expect_object(&command_type, result)
    }

    /// Deletes the registry entry `id`.
    ///
    /// # Errors
    ///
    /// Same as [`send_command`](Self::send_command).
    pub async fn registry_delete(&self, registry: Registry, id: &str) -> Result<(), ClientError> {
        let command = registry.command("delete").param(registry.id_key(), id);
        self.send_command(command).await?;
        Ok(())
    }

    /// Lists every device.
    ///
    /// # Errors
    ///
    /// Command errors, or [`ClientError::UnexpectedResponse`] if the result
    /// is not an array.
    pub async fn device_list(&self) -> Result<Vec<Value>, ClientError> {
        let result = self
            .send_command(Command::new("config/device_registry/list"))
            .await?;
        expect_array("config/device_registry/list", result)
    }

    /// Updates a device.
    ///
    /// # Errors
    ///
    /// Command errors, or [`ClientError::UnexpectedResponse`] if the result
    /// is not an object.
    pub async fn device_update(
        &self,
        device_id: &str,
        changes: Object,
    ) -> Result<Object, ClientError> {
        let command = Command::new("config/device_registry/update")
            .params(changes)
            .param("device_id", device_id);
        let result = self.send_command(command).await?;
        expect_object("config/device_registry/update", result)
    }

    /// Lists every entity registry entry.
    ///
    /// # Errors
    ///
    /// Command errors, or [`ClientError::UnexpectedResponse`] if the result
    /// is not an array.
    pub async fn entity_list(&self) -> Result<Vec<Value>, ClientError> {
        let result = self
            .send_command(Command::new("config/entity_registry/list"))
            .await?;
        expect_array("config/entity_registry/list", result)
    }

    /// Returns one entity registry entry.
    ///
    /// # Errors
    ///
    /// Command errors, or [`ClientError::UnexpectedResponse`] if the result
    /// is not an object.
    pub async fn entity_get(&self, entity_id: &str) -> Result<Object, ClientError> {
        let command = Command::new("config/entity_registry/get").param("entity_id", entity_id);
        let result = self.send_command(command).await?;
        expect_object("config/entity_registry/get", result)
    }

    /// Updates an entity registry entry.
    ///
    /// # Errors
    ///
    /// Command errors, or [`ClientError::UnexpectedResponse`] if the result
    /// is not an object.
    pub async fn entity_update(
        &self,
        entity_id: &str,
        changes: Object,
    ) -> Result<Object, ClientError> {
        let command = Command::new("config/entity_registry/update")
            .params(changes)
            .param("entity_id", entity_id);
        let result = self.send_command(command).await?;
        expect_object("config/entity_registry/update", result)
    }

    /// Lists every zone.
    ///
    /// # Errors
    ///
    /// Command errors, or [`ClientError::UnexpectedResponse`] if the result
    /// is not an array.
    pub async fn zone_list(&self) -> Result<Vec<Value>, ClientError> {
        let result = self.send_command(Command::new("zone/list")).await?;
        expect_array("zone/list", result)
    }

    /// Creates a zone. `radius` is in meters.
    ///
    /// # Errors
    ///
    /// Command errors, or [`ClientError::UnexpectedResponse`] if the result
    /// is not an object.
    pub async fn zone_create(
        &self,
        name: &str,
        latitude: f64,
        longitude: f64,
        radius: f64,
        extra: Object,
    ) -> Result<Object, ClientError> {
        let command = Command::new("zone/create")
            .params(extra)
            .param("name", name)
            .param("latitude", latitude)
            .param("longitude", longitude)
            .param("radius", radius);
        let result = self.send_command(command).await?;
        expect_object("zone/create", result)
    }

    /// Updates a zone.
    ///
    /// # Errors
    ///
    /// Command errors, or [`ClientError::UnexpectedResponse`] if the result
    /// is not an object.
    pub async fn zone_update(&self, zone_id: &str, changes: Object) -> Result<Object, ClientError> {
        let command = Command::new("zone/update")
            .params(changes)
            .param("zone_id", zone_id);
        let result = self.send_command(command).await?;
        expect_object("zone/update", result)
    }

    /// Deletes a zone.
    ///
    /// # Errors
    ///
    /// Same as [`send_command`](Self::send_command).
    pub async fn zone_delete(&self, zone_id: &str) -> Result<(), ClientError> {
        self.send_command(Command::new("zone/delete").param("zone_id", zone_id))
            .await?;
        Ok(())
    }

    /// Finds items related to `item_type`/`item_id` (e.g. `entity`,
    /// `light.kitchen`), grouped by kind. Non-string entries are skipped.
    ///
    /// # Errors
    ///
    /// Same as [`send_command`](Self::send_command).
    pub async fn search_related(
        &self,
        item_type: &str,
        item_id: &str,
    ) -> Result<HashMap<String, Vec<String>>, ClientError> {
        let command = Command::new("search/related")
            .param("item_type", item_type)
            .param("item_id", item_id);
        let result = self.send_command(command).await?;

        let Value::Object(groups) = result else {
            return Ok(HashMap::new());
        };
        Ok(groups
            .into_iter()
            .filter_map(|(kind, items)| {
                let Value::Array(items) = items else {
                    return None;
                };
                let names = items
                    .into_iter()
                    .filter_map(|item| match item {
                        Value::String(name) => Some(name),
                        _ => None,
                    })
                    .collect();
                Some((kind, names))
            })
            .collect())
    }

    /// Collects the system health report.
    ///
    /// The server streams it as `initial`, then `update` events per check,
    /// then `finish`. The whole collection is bounded by the request
    /// timeout; the subscription is dropped locally afterwards.
    ///
    /// # Errors
    ///
    /// Subscription errors, [`ClientError::Timeout`] if `finish` does not
    /// arrive in time, or [`ClientError::ConnectionClosed`] if the
    /// connection drops mid-stream.
    pub async fn system_health_info(&self) -> Result<Object, ClientError> {
        let timeout = self.config().request_timeout;
        let (subscription, mut events) = self
            .subscribe_command_channel(Command::new("system_health/info"))
            .await?;

        let collect = async {
            let mut data = Object::new();
            while let Some(event) = events.recv().await {
                if apply_health_event(&mut data, &event) {
                    return Ok(data);
                }
            }
            Err(ClientError::ConnectionClosed)
        };
        let outcome = tokio::time::timeout(timeout, collect)
            .await
            .unwrap_or(Err(ClientError::Timeout(timeout)));

        self.forget_subscription(subscription);
        outcome
    }
}
