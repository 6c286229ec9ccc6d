//! Named remote actions: wire envelope, action table, call/response mapping.
//!
//! An action travels as `PUT /action/<name>` with body `{"actions": {"action": .., "parameters": [..]}}`.
//! The callee echoes the action back with `result` set (200), or answers 201 with no body
//! when the action returns nothing.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::device::DeviceId;
use crate::request::{Method, Request};
use crate::response::{Response, StatusCode};
use crate::route::Route;
use crate::router::HandlerFault;

/// Top-level key of the action envelope.
pub const ACTION_KEY: &str = "actions";
pub const ACTION_PATH_PREFIX: &str = "/action/";
/// Route every node serves for inbound actions.
pub const ACTION_ROUTE: &str = "/action/:action";

/// One named argument of an action. Order is preserved on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: Value,
}

/// A named remote invocation with parameters and, once answered, a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "action")]
    name: String,
    #[serde(default)]
    parameters: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    /// Identity of the device the action was sent to. Not serialized; not ownership.
    #[serde(skip)]
    target: Option<DeviceId>,
}

impl Action {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
            result: None,
            target: None,
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push_parameter(name, value);
        self
    }

    pub fn push_parameter(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.parameters.push(Parameter {
            name: name.into(),
            value: value.into(),
        });
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// First parameter with this name.
    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| &p.value)
    }

    pub fn parameter_as<T: DeserializeOwned>(&self, name: &str) -> Result<T, ActionError> {
        let value = self
            .parameter(name)
            .ok_or_else(|| ActionError::MissingParameter(name.to_string()))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn result_as<T: DeserializeOwned>(&self) -> Result<Option<T>, ActionError> {
        match &self.result {
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
            None => Ok(None),
        }
    }

    pub fn set_result(&mut self, result: Option<Value>) {
        self.result = result;
    }

    pub fn target(&self) -> Option<&DeviceId> {
        self.target.as_ref()
    }

    pub fn set_target(&mut self, target: DeviceId) {
        self.target = Some(target);
    }

    /// Request path for this action, e.g. `/action/ping`.
    pub fn path(&self) -> String {
        format!("{}{}", ACTION_PATH_PREFIX, urlencoding::encode(&self.name))
    }

    /// `{"actions": <self>}` as JSON bytes.
    pub fn to_envelope(&self) -> Result<Vec<u8>, ActionError> {
        let mut map = serde_json::Map::new();
        map.insert(ACTION_KEY.to_string(), serde_json::to_value(self)?);
        Ok(serde_json::to_vec(&Value::Object(map))?)
    }

    pub fn from_envelope(bytes: &[u8]) -> Result<Self, ActionError> {
        let mut value: Value = serde_json::from_slice(bytes)?;
        let inner = value
            .get_mut(ACTION_KEY)
            .map(Value::take)
            .ok_or(ActionError::MissingEnvelope)?;
        Ok(serde_json::from_value(inner)?)
    }

    /// Outbound request carrying this action (result is not sent).
    pub fn to_request(&self) -> Result<Request, ActionError> {
        let mut outgoing = self.clone();
        outgoing.result = None;
        Ok(Request::new(Method::Put, &self.path())
            .with_header("content-type", "application/json")
            .with_header("accept", "application/json")
            .with_body(outgoing.to_envelope()?))
    }

    /// Inbound action from a dispatched request. The name comes from the `:action` path
    /// parameter; an empty body means no parameters.
    pub fn from_request(request: &Request) -> Result<Self, ActionError> {
        let name = request.param("action").ok_or(ActionError::MissingName)?;
        if request.body().is_empty() {
            return Ok(Action::new(name));
        }
        let action = Self::from_envelope(request.body())?;
        if action.name != name {
            return Err(ActionError::NameMismatch {
                path: name.to_string(),
                body: action.name,
            });
        }
        Ok(action)
    }

    /// Callee side: 200 with the echoed action when there is a result, otherwise 201.
    pub fn to_response(&self) -> Result<Response, ActionError> {
        if self.result.is_none() {
            return Ok(Response::created());
        }
        Ok(Response::json(self.to_envelope()?))
    }

    /// Caller side: take the result out of the peer's response. Non-2xx is an error
    /// and leaves the result unset.
    pub fn apply_response(&mut self, response: &Response) -> Result<(), ActionError> {
        if !response.status().is_success() {
            return Err(ActionError::Status {
                status: response.status(),
                body: String::from_utf8_lossy(response.body()).into_owned(),
            });
        }
        if response.body().is_empty() {
            self.result = None;
            return Ok(());
        }
        let answered = Self::from_envelope(response.body())?;
        self.result = answered.result;
        Ok(())
    }
}

/// Action implementation. `Ok(None)` means the action returns nothing.
pub type ActionHandler = Arc<dyn Fn(&Action) -> Result<Option<Value>, HandlerFault> + Send + Sync>;

/// Name → handler table behind the `PUT /action/:action` route.
#[derive(Default)]
pub struct ActionTable {
    handlers: RwLock<BTreeMap<String, ActionHandler>>,
}

impl ActionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The route that feeds this table.
    pub fn route() -> Route {
        Route::action()
    }

    /// Register an action. Returns false if the name is taken (first registration wins).
    pub fn register<F>(&self, name: impl Into<String>, handler: F) -> bool
    where
        F: Fn(&Action) -> Result<Option<Value>, HandlerFault> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if handlers.contains_key(&name) {
            return false;
        }
        tracing::debug!(action = %name, "action registered");
        handlers.insert(name, Arc::new(handler));
        true
    }

    pub fn remove(&self, name: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Route handler body: decode, look up, invoke, encode. Unknown action is 404.
    pub fn handle(&self, request: &Request) -> Result<Response, HandlerFault> {
        let mut action = Action::from_request(request)?;
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(action.name())
            .cloned();
        let Some(handler) = handler else {
            tracing::debug!(action = action.name(), "unknown action");
            return Ok(Response::not_found());
        };
        let result = handler(&action)?;
        action.set_result(result);
        Ok(action.to_response()?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("invalid action payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload has no \"actions\" object")]
    MissingEnvelope,
    #[error("request has no :action path parameter")]
    MissingName,
    #[error("path names action {path:?} but body names {body:?}")]
    NameMismatch { path: String, body: String },
    #[error("parameter {0:?} not present")]
    MissingParameter(String),
    #[error("peer responded {status}: {body}")]
    Status { status: StatusCode, body: String },
}
