//! Request dispatch to application controllers.
//!
//! A request's `type` string is `controller.action`. The dispatcher holds
//! an explicit registry of controllers by (case-insensitive) name; each
//! controller routes the action name to a handler and decodes its own
//! typed parameters with [`decode_params`]. There is no reflection —
//! the mapping is plain data.
//!
//! Failures split into two kinds: user-facing errors become a status 4
//! response carrying the error text, while internal errors (including
//! panics in handlers) are logged and answered with status 5 and a generic
//! message.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use futures::FutureExt;
use log::error;
use serde::{Serialize, Serializer, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;

use crate::{error::panic_message, user::UserAuth};

/// Longest accepted request payload in bytes (16 KiB − 1).
pub const MAX_ACTION_PAYLOAD: usize = (1 << 14) - 1;

/// Status codes embedded in every [`ResponseBody`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Success = 0,
    /// Request was malformed or rejected; the message says why.
    Error = 4,
    /// Something went wrong server-side; details are in the server log.
    InternalError = 5,
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

/// JSON body of every SendResp.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResponseBody {
    pub status: Status,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub data: Value,
}

impl ResponseBody {
    /// Successful response wrapping `data`.
    #[must_use]
    pub fn success(data: Value) -> Self {
        Self {
            status: Status::Success,
            message: String::new(),
            data,
        }
    }

    fn failure(status: Status, message: String) -> Self {
        Self {
            status,
            message,
            data: Value::Object(serde_json::Map::new()),
        }
    }

    /// Serialise for the wire. Response bodies are built from plain JSON
    /// values, so this cannot fail.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("response body serialises to JSON")
    }
}

/// Failure raised by an action handler.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActionError {
    /// Shown to the client verbatim as a status 4 message.
    #[error("{0}")]
    User(String),
    /// Logged server-side; the client sees a generic status 5 response.
    #[error("{0}")]
    Internal(String),
}

impl ActionError {
    pub fn user(message: impl Into<String>) -> Self { Self::User(message.into()) }

    pub fn internal(message: impl Into<String>) -> Self { Self::Internal(message.into()) }
}

/// Outcome of one action handler.
pub type ActionResult = Result<ResponseBody, ActionError>;

/// Per-request view handed to a controller.
pub struct ActionContext<'a> {
    /// The authenticated user driving this session.
    pub user: &'a mut dyn UserAuth,
    /// Raw request payload, conventionally JSON.
    pub payload: &'a str,
    /// Binary attachment, already inflated if the peer gzipped it.
    pub data: Option<&'a [u8]>,
}

/// One named controller: routes an action name to its handler.
#[async_trait]
pub trait Controller: Send + Sync {
    /// Run `action` for the request in `ctx`.
    ///
    /// Return a user-facing [`ActionError`] for unknown actions so the
    /// client learns which name it got wrong.
    async fn dispatch(&self, action: &str, ctx: ActionContext<'_>) -> ActionResult;
}

/// Decode a typed parameter struct from a request payload.
///
/// An empty payload yields the type's default, matching requests that
/// carry no parameters.
///
/// # Errors
///
/// Returns a user-facing error when the payload is not valid JSON for `P`.
pub fn decode_params<P>(payload: &str) -> Result<P, ActionError>
where
    P: DeserializeOwned + Default,
{
    if payload.is_empty() {
        return Ok(P::default());
    }
    serde_json::from_str(payload)
        .map_err(|e| ActionError::user(format!("failed to decode payload: {e}")))
}

/// Registry of controllers, keyed by lowercase controller name.
#[derive(Default)]
pub struct Dispatcher {
    controllers: HashMap<String, Arc<dyn Controller>>,
}

impl Dispatcher {
    /// Register `controller` under `name`. Matching is case-insensitive.
    pub fn route(&mut self, name: &str, controller: Arc<dyn Controller>) {
        self.controllers
            .insert(name.to_ascii_lowercase(), controller);
    }

    /// Run the handler for `req_type` and fold every failure mode into a
    /// [`ResponseBody`]; the session always gets an answer.
    pub async fn process(
        &self,
        user: &mut dyn UserAuth,
        req_type: &str,
        payload: &str,
        data: Option<&[u8]>,
    ) -> ResponseBody {
        let outcome = std::panic::AssertUnwindSafe(self.process_inner(user, req_type, payload, data))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(body)) => body,
            Ok(Err(ActionError::User(message))) => ResponseBody::failure(Status::Error, message),
            Ok(Err(ActionError::Internal(message))) => {
                error!("action {req_type} failed: {message}");
                ResponseBody::failure(Status::InternalError, "internal server error".to_string())
            }
            Err(panic) => {
                error!("action {req_type} panicked: {}", panic_message(panic));
                ResponseBody::failure(Status::InternalError, "internal server error".to_string())
            }
        }
    }

    async fn process_inner(
        &self,
        user: &mut dyn UserAuth,
        req_type: &str,
        payload: &str,
        data: Option<&[u8]>,
    ) -> ActionResult {
        if payload.len() > MAX_ACTION_PAYLOAD {
            return Err(ActionError::user("length of payload exceeds the max length"));
        }
        let mut parts = req_type.split('.');
        let (Some(controller_name), Some(action)) = (parts.next(), parts.next()) else {
            return Err(ActionError::user(
                "request type should be in the form controller.action",
            ));
        };
        let controller = self
            .controllers
            .get(&controller_name.to_ascii_lowercase())
            .ok_or_else(|| ActionError::user(format!("controller {controller_name} does not exist")))?;
        controller
            .dispatch(
                action,
                ActionContext {
                    user,
                    payload,
                    data,
                },
            )
            .await
    }
}
