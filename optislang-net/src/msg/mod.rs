//! Message definitions.
//!
//! Every request implements [`Request`], which ties the request to the
//! shape of the response the server sends back. Responses are decoded at
//! the client boundary, so downstream code never inspects untyped maps.
//!
//! Queries read state of the project and come as individual structs, one
//! per query name. Commands mutate state, they form the [`Command`] enum
//! and are all answered with a plain acknowledgement.

use serde::de::{DeserializeOwned, Deserializer, IgnoredAny};
use serde::Deserialize;
use serde_json::{Map, Value};

mod command;
mod design;
mod query;
mod state;

pub use command::*;
pub use design::*;
pub use query::*;
pub use state::*;

/// Request that can be sent to the server.
pub trait Request {
    /// Shape of the response sent back by the server
    type Response: DeserializeOwned;

    /// Name of the query or command as used on the wire.
    fn name(&self) -> &'static str;

    /// Builds the JSON body of the request, including the password if
    /// one is given.
    fn to_json(&self, password: Option<&str>) -> Value;

    /// Long running requests are not bound by the regular request timeout.
    fn is_long_running(&self) -> bool {
        false
    }
}

/// Acknowledgement carrying no information besides the fact that the
/// request didn't fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ack;

impl<'de> Deserialize<'de> for Ack {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        IgnoredAny::deserialize(deserializer)?;
        Ok(Ack)
    }
}

/// Builds a query body: `{"What": NAME, "uid"?, "hid"?, "args"?, "Password"?}`.
pub(crate) fn query_json(
    name: &str,
    uid: Option<&str>,
    hid: Option<&str>,
    args: Option<Value>,
    password: Option<&str>,
) -> Value {
    let mut body = Map::new();
    body.insert("What".to_string(), Value::from(name));
    if let Some(uid) = uid {
        body.insert("uid".to_string(), Value::from(uid));
    }
    if let Some(hid) = hid {
        body.insert("hid".to_string(), Value::from(hid));
    }
    if let Some(args) = args {
        body.insert("args".to_string(), args);
    }
    if let Some(password) = password {
        body.insert("Password".to_string(), Value::from(password));
    }
    Value::Object(body)
}

/// Builds a command body, a single builtin command wrapped in the project
/// command list.
pub(crate) fn command_json(
    name: &str,
    args: Option<Value>,
    actor_uid: Option<&str>,
    hid: Option<&str>,
    password: Option<&str>,
) -> Value {
    let mut command = Map::new();
    command.insert("type".to_string(), Value::from("builtin"));
    command.insert("command".to_string(), Value::from(name));
    if let Some(args) = args {
        command.insert("args".to_string(), args);
    }
    if let Some(uid) = actor_uid {
        command.insert("actor_uid".to_string(), Value::from(uid));
    }
    if let Some(hid) = hid {
        command.insert("hid".to_string(), Value::from(hid));
    }
    let mut body = Map::new();
    body.insert(
        "projects".to_string(),
        serde_json::json!([{ "commands": [Value::Object(command)] }]),
    );
    if let Some(password) = password {
        body.insert("Password".to_string(), Value::from(password));
    }
    Value::Object(body)
}

/// Extracts the request name out of a raw JSON body, either the `What`
/// field of a query or the first command name.
pub fn request_name(body: &Value) -> Option<&str> {
    if let Some(what) = body.get("What").and_then(Value::as_str) {
        return Some(what);
    }
    body.get("projects")?
        .get(0)?
        .get("commands")?
        .get(0)?
        .get("command")?
        .as_str()
}
