use std::path::PathBuf;

use serde_json::{json, Value};

use super::{command_json, Ack, DesignResult, Request};

/// Name of the actor property holding execution options.
pub const EXECUTION_OPTIONS_PROPERTY: &str = "ExecutionOptions";

/// Commands mutating the state of the server or its project.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Starts project execution
    Start,
    /// Stops project execution as soon as possible
    Stop,
    /// Stops project execution after currently running designs finish
    StopGently,
    /// Resets the project, discarding results
    Reset,
    /// Shuts the server application down
    Shutdown,
    Save,
    SaveAs {
        path: PathBuf,
        force: bool,
        restore: bool,
        reset: bool,
    },
    SaveCopy {
        path: PathBuf,
    },
    SetActorProperty {
        actor_uid: String,
        name: String,
        value: Value,
    },
    /// Hands evaluated designs over to a proxy solver node
    SetDesigns {
        actor_uid: String,
        designs: Vec<DesignResult>,
    },
}

impl Command {
    /// Convenience constructor for setting the execution options bitmask
    /// of a node.
    pub fn set_execution_options(actor_uid: &str, options: u32) -> Self {
        Command::SetActorProperty {
            actor_uid: actor_uid.to_string(),
            name: EXECUTION_OPTIONS_PROPERTY.to_string(),
            value: Value::from(options),
        }
    }
}

impl Request for Command {
    type Response = Ack;

    fn name(&self) -> &'static str {
        match self {
            Command::Start => "START",
            Command::Stop => "STOP",
            Command::StopGently => "STOP_GENTLY",
            Command::Reset => "RESET",
            Command::Shutdown => "SHUTDOWN",
            Command::Save => "SAVE",
            Command::SaveAs { .. } => "SAVE_AS",
            Command::SaveCopy { .. } => "SAVE_COPY",
            Command::SetActorProperty { .. } => "SET_ACTOR_PROPERTY",
            Command::SetDesigns { .. } => "SET_DESIGNS",
        }
    }

    fn to_json(&self, password: Option<&str>) -> Value {
        let name = self.name();
        match self {
            Command::SaveAs {
                path,
                force,
                restore,
                reset,
            } => command_json(
                name,
                Some(json!({
                    "path": path.to_string_lossy(),
                    "force": force,
                    "restore": restore,
                    "reset": reset,
                })),
                None,
                None,
                password,
            ),
            Command::SaveCopy { path } => command_json(
                name,
                Some(json!({ "path": path.to_string_lossy() })),
                None,
                None,
                password,
            ),
            Command::SetActorProperty {
                actor_uid,
                name: property,
                value,
            } => command_json(
                name,
                Some(json!({ "name": property, "value": value })),
                Some(actor_uid),
                None,
                password,
            ),
            Command::SetDesigns { actor_uid, designs } => command_json(
                name,
                Some(json!({ "designs": designs })),
                Some(actor_uid),
                None,
                password,
            ),
            _ => command_json(name, None, None, None, password),
        }
    }

    fn is_long_running(&self) -> bool {
        match self {
            Command::Start
            | Command::Stop
            | Command::Reset
            | Command::Save
            | Command::SaveAs { .. }
            | Command::SaveCopy { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::NamedValue;

    #[test]
    fn plain_command_body() {
        assert_eq!(
            Command::Start.to_json(Some("secret")),
            json!({
                "projects": [{"commands": [{"type": "builtin", "command": "START"}]}],
                "Password": "secret"
            })
        );
        assert!(Command::Start.is_long_running());
        assert!(!Command::Shutdown.is_long_running());
    }

    #[test]
    fn execution_options_body() {
        let body = Command::set_execution_options("node-1", 7).to_json(None);
        let command = &body["projects"][0]["commands"][0];
        assert_eq!(command["command"], "SET_ACTOR_PROPERTY");
        assert_eq!(command["actor_uid"], "node-1");
        assert_eq!(command["args"], json!({"name": "ExecutionOptions", "value": 7}));
    }

    #[test]
    fn set_designs_body() {
        let command = Command::SetDesigns {
            actor_uid: "solver".to_string(),
            designs: vec![DesignResult::new("0.1", vec![NamedValue::new("y", 2.5)])],
        };
        let body = command.to_json(None);
        assert_eq!(
            body["projects"][0]["commands"][0]["args"]["designs"],
            json!([{"hid": "0.1", "responses": [{"name": "y", "value": 2.5}]}])
        );
    }
}
