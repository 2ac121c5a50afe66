use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// State of the project as reported by the server.
///
/// Polling loops treat these as ordinary values, a project that did not
/// finish yet is not an error.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum ProjectState {
    Idle,
    Processing,
    Paused,
    PauseRequested,
    Stopped,
    StopRequested,
    GentleStopRequested,
    AbortRequested,
    Aborted,
    Finished,
    /// State name not known to this client
    Other(String),
}

impl ProjectState {
    /// Final states of a run. The project won't change state on its own
    /// once it reaches one of these.
    pub fn is_terminal(&self) -> bool {
        match self {
            ProjectState::Finished | ProjectState::Stopped | ProjectState::Aborted => true,
            _ => false,
        }
    }

    /// States in which the project is not executing anything.
    pub fn is_stopped(&self) -> bool {
        self.is_terminal() || *self == ProjectState::Idle
    }

    /// Priority of the pending stop request, if the state is one.
    pub fn stop_request_priority(&self) -> Option<u8> {
        match self {
            ProjectState::AbortRequested => Some(30),
            ProjectState::StopRequested => Some(20),
            ProjectState::GentleStopRequested => Some(10),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ProjectState::Idle => "IDLE",
            ProjectState::Processing => "PROCESSING",
            ProjectState::Paused => "PAUSED",
            ProjectState::PauseRequested => "PAUSE_REQUESTED",
            ProjectState::Stopped => "STOPPED",
            ProjectState::StopRequested => "STOP_REQUESTED",
            ProjectState::GentleStopRequested => "GENTLE_STOP_REQUESTED",
            ProjectState::AbortRequested => "ABORT_REQUESTED",
            ProjectState::Aborted => "ABORTED",
            ProjectState::Finished => "FINISHED",
            ProjectState::Other(s) => s,
        }
    }
}

impl From<String> for ProjectState {
    fn from(s: String) -> Self {
        match s.to_uppercase().as_str() {
            "IDLE" => ProjectState::Idle,
            "PROCESSING" => ProjectState::Processing,
            "PAUSED" => ProjectState::Paused,
            "PAUSE_REQUESTED" => ProjectState::PauseRequested,
            "STOPPED" => ProjectState::Stopped,
            "STOP_REQUESTED" => ProjectState::StopRequested,
            "GENTLE_STOP_REQUESTED" => ProjectState::GentleStopRequested,
            "ABORT_REQUESTED" => ProjectState::AbortRequested,
            "ABORTED" => ProjectState::Aborted,
            "FINISHED" => ProjectState::Finished,
            _ => ProjectState::Other(s),
        }
    }
}

impl From<ProjectState> for String {
    fn from(state: ProjectState) -> Self {
        state.as_str().to_string()
    }
}

impl Display for ProjectState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Evaluation status of a single design.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum DesignStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    NotSucceeded,
    Other(String),
}

impl DesignStatus {
    pub fn is_done(&self) -> bool {
        match self {
            DesignStatus::Succeeded | DesignStatus::Failed | DesignStatus::NotSucceeded => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DesignStatus::Pending => "Pending",
            DesignStatus::Running => "Running",
            DesignStatus::Succeeded => "Succeeded",
            DesignStatus::Failed => "Failed",
            DesignStatus::NotSucceeded => "NotSucceeded",
            DesignStatus::Other(s) => s,
        }
    }
}

impl Default for DesignStatus {
    fn default() -> Self {
        DesignStatus::Pending
    }
}

impl From<String> for DesignStatus {
    fn from(s: String) -> Self {
        match s.to_lowercase().as_str() {
            "pending" | "" => DesignStatus::Pending,
            "running" => DesignStatus::Running,
            "succeeded" => DesignStatus::Succeeded,
            "failed" => DesignStatus::Failed,
            "notsucceeded" | "not_succeeded" => DesignStatus::NotSucceeded,
            _ => DesignStatus::Other(s),
        }
    }
}

impl From<DesignStatus> for String {
    fn from(status: DesignStatus) -> Self {
        status.as_str().to_string()
    }
}

#[test]
fn project_state_from_wire() {
    let state: ProjectState = serde_json::from_str("\"FINISHED\"").unwrap();
    assert_eq!(state, ProjectState::Finished);
    assert!(state.is_terminal());

    let state: ProjectState = serde_json::from_str("\"PROCESSING\"").unwrap();
    assert!(!state.is_terminal());
    assert!(!state.is_stopped());

    assert!(ProjectState::Idle.is_stopped());
    assert!(!ProjectState::Idle.is_terminal());

    let state: ProjectState = serde_json::from_str("\"WARP_SPEED\"").unwrap();
    assert_eq!(state, ProjectState::Other("WARP_SPEED".to_string()));
    assert_eq!(serde_json::to_string(&state).unwrap(), "\"WARP_SPEED\"");
}

#[test]
fn stop_priorities() {
    assert!(
        ProjectState::AbortRequested.stop_request_priority()
            > ProjectState::StopRequested.stop_request_priority()
    );
    assert_eq!(ProjectState::Processing.stop_request_priority(), None);
}
