use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{query_json, Ack, Design, DesignStatusEntry, DesignTable, PendingDesign, ProjectState, Request};

pub const SERVER_IS_ALIVE: &str = "SERVER_IS_ALIVE";
pub const SERVER_INFO: &str = "SERVER_INFO";
pub const BASIC_PROJECT_INFO: &str = "BASIC_PROJECT_INFO";
pub const FULL_PROJECT_STATUS_INFO: &str = "FULL_PROJECT_STATUS_INFO";
pub const FULL_PROJECT_TREE: &str = "FULL_PROJECT_TREE";
pub const ACTOR_INFO: &str = "ACTOR_INFO";
pub const ACTOR_PROPERTIES: &str = "ACTOR_PROPERTIES";
pub const ACTOR_STATUS_INFO: &str = "ACTOR_STATUS_INFO";
pub const GET_DESIGNS: &str = "GET_DESIGNS";

/// Names of all supported queries.
pub const QUERIES: &[&str] = &[
    SERVER_IS_ALIVE,
    SERVER_INFO,
    BASIC_PROJECT_INFO,
    FULL_PROJECT_STATUS_INFO,
    FULL_PROJECT_TREE,
    ACTOR_INFO,
    ACTOR_PROPERTIES,
    ACTOR_STATUS_INFO,
    GET_DESIGNS,
];

/// Checks whether the server is up and responding.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServerIsAliveRequest;

impl Request for ServerIsAliveRequest {
    type Response = Ack;
    fn name(&self) -> &'static str {
        SERVER_IS_ALIVE
    }
    fn to_json(&self, password: Option<&str>) -> Value {
        query_json(SERVER_IS_ALIVE, None, None, None, password)
    }
}

/// Requests general information about the server application.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServerInfoRequest;

impl Request for ServerInfoRequest {
    type Response = Value;
    fn name(&self) -> &'static str {
        SERVER_INFO
    }
    fn to_json(&self, password: Option<&str>) -> Value {
        query_json(SERVER_INFO, None, None, None, password)
    }
}

/// Requests basic information about the opened project, including its
/// current state.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BasicProjectInfoRequest;

impl Request for BasicProjectInfoRequest {
    type Response = BasicProjectInfoResponse;
    fn name(&self) -> &'static str {
        BASIC_PROJECT_INFO
    }
    fn to_json(&self, password: Option<&str>) -> Value {
        query_json(BASIC_PROJECT_INFO, None, None, None, password)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct BasicProjectInfoResponse {
    #[serde(default)]
    pub projects: Vec<ProjectInfo>,
}

impl BasicProjectInfoResponse {
    /// State of the first (and only) opened project.
    pub fn state(&self) -> Option<&ProjectState> {
        self.projects.first().map(|p| &p.state)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ProjectInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub location: String,
    pub state: ProjectState,
}

/// Requests the complete status tree of the project.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FullProjectStatusInfoRequest;

impl Request for FullProjectStatusInfoRequest {
    type Response = Value;
    fn name(&self) -> &'static str {
        FULL_PROJECT_STATUS_INFO
    }
    fn to_json(&self, password: Option<&str>) -> Value {
        query_json(FULL_PROJECT_STATUS_INFO, None, None, None, password)
    }
    fn is_long_running(&self) -> bool {
        true
    }
}

/// Requests the tree of systems and nodes making up the project.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FullProjectTreeRequest;

impl Request for FullProjectTreeRequest {
    type Response = ProjectTreeResponse;
    fn name(&self) -> &'static str {
        FULL_PROJECT_TREE
    }
    fn to_json(&self, password: Option<&str>) -> Value {
        query_json(FULL_PROJECT_TREE, None, None, None, password)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ProjectTreeResponse {
    #[serde(default)]
    pub projects: Vec<ProjectTree>,
}

impl ProjectTreeResponse {
    /// Nodes placed directly in the root system of the project.
    pub fn root_nodes(&self) -> &[TreeNode] {
        self.projects
            .first()
            .map(|p| p.system.nodes.as_slice())
            .unwrap_or(&[])
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ProjectTree {
    #[serde(default)]
    pub system: TreeNode,
}

/// Node of the project tree, systems carry their child nodes.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TreeNode {
    pub uid: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub nodes: Vec<TreeNode>,
}

impl TreeNode {
    /// Depth-first search for a node with the given uid.
    pub fn find(&self, uid: &str) -> Option<&TreeNode> {
        if self.uid == uid {
            return Some(self);
        }
        self.nodes.iter().find_map(|n| n.find(uid))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ActorInfoRequest {
    pub uid: String,
}

impl Request for ActorInfoRequest {
    type Response = ActorInfoResponse;
    fn name(&self) -> &'static str {
        ACTOR_INFO
    }
    fn to_json(&self, password: Option<&str>) -> Value {
        query_json(ACTOR_INFO, Some(&self.uid), None, None, password)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ActorInfoResponse {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ActorPropertiesRequest {
    pub uid: String,
}

impl Request for ActorPropertiesRequest {
    type Response = Value;
    fn name(&self) -> &'static str {
        ACTOR_PROPERTIES
    }
    fn to_json(&self, password: Option<&str>) -> Value {
        query_json(ACTOR_PROPERTIES, Some(&self.uid), None, None, password)
    }
}

/// Requests status of an actor at a given hierarchical id, including the
/// table of its designs.
#[derive(Clone, Debug, PartialEq)]
pub struct ActorStatusInfoRequest {
    pub uid: String,
    pub hid: String,
}

impl Request for ActorStatusInfoRequest {
    type Response = ActorStatusInfoResponse;
    fn name(&self) -> &'static str {
        ACTOR_STATUS_INFO
    }
    fn to_json(&self, password: Option<&str>) -> Value {
        let args = serde_json::json!({
            "include_designs": true,
            "include_design_values": true,
            "include_non_scalar_design_values": false,
        });
        query_json(ACTOR_STATUS_INFO, Some(&self.uid), Some(&self.hid), Some(args), password)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ActorStatusInfoResponse {
    pub designs: DesignTable,
    pub design_status: Vec<DesignStatusEntry>,
}

impl ActorStatusInfoResponse {
    pub fn designs(&self) -> Vec<Design> {
        self.designs.designs(&self.design_status)
    }
}

/// Requests designs waiting for evaluation by a proxy solver node.
#[derive(Clone, Debug, PartialEq)]
pub struct GetDesignsRequest {
    pub uid: String,
}

impl Request for GetDesignsRequest {
    type Response = PendingDesigns;
    fn name(&self) -> &'static str {
        GET_DESIGNS
    }
    fn to_json(&self, password: Option<&str>) -> Value {
        query_json(GET_DESIGNS, Some(&self.uid), None, None, password)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct PendingDesigns {
    #[serde(default)]
    pub designs: Vec<PendingDesign>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn basic_project_info_state() {
        let response: BasicProjectInfoResponse = serde_json::from_value(json!({
            "projects": [{"name": "calc", "location": "/p/calc.opf", "state": "PROCESSING"}]
        }))
        .unwrap();
        assert_eq!(response.state(), Some(&ProjectState::Processing));
        assert_eq!(BasicProjectInfoResponse::default().state(), None);
    }

    #[test]
    fn project_tree_root_nodes() {
        let response: ProjectTreeResponse = serde_json::from_value(json!({
            "projects": [{"system": {
                "uid": "root",
                "type": "RootSystem",
                "nodes": [
                    {"uid": "a", "name": "Sensitivity", "type": "Sensitivity",
                     "nodes": [{"uid": "a1", "name": "Calc", "type": "CalculatorSet"}]},
                    {"uid": "b", "name": "Mop", "type": "Mop"}
                ]
            }}]
        }))
        .unwrap();
        let uids: Vec<_> = response.root_nodes().iter().map(|n| n.uid.as_str()).collect();
        assert_eq!(uids, vec!["a", "b"]);
        assert_eq!(response.projects[0].system.find("a1").map(|n| n.name.as_str()), Some("Calc"));
        assert!(ProjectTreeResponse::default().root_nodes().is_empty());
    }

    #[test]
    fn get_designs_body() {
        let request = GetDesignsRequest {
            uid: "solver".to_string(),
        };
        assert_eq!(
            request.to_json(None),
            json!({"What": "GET_DESIGNS", "uid": "solver"})
        );
        let response: PendingDesigns = serde_json::from_value(json!({"designs": []})).unwrap();
        assert!(response.designs.is_empty());
    }

    #[test]
    fn actor_status_info_designs() {
        let response: ActorStatusInfoResponse = serde_json::from_value(json!({
            "designs": {
                "parameter_names": ["x"],
                "response_names": ["y"],
                "values": [{"hid": "0.1", "parameter_values": [2.0], "response_values": [4.0]}]
            },
            "design_status": [{"id": "0.1", "feasible": true, "status": "Succeeded"}]
        }))
        .unwrap();
        let designs = response.designs();
        assert_eq!(designs.len(), 1);
        assert_eq!(designs[0].hid, "0.1");
        assert!(designs[0].is_feasible());
    }
}
