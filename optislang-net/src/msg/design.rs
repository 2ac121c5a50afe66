use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::DesignStatus;

/// Named numeric value, used for both parameters and responses.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct NamedValue {
    pub name: String,
    pub value: f64,
}

impl NamedValue {
    pub fn new(name: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            value,
        }
    }
}

/// Design waiting for evaluation by a proxy solver.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct PendingDesign {
    pub hid: String,
    #[serde(default)]
    pub parameters: Vec<NamedValue>,
}

impl PendingDesign {
    pub fn parameter(&self, name: &str) -> Option<f64> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value)
    }
}

/// Evaluated responses for a single pending design.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct DesignResult {
    pub hid: String,
    pub responses: Vec<NamedValue>,
}

impl DesignResult {
    pub fn new(hid: &str, responses: Vec<NamedValue>) -> Self {
        Self {
            hid: hid.to_string(),
            responses,
        }
    }
}

/// Table of designs as reported in the actor status info.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DesignTable {
    pub parameter_names: Vec<String>,
    pub response_names: Vec<String>,
    pub objective_names: Vec<String>,
    pub constraint_names: Vec<String>,
    pub limit_state_names: Vec<String>,
    pub values: Vec<DesignValues>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DesignValues {
    pub hid: String,
    pub parameter_values: Vec<Value>,
    pub response_values: Vec<Value>,
    pub objective_values: Vec<Value>,
    pub constraint_values: Vec<Value>,
    pub limit_state_values: Vec<Value>,
}

/// Per-design evaluation status entry.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DesignStatusEntry {
    /// Design hid
    pub id: String,
    pub feasible: Option<bool>,
    pub status: DesignStatus,
    pub pareto_design: Option<bool>,
    pub directory: Option<String>,
}

/// Evaluated design assembled from the design table and status list.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Design {
    pub hid: String,
    pub parameters: FnvHashMap<String, f64>,
    pub responses: FnvHashMap<String, f64>,
    pub objectives: FnvHashMap<String, f64>,
    pub constraints: FnvHashMap<String, f64>,
    pub limit_states: FnvHashMap<String, f64>,
    pub status: DesignStatus,
    pub feasible: Option<bool>,
    pub pareto_design: bool,
}

impl Design {
    /// Whether the design was evaluated and satisfies all constraints.
    pub fn is_feasible(&self) -> bool {
        self.status == DesignStatus::Succeeded && self.feasible.unwrap_or(true)
    }
}

/// Pairs names with values, skipping any non-numeric values.
fn zip_numeric(names: &[String], values: &[Value]) -> FnvHashMap<String, f64> {
    names
        .iter()
        .zip(values)
        .filter_map(|(name, value)| value.as_f64().map(|v| (name.clone(), v)))
        .collect()
}

impl DesignTable {
    /// Assembles designs, attaching the matching status entry of each.
    pub fn designs(&self, statuses: &[DesignStatusEntry]) -> Vec<Design> {
        let statuses: FnvHashMap<&str, &DesignStatusEntry> =
            statuses.iter().map(|s| (s.id.as_str(), s)).collect();
        self.values
            .iter()
            .map(|values| {
                let status = statuses.get(values.hid.as_str());
                Design {
                    hid: values.hid.clone(),
                    parameters: zip_numeric(&self.parameter_names, &values.parameter_values),
                    responses: zip_numeric(&self.response_names, &values.response_values),
                    objectives: zip_numeric(&self.objective_names, &values.objective_values),
                    constraints: zip_numeric(&self.constraint_names, &values.constraint_values),
                    limit_states: zip_numeric(&self.limit_state_names, &values.limit_state_values),
                    status: status.map(|s| s.status.clone()).unwrap_or_default(),
                    feasible: status.and_then(|s| s.feasible),
                    pareto_design: status.and_then(|s| s.pareto_design).unwrap_or(false),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn assemble_designs() {
        let table: DesignTable = serde_json::from_value(json!({
            "parameter_names": ["x", "y"],
            "response_names": ["z"],
            "values": [
                {"hid": "0.1", "parameter_values": [1.0, 2.0], "response_values": [3.0]},
                {"hid": "0.2", "parameter_values": [4.0, "discrete"], "response_values": []}
            ]
        }))
        .unwrap();
        let statuses: Vec<DesignStatusEntry> = serde_json::from_value(json!([
            {"id": "0.1", "feasible": true, "status": "Succeeded"},
            {"id": "0.2", "feasible": false, "status": "Failed"}
        ]))
        .unwrap();

        let designs = table.designs(&statuses);
        assert_eq!(designs.len(), 2);
        assert_eq!(designs[0].responses["z"], 3.0);
        assert!(designs[0].is_feasible());
        // non numeric values are skipped
        assert_eq!(designs[1].parameters.len(), 1);
        assert!(!designs[1].is_feasible());
        assert_eq!(designs[1].status, DesignStatus::Failed);
    }

    #[test]
    fn pending_design_lookup() {
        let design: PendingDesign = serde_json::from_value(json!({
            "hid": "0.3",
            "parameters": [{"name": "a", "value": 0.5}]
        }))
        .unwrap();
        assert_eq!(design.parameter("a"), Some(0.5));
        assert_eq!(design.parameter("b"), None);
    }
}
