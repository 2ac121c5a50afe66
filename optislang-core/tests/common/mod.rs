//! In-process stand-in for an optiSLang server.
//!
//! Answers framed requests over a TCP listener from a shared in-memory
//! project model. Starting the project finishes it immediately, unless the
//! proxy solver system is part of the run, in which case the project keeps
//! processing until all of its designs were evaluated.
//!
//! Like a real server, the mock is slow to report a run: after START the
//! first `start_lag` status queries still see the state from before, and a
//! run that finishes immediately is seen processing once.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use optislang_core::{ExecutionOption, Optislang};
use optislang_net::msg::{request_name, ProjectState, EXECUTION_OPTIONS_PROPERTY};
use optislang_net::{ClientConfig, Endpoint, Listener, LogContext};
use serde_json::{json, Value};

/// Designs generated for every executed system without a proxy solver.
pub const DESIGNS_PER_SYSTEM: usize = 5;

/// Proxy solver served by the mock.
#[derive(Debug, Clone)]
pub struct MockProxy {
    pub system_uid: String,
    pub solver_uid: String,
    /// Designs generated over a whole run
    pub total: usize,
    /// Designs handed out per batch
    pub batch: usize,
}

#[derive(Debug, Default)]
pub struct MockState {
    pub project_state: String,
    /// Status queries after START still answered with the previous state
    pub start_lag: usize,
    /// States reported before `project_state` is
    pub reported: VecDeque<String>,
    pub root_nodes: Vec<String>,
    pub options: HashMap<String, u32>,
    /// Snapshot of the execution options at every START
    pub starts: Vec<HashMap<String, u32>>,
    /// Names of all requests received, in order
    pub requests: Vec<String>,
    pub proxy: Option<MockProxy>,
    /// Designs handed out but not evaluated yet
    pub outstanding: Vec<(String, f64)>,
    pub generated: usize,
    /// Evaluated designs: hid, parameter, response
    pub evaluated: Vec<(String, f64, f64)>,
    /// Hids submitted that were not outstanding
    pub unexpected: Vec<String>,
    /// Systems executed since the last reset
    pub executed: Vec<String>,
    pub resets: usize,
}

impl MockState {
    pub fn count(&self, name: &str) -> usize {
        self.requests.iter().filter(|r| *r == name).count()
    }

    pub fn option(&self, uid: &str) -> u32 {
        self.options.get(uid).copied().unwrap_or(0)
    }

    fn start(&mut self) {
        self.starts.push(self.options.clone());
        for _ in 0..self.start_lag {
            self.reported.push_back(self.project_state.clone());
        }
        let started: Vec<String> = self
            .options
            .iter()
            .filter(|(_, o)| ExecutionOption::from_bits(**o).contains(ExecutionOption::STARTING_POINT))
            .map(|(uid, _)| uid.clone())
            .collect();
        let proxy_started = match &self.proxy {
            Some(proxy) => started.contains(&proxy.system_uid),
            None => false,
        };
        self.executed.extend(started);
        if proxy_started {
            self.project_state = "PROCESSING".to_string();
            self.generated = 0;
            self.outstanding.clear();
        } else {
            self.reported.push_back("PROCESSING".to_string());
            self.project_state = "FINISHED".to_string();
        }
    }

    fn reported_state(&mut self) -> String {
        match self.reported.pop_front() {
            Some(state) => state,
            None => self.project_state.clone(),
        }
    }

    fn get_designs(&mut self, uid: &str) -> Value {
        let proxy = match &self.proxy {
            Some(proxy) if proxy.solver_uid == uid => proxy.clone(),
            _ => return json!({"designs": []}),
        };
        if self.project_state == "PROCESSING" && self.outstanding.is_empty() {
            let n = proxy.batch.min(proxy.total - self.generated);
            for _ in 0..n {
                self.generated += 1;
                let hid = format!("0.{}", self.generated);
                self.outstanding.push((hid, self.generated as f64));
            }
        }
        let designs: Vec<Value> = self
            .outstanding
            .iter()
            .map(|(hid, x)| json!({"hid": hid, "parameters": [{"name": "x", "value": x}]}))
            .collect();
        json!({ "designs": designs })
    }

    fn set_designs(&mut self, designs: &[Value]) {
        for design in designs {
            let hid = design["hid"].as_str().unwrap_or_default().to_string();
            let y = design["responses"][0]["value"].as_f64().unwrap_or(f64::NAN);
            match self.outstanding.iter().position(|(h, _)| *h == hid) {
                Some(i) => {
                    let (hid, x) = self.outstanding.remove(i);
                    self.evaluated.push((hid, x, y));
                }
                None => self.unexpected.push(hid),
            }
        }
        if let Some(proxy) = &self.proxy {
            if self.generated >= proxy.total && self.outstanding.is_empty() {
                self.project_state = "FINISHED".to_string();
            }
        }
    }

    fn status_info(&self, uid: &str) -> Value {
        let values: Vec<Value> = match &self.proxy {
            Some(proxy) if proxy.system_uid == uid => self
                .evaluated
                .iter()
                .map(|(hid, x, y)| {
                    json!({"hid": hid, "parameter_values": [x], "response_values": [y]})
                })
                .collect(),
            _ if self.executed.iter().any(|e| e == uid) => (1..=DESIGNS_PER_SYSTEM)
                .map(|n| {
                    json!({
                        "hid": format!("0.{}", n),
                        "parameter_values": [n as f64],
                        "response_values": [2. * n as f64]
                    })
                })
                .collect(),
            _ => Vec::new(),
        };
        let statuses: Vec<Value> = values
            .iter()
            .map(|v| json!({"id": v["hid"], "feasible": true, "status": "Succeeded"}))
            .collect();
        json!({
            "designs": {
                "parameter_names": ["x"],
                "response_names": ["y"],
                "values": values
            },
            "design_status": statuses
        })
    }

    fn reset(&mut self) {
        self.resets += 1;
        self.project_state = "IDLE".to_string();
        self.reported.clear();
        self.outstanding.clear();
        self.evaluated.clear();
        self.executed.clear();
        self.generated = 0;
    }

    fn handle(&mut self, body: &Value) -> Value {
        let name = request_name(body).unwrap_or_default().to_string();
        self.requests.push(name.clone());
        let command = &body["projects"][0]["commands"][0];
        let uid = body["uid"].as_str().unwrap_or_default();
        match name.as_str() {
            "SERVER_IS_ALIVE" => json!({}),
            "SERVER_INFO" => json!({"application": "mock", "version": "0"}),
            "BASIC_PROJECT_INFO" => json!({
                "projects": [{"name": "mock", "location": "/mock.opf", "state": self.reported_state()}]
            }),
            "FULL_PROJECT_TREE" => {
                let nodes: Vec<Value> = self
                    .root_nodes
                    .iter()
                    .map(|uid| json!({"uid": uid, "name": uid, "type": "System"}))
                    .collect();
                json!({"projects": [{"system": {"uid": "root", "type": "RootSystem", "nodes": nodes}}]})
            }
            "ACTOR_STATUS_INFO" => self.status_info(uid),
            "GET_DESIGNS" => self.get_designs(uid),
            "SET_ACTOR_PROPERTY" => {
                let uid = command["actor_uid"].as_str().unwrap_or_default().to_string();
                if command["args"]["name"] == EXECUTION_OPTIONS_PROPERTY {
                    let value = command["args"]["value"].as_u64().unwrap_or(0) as u32;
                    self.options.insert(uid, value);
                }
                ack()
            }
            "SET_DESIGNS" => {
                let designs = command["args"]["designs"].as_array().cloned().unwrap_or_default();
                self.set_designs(&designs);
                ack()
            }
            "START" => {
                self.start();
                ack()
            }
            "STOP" | "STOP_GENTLY" => {
                self.reported.clear();
                self.project_state = "STOPPED".to_string();
                ack()
            }
            "RESET" => {
                self.reset();
                ack()
            }
            "SHUTDOWN" | "SAVE" | "SAVE_AS" | "SAVE_COPY" => ack(),
            _ => json!([{"status": "failure", "message": "unknown request", "std_err": name}]),
        }
    }
}

fn ack() -> Value {
    json!([{"status": "success"}])
}

/// Mock server answering requests on a background thread until dropped.
pub struct MockServer {
    endpoint: Endpoint,
    state: Arc<Mutex<MockState>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MockServer {
    pub fn start(state: MockState) -> Self {
        let listener = Listener::bind(&Endpoint::localhost(0)).unwrap();
        let endpoint = listener.endpoint().clone();
        let state = Arc::new(Mutex::new(state));
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let state = state.clone();
            let stop = stop.clone();
            thread::spawn(move || serve(listener, state, stop))
        };
        Self {
            endpoint,
            state,
            stop,
            handle: Some(handle),
        }
    }

    /// Project with the given top level systems, nothing executed yet.
    pub fn with_systems(root_nodes: &[&str], proxy: Option<MockProxy>) -> Self {
        Self::start(MockState {
            project_state: "IDLE".to_string(),
            start_lag: 1,
            root_nodes: root_nodes.iter().map(|s| s.to_string()).collect(),
            proxy,
            ..MockState::default()
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Client instance connected to the mock, polling status quickly.
    pub fn connect(&self) -> Optislang {
        let mut config = ClientConfig::default();
        config.request_timeout = Some(Duration::from_secs(5));
        config.long_request_timeout = Some(Duration::from_secs(5));
        let mut osl = Optislang::with_client_config(
            self.endpoint.clone(),
            config,
            LogContext::new("mock_client"),
        );
        osl.set_status_poll_interval(Duration::from_millis(10));
        osl.set_finish_timeout(Some(Duration::from_secs(20)));
        osl
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn serve(listener: Listener, state: Arc<Mutex<MockState>>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        let mut socket = match listener.accept(Some(Duration::from_millis(20))) {
            Ok(socket) => socket,
            Err(_) => continue,
        };
        let request = match socket.receive_msg(Some(Duration::from_secs(5))) {
            Ok(request) => request,
            Err(_) => continue,
        };
        let body: Value = match serde_json::from_str(&request) {
            Ok(body) => body,
            Err(_) => continue,
        };
        let response = state.lock().unwrap().handle(&body);
        let _ = socket.send_msg(&response.to_string(), Some(Duration::from_secs(5)));
        socket.close();
    }
}

/// Squares the `x` parameter of every design into the `y` response.
pub fn square(designs: &[optislang_net::msg::PendingDesign]) -> Vec<optislang_net::msg::DesignResult> {
    use optislang_net::msg::{DesignResult, NamedValue};
    designs
        .iter()
        .map(|d| {
            let x = d.parameter("x").unwrap_or(0.);
            DesignResult::new(&d.hid, vec![NamedValue::new("y", x * x)])
        })
        .collect()
}

pub fn init_log() {
    let _ = simplelog::TestLogger::init(simplelog::LevelFilter::Debug, simplelog::Config::default());
}

pub fn processing(state: &MockState) -> bool {
    state.project_state == ProjectState::Processing.as_str()
}
