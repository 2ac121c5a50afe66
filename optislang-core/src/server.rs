//! Control of a running optiSLang server.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use optislang_net::msg::{
    ActorInfoRequest, ActorInfoResponse, ActorPropertiesRequest, ActorStatusInfoRequest,
    ActorStatusInfoResponse, BasicProjectInfoRequest, BasicProjectInfoResponse, Command,
    DesignResult, FullProjectStatusInfoRequest, FullProjectTreeRequest, GetDesignsRequest,
    PendingDesign, ProjectState, ProjectTreeResponse, Request, ServerInfoRequest,
    ServerIsAliveRequest,
};
use optislang_net::{Client, ClientConfig, Endpoint, LogContext};
use serde_json::Value;

use crate::config::Config;
use crate::process::ServerProcess;
use crate::study::ExecutionOption;
use crate::{Error, Result};

/// Time the server gets to exit on its own after a shutdown request.
pub const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);

const STOP_PRIORITY: u8 = 20;
const STOP_GENTLY_PRIORITY: u8 = 10;

/// Connection to an optiSLang server, optionally owning the local server
/// process.
///
/// All operations take a shared reference, so a single instance can be
/// wrapped in an `Arc` and used from a background thread running a design
/// study.
pub struct Optislang {
    client: Client,
    process: Mutex<Option<ServerProcess>>,
    status_poll_interval: Duration,
    start_timeout: Duration,
    finish_timeout: Option<Duration>,
    disposed: AtomicBool,
    log: LogContext,
}

impl Optislang {
    /// Wraps an already configured client.
    pub fn new(client: Client, log: LogContext) -> Self {
        Self {
            client,
            process: Mutex::new(None),
            status_poll_interval: Duration::from_millis(500),
            start_timeout: Duration::from_secs(60),
            finish_timeout: None,
            disposed: AtomicBool::new(false),
            log,
        }
    }

    /// Connects to a server that is already running.
    pub fn connect(endpoint: Endpoint, config: &Config, log: LogContext) -> Self {
        let client = Client::new(endpoint, config.client_config(), log.child("client"));
        let mut osl = Self::new(client, log);
        osl.status_poll_interval = config.client.status_poll_interval;
        osl.start_timeout = config.client.start_timeout;
        osl.finish_timeout = config.client.finish_timeout;
        osl
    }

    /// Launches a local server process and connects to it once it
    /// announces its port.
    pub fn launch(config: &Config, log: LogContext) -> Result<Self> {
        let mut process = ServerProcess::new(config.process.clone(), log.child("process"));
        process.start()?;
        let info = match process.wait_for_server_info(None) {
            Ok(info) => info,
            Err(e) => {
                if let Err(te) = process.terminate(true) {
                    warn!(target: log.target(), "failed terminating server process: {}", te);
                }
                return Err(e);
            }
        };
        let endpoint = info.endpoint()?;
        info!(target: log.target(), "server started, listening on {}", endpoint);
        let osl = Self::connect(endpoint, config, log);
        *osl.process_guard() = Some(process);
        Ok(osl)
    }

    pub fn with_client_config(endpoint: Endpoint, config: ClientConfig, log: LogContext) -> Self {
        Self::new(Client::new(endpoint, config, log.child("client")), log)
    }

    pub fn set_status_poll_interval(&mut self, interval: Duration) {
        self.status_poll_interval = interval;
    }

    pub fn set_start_timeout(&mut self, timeout: Duration) {
        self.start_timeout = timeout;
    }

    pub fn set_finish_timeout(&mut self, timeout: Option<Duration>) {
        self.finish_timeout = timeout;
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.client.endpoint()
    }

    pub fn log(&self) -> &LogContext {
        &self.log
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// True if this instance launched the server process itself.
    pub fn is_local(&self) -> bool {
        self.process_guard().is_some()
    }

    pub fn server_pid(&self) -> Option<u32> {
        self.process_guard().as_ref().and_then(|p| p.pid())
    }

    fn process_guard(&self) -> std::sync::MutexGuard<'_, Option<ServerProcess>> {
        // a poisoned lock still holds a usable process handle
        self.process.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn request<R: Request>(&self, request: &R) -> Result<R::Response> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        Ok(self.client.request(request)?)
    }

    // queries

    /// Checks the server is responding.
    pub fn ping(&self) -> Result<()> {
        self.request(&ServerIsAliveRequest)?;
        Ok(())
    }

    pub fn server_info(&self) -> Result<Value> {
        self.request(&ServerInfoRequest)
    }

    pub fn basic_project_info(&self) -> Result<BasicProjectInfoResponse> {
        self.request(&BasicProjectInfoRequest)
    }

    pub fn full_project_status_info(&self) -> Result<Value> {
        self.request(&FullProjectStatusInfoRequest)
    }

    pub fn full_project_tree(&self) -> Result<ProjectTreeResponse> {
        self.request(&FullProjectTreeRequest)
    }

    pub fn actor_info(&self, uid: &str) -> Result<ActorInfoResponse> {
        self.request(&ActorInfoRequest {
            uid: uid.to_string(),
        })
    }

    pub fn actor_properties(&self, uid: &str) -> Result<Value> {
        self.request(&ActorPropertiesRequest {
            uid: uid.to_string(),
        })
    }

    pub fn actor_status_info(&self, uid: &str, hid: &str) -> Result<ActorStatusInfoResponse> {
        self.request(&ActorStatusInfoRequest {
            uid: uid.to_string(),
            hid: hid.to_string(),
        })
    }

    /// Current state of the project.
    pub fn get_status(&self) -> Result<ProjectState> {
        let info = self.basic_project_info()?;
        info.state().cloned().ok_or_else(|| {
            Error::Net(optislang_net::Error::ResponseFormat(
                "project info lists no project".to_string(),
            ))
        })
    }

    /// Designs waiting for evaluation by a proxy solver node.
    pub fn get_designs(&self, uid: &str) -> Result<Vec<PendingDesign>> {
        let response = self.request(&GetDesignsRequest {
            uid: uid.to_string(),
        })?;
        Ok(response.designs)
    }

    // commands

    pub fn set_designs(&self, uid: &str, designs: Vec<DesignResult>) -> Result<()> {
        self.request(&Command::SetDesigns {
            actor_uid: uid.to_string(),
            designs,
        })?;
        Ok(())
    }

    pub fn set_actor_property(&self, uid: &str, name: &str, value: Value) -> Result<()> {
        self.request(&Command::SetActorProperty {
            actor_uid: uid.to_string(),
            name: name.to_string(),
            value,
        })?;
        Ok(())
    }

    pub fn set_execution_options(&self, uid: &str, options: ExecutionOption) -> Result<()> {
        trace!(target: self.log.target(), "setting execution options of {} to {}", uid, options);
        self.request(&Command::set_execution_options(uid, options.bits()))?;
        Ok(())
    }

    /// Starts the project. Nothing is sent if the project is processing
    /// already.
    ///
    /// Returns once the server reports the run, so the status seen
    /// afterwards never belongs to an earlier run.
    pub fn start(&self, wait_for_finished: bool) -> Result<()> {
        let before = self.get_status()?;
        if before == ProjectState::Processing {
            warn!(
                target: self.log.target(),
                "project is already PROCESSING, START was not sent"
            );
        } else {
            self.request(&Command::Start)?;
            let state = self.wait_for_started(&before)?;
            debug!(target: self.log.target(), "project started, status {}", state);
        }
        if wait_for_finished {
            let state = self.wait_for_finished(self.finish_timeout)?;
            info!(target: self.log.target(), "project finished with status {}", state);
        }
        Ok(())
    }

    /// Stops the project as soon as possible.
    pub fn stop(&self, wait_for_finished: bool) -> Result<()> {
        self.send_stop(Command::Stop, STOP_PRIORITY, wait_for_finished)
    }

    /// Stops the project once the designs already running are done.
    pub fn stop_gently(&self, wait_for_finished: bool) -> Result<()> {
        self.send_stop(Command::StopGently, STOP_GENTLY_PRIORITY, wait_for_finished)
    }

    fn send_stop(&self, command: Command, priority: u8, wait_for_finished: bool) -> Result<()> {
        let state = self.get_status()?;
        if state.is_stopped() {
            debug!(
                target: self.log.target(),
                "not sending {}, project status is {}",
                command.name(),
                state
            );
            return Ok(());
        }
        match state.stop_request_priority() {
            Some(pending) if pending >= priority => debug!(
                target: self.log.target(),
                "not sending {}, project status is {}",
                command.name(),
                state
            ),
            _ => {
                self.request(&command)?;
            }
        }
        if wait_for_finished {
            self.wait_for_finished(self.finish_timeout)?;
        }
        Ok(())
    }

    pub fn reset(&self) -> Result<()> {
        self.request(&Command::Reset)?;
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        self.request(&Command::Save)?;
        Ok(())
    }

    pub fn save_as<P: AsRef<Path>>(&self, path: P, force: bool, restore: bool, reset: bool) -> Result<()> {
        self.request(&Command::SaveAs {
            path: path.as_ref().to_path_buf(),
            force,
            restore,
            reset,
        })?;
        Ok(())
    }

    pub fn save_copy<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.request(&Command::SaveCopy {
            path: path.as_ref().to_path_buf(),
        })?;
        Ok(())
    }

    /// Polls the project state until it is processing or differs from the
    /// state reported before START.
    fn wait_for_started(&self, before: &ProjectState) -> Result<ProjectState> {
        let start = Instant::now();
        loop {
            let state = self.get_status()?;
            if state == ProjectState::Processing || state != *before {
                return Ok(state);
            }
            if start.elapsed() >= self.start_timeout {
                return Err(Error::Net(optislang_net::Error::TimedOut(format!(
                    "waiting for project to start, status still {}",
                    state
                ))));
            }
            thread::sleep(self.status_poll_interval);
        }
    }

    /// Polls the project state until it reaches a terminal state.
    pub fn wait_for_finished(&self, timeout: Option<Duration>) -> Result<ProjectState> {
        let start = Instant::now();
        loop {
            let state = self.get_status()?;
            if state.is_terminal() {
                return Ok(state);
            }
            if let Some(t) = timeout {
                if start.elapsed() >= t {
                    return Err(Error::Net(optislang_net::Error::TimedOut(format!(
                        "waiting for project to finish, last status {}",
                        state
                    ))));
                }
            }
            thread::sleep(self.status_poll_interval);
        }
    }

    /// Shuts the server down.
    ///
    /// A local server process that doesn't exit shortly after the request
    /// is terminated. With `force`, failing to deliver the request is not an
    /// error as long as the local process can be terminated.
    pub fn shutdown(&self, force: bool) -> Result<()> {
        let mut guard = self.process_guard();
        if let Err(e) = self.request(&Command::Shutdown) {
            if !force || guard.is_none() {
                return Err(e);
            }
            warn!(target: self.log.target(), "shutdown request failed: {}", e);
        }
        if let Some(mut process) = guard.take() {
            let start = Instant::now();
            while process.is_running() && start.elapsed() < SHUTDOWN_WAIT {
                thread::sleep(SHUTDOWN_POLL_INTERVAL);
            }
            if process.is_running() {
                warn!(
                    target: self.log.target(),
                    "server did not shut down within {:?}, terminating",
                    SHUTDOWN_WAIT
                );
            }
            let code = process.terminate(force)?;
            debug!(target: self.log.target(), "server process exit code: {:?}", code);
        }
        Ok(())
    }

    /// Disposes the instance, terminating the local server process if
    /// there is one. Any later operation fails.
    pub fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(target: self.log.target(), "disposing optislang instance");
        if let Some(mut process) = self.process_guard().take() {
            if process.is_running() {
                process.terminate(false)?;
            }
        }
        Ok(())
    }
}

impl Drop for Optislang {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            error!(target: self.log.target(), "failed disposing: {}", e);
        }
    }
}
