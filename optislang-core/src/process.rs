//! Supervision of a local optiSLang server process.
//!
//! [`ServerProcess`] owns the external process from launch to termination,
//! going through the states of [`ProcessState`]. Termination never hangs:
//! a process ignoring the graceful request is killed, together with any
//! processes it spawned, once the grace period runs out.

use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use fnv::FnvHashMap;
use optislang_net::{Endpoint, LogContext};

use crate::config::secs;
use crate::{Error, Result};

/// Exit code signalling the server could not obtain a license.
pub const LICENSING_EXIT_CODE: i32 = 11;

/// Name of the server info file written by the server.
pub const SERVER_INFO_FILE: &str = "server_info.ini";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lines of server stderr kept for error reports.
const STDERR_TAIL_LINES: usize = 20;
/// Time the output readers get to finish after the process exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Environment variable never passed on to the server.
const LIBRARY_PATH_VAR: &str = "LD_LIBRARY_PATH";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Path to the optiSLang executable
    pub executable: PathBuf,
    /// Project to open, or to create when `new_project` is set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_path: Option<PathBuf>,
    pub new_project: bool,
    /// Run without the graphical interface
    pub batch: bool,
    /// Range of ports the server is allowed to bind to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_range: Option<(u16, u16)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub no_save: bool,
    /// Where the server writes its info file, defaults to
    /// `<project dir>/<project name>.opd/server_info.ini`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<PathBuf>,
    pub shutdown_on_finished: bool,
    /// Remove `.ini` files next to the project before starting
    pub remove_ini_files: bool,
    /// Extra `name=value` arguments
    pub additional_args: Vec<String>,
    #[serde(with = "secs")]
    pub startup_timeout: Duration,
    /// Time the process gets to exit after a graceful termination request
    #[serde(with = "secs")]
    pub grace_period: Duration,
    pub env_vars: FnvHashMap<String, String>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("optislang"),
            project_path: None,
            new_project: false,
            batch: true,
            port_range: None,
            password: None,
            no_save: false,
            server_info: None,
            shutdown_on_finished: false,
            remove_ini_files: true,
            additional_args: Vec::new(),
            startup_timeout: Duration::from_secs(60),
            grace_period: Duration::from_secs(3),
            env_vars: FnvHashMap::default(),
        }
    }
}

impl ProcessConfig {
    /// Builds the command line arguments for the server executable.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.batch {
            args.push("-b".to_string());
        }
        if let Some(project) = &self.project_path {
            if self.new_project {
                args.push(format!("--new={}", project.display()));
            } else {
                args.push(project.display().to_string());
            }
            if self.batch {
                args.push("--no-run".to_string());
                args.push("--force".to_string());
            }
        }
        match self.port_range {
            Some((lo, hi)) => args.push(format!("--enable-tcp-server={}-{}", lo, hi)),
            None => args.push("--enable-tcp-server".to_string()),
        }
        if let Some(password) = &self.password {
            args.push(format!("--server-password={}", password));
        }
        if let Some(path) = self.server_info_path() {
            args.push(format!("--write-server-info={}", path.display()));
        }
        if self.no_save {
            args.push("--no-save".to_string());
        }
        args.extend(self.additional_args.iter().cloned());
        if self.shutdown_on_finished {
            args.push("--shutdown-on-finished".to_string());
        }
        args
    }

    /// Location of the server info file, either configured explicitly or
    /// derived from the project path.
    pub fn server_info_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.server_info {
            return Some(path.clone());
        }
        let project = self.project_path.as_ref()?;
        let stem = project.file_stem()?.to_string_lossy();
        let dir = project.parent().unwrap_or_else(|| Path::new(""));
        Some(dir.join(format!("{}.opd", stem)).join(SERVER_INFO_FILE))
    }
}

/// Contents of the server info file.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerInfo {
    pub port: u16,
    pub host: Option<String>,
    pub pid: Option<u32>,
    /// All the entries of the file
    pub values: FnvHashMap<String, String>,
}

impl ServerInfo {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        fs::read_to_string(path)?.parse()
    }

    /// Endpoint of the server, localhost unless the file names a host.
    pub fn endpoint(&self) -> Result<Endpoint> {
        let host = self.host.as_deref().unwrap_or("127.0.0.1");
        Ok(Endpoint::tcp(host, self.port)?)
    }
}

impl FromStr for ServerInfo {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let mut values = FnvHashMap::default();
        for line in s.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') || line.starts_with('[') {
                continue;
            }
            if let Some(idx) = line.find('=') {
                values.insert(
                    line[..idx].trim().to_lowercase(),
                    line[idx + 1..].trim().to_string(),
                );
            }
        }
        let port = values
            .get("server_port")
            .ok_or_else(|| Error::ServerStart("server info is missing server_port".to_string()))?
            .parse::<u16>()
            .map_err(|e| Error::ServerStart(format!("invalid server_port: {}", e)))?;
        let host = values
            .get("server_address")
            .or_else(|| values.get("host"))
            .filter(|h| !h.is_empty())
            .cloned();
        let pid = values.get("pid").and_then(|p| p.parse().ok());
        Ok(Self {
            port,
            host,
            pid,
            values,
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Starting,
    Running,
    Terminating,
    Terminated,
}

impl Display for ProcessState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessState::NotStarted => "not started",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Terminating => "terminating",
            ProcessState::Terminated => "terminated",
        };
        write!(f, "{}", s)
    }
}

/// Converts the exit status into a signed exit code. Processes killed by a
/// signal report the negated signal number.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

/// Output streams of the server, drained on their own threads.
struct ServerOutput {
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    closed: Receiver<()>,
    open: usize,
}

impl ServerOutput {
    fn new() -> (Self, Sender<()>) {
        let (sender, closed) = crossbeam_channel::bounded(2);
        let output = Self {
            stderr_tail: Arc::new(Mutex::new(VecDeque::new())),
            closed,
            open: 0,
        };
        (output, sender)
    }

    /// Waits a short while for the readers to reach the end of their
    /// streams.
    fn drain(&mut self) {
        let deadline = Instant::now() + OUTPUT_DRAIN_TIMEOUT;
        while self.open > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.closed.recv_timeout(deadline - now) {
                Ok(()) => self.open -= 1,
                Err(_) => break,
            }
        }
    }

    fn stderr_tail(&self) -> Vec<String> {
        let tail = self.stderr_tail.lock().unwrap_or_else(|e| e.into_inner());
        tail.iter().cloned().collect()
    }
}

/// Logs the lines of one output stream until it closes. Stdout goes to the
/// debug log, stderr is logged as warnings and its last lines are kept.
fn log_output<R: Read>(
    stream: R,
    stderr_tail: Option<Arc<Mutex<VecDeque<String>>>>,
    log: LogContext,
    closed: Sender<()>,
) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => (),
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end();
        match &stderr_tail {
            Some(tail) => {
                warn!(target: log.target(), "server stderr: {}", line);
                let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line.to_string());
            }
            None => debug!(target: log.target(), "server stdout: {}", line),
        }
    }
    let _ = closed.send(());
}

/// Local server process.
pub struct ServerProcess {
    config: ProcessConfig,
    state: ProcessState,
    child: Option<Child>,
    output: Option<ServerOutput>,
    exit_code: Option<i32>,
    log: LogContext,
}

impl ServerProcess {
    pub fn new(config: ProcessConfig, log: LogContext) -> Self {
        Self {
            config,
            state: ProcessState::NotStarted,
            child: None,
            output: None,
            exit_code: None,
            log,
        }
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(|c| c.id())
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Last lines the server wrote to stderr.
    pub fn stderr_tail(&self) -> Vec<String> {
        match &self.output {
            Some(output) => output.stderr_tail(),
            None => Vec::new(),
        }
    }

    /// Launches the server process.
    pub fn start(&mut self) -> Result<()> {
        if self.state != ProcessState::NotStarted {
            return Err(Error::ProcessState(format!(
                "cannot start process that is {}",
                self.state
            )));
        }
        if self.config.remove_ini_files {
            self.remove_server_info_files();
        }

        let args = self.config.args();
        let log = &self.log;
        let env_vars = self.config.env_vars.iter().filter(|(name, _)| {
            if name.as_str() == LIBRARY_PATH_VAR {
                debug!(target: log.target(), "not passing {} to the server", LIBRARY_PATH_VAR);
                return false;
            }
            true
        });
        let mut command = Command::new(&self.config.executable);
        command
            .args(&args)
            .env_remove(LIBRARY_PATH_VAR)
            .envs(env_vars)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        self.state = ProcessState::Starting;
        info!(
            target: self.log.target(),
            "starting server: {} {}",
            self.config.executable.display(),
            args.join(" ")
        );
        let mut child = command.spawn().map_err(|e| {
            self.state = ProcessState::Terminated;
            Error::ServerStart(format!(
                "failed spawning {}: {}",
                self.config.executable.display(),
                e
            ))
        })?;
        debug!(target: self.log.target(), "server process started, pid: {}", child.id());
        self.output = Some(self.read_output(&mut child));
        self.child = Some(child);
        self.state = ProcessState::Running;
        Ok(())
    }

    fn read_output(&self, child: &mut Child) -> ServerOutput {
        let (mut output, closed) = ServerOutput::new();
        if let Some(stdout) = child.stdout.take() {
            let (log, closed) = (self.log.clone(), closed.clone());
            match thread::Builder::new()
                .name("osl-server-stdout".to_string())
                .spawn(move || log_output(stdout, None, log, closed))
            {
                Ok(_) => output.open += 1,
                Err(e) => warn!(target: self.log.target(), "failed reading server stdout: {}", e),
            }
        }
        if let Some(stderr) = child.stderr.take() {
            let (log, tail) = (self.log.clone(), output.stderr_tail.clone());
            match thread::Builder::new()
                .name("osl-server-stderr".to_string())
                .spawn(move || log_output(stderr, Some(tail), log, closed))
            {
                Ok(_) => output.open += 1,
                Err(e) => warn!(target: self.log.target(), "failed reading server stderr: {}", e),
            }
        }
        output
    }

    /// Describes an early exit, including what the server last wrote to
    /// stderr.
    fn exit_message(&mut self, code: i32) -> String {
        if let Some(output) = self.output.as_mut() {
            output.drain();
        }
        let tail = self.stderr_tail();
        if tail.is_empty() {
            format!("server exited with code {}", code)
        } else {
            format!("server exited with code {}: {}", code, tail.join("; "))
        }
    }

    fn remove_server_info_files(&self) {
        let dir = match self.config.project_path.as_ref().and_then(|p| p.parent()) {
            Some(dir) if dir.is_dir() => dir.to_path_buf(),
            _ => return,
        };
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == "ini").unwrap_or(false) {
                match fs::remove_file(&path) {
                    Ok(()) => debug!(target: self.log.target(), "removed {}", path.display()),
                    Err(e) => warn!(
                        target: self.log.target(),
                        "failed removing {}: {}",
                        path.display(),
                        e
                    ),
                }
            }
        }
    }

    /// Collects the exit status if the process has exited.
    fn poll_exit(&mut self) -> Result<Option<i32>> {
        if let Some(code) = self.exit_code {
            return Ok(Some(code));
        }
        let child = match self.child.as_mut() {
            Some(c) => c,
            None => return Ok(None),
        };
        match child.try_wait()? {
            Some(status) => {
                let code = exit_code(status);
                debug!(target: self.log.target(), "server process exited with code {}", code);
                self.exit_code = Some(code);
                self.state = ProcessState::Terminated;
                Ok(Some(code))
            }
            None => Ok(None),
        }
    }

    /// Returns true if the process was started and didn't exit yet.
    pub fn is_running(&mut self) -> bool {
        match self.poll_exit() {
            Ok(None) => self.child.is_some(),
            Ok(Some(_)) => false,
            Err(e) => {
                warn!(target: self.log.target(), "failed querying process status: {}", e);
                false
            }
        }
    }

    /// Blocks until the process exits or the timeout elapses. Returns the
    /// exit code, or none if the process is still running.
    pub fn wait_for_finished(&mut self, timeout: Option<Duration>) -> Result<Option<i32>> {
        if self.child.is_none() {
            return Err(Error::ProcessState(format!("process is {}", self.state)));
        }
        let start = Instant::now();
        loop {
            if let Some(code) = self.poll_exit()? {
                return Ok(Some(code));
            }
            if let Some(t) = timeout {
                if start.elapsed() >= t {
                    return Ok(None);
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Waits for the server to write its info file and reads it.
    ///
    /// Fails if the process exits first, with a dedicated error when the
    /// exit code points at a licensing problem.
    pub fn wait_for_server_info(&mut self, timeout: Option<Duration>) -> Result<ServerInfo> {
        let path = self.config.server_info_path().ok_or_else(|| {
            Error::ServerStart("server info path is unknown, no project path given".to_string())
        })?;
        let timeout = timeout.unwrap_or(self.config.startup_timeout);
        let start = Instant::now();
        loop {
            if path.is_file() {
                match ServerInfo::read(&path) {
                    Ok(info) => {
                        debug!(target: self.log.target(), "server listening on port {}", info.port);
                        return Ok(info);
                    }
                    // file may be only partially written
                    Err(e) => trace!(target: self.log.target(), "server info not ready: {}", e),
                }
            }
            if let Some(code) = self.poll_exit()? {
                let message = self.exit_message(code);
                return Err(match code {
                    LICENSING_EXIT_CODE => Error::ServerLicensing(message),
                    _ => Error::ServerStart(message),
                });
            }
            if start.elapsed() >= timeout {
                return Err(Error::ServerStart(format!(
                    "server info file {} did not appear within {:?}",
                    path.display(),
                    timeout
                )));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Terminates the process.
    ///
    /// Unless forced, the process and its children are asked to terminate
    /// first and given the grace period to exit. Anything still alive
    /// afterwards is killed.
    pub fn terminate(&mut self, force: bool) -> Result<Option<i32>> {
        if self.child.is_none() {
            self.state = ProcessState::Terminated;
            return Ok(self.exit_code);
        }
        if let Some(code) = self.poll_exit()? {
            return Ok(Some(code));
        }
        self.state = ProcessState::Terminating;
        let pid = self.pid().unwrap_or(0);
        let children = child_processes(pid);

        if !force {
            debug!(target: self.log.target(), "requesting server process {} to terminate", pid);
            for child in &children {
                request_termination(*child, &self.log);
            }
            request_termination(pid, &self.log);
            if let Some(code) = self.wait_for_finished(Some(self.config.grace_period))? {
                return Ok(Some(code));
            }
            warn!(
                target: self.log.target(),
                "server process {} did not exit within {:?}, killing it",
                pid,
                self.config.grace_period
            );
        }

        for child in child_processes(pid).into_iter().chain(children) {
            kill(child, &self.log);
        }
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.kill() {
                debug!(target: self.log.target(), "kill failed: {}", e);
            }
            let status = child.wait()?;
            let code = exit_code(status);
            self.exit_code = Some(code);
        }
        self.state = ProcessState::Terminated;
        Ok(self.exit_code)
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if self.state == ProcessState::Running && self.is_running() {
            if let Err(e) = self.terminate(true) {
                error!(target: self.log.target(), "failed terminating server process: {}", e);
            }
        }
    }
}

/// Finds all descendants of the process.
#[cfg(feature = "psutils")]
fn child_processes(pid: u32) -> Vec<u32> {
    let processes = match psutil::process::processes() {
        Ok(p) => p,
        Err(_) => return Vec::new(),
    };
    let parents: Vec<(u32, u32)> = processes
        .into_iter()
        .filter_map(|p| p.ok())
        .filter_map(|p| match p.ppid() {
            Ok(Some(ppid)) => Some((p.pid(), ppid)),
            _ => None,
        })
        .collect();
    let mut found = Vec::new();
    let mut queue = vec![pid];
    while let Some(parent) = queue.pop() {
        for (child, _) in parents.iter().filter(|(_, ppid)| *ppid == parent) {
            if !found.contains(child) {
                found.push(*child);
                queue.push(*child);
            }
        }
    }
    found
}

#[cfg(not(feature = "psutils"))]
fn child_processes(_: u32) -> Vec<u32> {
    Vec::new()
}

#[cfg(feature = "psutils")]
fn request_termination(pid: u32, log: &LogContext) {
    match psutil::process::Process::new(pid).and_then(|p| p.terminate()) {
        Ok(()) => trace!(target: log.target(), "sent termination request to {}", pid),
        Err(e) => debug!(target: log.target(), "cannot terminate process {}: {}", pid, e),
    }
}

#[cfg(not(feature = "psutils"))]
fn request_termination(pid: u32, log: &LogContext) {
    debug!(
        target: log.target(),
        "graceful termination of {} unavailable without psutils",
        pid
    );
}

#[cfg(feature = "psutils")]
fn kill(pid: u32, log: &LogContext) {
    if let Err(e) = psutil::process::Process::new(pid).and_then(|p| p.kill()) {
        trace!(target: log.target(), "cannot kill process {}: {}", pid, e);
    }
}

#[cfg(not(feature = "psutils"))]
fn kill(_: u32, _: &LogContext) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_info_parsing() {
        let info: ServerInfo = "[server]\nserver_port = 49690\nserver_address=10.0.0.2\npid = 1234\n"
            .parse()
            .unwrap();
        assert_eq!(info.port, 49690);
        assert_eq!(info.host.as_deref(), Some("10.0.0.2"));
        assert_eq!(info.pid, Some(1234));
        assert_eq!(info.endpoint().unwrap().port(), Some(49690));

        assert!("pid = 1".parse::<ServerInfo>().is_err());
        assert!("server_port = x".parse::<ServerInfo>().is_err());
    }

    #[test]
    fn batch_args() {
        let config = ProcessConfig {
            project_path: Some(PathBuf::from("/work/calc.opf")),
            port_range: Some((49690, 49700)),
            password: Some("pw".to_string()),
            no_save: true,
            shutdown_on_finished: true,
            additional_args: vec!["name=value".to_string()],
            ..ProcessConfig::default()
        };
        assert_eq!(
            config.args(),
            vec![
                "-b",
                "/work/calc.opf",
                "--no-run",
                "--force",
                "--enable-tcp-server=49690-49700",
                "--server-password=pw",
                "--write-server-info=/work/calc.opd/server_info.ini",
                "--no-save",
                "name=value",
                "--shutdown-on-finished",
            ]
        );
    }

    #[test]
    fn new_project_args() {
        let config = ProcessConfig {
            project_path: Some(PathBuf::from("new.opf")),
            new_project: true,
            batch: false,
            server_info: Some(PathBuf::from("/tmp/info.ini")),
            ..ProcessConfig::default()
        };
        assert_eq!(
            config.args(),
            vec![
                "--new=new.opf",
                "--enable-tcp-server",
                "--write-server-info=/tmp/info.ini",
            ]
        );
    }

    #[test]
    fn start_twice_fails() {
        let mut process = ServerProcess::new(
            ProcessConfig {
                executable: PathBuf::from("/nonexistent/optislang"),
                ..ProcessConfig::default()
            },
            LogContext::default(),
        );
        match process.start() {
            Err(Error::ServerStart(_)) => (),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(process.state(), ProcessState::Terminated);
        assert!(process.start().is_err());
        assert!(!process.is_running());
    }
}
