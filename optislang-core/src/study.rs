//! Design studies: sequenced execution of parametric systems.
//!
//! A [`DesignStudy`] manages a set of instances (nodes and parametric
//! systems) already present in the project. They are executed in blocks,
//! one [`ExecutableBlock`] at a time, so that only a single execution
//! window is open in the project at any time:
//!
//! ```text
//! deactivate top-level nodes
//! for block in execution order
//!     clear STARTING_POINT/END_POINT of the previous block, keep it active
//!     set execution options of the block's instances
//!     start the project, waiting for it to finish unless the block
//!         contains a proxy solver
//!     service the proxy solver until the project finishes
//! ```
//!
//! Blocks are either given explicitly or derived from the order of the
//! managed instances, see [`DesignStudy::new`].

use std::fmt::{Debug, Display, Formatter};
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, TryRecvError};
use optislang_net::msg::{Design, DesignResult, PendingDesign, ProjectState};
use optislang_net::LogContext;

use crate::config::secs;
use crate::proxy::{ProxySolverCallback, ProxySolverNode};
use crate::{Error, Optislang, Result};

/// Bitmask of execution options of a node.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct ExecutionOption(u32);

impl ExecutionOption {
    pub const INACTIVE: ExecutionOption = ExecutionOption(0);
    pub const ACTIVE: ExecutionOption = ExecutionOption(1);
    pub const STARTING_POINT: ExecutionOption = ExecutionOption(2);
    pub const END_POINT: ExecutionOption = ExecutionOption(4);
    pub const SAVE_POINT: ExecutionOption = ExecutionOption(8);
    pub const RECYCLE_RESULTS: ExecutionOption = ExecutionOption(16);

    pub fn from_bits(bits: u32) -> Self {
        ExecutionOption(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: ExecutionOption) -> bool {
        self.0 & other.0 == other.0
    }

    /// Options with the bits of `other` cleared.
    pub fn without(&self, other: ExecutionOption) -> Self {
        ExecutionOption(self.0 & !other.0)
    }

    /// Options of an instance that already ran: active, but neither
    /// starting nor end point.
    pub fn executed(&self) -> Self {
        self.without(ExecutionOption::STARTING_POINT | ExecutionOption::END_POINT)
    }
}

impl BitOr for ExecutionOption {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        ExecutionOption(self.0 | rhs.0)
    }
}

impl BitOrAssign for ExecutionOption {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for ExecutionOption {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        ExecutionOption(self.0 & rhs.0)
    }
}

impl Not for ExecutionOption {
    type Output = Self;
    fn not(self) -> Self {
        ExecutionOption(!self.0 & 0b11111)
    }
}

impl Display for ExecutionOption {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.0 == 0 {
            return write!(f, "INACTIVE");
        }
        let names = [
            (ExecutionOption::ACTIVE, "ACTIVE"),
            (ExecutionOption::STARTING_POINT, "STARTING_POINT"),
            (ExecutionOption::END_POINT, "END_POINT"),
            (ExecutionOption::SAVE_POINT, "SAVE_POINT"),
            (ExecutionOption::RECYCLE_RESULTS, "RECYCLE_RESULTS"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(option, _)| self.contains(*option))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", set.join("|"))
    }
}

#[derive(Clone)]
enum InstanceKind {
    Node,
    ParametricSystem {
        solver_uid: Option<String>,
    },
    ProxySolverSystem {
        solver: ProxySolverNode,
        callback: ProxySolverCallback,
    },
}

/// Node of the project managed by a design study.
#[derive(Clone)]
pub struct ManagedInstance {
    uid: String,
    kind: InstanceKind,
}

impl Debug for ManagedInstance {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            InstanceKind::Node => "node",
            InstanceKind::ParametricSystem { .. } => "parametric system",
            InstanceKind::ProxySolverSystem { .. } => "proxy solver system",
        };
        f.debug_struct("ManagedInstance")
            .field("uid", &self.uid)
            .field("kind", &kind)
            .field("solver_uid", &self.solver_uid())
            .finish()
    }
}

impl ManagedInstance {
    /// Plain node, e.g. a mop or a postprocessing node.
    pub fn node(uid: &str) -> Self {
        Self {
            uid: uid.to_string(),
            kind: InstanceKind::Node,
        }
    }

    pub fn parametric_system(uid: &str, solver_uid: Option<&str>) -> Self {
        Self {
            uid: uid.to_string(),
            kind: InstanceKind::ParametricSystem {
                solver_uid: solver_uid.map(|s| s.to_string()),
            },
        }
    }

    /// Parametric system evaluated by a proxy solver node, with the
    /// callback computing the designs.
    pub fn proxy_solver_system<F>(uid: &str, solver_uid: &str, callback: F) -> Self
    where
        F: Fn(&[PendingDesign]) -> Vec<DesignResult> + Send + Sync + 'static,
    {
        Self {
            uid: uid.to_string(),
            kind: InstanceKind::ProxySolverSystem {
                solver: ProxySolverNode::new(solver_uid),
                callback: Arc::new(callback),
            },
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn solver_uid(&self) -> Option<&str> {
        match &self.kind {
            InstanceKind::Node => None,
            InstanceKind::ParametricSystem { solver_uid } => solver_uid.as_deref(),
            InstanceKind::ProxySolverSystem { solver, .. } => Some(solver.uid()),
        }
    }

    pub fn is_parametric_system(&self) -> bool {
        match self.kind {
            InstanceKind::Node => false,
            _ => true,
        }
    }

    pub fn proxy_solver(&self) -> Option<&ProxySolverNode> {
        match &self.kind {
            InstanceKind::ProxySolverSystem { solver, .. } => Some(solver),
            _ => None,
        }
    }

    pub fn callback(&self) -> Option<&ProxySolverCallback> {
        match &self.kind {
            InstanceKind::ProxySolverSystem { callback, .. } => Some(callback),
            _ => None,
        }
    }
}

/// Group of instances executed together.
#[derive(Debug, Clone, Default)]
pub struct ExecutableBlock {
    instances: Vec<(ManagedInstance, ExecutionOption)>,
}

impl ExecutableBlock {
    pub fn new(instances: Vec<(ManagedInstance, ExecutionOption)>) -> Self {
        Self { instances }
    }

    pub fn add_instance(&mut self, instance: ManagedInstance, options: ExecutionOption) {
        self.instances.push((instance, options));
    }

    pub fn remove_instance_by_uid(&mut self, uid: &str) -> Result<()> {
        match self.instances.iter().position(|(i, _)| i.uid == uid) {
            Some(idx) => {
                self.instances.remove(idx);
                Ok(())
            }
            None => Err(Error::Study(format!("no instance with uid {} in block", uid))),
        }
    }

    pub fn instances_with_execution_options(&self) -> &[(ManagedInstance, ExecutionOption)] {
        &self.instances
    }

    pub fn instances(&self) -> impl Iterator<Item = &ManagedInstance> {
        self.instances.iter().map(|(i, _)| i)
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn contains_proxy_solver(&self) -> bool {
        self.proxy_solver().is_some()
    }

    fn proxy_solver(&self) -> Option<(&ProxySolverNode, &ProxySolverCallback)> {
        self.instances().find_map(|i| match (i.proxy_solver(), i.callback()) {
            (Some(solver), Some(callback)) => Some((solver, callback)),
            _ => None,
        })
    }
}

/// Derives execution blocks from the order of instances. Every parametric
/// system gets its own block as both starting and end point, consecutive
/// plain nodes in between are grouped into a single active block.
pub fn auto_blocks(instances: &[ManagedInstance]) -> Vec<ExecutableBlock> {
    let mut blocks = Vec::new();
    let mut block = ExecutableBlock::default();
    for instance in instances {
        if instance.is_parametric_system() {
            if !block.is_empty() {
                blocks.push(std::mem::take(&mut block));
            }
            blocks.push(ExecutableBlock::new(vec![(
                instance.clone(),
                ExecutionOption::ACTIVE | ExecutionOption::STARTING_POINT | ExecutionOption::END_POINT,
            )]));
        } else {
            block.add_instance(instance.clone(), ExecutionOption::ACTIVE);
        }
    }
    if !block.is_empty() {
        blocks.push(block);
    }
    blocks
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudyConfig {
    /// Interval between polls of a proxy solver with nothing to evaluate
    #[serde(with = "secs")]
    pub poll_interval: Duration,
}

impl Default for StudyConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StudyState {
    Built,
    Running,
    Complete,
}

/// Runs the blocks in order. Proxy solvers are serviced here only if
/// `drive_proxy` is set, otherwise the block of a proxy solver is started
/// in blocking mode while the solver is serviced from elsewhere.
fn run_blocks(
    osl: &Optislang,
    blocks: &[ExecutableBlock],
    current_proxy: &Mutex<Option<ProxySolverNode>>,
    drive_proxy: bool,
    config: &StudyConfig,
    log: &LogContext,
) -> Result<()> {
    let mut previous: Option<&ExecutableBlock> = None;
    for (n, block) in blocks.iter().enumerate() {
        if let Some(previous) = previous {
            for (instance, options) in previous.instances_with_execution_options() {
                osl.set_execution_options(&instance.uid, options.executed())?;
            }
        }
        for (instance, options) in block.instances_with_execution_options() {
            osl.set_execution_options(&instance.uid, *options)?;
        }
        debug!(target: log.target(), "executing block {} of {}", n + 1, blocks.len());

        match block.proxy_solver() {
            Some((solver, callback)) if drive_proxy => {
                osl.start(false)?;
                let mut consumer = solver.try_consume()?;
                let status =
                    consumer.run_until_terminal(osl, config.poll_interval, |d| (**callback)(d))?;
                debug!(target: log.target(), "block {} finished with status {}", n + 1, status);
            }
            Some((solver, _)) => {
                *lock(current_proxy) = Some(solver.clone());
                let result = osl.start(true);
                *lock(current_proxy) = None;
                result?;
            }
            None => osl.start(true)?,
        }
        previous = Some(block);
    }
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle to a design study executing on a background thread.
pub struct StudyRun {
    handle: Option<JoinHandle<()>>,
    receiver: Receiver<Result<()>>,
    result: Option<Result<()>>,
}

impl StudyRun {
    /// Returns true once the execution thread is done, successfully or not.
    pub fn is_finished(&mut self) -> bool {
        if self.result.is_some() {
            return true;
        }
        match self.receiver.try_recv() {
            Ok(result) => {
                self.result = Some(result);
                true
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => {
                self.result = Some(Err(Error::Study(
                    "execution thread exited unexpectedly".to_string(),
                )));
                true
            }
        }
    }

    /// Blocks until the execution is done, returning its result.
    pub fn join(mut self) -> Result<()> {
        let result = match self.result.take() {
            Some(result) => result,
            None => self.receiver.recv().unwrap_or_else(|_| {
                Err(Error::Study("execution thread exited unexpectedly".to_string()))
            }),
        };
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                return Err(Error::Study("execution thread panicked".to_string()));
            }
        }
        result
    }
}

/// Parametric design study.
///
/// Moves through the states of [`StudyState`]: built, running one block at
/// a time, complete. Failed executions are not retried, the study goes
/// back to built and the project is left as the server reports it.
pub struct DesignStudy {
    osl: Arc<Optislang>,
    instances: Vec<ManagedInstance>,
    blocks: Vec<ExecutableBlock>,
    config: StudyConfig,
    state: Arc<Mutex<StudyState>>,
    current_proxy: Arc<Mutex<Option<ProxySolverNode>>>,
    deleted: bool,
    log: LogContext,
}

impl DesignStudy {
    /// Creates a study over the given instances.
    ///
    /// Without explicit blocks, they are derived from the order of the
    /// instances: each parametric system forms its own block, marked as
    /// both starting and end point, plain nodes between parametric systems
    /// are grouped into active blocks.
    pub fn new(
        osl: Arc<Optislang>,
        instances: Vec<ManagedInstance>,
        blocks: Option<Vec<ExecutableBlock>>,
        config: StudyConfig,
        log: LogContext,
    ) -> Self {
        let blocks = match blocks {
            Some(blocks) if !blocks.is_empty() => blocks,
            _ => auto_blocks(&instances),
        };
        Self {
            osl,
            instances,
            blocks,
            config,
            state: Arc::new(Mutex::new(StudyState::Built)),
            current_proxy: Arc::new(Mutex::new(None)),
            deleted: false,
            log,
        }
    }

    pub fn optislang(&self) -> &Arc<Optislang> {
        &self.osl
    }

    pub fn managed_instances(&self) -> &[ManagedInstance] {
        &self.instances
    }

    pub fn execution_order(&self) -> &[ExecutableBlock] {
        &self.blocks
    }

    pub fn state(&self) -> StudyState {
        *lock(&self.state)
    }

    pub fn is_complete(&self) -> bool {
        self.state() == StudyState::Complete
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Marks the study as no longer usable.
    pub fn delete(&mut self) {
        debug!(target: self.log.target(), "deleting design study");
        self.deleted = true;
    }

    fn begin(&self) -> Result<()> {
        if self.deleted {
            return Err(Error::Study("design study was deleted".to_string()));
        }
        let mut state = lock(&self.state);
        if *state == StudyState::Running {
            return Err(Error::Study("design study is already running".to_string()));
        }
        *state = StudyState::Running;
        Ok(())
    }

    fn finish(state: &Mutex<StudyState>, result: &Result<()>, log: &LogContext) {
        let mut state = lock(state);
        match result {
            Ok(()) => *state = StudyState::Complete,
            Err(e) => {
                error!(target: log.target(), "design study execution failed: {}", e);
                *state = StudyState::Built;
            }
        }
    }

    fn deactivate_toplevel_nodes(&self) -> Result<()> {
        let tree = self.osl.full_project_tree()?;
        for node in tree.root_nodes() {
            self.osl
                .set_execution_options(&node.uid, ExecutionOption::INACTIVE)?;
        }
        Ok(())
    }

    fn set_managed_instances_options(&self, options: ExecutionOption) -> Result<()> {
        for instance in &self.instances {
            self.osl.set_execution_options(&instance.uid, options)?;
        }
        Ok(())
    }

    /// Executes all blocks, blocking until the last one is done. Proxy
    /// solvers are serviced with their callbacks.
    pub fn execute(&mut self) -> Result<()> {
        self.begin()?;
        info!(
            target: self.log.target(),
            "executing design study, {} blocks",
            self.blocks.len()
        );
        let result = self.deactivate_toplevel_nodes().and_then(|_| {
            run_blocks(
                &self.osl,
                &self.blocks,
                &self.current_proxy,
                true,
                &self.config,
                &self.log,
            )
        });
        Self::finish(&self.state, &result, &self.log);
        result
    }

    /// Executes all blocks on a background thread.
    ///
    /// Proxy solvers are not serviced by the execution thread. While it
    /// runs, the caller is expected to service them with
    /// [`poll_designs`](Self::poll_designs) and
    /// [`submit_designs`](Self::submit_designs).
    pub fn start_in_thread(&mut self) -> Result<StudyRun> {
        self.begin()?;
        if let Err(e) = self.deactivate_toplevel_nodes() {
            *lock(&self.state) = StudyState::Built;
            return Err(e);
        }

        let (sender, receiver) = crossbeam_channel::bounded(1);
        let osl = self.osl.clone();
        let blocks = self.blocks.clone();
        let current_proxy = self.current_proxy.clone();
        let state = self.state.clone();
        let config = self.config.clone();
        let log = self.log.clone();
        let spawned = thread::Builder::new()
            .name("optislang-design-study".to_string())
            .spawn(move || {
                let result = run_blocks(&osl, &blocks, &current_proxy, false, &config, &log);
                Self::finish(&state, &result, &log);
                let _ = sender.send(result);
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                *lock(&self.state) = StudyState::Built;
                return Err(e.into());
            }
        };
        Ok(StudyRun {
            handle: Some(handle),
            receiver,
            result: None,
        })
    }

    /// Fetches designs waiting for evaluation by the proxy solver of the
    /// block being executed. Returns none if no proxy solver block is
    /// executing.
    pub fn poll_designs(&self) -> Result<Option<Vec<PendingDesign>>> {
        let solver = match lock(&self.current_proxy).clone() {
            Some(solver) => solver,
            None => return Ok(None),
        };
        let mut consumer = solver.try_consume()?;
        Ok(Some(consumer.pending_designs(&self.osl)?))
    }

    /// Submits evaluated designs to the proxy solver of the block being
    /// executed.
    pub fn submit_designs(&self, results: Vec<DesignResult>) -> Result<()> {
        let solver = lock(&self.current_proxy)
            .clone()
            .ok_or_else(|| Error::Study("no proxy solver is being executed".to_string()))?;
        let mut consumer = solver.try_consume()?;
        consumer.submit(&self.osl, results)
    }

    /// Resets the study and the nodes it manages in the project.
    pub fn reset(&mut self) -> Result<()> {
        if self.state() == StudyState::Running {
            return Err(Error::Study("cannot reset a running design study".to_string()));
        }
        self.deactivate_toplevel_nodes()?;
        self.set_managed_instances_options(ExecutionOption::ACTIVE)?;
        self.osl.reset()?;
        self.set_managed_instances_options(ExecutionOption::INACTIVE)?;
        for solver in self.instances.iter().filter_map(|i| i.proxy_solver()) {
            solver.reset();
        }
        *lock(&self.state) = StudyState::Built;
        Ok(())
    }

    /// Designs of the last parametric system of the study.
    pub fn get_result_designs(&self) -> Result<Vec<Design>> {
        let system = self.get_last_parametric_system().ok_or_else(|| {
            Error::Study("design study contains no parametric system".to_string())
        })?;
        Ok(self.osl.actor_status_info(&system.uid, "0")?.designs())
    }

    pub fn get_status(&self) -> Result<ProjectState> {
        self.osl.get_status()
    }

    pub fn get_last_parametric_system(&self) -> Option<&ManagedInstance> {
        self.blocks
            .iter()
            .rev()
            .flat_map(|b| b.instances())
            .find(|i| i.is_parametric_system())
    }

    pub fn contains_proxy_solver(&self) -> bool {
        self.instances.iter().any(|i| i.proxy_solver().is_some())
    }
}

/// Collection of design studies sharing a single optiSLang instance.
pub struct DesignStudyManager {
    osl: Arc<Optislang>,
    studies: Vec<DesignStudy>,
    config: StudyConfig,
    log: LogContext,
}

impl DesignStudyManager {
    pub fn new(osl: Arc<Optislang>, config: StudyConfig, log: LogContext) -> Self {
        Self {
            osl,
            studies: Vec::new(),
            config,
            log,
        }
    }

    pub fn optislang(&self) -> &Arc<Optislang> {
        &self.osl
    }

    pub fn design_studies(&self) -> &[DesignStudy] {
        &self.studies
    }

    pub fn design_studies_mut(&mut self) -> &mut [DesignStudy] {
        &mut self.studies
    }

    pub fn len(&self) -> usize {
        self.studies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.studies.is_empty()
    }

    pub fn append_design_study(&mut self, study: DesignStudy) {
        self.studies.push(study);
    }

    /// Creates a study over instances existing in the project and starts
    /// managing it.
    pub fn create_design_study(
        &mut self,
        instances: Vec<ManagedInstance>,
        blocks: Option<Vec<ExecutableBlock>>,
    ) -> &mut DesignStudy {
        let log = self.log.child(&format!("study{}", self.studies.len()));
        let study = DesignStudy::new(self.osl.clone(), instances, blocks, self.config.clone(), log);
        self.studies.push(study);
        let idx = self.studies.len() - 1;
        &mut self.studies[idx]
    }

    /// Stops managing all studies, optionally marking them deleted.
    pub fn clear_design_studies(&mut self, delete: bool) {
        if delete {
            self.studies.iter_mut().for_each(|s| s.delete());
        }
        self.studies.clear();
    }

    pub fn get_finished_design_studies(&self) -> Vec<&DesignStudy> {
        self.studies.iter().filter(|s| s.is_complete()).collect()
    }

    pub fn get_unfinished_design_studies(&self) -> Vec<&DesignStudy> {
        self.studies.iter().filter(|s| !s.is_complete()).collect()
    }

    pub fn reset(&mut self) -> Result<()> {
        for study in &mut self.studies {
            study.reset()?;
        }
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        self.osl.save()
    }

    pub fn save_as<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.osl.save_as(path, true, false, false)
    }

    /// Drops all studies and disposes the optiSLang instance.
    pub fn dispose(&mut self) -> Result<()> {
        self.studies.clear();
        self.osl.dispose()
    }
}
