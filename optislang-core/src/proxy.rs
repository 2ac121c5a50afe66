//! Hand-off of designs between a proxy solver node and an external solver.
//!
//! A proxy solver node doesn't evaluate designs itself. Instead it queues
//! them up, and whoever services the node polls the queue, evaluates the
//! designs and submits the results back:
//!
//! ```text
//! loop
//!     project status terminal     -> done
//!     GET_DESIGNS(uid) non-empty  -> evaluate, SET_DESIGNS(uid, results)
//!     GET_DESIGNS(uid) empty      -> sleep, poll again
//! ```
//!
//! Only a single consumer may service a node at any time. Every
//! [`ProxySolverNode`] (and all its clones) share one lock, servicing
//! requires holding it through a [`ProxyConsumer`].
//!
//! Results for a design can be submitted only once. Submitting a design
//! that was already acknowledged fails with [`Error::AlreadySubmitted`]
//! before anything is sent to the server.

use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::Duration;

use fnv::FnvHashSet;
use optislang_net::msg::{DesignResult, PendingDesign, ProjectState};

use crate::{Error, Optislang, Result};

/// Evaluates a batch of pending designs, returning one result per design.
pub type ProxySolverCallback = Arc<dyn Fn(&[PendingDesign]) -> Vec<DesignResult> + Send + Sync>;

/// Outcome of a single poll of the hand-off channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Poll {
    /// Designs waiting for evaluation
    Designs(Vec<PendingDesign>),
    /// Nothing to evaluate yet
    Empty,
    /// The project reached a terminal state, no more designs will come
    Finished(ProjectState),
}

/// State of the hand-off channel of a single node.
#[derive(Debug, Default)]
pub struct HandoffState {
    /// Designs with acknowledged results
    submitted: FnvHashSet<String>,
}

impl HandoffState {
    pub fn is_submitted(&self, hid: &str) -> bool {
        self.submitted.contains(hid)
    }

    pub fn submitted_count(&self) -> usize {
        self.submitted.len()
    }
}

/// Handle to a proxy solver node in the project.
#[derive(Clone)]
pub struct ProxySolverNode {
    uid: String,
    state: Arc<Mutex<HandoffState>>,
}

impl Debug for ProxySolverNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySolverNode")
            .field("uid", &self.uid)
            .finish()
    }
}

impl ProxySolverNode {
    pub fn new(uid: &str) -> Self {
        Self {
            uid: uid.to_string(),
            state: Arc::new(Mutex::new(HandoffState::default())),
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Takes the role of the node's single consumer, failing immediately
    /// if somebody else holds it.
    pub fn try_consume(&self) -> Result<ProxyConsumer<'_>> {
        let state = match self.state.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(Error::ConsumerBusy(self.uid.clone())),
        };
        Ok(ProxyConsumer { node: self, state })
    }

    /// Takes the role of the node's single consumer, waiting for the
    /// current consumer to let go.
    pub fn consume(&self) -> ProxyConsumer<'_> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        ProxyConsumer { node: self, state }
    }

    /// Number of designs with acknowledged results. Blocks while a
    /// consumer is active.
    pub fn submitted_count(&self) -> usize {
        self.consume().state.submitted_count()
    }

    /// Forgets all acknowledged designs, e.g. after the project was reset.
    pub fn reset(&self) {
        let mut consumer = self.consume();
        consumer.state.submitted.clear();
    }
}

/// Exclusive access to the hand-off channel of a node.
pub struct ProxyConsumer<'a> {
    node: &'a ProxySolverNode,
    state: MutexGuard<'a, HandoffState>,
}

impl<'a> ProxyConsumer<'a> {
    pub fn uid(&self) -> &str {
        &self.node.uid
    }

    pub fn state(&self) -> &HandoffState {
        &self.state
    }

    /// Fetches the designs waiting for evaluation. Designs whose results
    /// were already acknowledged are left out.
    pub fn pending_designs(&mut self, osl: &Optislang) -> Result<Vec<PendingDesign>> {
        let mut designs = osl.get_designs(&self.node.uid)?;
        let state = &self.state;
        designs.retain(|d| {
            let keep = !state.is_submitted(&d.hid);
            if !keep {
                debug!(
                    target: osl.log().target(),
                    "design {} was already submitted, skipping",
                    d.hid
                );
            }
            keep
        });
        Ok(designs)
    }

    /// Polls the channel once, checking the project state first.
    pub fn poll(&mut self, osl: &Optislang) -> Result<Poll> {
        let status = osl.get_status()?;
        if status.is_terminal() {
            return Ok(Poll::Finished(status));
        }
        let designs = self.pending_designs(osl)?;
        if designs.is_empty() {
            Ok(Poll::Empty)
        } else {
            Ok(Poll::Designs(designs))
        }
    }

    /// Submits evaluated designs. Fails without sending anything if any of
    /// the designs was submitted before or is listed twice.
    pub fn submit(&mut self, osl: &Optislang, results: Vec<DesignResult>) -> Result<()> {
        let mut hids = FnvHashSet::default();
        for result in &results {
            if self.state.is_submitted(&result.hid) || !hids.insert(result.hid.as_str()) {
                return Err(Error::AlreadySubmitted {
                    uid: self.node.uid.clone(),
                    hid: result.hid.clone(),
                });
            }
        }
        if results.is_empty() {
            return Ok(());
        }
        let hids: Vec<String> = results.iter().map(|r| r.hid.clone()).collect();
        osl.set_designs(&self.node.uid, results)?;
        trace!(
            target: osl.log().target(),
            "submitted {} designs to {}",
            hids.len(),
            self.node.uid
        );
        self.state.submitted.extend(hids);
        Ok(())
    }

    /// Services the node until the project reaches a terminal state.
    /// Returns that state.
    pub fn run_until_terminal<F>(
        &mut self,
        osl: &Optislang,
        poll_interval: Duration,
        mut solve: F,
    ) -> Result<ProjectState>
    where
        F: FnMut(&[PendingDesign]) -> Vec<DesignResult>,
    {
        loop {
            match self.poll(osl)? {
                Poll::Finished(status) => {
                    info!(
                        target: osl.log().target(),
                        "project status: {}, {} designs evaluated by {}",
                        status,
                        self.state.submitted_count(),
                        self.node.uid
                    );
                    return Ok(status);
                }
                Poll::Designs(designs) => {
                    debug!(
                        target: osl.log().target(),
                        "evaluating {} designs for {}",
                        designs.len(),
                        self.node.uid
                    );
                    let results = solve(&designs);
                    self.submit(osl, results)?;
                }
                Poll::Empty => thread::sleep(poll_interval),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_consumer() {
        let node = ProxySolverNode::new("solver");
        let clone = node.clone();
        let consumer = node.try_consume().unwrap();
        match clone.try_consume() {
            Err(Error::ConsumerBusy(uid)) => assert_eq!(uid, "solver"),
            other => panic!("unexpected result: {:?}", other.map(|c| c.uid().to_string())),
        }
        drop(consumer);
        assert!(clone.try_consume().is_ok());
    }

    #[test]
    fn consumer_across_threads() {
        let node = ProxySolverNode::new("solver");
        let consumer = node.try_consume().unwrap();
        let other = node.clone();
        let busy = thread::spawn(move || other.try_consume().is_err())
            .join()
            .unwrap();
        assert!(busy);
        drop(consumer);
    }

    #[test]
    fn reset_forgets_submitted() {
        let node = ProxySolverNode::new("solver");
        node.consume().state.submitted.insert("0.1".to_string());
        assert_eq!(node.submitted_count(), 1);
        node.reset();
        assert_eq!(node.submitted_count(), 0);
    }
}
