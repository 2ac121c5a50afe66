//! This library implements driving of an optiSLang server.
//!
//! Programming interface is centered around the [`Optislang`] structure,
//! which either connects to a server that is already running or launches
//! a local server process and supervises it. On top of it sits the design
//! study scheduler ([`DesignStudy`]), executing parametric systems of the
//! project block by block, and the proxy solver hand-off channel
//! ([`ProxySolverNode`]) through which designs of a running system get
//! evaluated outside of the server.
//!
//!
//! # Networking
//!
//! All communication with the server goes through the `optislang-net`
//! crate. Failures of the transport and protocol layers are carried
//! unchanged inside [`Error::Net`], so callers can still tell retryable
//! transport failures apart from rejected requests.
//!
//!
//! # Logging
//!
//! Nothing here logs through a global instance name. Every object takes a
//! [`LogContext`] on construction and emits its records under the
//! context's target.
//!
//! ## Example
//!
//! ```ignore
//! use optislang_core::{Config, DesignStudy, ManagedInstance, Optislang};
//! use optislang_net::LogContext;
//! use std::sync::Arc;
//!
//! pub fn main() {
//!     let config = Config::from_file("optislang.toml").unwrap();
//!     let osl = Arc::new(Optislang::launch(&config, LogContext::default()).unwrap());
//!     let mut study = DesignStudy::new(
//!         osl.clone(),
//!         vec![ManagedInstance::parametric_system("sensitivity", Some("solver"))],
//!         None,
//!         config.study.clone(),
//!         LogContext::default().child("study"),
//!     );
//!     study.execute().unwrap();
//!     println!("{} designs", study.get_result_designs().unwrap().len());
//!     osl.shutdown(true).unwrap();
//! }
//! ```
//!
//! [`LogContext`]: optislang_net::LogContext

#[macro_use]
extern crate serde;
#[macro_use]
extern crate log;

// reexports
pub use config::Config;
pub use error::{Error, Result};
pub use process::{ProcessConfig, ProcessState, ServerInfo, ServerProcess};
pub use proxy::{Poll, ProxyConsumer, ProxySolverCallback, ProxySolverNode};
pub use server::Optislang;
pub use study::{
    DesignStudy, DesignStudyManager, ExecutableBlock, ExecutionOption, ManagedInstance,
    StudyConfig, StudyRun, StudyState,
};

pub mod config;
pub mod error;
pub mod process;
pub mod proxy;
pub mod server;
pub mod study;
