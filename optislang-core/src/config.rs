//! Configuration file support.
//!
//! All the knobs of the client, the server process and the design study
//! scheduler can be collected in a single TOML file:
//!
//! ```toml
//! [client]
//! connect_timeout = 2.0
//! request_timeout = 30.0
//! max_request_attempts = 1
//!
//! [process]
//! executable = "/opt/ansys_inc/v241/optiSLang/optislang"
//! batch = true
//! port_range = [49690, 49700]
//!
//! [study]
//! poll_interval = 0.1
//! ```
//!
//! Durations are given in seconds.

use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use optislang_net::ClientConfig;

use crate::process::ProcessConfig;
use crate::study::StudyConfig;
use crate::{Error, Result};

pub const CONFIG_FILE: &str = "optislang.toml";

/// Serializable configuration for the whole client stack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub client: ClientSection,
    pub process: ProcessConfig,
    pub study: StudyConfig,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file_str = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed reading {}: {}", path.display(), e))
        })?;
        file_str.parse()
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file_str = toml::to_string(self)?;
        fs::write(path, file_str)?;
        Ok(())
    }

    /// Client configuration with the server password filled in from the
    /// process section if the client section doesn't set one.
    pub fn client_config(&self) -> ClientConfig {
        let mut config = self.client.to_client_config();
        if config.password.is_none() {
            config.password = self.process.password.clone();
        }
        config
    }
}

impl FromStr for Config {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }
}

/// Client related part of the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    #[serde(with = "opt_secs", skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<Duration>,
    #[serde(with = "opt_secs", skip_serializing_if = "Option::is_none")]
    pub send_timeout: Option<Duration>,
    #[serde(with = "opt_secs", skip_serializing_if = "Option::is_none")]
    pub recv_timeout: Option<Duration>,
    #[serde(with = "opt_secs", skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<Duration>,
    #[serde(with = "opt_secs", skip_serializing_if = "Option::is_none")]
    pub long_request_timeout: Option<Duration>,
    pub max_request_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Interval between project status queries while waiting for a run
    #[serde(with = "secs")]
    pub status_poll_interval: Duration,
    /// Time the project gets to report a run after START
    #[serde(with = "secs")]
    pub start_timeout: Duration,
    /// Time allowed for a project run, none waits indefinitely
    #[serde(with = "opt_secs", skip_serializing_if = "Option::is_none")]
    pub finish_timeout: Option<Duration>,
}

impl Default for ClientSection {
    fn default() -> Self {
        let config = ClientConfig::default();
        Self {
            connect_timeout: config.socket.connect_timeout,
            send_timeout: config.socket.send_timeout,
            recv_timeout: config.socket.recv_timeout,
            request_timeout: config.request_timeout,
            long_request_timeout: config.long_request_timeout,
            max_request_attempts: config.max_request_attempts,
            password: config.password,
            status_poll_interval: Duration::from_millis(500),
            start_timeout: Duration::from_secs(60),
            finish_timeout: None,
        }
    }
}

impl ClientSection {
    pub fn to_client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::default();
        config.socket.connect_timeout = self.connect_timeout;
        config.socket.send_timeout = self.send_timeout;
        config.socket.recv_timeout = self.recv_timeout;
        config.request_timeout = self.request_timeout;
        config.long_request_timeout = self.long_request_timeout;
        config.max_request_attempts = self.max_request_attempts.max(1);
        config.password = self.password.clone();
        config
    }
}

/// (De)serializes a duration as fractional seconds.
pub(crate) mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration {}: {}", secs, e)))
    }
}

/// (De)serializes an optional duration as fractional seconds.
pub(crate) mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        match Option::<f64>::deserialize(d)? {
            Some(secs) => Duration::try_from_secs_f64(secs).map(Some).map_err(|e| {
                serde::de::Error::custom(format!("invalid duration {}: {}", secs, e))
            }),
            None => Ok(None),
        }
    }
}
