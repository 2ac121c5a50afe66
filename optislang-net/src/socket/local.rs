//! Local channel backed by unix domain sockets.
//!
//! The channel identifier maps to a socket file in the temporary directory,
//! unless the identifier is an absolute path itself.

use std::env;
use std::fs;
use std::io::{self, ErrorKind};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::socket::{pause, remaining, SocketConfig};
use crate::{Error, Result};

pub(crate) fn socket_path(name: &str) -> PathBuf {
    let path = Path::new(name);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::temp_dir().join(format!("{}.sock", name))
    }
}

pub(crate) struct LocalSocket {
    pub(crate) stream: UnixStream,
}

impl LocalSocket {
    /// Connects to the channel. The listening side may not have bound yet,
    /// missing or refusing sockets are retried until the timeout runs out.
    pub fn connect(name: &str, timeout: Option<Duration>, config: &SocketConfig) -> Result<Self> {
        let path = socket_path(name);
        let what = format!("connecting to {}", path.display());
        let start = Instant::now();
        loop {
            remaining(start, timeout, &what)?;
            match UnixStream::connect(&path) {
                Ok(stream) => return Ok(Self { stream }),
                Err(e) if timeout.is_some() && is_transient(&e) => {
                    trace!("{}: {}, retrying", what, e);
                    pause(start, timeout, config.retry_interval);
                }
                Err(e) => return Err(Error::from_io(e, &what)),
            }
        }
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            stream: self.stream.try_clone()?,
        })
    }
}

fn is_transient(e: &io::Error) -> bool {
    match e.kind() {
        ErrorKind::NotFound | ErrorKind::ConnectionRefused => true,
        _ => false,
    }
}

pub(crate) struct LocalListener {
    listener: UnixListener,
    path: PathBuf,
}

impl LocalListener {
    /// Binds the channel, replacing any stale socket file. The socket file
    /// is only accessible to the current user.
    pub fn bind(name: &str) -> Result<Self> {
        let path = socket_path(name);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener, path })
    }

    pub fn accept(&self) -> io::Result<LocalSocket> {
        let (stream, _) = self.listener.accept()?;
        stream.set_nonblocking(false)?;
        Ok(LocalSocket { stream })
    }
}

impl Drop for LocalListener {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            trace!("failed removing socket file {}: {}", self.path.display(), e);
        }
    }
}
