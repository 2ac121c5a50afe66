use std::io::{self, ErrorKind};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use crate::socket::{pause, remaining, SocketConfig};
use crate::{Error, Result};

/// Plain tcp stream.
pub(crate) struct TcpSocket {
    pub(crate) stream: TcpStream,
}

impl TcpSocket {
    /// Connects to the given address, retrying refused attempts until the
    /// timeout runs out.
    pub fn connect(addr: SocketAddr, timeout: Option<Duration>, config: &SocketConfig) -> Result<Self> {
        let what = format!("connecting to {}", addr);
        let start = Instant::now();
        let stream = loop {
            let attempt = match remaining(start, timeout, &what)? {
                Some(left) => TcpStream::connect_timeout(&addr, left),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => break stream,
                Err(e) if timeout.is_some() && is_transient(&e) => {
                    trace!("{}: {}, retrying", what, e);
                    pause(start, timeout, config.retry_interval);
                }
                Err(e) => return Err(Error::from_io(e, &what)),
            }
        };
        stream.set_nodelay(config.nodelay)?;
        Ok(Self { stream })
    }

    /// Wraps a stream accepted by a non-blocking listener.
    pub fn accepted(stream: TcpStream, config: &SocketConfig) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(config.nodelay)?;
        Ok(Self { stream })
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            stream: self.stream.try_clone()?,
        })
    }
}

fn is_transient(e: &io::Error) -> bool {
    match e.kind() {
        ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
            true
        }
        _ => false,
    }
}
