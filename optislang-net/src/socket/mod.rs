//! Framed socket transport.
//!
//! `Socket` is a connected byte stream over either TCP or a local channel.
//! Every blocking primitive accepts a timeout, the external process can be
//! slow to start or busy, and a caller must never hang indefinitely.
//!
//! Messages are framed with a 16 byte header carrying two big-endian copies
//! of the payload length, see [`frame`].

use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, ToSocketAddrs};
use std::path::Path;
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub mod frame;
#[cfg(unix)]
mod local;
mod tcp;

/// List of available transports.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Plain TCP built with rust's standard library
    Tcp,
    /// Local inter-process channel, domain socket on unix
    Local,
}

impl Transport {
    /// Checks whether the transport can be used on the current platform.
    pub fn is_available(&self) -> bool {
        match self {
            Transport::Tcp => true,
            Transport::Local => cfg!(unix),
        }
    }
}

impl Display for Transport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Local => write!(f, "local"),
        }
    }
}

impl FromStr for Transport {
    type Err = Error;
    fn from_str(s: &str) -> core::result::Result<Self, Error> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Transport::Tcp),
            "local" | "ipc" | "unix" | "pipe" => Ok(Transport::Local),
            _ => Err(Error::Other(format!(
                "failed parsing transport from string: {}",
                s
            ))),
        }
    }
}

/// Address of a listening peer.
///
/// Local endpoints carry an opaque identifier, it's the only information
/// needed to connect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Endpoint {
    Tcp(SocketAddr),
    Local(String),
}

impl Endpoint {
    /// Resolves a host name and port into a TCP endpoint.
    pub fn tcp(host: &str, port: u16) -> Result<Self> {
        (host, port)
            .to_socket_addrs()?
            .next()
            .map(Endpoint::Tcp)
            .ok_or_else(|| Error::InvalidEndpoint(format!("{}:{}", host, port)))
    }

    pub fn localhost(port: u16) -> Self {
        Endpoint::Tcp(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    /// Creates a local endpoint with a fresh, unique identifier.
    pub fn generate_local() -> Self {
        Endpoint::Local(format!("optislang-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn transport(&self) -> Transport {
        match self {
            Endpoint::Tcp(_) => Transport::Tcp,
            Endpoint::Local(_) => Transport::Local,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Endpoint::Tcp(addr) => Some(addr.port()),
            Endpoint::Local(_) => None,
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::Tcp(addr)
    }
}

fn parse_host_port(s: &str) -> Result<Endpoint> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(Endpoint::Tcp(addr));
    }
    match s.rfind(':') {
        Some(idx) => Endpoint::tcp(&s[..idx], s[idx + 1..].parse()?),
        None => Err(Error::InvalidEndpoint(s.to_string())),
    }
}

impl FromStr for Endpoint {
    type Err = Error;
    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        if let Some(addr) = s.strip_prefix("tcp://") {
            parse_host_port(addr)
        } else if let Some(name) = s.strip_prefix("local://") {
            if name.is_empty() {
                Err(Error::InvalidEndpoint(s.to_string()))
            } else {
                Ok(Endpoint::Local(name.to_string()))
            }
        } else if s.contains("://") {
            Err(Error::InvalidEndpoint(s.to_string()))
        } else {
            parse_host_port(s)
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{}", addr),
            Self::Local(name) => write!(f, "local://{}", name),
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct SocketConfig {
    /// Time allowed for establishing a connection, none blocks until the
    /// operating system gives up
    pub connect_timeout: Option<Duration>,
    /// Default time allowed for sending a single message
    pub send_timeout: Option<Duration>,
    /// Default time allowed for receiving a single message
    pub recv_timeout: Option<Duration>,
    /// Delay between connection attempts while the peer is not listening yet
    pub retry_interval: Duration,
    /// Size of chunks used when streaming files
    pub buffer_size: usize,
    pub nodelay: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(2)),
            send_timeout: Some(Duration::from_secs(5)),
            recv_timeout: Some(Duration::from_secs(5)),
            retry_interval: Duration::from_millis(50),
            buffer_size: frame::BUFFER_SIZE,
            nodelay: true,
        }
    }
}

/// Returns time left until the deadline, or a timeout error if the deadline
/// has already passed. No timeout means no deadline.
pub(crate) fn remaining(
    start: Instant,
    timeout: Option<Duration>,
    what: &str,
) -> Result<Option<Duration>> {
    match timeout {
        None => Ok(None),
        Some(t) => match t.checked_sub(start.elapsed()) {
            Some(left) if left > Duration::from_millis(0) => Ok(Some(left)),
            _ => Err(Error::TimedOut(what.to_string())),
        },
    }
}

/// Sleeps for the retry interval, never past the deadline.
pub(crate) fn pause(start: Instant, timeout: Option<Duration>, interval: Duration) {
    let wait = match timeout {
        Some(t) => t
            .checked_sub(start.elapsed())
            .map(|left| left.min(interval))
            .unwrap_or_else(|| Duration::from_millis(0)),
        None => interval,
    };
    thread::sleep(wait);
}

/// Wrapper over stream types by transport.
enum InnerSocket {
    Tcp(tcp::TcpSocket),
    #[cfg(unix)]
    Local(local::LocalSocket),
}

impl InnerSocket {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            InnerSocket::Tcp(socket) => socket.stream.set_read_timeout(timeout),
            #[cfg(unix)]
            InnerSocket::Local(socket) => socket.stream.set_read_timeout(timeout),
        }
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            InnerSocket::Tcp(socket) => socket.stream.set_write_timeout(timeout),
            #[cfg(unix)]
            InnerSocket::Local(socket) => socket.stream.set_write_timeout(timeout),
        }
    }

    fn shutdown(&self) -> io::Result<()> {
        match self {
            InnerSocket::Tcp(socket) => socket.stream.shutdown(Shutdown::Both),
            #[cfg(unix)]
            InnerSocket::Local(socket) => socket.stream.shutdown(Shutdown::Both),
        }
    }

    fn try_clone(&self) -> io::Result<InnerSocket> {
        match self {
            InnerSocket::Tcp(socket) => Ok(InnerSocket::Tcp(socket.try_clone()?)),
            #[cfg(unix)]
            InnerSocket::Local(socket) => Ok(InnerSocket::Local(socket.try_clone()?)),
        }
    }
}

impl Read for InnerSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            InnerSocket::Tcp(socket) => socket.stream.read(buf),
            #[cfg(unix)]
            InnerSocket::Local(socket) => socket.stream.read(buf),
        }
    }
}

impl Write for InnerSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            InnerSocket::Tcp(socket) => socket.stream.write(buf),
            #[cfg(unix)]
            InnerSocket::Local(socket) => socket.stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            InnerSocket::Tcp(socket) => socket.stream.flush(),
            #[cfg(unix)]
            InnerSocket::Local(socket) => socket.stream.flush(),
        }
    }
}

#[cfg(unix)]
fn connect_local(name: &str, timeout: Option<Duration>, config: &SocketConfig) -> Result<InnerSocket> {
    Ok(InnerSocket::Local(local::LocalSocket::connect(name, timeout, config)?))
}

#[cfg(not(unix))]
fn connect_local(_: &str, _: Option<Duration>, _: &SocketConfig) -> Result<InnerSocket> {
    Err(Error::TransportUnavailable(Transport::Local))
}

/// Main socket abstraction.
///
/// A socket is created unconnected and connected once, requests are
/// strictly sequential: one message is sent and its response read before
/// the next one goes out.
pub struct Socket {
    transport: Transport,
    config: SocketConfig,
    inner: Option<InnerSocket>,
    peer: Option<Endpoint>,
}

impl Socket {
    /// Creates a new unconnected socket for the given transport.
    pub fn new(transport: Transport) -> Result<Self> {
        Self::new_with_config(transport, SocketConfig::default())
    }

    pub fn new_with_config(transport: Transport, config: SocketConfig) -> Result<Self> {
        if !transport.is_available() {
            return Err(Error::TransportUnavailable(transport));
        }
        Ok(Self {
            transport,
            config,
            inner: None,
            peer: None,
        })
    }

    /// Creates a socket and connects it to the endpoint, using the
    /// configured connect timeout.
    pub fn connect_to(endpoint: &Endpoint, config: SocketConfig) -> Result<Self> {
        let mut socket = Self::new_with_config(endpoint.transport(), config)?;
        socket.connect(endpoint, config.connect_timeout)?;
        Ok(socket)
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    pub fn peer(&self) -> Option<&Endpoint> {
        self.peer.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_some()
    }

    /// Connects to a listening peer.
    ///
    /// While the peer refuses the connection (e.g. it did not bind yet),
    /// connecting is retried until the timeout elapses. Without a timeout
    /// a single attempt is made.
    pub fn connect(&mut self, endpoint: &Endpoint, timeout: Option<Duration>) -> Result<()> {
        if let Some(peer) = &self.peer {
            return Err(Error::ConnectionEstablished(peer.to_string()));
        }
        if endpoint.transport() != self.transport {
            return Err(Error::WrongEndpointType {
                endpoint: endpoint.to_string(),
                transport: self.transport,
            });
        }
        let inner = match endpoint {
            Endpoint::Tcp(addr) => {
                InnerSocket::Tcp(tcp::TcpSocket::connect(*addr, timeout, &self.config)?)
            }
            Endpoint::Local(name) => connect_local(name, timeout, &self.config)?,
        };
        debug!("connection established to {}", endpoint);
        self.inner = Some(inner);
        self.peer = Some(endpoint.clone());
        Ok(())
    }

    /// Closes the connection. Calling it on a closed socket does nothing.
    pub fn close(&mut self) {
        if let Some(inner) = self.inner.take() {
            if let Err(e) = inner.shutdown() {
                trace!("shutdown failed: {}", e);
            }
        }
        self.peer = None;
    }

    /// Returns a handle able to close the connection from another thread,
    /// e.g. one blocked in `recv`.
    pub fn closer(&self) -> Result<SocketCloser> {
        let inner = self.stream_ref()?.try_clone()?;
        Ok(SocketCloser { inner })
    }

    fn stream_ref(&self) -> Result<&InnerSocket> {
        self.inner.as_ref().ok_or(Error::ConnectionNotEstablished)
    }

    fn describe(&self, what: &str) -> String {
        match &self.peer {
            Some(peer) => format!("{} {}", what, peer),
            None => what.to_string(),
        }
    }

    /// Writes all bytes, using the configured send timeout.
    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let timeout = self.config.send_timeout;
        self.send_with_timeout(bytes, timeout)
    }

    /// Writes all bytes, failing if the peer doesn't accept them within
    /// the timeout.
    pub fn send_with_timeout(&mut self, bytes: &[u8], timeout: Option<Duration>) -> Result<()> {
        self.write_until(bytes, Instant::now(), timeout)
    }

    /// Reads up to `max_bytes`, using the configured receive timeout.
    pub fn recv(&mut self, max_bytes: usize) -> Result<Vec<u8>> {
        let timeout = self.config.recv_timeout;
        self.recv_with_timeout(max_bytes, timeout)
    }

    /// Reads up to `max_bytes`. Returns an empty buffer if the peer shut
    /// the connection down.
    pub fn recv_with_timeout(&mut self, max_bytes: usize, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let what = self.describe("receiving from");
        let start = Instant::now();
        let stream = self
            .inner
            .as_mut()
            .ok_or(Error::ConnectionNotEstablished)?;
        let mut buf = vec![0; max_bytes];
        loop {
            stream.set_read_timeout(remaining(start, timeout, &what)?)?;
            match stream.read(&mut buf) {
                Ok(count) => {
                    buf.truncate(count);
                    return Ok(buf);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::from_io(e, &what)),
            }
        }
    }

    fn write_until(&mut self, bytes: &[u8], start: Instant, timeout: Option<Duration>) -> Result<()> {
        let what = self.describe("sending to");
        let stream = self
            .inner
            .as_mut()
            .ok_or(Error::ConnectionNotEstablished)?;
        let mut written = 0;
        while written < bytes.len() {
            stream.set_write_timeout(remaining(start, timeout, &what)?)?;
            match stream.write(&bytes[written..]) {
                Ok(0) => return Err(Error::IoError(ErrorKind::WriteZero.into())),
                Ok(count) => written += count,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::from_io(e, &what)),
            }
        }
        stream.flush()?;
        Ok(())
    }

    /// Fills the buffer, stopping early only if the peer closes the
    /// connection. Returns the number of bytes read.
    fn read_until(&mut self, buf: &mut [u8], start: Instant, timeout: Option<Duration>) -> Result<usize> {
        let what = self.describe("receiving from");
        let stream = self
            .inner
            .as_mut()
            .ok_or(Error::ConnectionNotEstablished)?;
        let mut filled = 0;
        while filled < buf.len() {
            stream.set_read_timeout(remaining(start, timeout, &what)?)?;
            match stream.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(count) => filled += count,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::from_io(e, &what)),
            }
        }
        Ok(filled)
    }

    fn receive_header(&mut self, start: Instant, timeout: Option<Duration>) -> Result<u64> {
        let mut header = [0; frame::HEADER_LEN];
        let count = self.read_until(&mut header, start, timeout)?;
        if count != frame::HEADER_LEN {
            return Err(Error::ResponseFormat(format!(
                "incomplete message header, got {} of {} bytes",
                count,
                frame::HEADER_LEN
            )));
        }
        frame::decode_header(&header)
    }

    /// Sends a single framed text message.
    pub fn send_msg(&mut self, msg: &str, timeout: Option<Duration>) -> Result<()> {
        trace!("sending {} byte message", msg.len());
        self.write_until(&frame::encode(msg), Instant::now(), timeout)
    }

    /// Receives a single framed text message. The timeout covers the whole
    /// message, header included.
    pub fn receive_msg(&mut self, timeout: Option<Duration>) -> Result<String> {
        let start = Instant::now();
        let len = self.receive_header(start, timeout)?;
        if len == 0 {
            return Err(Error::EmptyResponse);
        }
        if len > frame::MAX_MESSAGE_LEN {
            return Err(Error::ResponseFormat(format!(
                "declared message size {} exceeds limit",
                len
            )));
        }
        let mut data = vec![0; len as usize];
        let count = self.read_until(&mut data, start, timeout)?;
        if count != data.len() {
            return Err(Error::ResponseFormat(
                "received data does not match declared data size".to_string(),
            ));
        }
        String::from_utf8(data)
            .map_err(|e| Error::ResponseFormat(format!("message is not valid utf-8: {}", e)))
    }

    /// Streams the contents of a file preceded by the length header. The
    /// timeout applies to each chunk separately.
    pub fn send_file<P: AsRef<Path>>(&mut self, path: P, timeout: Option<Duration>) -> Result<()> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        debug!("sending file {} ({} bytes)", path.display(), len);
        self.write_until(&frame::encode_header(len), Instant::now(), timeout)?;
        let mut buf = vec![0; self.config.buffer_size];
        loop {
            let count = file.read(&mut buf)?;
            if count == 0 {
                break;
            }
            self.write_until(&buf[..count], Instant::now(), timeout)?;
        }
        Ok(())
    }

    /// Receives a length-headed payload and writes it to the given path,
    /// chunk by chunk.
    pub fn receive_file<P: AsRef<Path>>(&mut self, path: P, timeout: Option<Duration>) -> Result<()> {
        let path = path.as_ref();
        let len = self.receive_header(Instant::now(), timeout)?;
        if len == 0 {
            return Err(Error::EmptyResponse);
        }
        let mut file = File::create(path)?;
        let mut buf = vec![0; self.config.buffer_size];
        let mut received: u64 = 0;
        while received < len {
            let want = (len - received).min(buf.len() as u64) as usize;
            let count = self.read_until(&mut buf[..want], Instant::now(), timeout)?;
            file.write_all(&buf[..count])?;
            received += count as u64;
            if count < want {
                break;
            }
        }
        file.flush()?;
        if received != len {
            return Err(Error::ResponseFormat(format!(
                "received file size {} does not match declared size {}",
                received, len
            )));
        }
        debug!("received file {} ({} bytes)", path.display(), len);
        Ok(())
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

/// Handle for closing a connection from a thread other than its owner.
pub struct SocketCloser {
    inner: InnerSocket,
}

impl SocketCloser {
    /// Shuts the connection down, unblocking any pending reads. Safe to
    /// call multiple times.
    pub fn close(&self) {
        if let Err(e) = self.inner.shutdown() {
            trace!("shutdown failed: {}", e);
        }
    }
}

enum InnerListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Local(local::LocalListener),
}

#[cfg(unix)]
fn bind_local(name: &str) -> Result<InnerListener> {
    Ok(InnerListener::Local(local::LocalListener::bind(name)?))
}

#[cfg(not(unix))]
fn bind_local(_: &str) -> Result<InnerListener> {
    Err(Error::TransportUnavailable(Transport::Local))
}

/// Listening side of the transport.
///
/// Used by test harnesses and anything else playing the server's role.
pub struct Listener {
    inner: InnerListener,
    endpoint: Endpoint,
    config: SocketConfig,
}

impl Listener {
    pub fn bind(endpoint: &Endpoint) -> Result<Self> {
        Self::bind_with_config(endpoint, SocketConfig::default())
    }

    pub fn bind_with_config(endpoint: &Endpoint, config: SocketConfig) -> Result<Self> {
        let (inner, endpoint) = match endpoint {
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr)?;
                listener.set_nonblocking(true)?;
                let bound = Endpoint::Tcp(listener.local_addr()?);
                (InnerListener::Tcp(listener), bound)
            }
            Endpoint::Local(name) => (bind_local(name)?, endpoint.clone()),
        };
        trace!("listening on {}", endpoint);
        Ok(Self {
            inner,
            endpoint,
            config,
        })
    }

    /// Endpoint the listener is actually bound to, with any port 0
    /// resolved to the assigned port.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn try_accept(&self) -> io::Result<Option<InnerSocket>> {
        let accepted = match &self.inner {
            InnerListener::Tcp(listener) => listener
                .accept()
                .and_then(|(stream, _)| tcp::TcpSocket::accepted(stream, &self.config))
                .map(InnerSocket::Tcp),
            #[cfg(unix)]
            InnerListener::Local(listener) => listener.accept().map(InnerSocket::Local),
        };
        match accepted {
            Ok(socket) => Ok(Some(socket)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Waits for an incoming connection, failing with a timeout error if
    /// none arrives in time.
    pub fn accept(&self, timeout: Option<Duration>) -> Result<Socket> {
        let what = format!("accepting on {}", self.endpoint);
        let start = Instant::now();
        loop {
            if let Some(inner) = self.try_accept()? {
                trace!("accepted connection on {}", self.endpoint);
                return Ok(Socket {
                    transport: self.endpoint.transport(),
                    config: self.config,
                    inner: Some(inner),
                    peer: Some(self.endpoint.clone()),
                });
            }
            remaining(start, timeout, &what)?;
            pause(start, timeout, self.config.retry_interval.min(Duration::from_millis(10)));
        }
    }
}
