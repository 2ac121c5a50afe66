use std::time::Duration;

use serde_json::Value;

use crate::msg::{request_name, Request};
use crate::socket::{Endpoint, Socket, SocketConfig};
use crate::{Error, LogContext, Result};

/// Configuration of the request/response client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub socket: SocketConfig,
    /// Time allowed for a regular request, sending and receiving included
    pub request_timeout: Option<Duration>,
    /// Time allowed for long running commands, e.g. starting the project
    pub long_request_timeout: Option<Duration>,
    /// Number of times a request is attempted. Only timed out requests are
    /// attempted again.
    pub max_request_attempts: u32,
    /// Password sent along with every request
    pub password: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket: SocketConfig::default(),
            request_timeout: Some(Duration::from_secs(30)),
            long_request_timeout: None,
            max_request_attempts: 1,
            password: None,
        }
    }
}

/// Sends requests to a running server.
///
/// Every request is exchanged over its own connection: connect, send one
/// frame, receive one frame, close. The client itself holds no connection,
/// it can be cloned freely and the clones used from separate threads. A
/// single instance is not meant to be shared between threads issuing
/// requests at the same time.
///
/// Failures are reported by layer. Transport failures (including timeouts)
/// are the only ones worth retrying, a malformed response or a request the
/// server rejected will fail the same way again.
#[derive(Debug, Clone)]
pub struct Client {
    endpoint: Endpoint,
    config: ClientConfig,
    log: LogContext,
    disposed: bool,
}

impl Client {
    pub fn new(endpoint: Endpoint, config: ClientConfig, log: LogContext) -> Self {
        Self {
            endpoint,
            config,
            log,
            disposed: false,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn log(&self) -> &LogContext {
        &self.log
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Marks the client as disposed. Any request made afterwards fails.
    pub fn dispose(&mut self) {
        if !self.disposed {
            debug!(target: self.log.target(), "disposing client of {}", self.endpoint);
        }
        self.disposed = true;
    }

    /// Sends a typed request and decodes the response into the shape the
    /// request declares.
    pub fn request<R: Request>(&self, request: &R) -> Result<R::Response> {
        let name = request.name();
        let body = request.to_json(self.config.password.as_deref());
        let timeout = match request.is_long_running() {
            true => self.config.long_request_timeout,
            false => self.config.request_timeout,
        };
        let response = self.exchange_with_attempts(name, &body, timeout)?;
        serde_json::from_value(response).map_err(|e| {
            Error::ResponseFormat(format!("unexpected response to {}: {}", name, e))
        })
    }

    /// Sends a raw JSON request, returning the raw JSON response.
    ///
    /// The password, if configured, is added to the body unless it already
    /// carries one.
    pub fn send_command(&self, body: &Value) -> Result<Value> {
        let name = request_name(body).unwrap_or("request").to_string();
        let mut body = body.clone();
        if let (Some(password), Value::Object(map)) = (&self.config.password, &mut body) {
            map.entry("Password")
                .or_insert_with(|| Value::from(password.as_str()));
        }
        self.exchange_with_attempts(&name, &body, self.config.request_timeout)
    }

    fn exchange_with_attempts(
        &self,
        name: &str,
        body: &Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        if self.disposed {
            return Err(Error::Disposed);
        }
        let text = serde_json::to_string(body)?;
        let attempts = self.config.max_request_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.exchange(name, &text, timeout) {
                Err(e) if e.is_timeout() && attempt < attempts => {
                    warn!(
                        target: self.log.target(),
                        "{} (attempt {}/{})", e, attempt, attempts
                    );
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Performs a single request/response exchange on a fresh connection.
    fn exchange(&self, name: &str, text: &str, timeout: Option<Duration>) -> Result<Value> {
        trace!(target: self.log.target(), "sending {} to {}", name, self.endpoint);
        let response = self
            .transmit(text, timeout)
            .map_err(|e| self.contextualize(name, e))?;
        trace!(target: self.log.target(), "{} response: {}", name, response);

        let response: Value = serde_json::from_str(&response).map_err(|e| {
            Error::ResponseFormat(format!("response to {} is not valid json: {}", name, e))
        })?;
        check_response(name, &response)?;
        Ok(response)
    }

    fn transmit(&self, text: &str, timeout: Option<Duration>) -> Result<String> {
        let mut socket = Socket::connect_to(&self.endpoint, self.config.socket)?;
        socket.send_msg(text, timeout)?;
        let response = socket.receive_msg(timeout);
        socket.close();
        response
    }

    /// Attaches the request name and endpoint to transport errors.
    fn contextualize(&self, name: &str, e: Error) -> Error {
        match e {
            Error::TimedOut(_) => Error::TimedOut(format!("{} on {}", name, self.endpoint)),
            Error::ResponseFormat(_)
            | Error::EmptyResponse
            | Error::TransportUnavailable(_)
            | Error::WrongEndpointType { .. } => e,
            e => Error::Communication {
                endpoint: self.endpoint.to_string(),
                message: format!("{}: {}", name, e),
            },
        }
    }
}

/// Fails if the response reports a failed request. Arrays are checked
/// element by element.
pub fn check_response(name: &str, response: &Value) -> Result<()> {
    match response {
        Value::Array(items) => items.iter().try_for_each(|item| check_response(name, item)),
        Value::Object(map) => {
            let failed = map
                .get("status")
                .and_then(Value::as_str)
                .map(|status| status.eq_ignore_ascii_case("failure"))
                .unwrap_or(false);
            if !failed {
                return Ok(());
            }
            let message = map.get("message").and_then(Value::as_str);
            let std_err = map.get("std_err").and_then(Value::as_str);
            let message = match (message, std_err) {
                (Some(message), Some(std_err)) => format!("{}; {}", message, std_err),
                (Some(message), None) => message.to_string(),
                _ => response.to_string(),
            };
            Err(Error::Command {
                command: name.to_string(),
                message,
            })
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{BasicProjectInfoRequest, Command, ProjectState, ServerIsAliveRequest};
    use crate::socket::frame;
    use crate::Listener;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    /// Accepts `connections` connections, handing each to the handler on
    /// its own thread.
    fn serve<F>(listener: Listener, connections: usize, handler: F) -> thread::JoinHandle<()>
    where
        F: Fn(usize, Socket) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        thread::spawn(move || {
            let mut workers = Vec::new();
            for n in 0..connections {
                let socket = match listener.accept(Some(Duration::from_secs(5))) {
                    Ok(s) => s,
                    Err(_) => break,
                };
                let handler = handler.clone();
                workers.push(thread::spawn(move || handler(n, socket)));
            }
            for worker in workers {
                let _ = worker.join();
            }
        })
    }

    /// Accepts `connections` connections, handling them one at a time on
    /// the serving thread.
    fn serve_sequentially<F>(listener: Listener, connections: usize, handler: F) -> thread::JoinHandle<()>
    where
        F: Fn(usize, Socket) + Send + 'static,
    {
        thread::spawn(move || {
            for n in 0..connections {
                match listener.accept(Some(Duration::from_secs(5))) {
                    Ok(socket) => handler(n, socket),
                    Err(_) => break,
                }
            }
        })
    }

    fn respond_with(response: Value) -> impl Fn(usize, Socket) + Send + Sync + 'static {
        move |_, mut socket| {
            let timeout = Some(Duration::from_secs(5));
            socket.receive_msg(timeout).unwrap();
            socket.send_msg(&response.to_string(), timeout).unwrap();
        }
    }

    fn tcp_listener() -> (Listener, Endpoint) {
        let listener = Listener::bind(&Endpoint::localhost(0)).unwrap();
        let endpoint = listener.endpoint().clone();
        (listener, endpoint)
    }

    fn config(timeout_ms: u64) -> ClientConfig {
        ClientConfig {
            request_timeout: Some(Duration::from_millis(timeout_ms)),
            ..ClientConfig::default()
        }
    }

    #[test]
    fn typed_response() {
        let (listener, endpoint) = tcp_listener();
        let server = serve(
            listener,
            1,
            respond_with(json!({"projects": [{"name": "p", "state": "FINISHED"}]})),
        );
        let client = Client::new(endpoint, ClientConfig::default(), LogContext::default());
        let info = client.request(&BasicProjectInfoRequest).unwrap();
        assert_eq!(info.state(), Some(&ProjectState::Finished));
        server.join().unwrap();
    }

    #[test]
    fn password_is_sent() {
        let (listener, endpoint) = tcp_listener();
        let server = serve(listener, 1, |_, mut socket| {
            let timeout = Some(Duration::from_secs(5));
            let body: Value = serde_json::from_str(&socket.receive_msg(timeout).unwrap()).unwrap();
            assert_eq!(body["Password"], "pw");
            socket.send_msg("{}", timeout).unwrap();
        });
        let config = ClientConfig {
            password: Some("pw".to_string()),
            ..ClientConfig::default()
        };
        let client = Client::new(endpoint, config, LogContext::default());
        client.request(&ServerIsAliveRequest).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn failure_status_is_command_error() {
        let (listener, endpoint) = tcp_listener();
        let server = serve(
            listener,
            2,
            respond_with(json!([
                {"status": "success"},
                {"status": "Failure", "message": "cannot start", "std_err": "no license"}
            ])),
        );
        let client = Client::new(endpoint, ClientConfig::default(), LogContext::default());
        match client.request(&Command::Start) {
            Err(Error::Command { command, message }) => {
                assert_eq!(command, "START");
                assert_eq!(message, "cannot start; no license");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        let e = client
            .send_command(&json!({"What": "SERVER_IS_ALIVE"}))
            .unwrap_err();
        assert!(!e.is_retryable());
        server.join().unwrap();
    }

    #[test]
    fn failure_without_details_carries_body() {
        let e = check_response("X", &json!({"status": "failure"})).unwrap_err();
        assert!(e.to_string().contains("\"status\""));
        assert!(check_response("X", &json!({"status": "success"})).is_ok());
        assert!(check_response("X", &json!(3)).is_ok());
    }

    #[test]
    fn empty_response() {
        let (listener, endpoint) = tcp_listener();
        let server = serve(listener, 1, |_, mut socket| {
            socket.receive_msg(Some(Duration::from_secs(5))).unwrap();
            socket.send(&frame::encode_header(0)).unwrap();
        });
        let client = Client::new(endpoint, ClientConfig::default(), LogContext::default());
        match client.request(&ServerIsAliveRequest) {
            Err(Error::EmptyResponse) => (),
            other => panic!("unexpected result: {:?}", other),
        }
        server.join().unwrap();
    }

    #[test]
    fn invalid_json_is_format_error() {
        let (listener, endpoint) = tcp_listener();
        let server = serve(listener, 1, |_, mut socket| {
            let timeout = Some(Duration::from_secs(5));
            socket.receive_msg(timeout).unwrap();
            socket.send_msg("{not json", timeout).unwrap();
        });
        let client = Client::new(endpoint, ClientConfig::default(), LogContext::default());
        match client.request(&ServerIsAliveRequest) {
            Err(Error::ResponseFormat(_)) => (),
            other => panic!("unexpected result: {:?}", other),
        }
        server.join().unwrap();
    }

    #[test]
    fn unanswered_request_times_out() {
        let (listener, endpoint) = tcp_listener();
        let server = serve(listener, 1, |_, mut socket| {
            socket.receive_msg(Some(Duration::from_secs(5))).unwrap();
            thread::sleep(Duration::from_millis(800));
        });
        let client = Client::new(endpoint, config(300), LogContext::default());
        let start = Instant::now();
        let e = client.request(&ServerIsAliveRequest).unwrap_err();
        assert!(e.is_timeout());
        assert!(e.to_string().contains("SERVER_IS_ALIVE"));
        assert!(start.elapsed() < Duration::from_millis(800));
        server.join().unwrap();
    }

    #[test]
    fn timed_out_request_is_attempted_again() {
        let (listener, endpoint) = tcp_listener();
        let server = serve(listener, 2, |n, mut socket| {
            let timeout = Some(Duration::from_secs(5));
            socket.receive_msg(timeout).unwrap();
            if n == 0 {
                thread::sleep(Duration::from_millis(600));
            } else {
                socket.send_msg("{}", timeout).unwrap();
            }
        });
        let config = ClientConfig {
            max_request_attempts: 2,
            ..config(300)
        };
        let client = Client::new(endpoint, config, LogContext::default());
        client.request(&ServerIsAliveRequest).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn nothing_listening() {
        let endpoint = {
            let (_listener, endpoint) = tcp_listener();
            endpoint
        };
        let mut config = config(300);
        config.socket.connect_timeout = Some(Duration::from_millis(200));
        let client = Client::new(endpoint, config, LogContext::default());
        let e = client.request(&ServerIsAliveRequest).unwrap_err();
        assert!(e.is_retryable());
    }

    #[test]
    fn disposed_client_fails() {
        let mut client = Client::new(
            Endpoint::localhost(1),
            ClientConfig::default(),
            LogContext::default(),
        );
        client.dispose();
        client.dispose();
        assert!(client.is_disposed());
        match client.request(&ServerIsAliveRequest) {
            Err(Error::Disposed) => (),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn concurrent_local_connections_do_not_mix() {
        let endpoint = Endpoint::generate_local();
        let listener = Listener::bind(&endpoint).unwrap();
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        let server = serve(listener, 3, move |_, mut socket| {
            let timeout = Some(Duration::from_secs(5));
            let msg = socket.receive_msg(timeout).unwrap();
            thread::sleep(Duration::from_millis(50));
            socket.send_msg(&msg, timeout).unwrap();
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let clients: Vec<_> = (0..3)
            .map(|i| {
                let client = Client::new(endpoint.clone(), config(5000), LogContext::default());
                thread::spawn(move || {
                    let body = json!({"What": "ECHO", "id": i});
                    let response = client.send_command(&body).unwrap();
                    assert_eq!(response, body);
                })
            })
            .collect();
        for client in clients {
            client.join().unwrap();
        }
        server.join().unwrap();
        assert_eq!(handled.load(Ordering::SeqCst), 3);
    }

    #[cfg(unix)]
    #[test]
    fn local_connections_served_one_at_a_time_do_not_mix() {
        let endpoint = Endpoint::generate_local();
        let listener = Listener::bind(&endpoint).unwrap();
        let served = Arc::new(std::sync::Mutex::new(Vec::new()));
        let order = served.clone();
        let server = serve_sequentially(listener, 3, move |_, mut socket| {
            let timeout = Some(Duration::from_secs(5));
            let msg = socket.receive_msg(timeout).unwrap();
            thread::sleep(Duration::from_millis(50));
            socket.send_msg(&msg, timeout).unwrap();
            let body: Value = serde_json::from_str(&msg).unwrap();
            order.lock().unwrap().push(body["id"].as_u64().unwrap());
        });

        let clients: Vec<_> = (0..3)
            .map(|i| {
                let client = Client::new(endpoint.clone(), config(5000), LogContext::default());
                thread::spawn(move || {
                    let body = json!({"What": "ECHO", "id": i});
                    let response = client.send_command(&body).unwrap();
                    assert_eq!(response, body);
                })
            })
            .collect();
        for client in clients {
            client.join().unwrap();
        }
        server.join().unwrap();

        let mut served = served.lock().unwrap().clone();
        served.sort_unstable();
        assert_eq!(served, vec![0, 1, 2]);
    }
}
