//! The endpoint contract and the single-threaded blocking accept loop.
//!
//! Grounded in `examples/original_source/server-cpp/include/sync-http-srv/
//! server.hh` and `src/server.cc`'s `Server::run()`: routes are tried in
//! registration order, first match wins, and the three handling flags
//! (`kNoDispatchResponse`, `kStop`, `kKeepClientConnection`) drive whether
//! the loop writes a response, closes the socket, and keeps accepting.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use log::{debug, error, info, warn};

use crate::error::{ServerError, ServerResult};
use crate::http::{HttpStatus, ReceiveConfig, RequestMsg, ResponseMsg};
use crate::route::{Route, UrlParams};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HandleFlags: u16 {
        const NO_DISPATCH_RESPONSE = 0x1;
        const STOP_SERVER = 0x2;
        const KEEP_CLIENT_CONNECTION = 0x4;
    }
}

/// Business logic behind one route. `client` is the accepted connection;
/// endpoints that need to keep it alive past `handle` returning (the
/// forwarding endpoint) set `KEEP_CLIENT_CONNECTION` and clone it first.
pub trait Endpoint: Send + Sync {
    fn handle(
        &self,
        request: &RequestMsg,
        client: &TcpStream,
        params: &UrlParams,
    ) -> (HandleFlags, Option<ResponseMsg>);
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub connection_timeout_s: u64,
    pub io_buf_size: usize,
    pub max_in_mem_content_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            backlog: 128,
            connection_timeout_s: 15,
            io_buf_size: 8192,
            max_in_mem_content_len: 10 * 1024 * 1024,
        }
    }
}

type RouteTable = Vec<(Box<dyn Route>, Box<dyn Endpoint>)>;

pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    routes: RouteTable,
    keep_going: Arc<AtomicBool>,
}

impl Server {
    /// Binds and listens immediately, so that a `port: 0` config's
    /// effective port is known to the caller before `run()` — and, in
    /// the process manager's case, before `fork()`.
    pub fn bind(config: ServerConfig) -> ServerResult<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr)?;
        let effective_port = listener.local_addr()?.port();
        info!("listening on {}:{effective_port}", config.host);

        let mut config = config;
        config.port = effective_port;

        // backlog is fixed at bind time on Unix via listen(2); std's
        // TcpListener always uses a platform default, so make sure the
        // configured backlog is at least visible for anyone inspecting
        // the config (a true custom backlog needs a raw socket builder,
        // e.g. socket2, which this crate's dependency set doesn't add).
        debug!("configured backlog: {}", config.backlog);

        Ok(Self {
            listener,
            config,
            routes: Vec::new(),
            keep_going: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn add_route(&mut self, route: Box<dyn Route>, endpoint: Box<dyn Endpoint>) -> &mut Self {
        self.routes.push((route, endpoint));
        self
    }

    /// External entry point mirroring the original's `set_stop_flag()`.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.keep_going.clone()
    }

    pub fn request_stop(&self) {
        self.keep_going.store(false, Ordering::SeqCst);
    }

    fn receive_config(&self) -> ReceiveConfig {
        ReceiveConfig {
            io_buf_size: self.config.io_buf_size,
            max_in_mem_content_len: self.config.max_in_mem_content_len,
        }
    }

    /// First route whose `can_handle` matches, in registration order.
    /// Propagates a misconfigured route's hard error instead of treating
    /// it as a non-match.
    fn match_route(&self, path: &str) -> ServerResult<Option<(&Box<dyn Endpoint>, UrlParams)>> {
        for (route, endpoint) in &self.routes {
            if let Some(params) = route.can_handle(path)? {
                return Ok(Some((endpoint, params)));
            }
        }
        Ok(None)
    }

    /// The accept loop. Runs until `request_stop()` is called (directly,
    /// or by an endpoint returning `STOP_SERVER`).
    pub fn run(&self) -> ServerResult<()> {
        while self.keep_going.load(Ordering::SeqCst) {
            let (stream, peer) = match self.listener.accept() {
                Ok(v) => v,
                Err(e) => {
                    warn!("accept() failed: {e}");
                    continue;
                }
            };

            let timeout = Duration::from_secs(self.config.connection_timeout_s.max(1));
            let _ = stream.set_read_timeout(Some(timeout));
            let _ = stream.set_write_timeout(Some(timeout));

            self.handle_client(stream, peer);
        }
        Ok(())
    }

    fn handle_client(&self, mut stream: TcpStream, peer: SocketAddr) {
        let client_ip = peer.ip().to_string();
        debug!("connection from {client_ip}");

        let request = match RequestMsg::receive(&mut stream, &self.receive_config(), &client_ip) {
            Ok(req) => req,
            Err(ServerError::ClientClosedConnection) => {
                debug!("client {client_ip} closed connection before sending a request");
                return;
            }
            Err(ServerError::ClientSocketError(msg)) => {
                debug!("socket error from {client_ip}: {msg}");
                return;
            }
            Err(e) => {
                let mut resp = ResponseMsg::from_server_error(&e);
                let _ = resp.dispatch(&mut stream, self.config.io_buf_size);
                let _ = stream.shutdown(std::net::Shutdown::Both);
                return;
            }
        };

        info!("[{}] {}", request.method, request.raw_target);

        let (flags, response) = match self.match_route(&request.uri.path) {
            Ok(Some((endpoint, params))) => {
                match catch_unwind(AssertUnwindSafe(|| endpoint.handle(&request, &stream, &params))) {
                    Ok(result) => result,
                    Err(_) => {
                        error!("endpoint for {:?} panicked", request.raw_target);
                        (
                            HandleFlags::empty(),
                            Some(ResponseMsg::error_json(
                                HttpStatus::BadRequest,
                                &["endpoint failed to handle request.".to_string()],
                            )),
                        )
                    }
                }
            }
            Ok(None) => (
                HandleFlags::empty(),
                Some(ResponseMsg::error_json(
                    HttpStatus::NotFound,
                    &["Invalid path, no matching route.".to_string()],
                )),
            ),
            Err(e) => {
                error!("route matching failed: {e}");
                (HandleFlags::empty(), Some(ResponseMsg::from_server_error(&e)))
            }
        };

        if let Some(mut response) = response {
            response.headers.set("access-control-allow-origin", "*");
            if !flags.contains(HandleFlags::NO_DISPATCH_RESPONSE) {
                if let Err(e) = response.dispatch(&mut stream, self.config.io_buf_size) {
                    warn!("failed dispatching response to {client_ip}: {e}");
                }
            }
        }

        if !flags.contains(HandleFlags::KEEP_CLIENT_CONNECTION) {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }

        if flags.contains(HandleFlags::STOP_SERVER) {
            info!("endpoint requested server stop");
            self.keep_going.store(false, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;
    use crate::route::StringRoute;
    use std::io::{Read, Write};
    use std::thread;

    struct EchoEndpoint;

    impl Endpoint for EchoEndpoint {
        fn handle(
            &self,
            _request: &RequestMsg,
            _client: &TcpStream,
            _params: &UrlParams,
        ) -> (HandleFlags, Option<ResponseMsg>) {
            (HandleFlags::empty(), Some(ResponseMsg::new(HttpStatus::Ok)))
        }
    }

    struct StoppingEndpoint;

    impl Endpoint for StoppingEndpoint {
        fn handle(
            &self,
            _request: &RequestMsg,
            _client: &TcpStream,
            _params: &UrlParams,
        ) -> (HandleFlags, Option<ResponseMsg>) {
            (
                HandleFlags::STOP_SERVER,
                Some(ResponseMsg::new(HttpStatus::Ok)),
            )
        }
    }

    #[test]
    fn no_matching_route_yields_404() {
        let mut server = Server::bind(ServerConfig {
            port: 0,
            ..Default::default()
        })
        .unwrap();
        server.add_route(Box::new(StringRoute::new("echo", "/echo")), Box::new(EchoEndpoint));
        let port = server.port();

        let handle = thread::spawn(move || server.run());

        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .write_all(b"GET /nope HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).unwrap();
        let text = String::from_utf8_lossy(&buf);
        assert!(text.starts_with("404"));

        drop(handle);
    }

    #[test]
    fn stop_server_flag_ends_accept_loop() {
        let mut server = Server::bind(ServerConfig {
            port: 0,
            ..Default::default()
        })
        .unwrap();
        server.add_route(Box::new(StringRoute::new("stop", "/stop")), Box::new(StoppingEndpoint));
        let port = server.port();

        let handle = thread::spawn(move || server.run());

        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .write_all(b"GET /stop HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).unwrap();

        handle.join().unwrap().unwrap();
        let _ = Method::Get;
    }
}
