//! The process tree: child bookkeeping, fork-and-handover, status
//! reaping, and the reverse-proxy forwarding endpoint.
//!
//! Grounded in `examples/original_source/server-cpp/src/resources/
//! processes.cc`: `_vacant_proc_name`'s probing loop, `fork_server`'s
//! construct-then-fork sequencing, `refresh_children_status`'s
//! `waitpid(WNOHANG)` use, and `_run_forward_request`'s per-stage error
//! synthesis.

use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::{Arc, Condvar, Mutex};

use log::{debug, error, warn};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::error::{ServerError, ServerResult};
use crate::http::{HttpStatus, InMemoryContent, ReceiveConfig, RequestMsg, ResponseMsg};
use crate::route::UrlParams;
use crate::server::{Endpoint, HandleFlags, Server, ServerConfig};
use crate::uri::Uri;

const MAX_NAME_SUFFIX: u32 = 1 << 16;

#[derive(Debug, Clone)]
pub struct ChildProcess {
    pub pid: i32,
    pub port: u16,
    pub is_running: bool,
    pub exit_code: Option<i32>,
    pub stop_signal: Option<i32>,
    pub host: String,
    pub api_prefix: String,
}

/// Tracks forwarding worker threads so `fork_server` can drain them
/// before calling `fork()` — option (a) from spec.md §9's design note,
/// chosen over silently inheriting the source's un-implemented barrier.
pub struct WorkerRegistry {
    count: Mutex<usize>,
    drained: Condvar,
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            drained: Condvar::new(),
        }
    }

    pub fn spawn<F>(self: &Arc<Self>, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.count.lock().unwrap() += 1;
        let registry = self.clone();
        std::thread::spawn(move || {
            f();
            let mut count = registry.count.lock().unwrap();
            *count -= 1;
            if *count == 0 {
                registry.drained.notify_all();
            }
        });
    }

    /// Blocks until no forwarding worker is in flight.
    pub fn drain(&self) {
        let guard = self.count.lock().unwrap();
        let _unused = self.drained.wait_while(guard, |c| *c != 0).unwrap();
    }
}

pub enum ForkOutcome {
    Parent,
    Child(Box<Server>),
}

type SubserverCtor = dyn Fn(&str, u16) -> ServerResult<Server> + Send + Sync;

/// Owns the child-name -> `ChildProcess` map and the fork sequencing.
/// Does not hold routes or an `Endpoint` reference itself; the binary
/// wires `ForwardingEndpoint` to the same `children` map independently.
pub struct ProcessManager {
    children: Arc<Mutex<HashMap<String, ChildProcess>>>,
    subserver_ctor: Box<SubserverCtor>,
    worker_registry: Mutex<Option<Arc<WorkerRegistry>>>,
}

impl ProcessManager {
    pub fn new<F>(subserver_ctor: F) -> Self
    where
        F: Fn(&str, u16) -> ServerResult<Server> + Send + Sync + 'static,
    {
        Self {
            children: Arc::new(Mutex::new(HashMap::new())),
            subserver_ctor: Box::new(subserver_ctor),
            worker_registry: Mutex::new(None),
        }
    }

    pub fn children_handle(&self) -> Arc<Mutex<HashMap<String, ChildProcess>>> {
        self.children.clone()
    }

    /// Binds the drain-before-fork barrier. May only be called once; a
    /// second call is the "repeated binding" condition the source
    /// reserved `RepeatativeBinding` for.
    pub fn bind_worker_registry(&self, registry: Arc<WorkerRegistry>) -> ServerResult<()> {
        let mut slot = self.worker_registry.lock().unwrap();
        if slot.is_some() {
            return Err(ServerError::RepeatedBinding);
        }
        *slot = Some(registry);
        Ok(())
    }

    pub fn vacant_name(&self, base: &str) -> ServerResult<String> {
        let children = self.children.lock().unwrap();
        if !children.contains_key(base) {
            return Ok(base.to_string());
        }
        for n in 1..=MAX_NAME_SUFFIX {
            let candidate = format!("{base}-{n}");
            if !children.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(ServerError::MaxProcessNumberExceeded)
    }

    pub fn lookup(&self, name: &str) -> Option<ChildProcess> {
        self.children.lock().unwrap().get(name).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, ChildProcess> {
        self.children.lock().unwrap().clone()
    }

    /// Binds the child's own listening socket (so its effective port is
    /// known before `fork()`), drains in-flight forwarding workers, then
    /// forks. The parent records the new `ChildProcess` and drops its
    /// copy of the child server (closing it in this address space only
    /// — the listening fd was duplicated into the child by `fork()`).
    /// The child returns the live server so the caller can swap it in.
    pub fn fork_server(
        &self,
        name: &str,
        host: &str,
        port: u16,
        api_prefix: &str,
    ) -> ServerResult<ForkOutcome> {
        let new_server = (self.subserver_ctor)(host, port)?;
        let effective_port = new_server.port();

        if let Some(registry) = self.worker_registry.lock().unwrap().as_ref() {
            registry.drain();
        }

        // SAFETY: single-threaded server loop at the point fork_server is
        // called from (the accept loop handling the spawning request);
        // no other thread holds locks this process needs to survive the
        // fork other than the ones released above.
        let outcome = unsafe { fork() }.map_err(|e| ServerError::ForkFailed(e.to_string()))?;
        match outcome {
            ForkResult::Parent { child } => {
                drop(new_server);
                self.children.lock().unwrap().insert(
                    name.to_string(),
                    ChildProcess {
                        pid: child.as_raw(),
                        port: effective_port,
                        is_running: true,
                        exit_code: None,
                        stop_signal: None,
                        host: host.to_string(),
                        api_prefix: api_prefix.to_string(),
                    },
                );
                Ok(ForkOutcome::Parent)
            }
            ForkResult::Child => Ok(ForkOutcome::Child(Box::new(new_server))),
        }
    }

    pub fn refresh(&self, name: &str) {
        let mut children = self.children.lock().unwrap();
        let Some(child) = children.get_mut(name) else {
            return;
        };
        if !child.is_running {
            return;
        }
        match waitpid(Pid::from_raw(child.pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(WaitStatus::Exited(_, code)) => {
                child.exit_code = Some(code);
                child.is_running = false;
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                child.stop_signal = Some(sig as i32);
                child.is_running = false;
            }
            Ok(other) => debug!("waitpid({name}) returned unexpected status: {other:?}"),
            Err(e) => warn!("waitpid({name}) failed: {e}"),
        }
    }

    pub fn refresh_all(&self) {
        let names: Vec<String> = {
            let children = self.children.lock().unwrap();
            children
                .iter()
                .filter(|(_, c)| c.is_running)
                .map(|(name, _)| name.clone())
                .collect()
        };
        for name in names {
            self.refresh(&name);
        }
    }
}

/// Per-request detached worker that relays a request to a named child
/// and streams the reply back, or a `301` nudge when forwarding is
/// disabled (`fw_io_buf_len == 0`).
pub struct ForwardingEndpoint {
    children: Arc<Mutex<HashMap<String, ChildProcess>>>,
    fw_io_buf_len: usize,
    max_in_mem_content_len: usize,
    worker_registry: Arc<WorkerRegistry>,
}

impl ForwardingEndpoint {
    pub fn new(
        children: Arc<Mutex<HashMap<String, ChildProcess>>>,
        fw_io_buf_len: usize,
        max_in_mem_content_len: usize,
        worker_registry: Arc<WorkerRegistry>,
    ) -> Self {
        Self {
            children,
            fw_io_buf_len,
            max_in_mem_content_len,
            worker_registry,
        }
    }

    fn lookup(&self, name: &str) -> Option<ChildProcess> {
        self.children.lock().unwrap().get(name).cloned()
    }
}

fn synth_error(stream: &mut TcpStream, status: HttpStatus, message: String) {
    let mut resp = ResponseMsg::error_json(status, &[message]);
    if let Err(e) = resp.dispatch(stream, 8192) {
        warn!("failed to synthesize error response to client: {e}");
    }
}

impl Endpoint for ForwardingEndpoint {
    fn handle(
        &self,
        request: &RequestMsg,
        client: &TcpStream,
        params: &UrlParams,
    ) -> (HandleFlags, Option<ResponseMsg>) {
        let proc_id = match params.get("procID") {
            Some(p) if !p.is_empty() => p.clone(),
            _ => {
                return (
                    HandleFlags::empty(),
                    Some(ResponseMsg::error_json(
                        HttpStatus::NotFound,
                        &["No such child process.".to_string()],
                    )),
                )
            }
        };
        let remainder = params.get("remainder").cloned().unwrap_or_default();

        let child = match self.lookup(&proc_id) {
            Some(c) => c,
            None => {
                return (
                    HandleFlags::empty(),
                    Some(ResponseMsg::error_json(
                        HttpStatus::NotFound,
                        &["No such child process.".to_string()],
                    )),
                )
            }
        };
        if !child.is_running {
            return (
                HandleFlags::empty(),
                Some(ResponseMsg::error_json(
                    HttpStatus::Gone,
                    &[format!("Child process \"{proc_id}\" is not running.")],
                )),
            );
        }

        let mut downstream_uri = request.uri.clone();
        downstream_uri.scheme = "http".to_string();
        downstream_uri.host = child.host.clone();
        downstream_uri.set_port(child.port);
        downstream_uri.path = remainder.clone();

        if self.fw_io_buf_len == 0 {
            let location = downstream_uri
                .to_string_checked(true)
                .unwrap_or_else(|_| remainder.clone());
            let mut response = ResponseMsg::error_json(
                HttpStatus::MovedPermanently,
                &[format!("Forwarding disabled; access {proc_id} directly.")],
            );
            response.headers.set("location", location);
            return (HandleFlags::empty(), Some(response));
        }

        let method = request.method;
        let version = request.version;
        let headers = request.headers.clone();
        let query = request.uri.query_str();
        let body = request.content.as_ref().map(|c| {
            let mut buf = vec![0u8; c.size()];
            c.copy_to(&mut buf, 0);
            buf
        });
        let io_buf_size = self.fw_io_buf_len;
        let max_in_mem_content_len = self.max_in_mem_content_len;
        let client_clone = match client.try_clone() {
            Ok(c) => c,
            Err(e) => {
                error!("could not clone client socket for forwarding: {e}");
                return (
                    HandleFlags::empty(),
                    Some(ResponseMsg::error_json(
                        HttpStatus::InternalServerError,
                        &["could not set up forwarding.".to_string()],
                    )),
                );
            }
        };

        self.worker_registry.spawn(move || {
            let mut target = remainder.clone();
            if !query.is_empty() {
                target.push('?');
                target.push_str(&query);
            }

            let mut client_stream = client_clone;

            let mut downstream_req = match RequestMsg::new(method, &target, version) {
                Ok(r) => r,
                Err(e) => {
                    synth_error(&mut client_stream, HttpStatus::InternalServerError, e.to_string());
                    return;
                }
            };
            downstream_req.headers = headers;
            downstream_req
                .headers
                .set("host", format!("{}:{}", child.host, child.port));
            downstream_req.content = body.map(|b| Box::new(InMemoryContent::from_bytes(b)) as _);

            let connect_host = if child.host.is_empty() {
                "localhost"
            } else {
                child.host.as_str()
            };
            let mut downstream_stream = match TcpStream::connect((connect_host, child.port)) {
                Ok(s) => s,
                Err(e) => {
                    synth_error(
                        &mut client_stream,
                        HttpStatus::InternalServerError,
                        format!("could not connect to child \"{}\": {e}", proc_id),
                    );
                    return;
                }
            };

            if let Err(e) = downstream_req.dispatch(&mut downstream_stream, io_buf_size) {
                synth_error(
                    &mut client_stream,
                    HttpStatus::InternalServerError,
                    format!("failed sending request to child: {e}"),
                );
                return;
            }

            let recv_cfg = ReceiveConfig {
                io_buf_size,
                max_in_mem_content_len,
            };
            let mut downstream_resp = match ResponseMsg::receive(&mut downstream_stream, &recv_cfg) {
                Ok(r) => r,
                Err(e) => {
                    synth_error(
                        &mut client_stream,
                        HttpStatus::BadGateway,
                        format!("failed reading response from child: {e}"),
                    );
                    return;
                }
            };

            if let Err(e) = downstream_resp.dispatch(&mut client_stream, io_buf_size) {
                warn!("failed relaying response back to client: {e}");
            }

            let _ = client_stream.shutdown(std::net::Shutdown::Both);
            let _ = downstream_stream.shutdown(std::net::Shutdown::Both);
        });

        (
            HandleFlags::KEEP_CLIENT_CONNECTION | HandleFlags::NO_DISPATCH_RESPONSE,
            None,
        )
    }
}

/// Computes a route-relative path against `host`/`port`; used when
/// building `_link` URLs for the process resource.
pub fn build_uri(host: &str, port: u16, path: &str) -> Uri {
    Uri {
        scheme: "http".to_string(),
        userinfo: String::new(),
        host: host.to_string(),
        port: port.to_string(),
        path: path.to_string(),
        query: Vec::new(),
        fragment: String::new(),
    }
}

pub fn default_server_config(host: &str, port: u16) -> ServerConfig {
    ServerConfig {
        host: host.to_string(),
        port,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctor(_host: &str, port: u16) -> ServerResult<Server> {
        Server::bind(ServerConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..Default::default()
        })
    }

    #[test]
    fn vacant_name_returns_base_when_free() {
        let pm = ProcessManager::new(ctor);
        assert_eq!(pm.vacant_name("worker").unwrap(), "worker");
    }

    #[test]
    fn vacant_name_probes_suffixes() {
        let pm = ProcessManager::new(ctor);
        pm.children
            .lock()
            .unwrap()
            .insert(
                "worker".to_string(),
                ChildProcess {
                    pid: 1,
                    port: 1,
                    is_running: true,
                    exit_code: None,
                    stop_signal: None,
                    host: "h".to_string(),
                    api_prefix: "/api/proc".to_string(),
                },
            );
        assert_eq!(pm.vacant_name("worker").unwrap(), "worker-1");
    }

    #[test]
    fn binding_worker_registry_twice_fails() {
        let pm = ProcessManager::new(ctor);
        let registry = Arc::new(WorkerRegistry::new());
        pm.bind_worker_registry(registry.clone()).unwrap();
        assert!(matches!(
            pm.bind_worker_registry(registry),
            Err(ServerError::RepeatedBinding)
        ));
    }
}
