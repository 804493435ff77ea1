//! The REST view over the process tree (`/api/proc[/{procID}]`) and the
//! post-fork reconfiguration handshake.
//!
//! Grounded in `examples/original_source/server-cpp/src/resources/
//! processes.cc`'s `ProcessResource::get_`/`post_`/`child_url` and
//! `include/.../resources/resource.hh`'s `SpawnRequestDetails`.

use std::net::TcpStream;
use std::sync::{Arc, Mutex};

use log::info;
use serde_json::{json, Map, Value};

use crate::http::{Headers, HttpStatus, Method, RequestMsg, ResponseMsg};
use crate::payload::{JsonCodec, PayloadCodec, PayloadValue};
use crate::process::{build_uri, ChildProcess, ForkOutcome, ProcessManager};
use crate::resource::{extract_body, RestResource};
use crate::route::{Route, RouteInfo, UrlParams};
use crate::server::{Endpoint, HandleFlags, Server};
use crate::uri::Uri;

/// The parts of the request that triggered a spawn, captured for the
/// child to read after `fork()`. `RequestMsg` itself isn't `Clone`
/// (its content is a trait object), so this carries exactly what a
/// child needs to reconfigure itself rather than the original message.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: Method,
    pub raw_target: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub client_ip: String,
}

/// Written by the spawning endpoint exactly once, in the child, before
/// it sets `STOP_SERVER`; read by the driver after `run()` returns and
/// then cleared. The parent's slot is always empty.
#[derive(Debug, Clone)]
pub struct SpawnRequestDetails {
    pub request: CapturedRequest,
    pub parsed_body: PayloadValue,
    pub url_params: UrlParams,
    pub subprocess_name: String,
    pub subprocess_url: Uri,
}

pub type SpawnSlot = Arc<Mutex<Option<SpawnRequestDetails>>>;
pub type NewServerSlot = Arc<Mutex<Option<Server>>>;

pub struct ProcessResource {
    process_manager: Arc<ProcessManager>,
    forwarding_route: Option<Arc<dyn Route>>,
    default_api_prefix: String,
    own_host: String,
    own_port: u16,
    spawn_slot: SpawnSlot,
    new_server_slot: NewServerSlot,
}

impl ProcessResource {
    pub fn new(
        process_manager: Arc<ProcessManager>,
        forwarding_route: Option<Arc<dyn Route>>,
        default_api_prefix: impl Into<String>,
        own_host: impl Into<String>,
        own_port: u16,
        spawn_slot: SpawnSlot,
        new_server_slot: NewServerSlot,
    ) -> Self {
        Self {
            process_manager,
            forwarding_route,
            default_api_prefix: default_api_prefix.into(),
            own_host: own_host.into(),
            own_port,
            spawn_slot,
            new_server_slot,
        }
    }

    /// `_link` for a child: routed through the parent's forwarding route
    /// when one is configured (so clients keep hitting the parent),
    /// otherwise the child's own host/port and API prefix.
    fn child_url(&self, name: &str, child: &ChildProcess) -> Uri {
        match &self.forwarding_route {
            Some(route) => {
                let mut params = UrlParams::new();
                params.insert("procID".to_string(), name.to_string());
                params.insert("remainder".to_string(), "/".to_string());
                match route.path_for(&params) {
                    Ok(path) => build_uri(&self.own_host, self.own_port, &path),
                    Err(_) => build_uri(&child.host, child.port, &child.api_prefix),
                }
            }
            None => build_uri(&child.host, child.port, &child.api_prefix),
        }
    }

    fn child_details_json(&self, name: &str, child: &ChildProcess) -> Value {
        let mut obj = Map::new();
        obj.insert("port".to_string(), json!(child.port));
        obj.insert("isRunning".to_string(), json!(child.is_running));
        obj.insert("host".to_string(), json!(child.host));
        obj.insert("procAPIPrefix".to_string(), json!(child.api_prefix));
        if child.is_running {
            obj.insert("_link".to_string(), json!(self.child_url(name, child).to_string()));
        } else if let Some(sig) = child.stop_signal {
            obj.insert("stopSignal".to_string(), json!(sig));
        } else if let Some(code) = child.exit_code {
            obj.insert("exitCode".to_string(), json!(code));
        }
        Value::Object(obj)
    }
}

impl RestResource for ProcessResource {
    fn get(
        &self,
        _request: &RequestMsg,
        params: &UrlParams,
        _value: &PayloadValue,
        response: &mut ResponseMsg,
        _flags: &mut HandleFlags,
    ) -> Option<Value> {
        Some(match params.get("procID").filter(|s| !s.is_empty()) {
            Some(proc_id) => {
                self.process_manager.refresh(proc_id);
                match self.process_manager.lookup(proc_id) {
                    Some(child) => self.child_details_json(proc_id, &child),
                    None => {
                        response.status = HttpStatus::NotFound;
                        json!({ "errors": ["No such child process."] })
                    }
                }
            }
            None => {
                self.process_manager.refresh_all();
                let snapshot = self.process_manager.snapshot();
                let children: Map<String, Value> = snapshot
                    .iter()
                    .map(|(name, child)| (name.clone(), self.child_details_json(name, child)))
                    .collect();
                json!({
                    "version": env!("CARGO_PKG_VERSION"),
                    "children": children,
                })
            }
        })
    }

    fn post(
        &self,
        request: &RequestMsg,
        params: &UrlParams,
        value: &Value,
        response: &mut ResponseMsg,
        flags: &mut HandleFlags,
    ) -> Option<Value> {
        let base_name = value
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("worker")
            .to_string();
        let api_prefix = value
            .get("procAPIPrefix")
            .and_then(Value::as_str)
            .unwrap_or(&self.default_api_prefix)
            .to_string();

        let name = match self.process_manager.vacant_name(&base_name) {
            Ok(n) => n,
            Err(e) => {
                response.status = HttpStatus::from(&e);
                return Some(json!({ "errors": [e.to_string()] }));
            }
        };

        Some(match self
            .process_manager
            .fork_server(&name, &self.own_host, 0, &api_prefix)
        {
            Ok(ForkOutcome::Parent) => {
                let child = self
                    .process_manager
                    .lookup(&name)
                    .expect("fork_server just inserted this child");
                response.status = HttpStatus::Created;
                response
                    .headers
                    .set("location", self.child_url(&name, &child).to_string());
                Value::Null
            }
            Ok(ForkOutcome::Child(new_server)) => {
                info!("child \"{name}\" forked, reconfiguring routes for spawning request");
                let subprocess_url = build_uri(&self.own_host, new_server.port(), &api_prefix);
                let captured = CapturedRequest {
                    method: request.method,
                    raw_target: request.raw_target.clone(),
                    headers: request.headers.clone(),
                    body: extract_body(request),
                    client_ip: request.client_ip.clone(),
                };
                *self.spawn_slot.lock().unwrap() = Some(SpawnRequestDetails {
                    request: captured,
                    parsed_body: value.clone(),
                    url_params: params.clone(),
                    subprocess_name: name,
                    subprocess_url,
                });
                *self.new_server_slot.lock().unwrap() = Some(*new_server);
                *flags = HandleFlags::STOP_SERVER | HandleFlags::NO_DISPATCH_RESPONSE;
                Value::Null
            }
            Err(e) => {
                response.status = HttpStatus::from(&e);
                json!({ "errors": [e.to_string()] })
            }
        })
    }

    fn delete(
        &self,
        _request: &RequestMsg,
        _params: &UrlParams,
        _value: &PayloadValue,
        response: &mut ResponseMsg,
        _flags: &mut HandleFlags,
    ) -> Option<Value> {
        response.status = HttpStatus::NotImplemented;
        Some(json!({ "errors": ["Not Implemented"] }))
    }
}

/// `GET /api/routes` debug endpoint, listing every registered route's
/// name, kind, source pattern, reverse template, and capture groups.
pub struct RoutesView {
    routes: Arc<Vec<RouteInfo>>,
}

impl RoutesView {
    pub fn new(routes: Arc<Vec<RouteInfo>>) -> Self {
        Self { routes }
    }
}

impl Endpoint for RoutesView {
    fn handle(
        &self,
        request: &RequestMsg,
        _client: &TcpStream,
        _params: &UrlParams,
    ) -> (HandleFlags, Option<ResponseMsg>) {
        if request.method != Method::Get {
            let mut response = ResponseMsg::new(HttpStatus::MethodNotAllowed);
            JsonCodec.set_response_content(&mut response, &JsonCodec.method_not_allowed());
            return (HandleFlags::empty(), Some(response));
        }

        let routes: Vec<Value> = self
            .routes
            .iter()
            .map(|r| {
                let mut obj = Map::new();
                obj.insert("name".to_string(), json!(r.name));
                obj.insert("kind".to_string(), json!(r.kind));
                if let Some(pattern) = &r.pattern {
                    obj.insert("pathPattern".to_string(), json!(pattern));
                }
                if let Some(template) = &r.reverse_template {
                    obj.insert("pathTemplate".to_string(), json!(template));
                }
                if !r.groups.is_empty() {
                    let groups: Vec<Value> = r
                        .groups
                        .iter()
                        .map(|(index, name)| json!([index, name]))
                        .collect();
                    obj.insert("groups".to_string(), Value::Array(groups));
                }
                Value::Object(obj)
            })
            .collect();

        let mut response = ResponseMsg::new(HttpStatus::Ok);
        JsonCodec.set_response_content(&mut response, &json!({ "routes": routes }));
        (HandleFlags::empty(), Some(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpVersion;
    use crate::resource::ResourceEndpoint;
    use crate::route::RegexRoute;
    use crate::server::ServerConfig;
    use crate::uri::Uri as UriParser;

    fn ctor(_host: &str, port: u16) -> crate::error::ServerResult<Server> {
        Server::bind(ServerConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..Default::default()
        })
    }

    fn dummy_request(method: Method, target: &str, body: &[u8]) -> RequestMsg {
        let mut req = RequestMsg::new(method, target, HttpVersion::Http11).unwrap();
        if !body.is_empty() {
            req.content = Some(Box::new(crate::http::InMemoryContent::from_bytes(body.to_vec())));
            req.headers.set("content-length", body.len().to_string());
        }
        req
    }

    fn resource() -> (ResourceEndpoint<ProcessResource, JsonCodec>, TcpStream) {
        let pm = Arc::new(ProcessManager::new(ctor));
        let fwd_route: Arc<dyn Route> = Arc::new(
            RegexRoute::new(
                "proc-fwd",
                r"^/api/proc/([A-Za-z0-9_\-]+)(/.+)$",
                vec![(1, "procID"), (2, "remainder")],
                "/api/proc/{procID}{remainder}",
            )
            .unwrap(),
        );
        let resource = ProcessResource::new(
            pm,
            Some(fwd_route),
            "/api/proc",
            "127.0.0.1",
            5657,
            Arc::new(Mutex::new(None)),
            Arc::new(Mutex::new(None)),
        );
        let endpoint = ResourceEndpoint::new(resource, JsonCodec);
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        (endpoint, client)
    }

    #[test]
    fn get_without_proc_id_lists_empty_tree() {
        let (resource, client) = resource();
        let req = dummy_request(Method::Get, "/api/proc", b"");
        let (_, response) = resource.handle(&req, &client, &UrlParams::new());
        assert_eq!(response.unwrap().status.code(), 200);
    }

    #[test]
    fn get_missing_child_is_404() {
        let (resource, client) = resource();
        let req = dummy_request(Method::Get, "/api/proc/nope", b"");
        let mut params = UrlParams::new();
        params.insert("procID".to_string(), "nope".to_string());
        let (_, response) = resource.handle(&req, &client, &params);
        assert_eq!(response.unwrap().status.code(), 404);
    }

    #[test]
    fn delete_is_not_implemented() {
        let (resource, client) = resource();
        let req = dummy_request(Method::Delete, "/api/proc/w", b"");
        let (_, response) = resource.handle(&req, &client, &UrlParams::new());
        assert_eq!(response.unwrap().status.code(), 501);
    }

    #[test]
    fn routes_view_lists_registered_routes() {
        let route = RegexRoute::new(
            "proc",
            r"^/api/proc(?:/([A-Za-z0-9_\-]+))?$",
            vec![(1, "procID")],
            "/api/proc/{procID}",
        )
        .unwrap();
        let infos = vec![RouteInfo::regex("proc", &route)];
        let view = RoutesView::new(Arc::new(infos));

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let req = dummy_request(Method::Get, "/api/routes", b"");
        let (_, response) = view.handle(&req, &client, &UrlParams::new());
        assert_eq!(response.unwrap().status.code(), 200);

        let _ = UriParser::parse("/api/routes");
    }
}
