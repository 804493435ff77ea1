//! # forkhttpd
//!
//! A synchronous, blocking HTTP/1.1 server whose purpose is to host a
//! tree of computation processes: the root process accepts REST requests
//! that instruct it to fork a child worker bound to its own port, and
//! the root can act as a reverse proxy for requests addressed to a
//! named child.
//!
//! This is not a general-purpose web server — no event loop, no
//! keep-alive, no TLS. One request is received, routed, and dispatched
//! at a time per server.
//!
//! ```no_run
//! use forkhttpd::route::StringRoute;
//! use forkhttpd::server::{Endpoint, HandleFlags, Server, ServerConfig};
//! use forkhttpd::http::{HttpStatus, ResponseMsg};
//!
//! struct Ping;
//!
//! impl Endpoint for Ping {
//!     fn handle(
//!         &self,
//!         _request: &forkhttpd::http::RequestMsg,
//!         _client: &std::net::TcpStream,
//!         _params: &forkhttpd::route::UrlParams,
//!     ) -> (HandleFlags, Option<ResponseMsg>) {
//!         (HandleFlags::empty(), Some(ResponseMsg::new(HttpStatus::Ok)))
//!     }
//! }
//!
//! let mut server = Server::bind(ServerConfig { port: 0, ..Default::default() }).unwrap();
//! server.add_route(Box::new(StringRoute::new("ping", "/ping")), Box::new(Ping));
//! // server.run().unwrap();
//! ```

pub mod config;
pub mod error;
pub mod http;
pub mod payload;
pub mod process;
pub mod process_resource;
pub mod resource;
pub mod route;
pub mod server;
pub mod uri;
