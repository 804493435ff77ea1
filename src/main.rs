//! Driver binary: wires configuration, logging, the root server, and
//! the stop-and-swap fork/reconfigure loop described in spec.md §9 —
//! after a spawning request forks, `run()` returns, the driver checks
//! whether a new server was produced and, if so, swaps it in and
//! rebuilds routes for the child before calling `run()` again.

use std::sync::{Arc, Mutex};

use clap::Parser;
use log::info;

use forkhttpd::config::AppConfig;
use forkhttpd::error::ServerResult;
use forkhttpd::payload::JsonCodec;
use forkhttpd::process::{ForwardingEndpoint, ProcessManager, WorkerRegistry};
use forkhttpd::process_resource::{NewServerSlot, ProcessResource, RoutesView, SpawnSlot};
use forkhttpd::resource::ResourceEndpoint;
use forkhttpd::route::{RegexRoute, Route, RouteInfo, StringRoute};
use forkhttpd::server::{Server, ServerConfig};

const PROC_PATTERN: &str = r"^/api/proc(?:/([A-Za-z0-9_\-]+))?$";
const PROC_FWD_PATTERN: &str = r"^/api/proc/([A-Za-z0-9_\-]+)(/.+)$";

fn main() {
    let config = AppConfig::parse();

    let log_env = env_logger::Env::default().default_filter_or(config.log_level.clone());
    env_logger::init_from_env(log_env);

    if let Err(e) = run(config) {
        log::error!("fatal startup error: {e}");
        std::process::exit(1);
    }
}

fn run(config: AppConfig) -> ServerResult<()> {
    let worker_registry = Arc::new(WorkerRegistry::new());
    let mut server = Server::bind(config.server_config())?;
    let mut api_prefix = config.url_path_prefix.clone();

    loop {
        let own_host = server.config().host.clone();
        let own_port = server.port();

        let process_manager = Arc::new(ProcessManager::new(move |host: &str, port: u16| {
            Server::bind(ServerConfig {
                host: host.to_string(),
                port,
                ..Default::default()
            })
        }));
        process_manager.bind_worker_registry(worker_registry.clone())?;

        let spawn_slot: SpawnSlot = Arc::new(Mutex::new(None));
        let new_server_slot: NewServerSlot = Arc::new(Mutex::new(None));

        let proc_route = Arc::new(RegexRoute::new(
            "proc",
            PROC_PATTERN,
            vec![(1, "procID")],
            "/api/proc/{procID}",
        )?);
        let proc_fwd_route = Arc::new(RegexRoute::new(
            "proc-fwd",
            PROC_FWD_PATTERN,
            vec![(1, "procID"), (2, "remainder")],
            "/api/proc/{procID}{remainder}",
        )?);

        let route_infos = Arc::new(vec![
            RouteInfo::regex("proc", &proc_route),
            RouteInfo::regex("proc-fwd", &proc_fwd_route),
            RouteInfo::exact("routes", "/api/routes"),
        ]);

        let forwarding_endpoint = ForwardingEndpoint::new(
            process_manager.children_handle(),
            config.forwarding_io_buf_len(),
            config.max_in_mem_content_len,
            worker_registry.clone(),
        );

        let process_resource = ProcessResource::new(
            process_manager.clone(),
            Some(proc_fwd_route.clone() as Arc<dyn Route>),
            api_prefix.clone(),
            own_host.clone(),
            own_port,
            spawn_slot.clone(),
            new_server_slot.clone(),
        );

        server.add_route(
            Box::new(proc_route.clone()),
            Box::new(ResourceEndpoint::new(process_resource, JsonCodec)),
        );
        server.add_route(Box::new(proc_fwd_route.clone()), Box::new(forwarding_endpoint));
        server.add_route(
            Box::new(StringRoute::new("routes", "/api/routes")),
            Box::new(RoutesView::new(route_infos)),
        );

        info!("serving {own_host}:{own_port}{api_prefix}");
        server.run()?;

        let next_server = new_server_slot.lock().unwrap().take();
        match next_server {
            Some(next) => {
                if let Some(details) = spawn_slot.lock().unwrap().take() {
                    api_prefix = details.subprocess_url.path.clone();
                    info!(
                        "reconfiguring as child \"{}\" ({})",
                        details.subprocess_name, details.subprocess_url
                    );
                }
                server = next;
            }
            None => break,
        }
    }

    Ok(())
}
