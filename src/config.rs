//! CLI and server configuration, built with `clap`'s derive API — the
//! teacher crate depends on `clap` but never exercises it; this is the
//! first real use of it.

use clap::Parser;

use crate::server::ServerConfig;

#[derive(Parser, Debug, Clone)]
#[command(name = "forkhttpd", about = "Forking process-tree HTTP server")]
pub struct AppConfig {
    /// Address the root server binds to.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to bind to; 0 lets the OS pick one.
    #[arg(long, default_value_t = 0)]
    pub port: u16,

    /// `env_logger` filter level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Path prefix the process resource is mounted under.
    #[arg(long, default_value = "/api/proc")]
    pub url_path_prefix: String,

    /// `listen(2)` backlog.
    #[arg(long, default_value_t = 128)]
    pub backlog: u32,

    /// Per-connection read/write timeout, in seconds.
    #[arg(long, default_value_t = 15)]
    pub connection_timeout: u64,

    /// Chunk size used for both header accumulation and body streaming.
    #[arg(long, default_value_t = 8192)]
    pub io_buf_size: usize,

    /// Bodies larger than this spill to a temp file instead of memory.
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    pub max_in_mem_content_len: usize,

    /// Disables reverse-proxy forwarding to children (sets fw_io_buf_len
    /// to 0: `/api/proc/{id}/...` answers with a 301 instead of relaying).
    #[arg(long)]
    pub no_forward: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            log_level: "info".to_string(),
            url_path_prefix: "/api/proc".to_string(),
            backlog: 128,
            connection_timeout: 15,
            io_buf_size: 8192,
            max_in_mem_content_len: 10 * 1024 * 1024,
            no_forward: false,
        }
    }
}

impl AppConfig {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            backlog: self.backlog,
            connection_timeout_s: self.connection_timeout,
            io_buf_size: self.io_buf_size,
            max_in_mem_content_len: self.max_in_mem_content_len,
        }
    }

    pub fn forwarding_io_buf_len(&self) -> usize {
        if self.no_forward {
            0
        } else {
            self.io_buf_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_forward_flag_zeroes_forwarding_buffer() {
        let mut cfg = AppConfig::default();
        assert_eq!(cfg.forwarding_io_buf_len(), cfg.io_buf_size);
        cfg.no_forward = true;
        assert_eq!(cfg.forwarding_io_buf_len(), 0);
    }
}
