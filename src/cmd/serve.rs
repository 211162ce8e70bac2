//! HTTP server command: `recyconnect serve`.

use anyhow::Result;

use recyconnect::config::AppConfig;
use recyconnect::market::server::start_server;

/// CLI overrides for the `[server]` section.
pub struct ServeOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub db_path: Option<std::path::PathBuf>,
    pub dev: bool,
}

pub async fn cmd_serve(config: &AppConfig, overrides: ServeOverrides) -> Result<()> {
    let mut server = config.server_config();
    if let Some(host) = overrides.host {
        server.host = host;
    }
    if let Some(port) = overrides.port {
        server.port = port;
    }
    if let Some(db_path) = overrides.db_path {
        server.db_path = db_path;
    }
    server.dev_mode |= overrides.dev;

    for problem in config.validate() {
        tracing::warn!(%problem, "configuration problem");
    }

    start_server(server).await
}
