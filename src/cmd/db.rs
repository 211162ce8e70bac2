//! Database bootstrap command: `recyconnect init-db`.

use anyhow::Result;

use recyconnect::config::AppConfig;
use recyconnect::market::server::open_database;

pub fn cmd_init_db(config: &AppConfig, db_path: Option<std::path::PathBuf>) -> Result<()> {
    let mut server = config.server_config();
    if let Some(path) = db_path {
        server.db_path = path;
    }
    open_database(&server)?;
    println!("Database initialized at {}", server.db_path.display());
    Ok(())
}
