use anyhow::Result;
use std::path::PathBuf;

use fleet::config::FleetToml;
use fleet::hub::server::{ServerConfig, open_database, start_server};

/// Start the hub. CLI flags win over `FLEET_*` variables and fleet.toml.
pub async fn cmd_serve(
    settings: &FleetToml,
    port: Option<u16>,
    host: Option<String>,
    db_path: Option<PathBuf>,
    dev: bool,
) -> Result<()> {
    let mut server = ServerConfig::from_toml(settings);
    if let Some(port) = port {
        server.port = port;
    }
    if let Some(host) = host {
        server.host = host;
    }
    if let Some(db_path) = db_path {
        server.db_path = db_path;
    }
    server.dev_mode |= dev;

    start_server(server, settings).await
}

pub fn cmd_init_db(settings: &FleetToml, db_path: Option<PathBuf>) -> Result<()> {
    let path = db_path.unwrap_or_else(|| settings.db_path());
    open_database(&path)?;
    println!("Fleet database initialized at {}", path.display());
    Ok(())
}
