use anyhow::{Result, bail};
use std::path::PathBuf;

use fleet::config::FleetToml;
use fleet::hub::server::open_database;

/// Create a hub user. The API token is printed once; it is the bearer
/// credential for every `/api` call.
pub fn cmd_user_add(
    settings: &FleetToml,
    email: &str,
    name: Option<&str>,
    db_path: Option<PathBuf>,
) -> Result<()> {
    let email = email.trim();
    if email.is_empty() || !email.contains('@') {
        bail!("Invalid email address: '{}'", email);
    }

    let path = db_path.unwrap_or_else(|| settings.db_path());
    let db = open_database(&path)?;
    if db.get_user_by_email(email)?.is_some() {
        bail!("A user with email '{}' already exists", email);
    }

    let user = db.create_user(email, name)?;
    tracing::info!(user_id = %user.id, "user created");
    println!("Created user {} ({})", user.email, user.id);
    println!("API token: {}", user.api_token);
    Ok(())
}
