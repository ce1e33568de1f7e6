use anyhow::Result;

use fleet::config::FleetToml;

pub fn cmd_config_show(settings: &FleetToml) -> Result<()> {
    print!("{}", settings.to_toml_string()?);
    Ok(())
}
