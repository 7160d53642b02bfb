//! `vmux pair`, `vmux auth ...`, and `vmux relay`.

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};

use vmux_sync::VmuxConfig;
use vmux_sync::auth::CredentialStore;
use vmux_sync::config::RelayConfig;

use super::{explain, relay_api};

fn relay(config: &VmuxConfig) -> Result<RelayConfig> {
    Ok(RelayConfig::from_file(&config.file_config()?.relay))
}

pub async fn pair_command(config: &VmuxConfig, code: &str, name: &str) -> Result<()> {
    let relay = relay(config)?;
    let api = relay_api(config, &relay)?;
    let creds = api
        .pair(code, name)
        .await
        .map_err(|e| explain(e, &relay.base_url))?;
    eprintln!(
        "Paired with {} as {} ({})",
        relay.base_url,
        creds.device_name.as_deref().unwrap_or(name),
        creds.device_id.as_deref().unwrap_or("unknown id")
    );
    Ok(())
}

pub async fn status_command(config: &VmuxConfig) -> Result<()> {
    let relay = relay(config)?;
    let api = relay_api(config, &relay)?;
    let stored = CredentialStore::new(config.credentials_path()).load()?;

    eprintln!("Relay: {}", relay.base_url);
    match &stored {
        Some(c) => eprintln!(
            "  stored device: {} ({})",
            c.device_name.as_deref().unwrap_or("unnamed"),
            c.device_id.as_deref().unwrap_or("unknown id")
        ),
        None => eprintln!("  stored device: none"),
    }

    let status = api
        .auth_status()
        .await
        .map_err(|e| explain(e, &relay.base_url))?;
    if !status.auth_enabled {
        eprintln!("  auth:          disabled on relay");
    } else if status.authenticated {
        eprintln!(
            "  auth:          authenticated as {}",
            status
                .device_name
                .or(status.device_id)
                .unwrap_or_else(|| "this device".to_string())
        );
    } else {
        eprintln!("  auth:          not authenticated (run `vmux pair <CODE>`)");
    }
    Ok(())
}

pub async fn devices_command(config: &VmuxConfig) -> Result<()> {
    let relay = relay(config)?;
    let api = relay_api(config, &relay)?;
    let devices = api
        .list_devices()
        .await
        .map_err(|e| explain(e, &relay.base_url))?;

    if devices.is_empty() {
        println!("No paired devices.");
    }
    for d in &devices {
        let paired = d
            .paired_at
            .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single())
            .map(|t| t.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:<36} {:<20} paired {}", d.device_id, d.device_name, paired);
    }
    Ok(())
}

pub async fn revoke_command(config: &VmuxConfig, device_id: &str) -> Result<()> {
    let relay = relay(config)?;
    let api = relay_api(config, &relay)?;
    api.revoke_device(device_id)
        .await
        .map_err(|e| explain(e, &relay.base_url))?;
    eprintln!("Revoked {}", device_id);
    Ok(())
}

/// Write `[relay] url` into config.toml, keeping everything else.
pub fn set_relay_url(config: &VmuxConfig, url: &str) -> Result<()> {
    let path = config.config_toml_path();

    let mut doc = if path.exists() {
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        contents
            .parse::<toml::Table>()
            .with_context(|| format!("Failed to parse {}", path.display()))?
    } else {
        toml::Table::new()
    };

    let relay_table = doc
        .entry("relay")
        .or_insert_with(|| toml::Value::Table(toml::Table::new()))
        .as_table_mut()
        .context("[relay] in config.toml is not a table")?;

    relay_table.insert("url".to_string(), toml::Value::String(url.to_string()));

    let serialized = toml::to_string_pretty(&doc).context("Failed to serialize config.toml")?;
    std::fs::write(&path, serialized)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    eprintln!("Relay set to {} in {}", url, path.display());
    Ok(())
}
