//! Configuration loading for the HTSP client.
//!
//! Settings come from `htsp-client.ini` in the working directory if present,
//! otherwise from `HTSP_CLIENT_*` environment variables, otherwise defaults.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, error, info};

use crate::client::ConnectionConfig;

/// Name of the INI file looked up in the working directory.
pub const INI_FILE_NAME: &str = "htsp-client.ini";

const ENV_PREFIX: &str = "HTSP_CLIENT_";

/// Load configuration.
///
/// Searches in the following order:
/// 1. `htsp-client.ini` in the current directory
/// 2. Environment variables (`HTSP_CLIENT_*`)
/// 3. Default values
pub fn load_config() -> ConnectionConfig {
    if let Some(ini_path) = find_ini_file() {
        info!("Loading configuration from {:?}", ini_path);
        if let Some(config) = load_from_ini(&ini_path) {
            return config;
        }
    }

    load_from_env()
}

fn find_ini_file() -> Option<PathBuf> {
    let ini_path = std::env::current_dir().ok()?.join(INI_FILE_NAME);
    ini_path.exists().then_some(ini_path)
}

/// Simple INI section parser.
fn parse_ini(content: &str) -> HashMap<String, HashMap<String, String>> {
    let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut current_section = String::new();

    for line in content.lines() {
        let line = line.trim();

        // Skip empty lines and comments
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            current_section = name.trim().to_string();
            sections.entry(current_section.clone()).or_default();
            continue;
        }

        if let Some((key, value)) = line.split_once('=') {
            sections
                .entry(current_section.clone())
                .or_default()
                .insert(key.trim().to_string(), value.trim().to_string());
        }
    }

    sections
}

/// Build a configuration from key lookups, falling back to defaults for
/// anything absent or unparsable.
fn build_config<F>(get: F) -> ConnectionConfig
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = ConnectionConfig::default();
    let millis = |key: &str, default: Duration| {
        get(key)
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(default)
    };

    ConnectionConfig {
        host: get("Host").unwrap_or(defaults.host),
        htsp_port: get("HtspPort")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.htsp_port),
        http_port: get("HttpPort")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.http_port),
        username: get("Username").unwrap_or_default(),
        password: get("Password").unwrap_or_default(),
        client_name: get("ClientName").unwrap_or(defaults.client_name),
        connect_timeout: millis("ConnectTimeout", defaults.connect_timeout),
        response_timeout: millis("ResponseTimeout", defaults.response_timeout),
    }
}

/// Load configuration from the `[Server]` section of an INI file.
pub fn load_from_ini(path: &Path) -> Option<ConnectionConfig> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to read INI file: {}", e);
            return None;
        }
    };

    let sections = parse_ini(&content);
    let section = sections.get("Server")?;
    let config = build_config(|key| section.get(key).cloned());

    debug!(
        "Configuration loaded: server={}, user='{}'",
        config.server_addr(),
        config.username
    );
    Some(config)
}

/// Environment variable holding `key`, e.g. `HtspPort` -> `HTSP_CLIENT_HTSP_PORT`.
fn env_var_name(key: &str) -> String {
    let mut name = ENV_PREFIX.to_string();
    for (i, c) in key.chars().enumerate() {
        if c.is_ascii_uppercase() && i > 0 {
            name.push('_');
        }
        name.push(c.to_ascii_uppercase());
    }
    name
}

fn load_from_env() -> ConnectionConfig {
    let config = build_config(|key| std::env::var(env_var_name(key)).ok());
    debug!(
        "Using environment/default config: server={}",
        config.server_addr()
    );
    config
}
