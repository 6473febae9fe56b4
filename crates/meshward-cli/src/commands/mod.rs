pub mod control;
pub mod heal;
pub mod query;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use meshward_core::{ClientConfig, ConfigHandle, ensure_valid};

/// Timeout for one request to the server.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Read the client configuration, falling back to defaults when the file
/// does not exist. The `--server` override is kept on the handle and
/// survives reloads of the file.
pub fn load_config(path: &Path, server: Option<&str>) -> Result<ConfigHandle<ClientConfig>> {
    let file = if path.is_file() {
        ClientConfig::from_file(path)?
    } else {
        ClientConfig::default()
    };
    let server = server.map(|s| s.trim_end_matches('/').to_string());
    let config = ConfigHandle::with_overrides(file, move |config: &mut ClientConfig| {
        if let Some(server) = &server {
            config.server_base = server.clone();
        }
    });
    ensure_valid(config.current().validate())
        .with_context(|| format!("invalid client configuration in {}", path.display()))?;
    Ok(config)
}
