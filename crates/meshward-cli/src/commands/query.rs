//! `meshward clients|stats|health|metrics`: read-only server queries.

use anyhow::Result;
use meshward_core::ClientConfig;
use meshward_heal::ServerClient;

use super::REQUEST_TIMEOUT;

/// Fetch an enveloped endpoint and pretty-print its `data`.
pub async fn print_json(config: &ClientConfig, path: &str) -> Result<()> {
    let client = ServerClient::new(&config.server_base, REQUEST_TIMEOUT)?;
    let data: serde_json::Value = client.get_json(path).await?;
    println!("{}", serde_json::to_string_pretty(&data)?);
    Ok(())
}

pub async fn print_metrics(config: &ClientConfig) -> Result<()> {
    let client = ServerClient::new(&config.server_base, REQUEST_TIMEOUT)?;
    print!("{}", client.get_text("/metrics").await?);
    Ok(())
}
