// SPDX-License-Identifier:

use anyhow::Result;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing_subscriber::EnvFilter;

mod client;

#[derive(Debug, Deserialize)]
struct TerminalConfig {
    #[serde(rename = "service-url")]
    service_url: String,
    #[serde(rename = "terminal-id")]
    terminal_id: String,
    #[serde(rename = "api-key")]
    api_key: String,
    #[serde(rename = "state-dir", default = "default_state_dir")]
    state_dir: String,
}

fn default_state_dir() -> String {
    "terminal-state".to_string()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load config
    let cfg_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "terminal-configs.json".to_string());
    let cfg_str = fs::read_to_string(&cfg_path)?;
    let cfg: TerminalConfig = serde_json::from_str(&cfg_str)?;

    let mut terminal = client::TerminalClient::new(
        &cfg.terminal_id,
        &cfg.api_key,
        &cfg.service_url,
        Path::new(&cfg.state_dir),
    )?;

    // Register with the service (only needed once per identity)
    if !terminal.is_registered() {
        terminal.register()?;
        println!("terminal {} registered", cfg.terminal_id);
    }

    // Request an IPEK; the service manages KSN advancement
    let result = terminal.request_key()?;
    println!("IPEK: {}", result.ipek_hex);
    println!("KSN: {}", result.ksn);
    println!("KCV: {}", result.kcv);
    println!("request_id: {}", result.request_id);

    Ok(())
}
