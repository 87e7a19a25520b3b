//! `agentry serve` — Start the HTTP API server.

use agentry_config::AppConfig;

pub async fn run(port_override: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    println!("Agentry Gateway");
    println!("   Listening: {}:{}", config.gateway.host, config.gateway.port);
    println!("   Store:     {:?}", config.store.backend);
    if config.gateway.first_token_timeout_secs > 0 {
        println!("   First-token timeout: {}s", config.gateway.first_token_timeout_secs);
    }

    agentry_gateway::start(config).await?;

    Ok(())
}
