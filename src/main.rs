use qmesh::{Config, Node};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (config, loaded_path) = match Config::load() {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            std::process::exit(1);
        }
    };
    match &loaded_path {
        Some(path) => info!(path = %path.display(), "Loaded configuration"),
        None => info!("No config file found, using defaults"),
    }

    let node = match Node::new(config) {
        Ok(node) => node,
        Err(e) => {
            eprintln!("Error creating node: {}", e);
            std::process::exit(1);
        }
    };

    info!(node_id = %node.local_id(), "Identity initialized");

    if let Err(e) = node.start().await {
        eprintln!("Error starting node: {}", e);
        std::process::exit(1);
    }

    if let Some(addr) = node.local_addr() {
        info!(addr = %addr, "Listening");
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => info!(error = %e, "Signal handler failed, shutting down"),
    }

    node.stop().await;
}
