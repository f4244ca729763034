//! Bastion Server Binary
//!
//! Command-line interface for running an authority, bank or database server.
//!
//! ## Usage
//!
//! ```bash
//! bastion-server --role authority --port 7400
//! bastion-server --role database --port 7402 \
//!     --authority 127.0.0.1:7400 --authority-key authority/identity/public.pem
//! ```

use bastion_server::{BastionServer, ServerConfig, ServiceRole};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Bastion Server - ticket authority and resource servers
#[derive(Parser, Debug)]
#[command(name = "bastion-server")]
#[command(version = "0.1.0")]
#[command(about = "Bastion secure-session authority and resource servers", long_about = None)]
struct Args {
    /// Role: authority, bank or database
    #[arg(short = 'r', long, default_value = "authority")]
    role: ServiceRole,

    /// Principal name (defaults to the role)
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Bind address
    #[arg(short = 'a', long, default_value = "0.0.0.0")]
    address: String,

    /// Bind port
    #[arg(short = 'p', long, default_value_t = 7400)]
    port: u16,

    /// Data directory for identity and key material
    #[arg(short = 'd', long, default_value = "bastion-data")]
    data_dir: PathBuf,

    /// Authority address (resource roles)
    #[arg(long)]
    authority: Option<String>,

    /// Authority public key PEM (resource roles)
    #[arg(long)]
    authority_key: Option<PathBuf>,

    /// Maximum concurrent connections
    #[arg(short = 'm', long, default_value_t = 256)]
    max_connections: usize,

    /// Configuration file path
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Generate sample configuration file
    #[arg(long)]
    generate_config: Option<PathBuf>,
}

impl Args {
    fn to_config(&self) -> Result<ServerConfig, bastion_server::ConfigError> {
        let mut builder = ServerConfig::builder()
            .role(self.role)
            .bind_address(&self.address)
            .bind_port(self.port)
            .data_dir(&self.data_dir)
            .max_connections(self.max_connections)
            .log_level(&self.log_level);
        if let Some(name) = &self.name {
            builder = builder.name(name);
        }
        if let (Some(address), Some(key)) = (&self.authority, &self.authority_key) {
            builder = builder.authority(address, key);
        }
        builder.build()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    // Handle generate-config option
    if let Some(path) = &args.generate_config {
        let config = ServerConfig::default();
        config.save_to_file(path)?;
        println!("Generated sample configuration at: {}", path.display());
        return Ok(());
    }

    // Load or build configuration
    let config = if let Some(config_path) = &args.config {
        info!("Loading configuration from: {}", config_path.display());
        ServerConfig::load_from_file(config_path)?
    } else {
        args.to_config()?
    };

    info!("Configuration:");
    info!("  Role: {} ({})", config.role, config.name);
    info!("  Bind: {}:{}", config.bind_address, config.bind_port);
    info!("  Data dir: {}", config.data_dir.display());
    if let Some(authority) = &config.authority_address {
        info!("  Authority: {}", authority);
    }

    // Create and start server
    let server = Arc::new(BastionServer::build(config).await?);

    // Handle Ctrl+C
    let handle = Arc::clone(&server);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
        handle.stop();
    });

    // Run the server
    match server.start().await {
        Ok(()) => {
            info!("Server stopped gracefully");
            Ok(())
        }
        Err(e) => {
            error!("Server error: {}", e);
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parsing() {
        let args = Args::parse_from(["bastion-server", "--port", "8080"]);
        assert_eq!(args.port, 8080);
        assert_eq!(args.role, ServiceRole::Authority);
    }

    #[test]
    fn test_resource_args_to_config() {
        let args = Args::parse_from([
            "bastion-server",
            "--role",
            "database",
            "--authority",
            "127.0.0.1:7400",
            "--authority-key",
            "authority.pem",
        ]);
        let config = args.to_config().unwrap();
        assert_eq!(config.name, "database");
        assert_eq!(config.authority_address.as_deref(), Some("127.0.0.1:7400"));
    }

    #[test]
    fn test_resource_args_need_authority() {
        let args = Args::parse_from(["bastion-server", "--role", "bank"]);
        assert!(args.to_config().is_err());
    }
}
