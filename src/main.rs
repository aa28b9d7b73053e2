use clap::{Parser, Subcommand};
use multigate::config::GatewayConfig;
use std::path::Path;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// multigate: single-port gateway for locally supervised services
#[derive(Parser)]
#[command(name = "multigate", version, about)]
struct Cli {
    /// Path to configuration file (.hcl)
    #[arg(short, long, default_value = "gateway.hcl")]
    config: String,

    /// Override the preferred listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file without starting the gateway
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long, default_value = "gateway.hcl")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Handle validate subcommand
    if let Some(Commands::Validate { config: config_path }) = &cli.command {
        return validate_config(config_path).await;
    }

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    tracing::info!("multigate v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration; routing is never guessed, so a missing file is fatal
    let config = match load_config(&cli).await {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(config = cli.config, error = %e, "Cannot load configuration");
            return ExitCode::FAILURE;
        }
    };

    let gateway = match multigate::Gateway::new(config) {
        Ok(gateway) => gateway,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    match gateway.start().await {
        Ok(addr) => {
            tracing::info!(port = addr.port(), "Gateway ready, press Ctrl+C to stop");
        }
        Err(e) => {
            tracing::error!(error = %e, "Gateway failed to start");
            gateway.shutdown().await;
            return ExitCode::FAILURE;
        }
    }

    // Wait for shutdown signal
    gateway.wait_for_shutdown().await;

    ExitCode::SUCCESS
}

async fn load_config(cli: &Cli) -> multigate::Result<GatewayConfig> {
    if !Path::new(&cli.config).exists() {
        return Err(multigate::GatewayError::Config(format!(
            "Config file not found: {}",
            cli.config
        )));
    }

    tracing::info!(config = cli.config, "Loading configuration");
    let mut config = GatewayConfig::from_file(&cli.config).await?;
    config.apply_env()?;

    // Override listen port if provided
    if let Some(port) = cli.port {
        config.listen.port = port;
    }

    Ok(config)
}

/// Validate a configuration file and print diagnostics
async fn validate_config(path: &str) -> ExitCode {
    if !Path::new(path).exists() {
        eprintln!("✗ Config file not found: {}", path);
        return ExitCode::FAILURE;
    }

    // Parse
    let mut config = match GatewayConfig::from_file(path).await {
        Ok(c) => {
            println!("✓ Config parsed successfully ({})", path);
            c
        }
        Err(e) => {
            eprintln!("✗ Parse error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = config.apply_env() {
        eprintln!("✗ Environment override error: {}", e);
        return ExitCode::FAILURE;
    }

    // Validate
    if let Err(e) = config.validate() {
        eprintln!("✗ Validation error: {}", e);
        return ExitCode::FAILURE;
    }

    // Print summary
    println!("✓ Configuration is valid");
    println!();
    println!(
        "  Listen:    {}:{} (up to {} fallback ports)",
        config.listen.host, config.listen.port, config.listen.max_port_retries
    );
    println!("  Hub:       {} (tick every {}s)", config.hub.path, config.hub.tick_interval_secs);
    println!(
        "  Database:  {}",
        if config.hub.database_url.is_some() {
            "configured"
        } else {
            "not configured"
        }
    );
    println!("  Services:  {}", config.services.len());
    for (name, svc) in &config.services {
        let launch = match &svc.command {
            Some(cmd) if svc.autostart => format!("autostart: {}", cmd),
            Some(cmd) => format!("manual: {}", cmd),
            None => "external".to_string(),
        };
        println!(
            "    - {} {} → {}:{} (rewrite: {}, {})",
            name, svc.path_prefix, svc.upstream_host, svc.upstream_port, svc.rewrite, launch
        );
    }

    ExitCode::SUCCESS
}
