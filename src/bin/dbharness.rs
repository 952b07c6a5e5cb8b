use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use std::path::Path;
use std::sync::Arc;
use tokio::signal;

use dbharness::config::{create_sample_config, load_config, DEFAULT_HARNESS_CONFIG};
use dbharness::settings::ENV_PREFIX;
use dbharness::{ConfigOverlay, Provisioner, Testcontainers};

/// Wait for shutdown signal (CTRL+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received CTRL+C, shutting down...");
        },
        _ = terminate => {
            log::info!("Received SIGTERM, shutting down...");
        },
    }
}

async fn up(matches: &ArgMatches) -> Result<()> {
    let config_path = matches.get_one::<String>("config").map(Path::new);
    let mut config = load_config(config_path)?;
    if let Some(image) = matches.get_one::<String>("image") {
        config.image = image.clone();
        config.validate()?;
    }

    let provisioner = Arc::new(Provisioner::new(Testcontainers, config));
    provisioner
        .start()
        .await
        .context("Failed to provision database")?;

    let mut overlay = ConfigOverlay::new();
    overlay.register_datasource(provisioner.clone());
    let resolved = overlay.resolve()?;

    let format = matches
        .get_one::<String>("format")
        .map(String::as_str)
        .unwrap_or("env");
    match format {
        "toml" => print!("{}", toml::to_string_pretty(&resolved.to_toml())?),
        _ => {
            for (name, value) in resolved.env_vars(ENV_PREFIX) {
                println!("{name}={value}");
            }
        }
    }

    log::info!("Database is up, press Ctrl+C to stop");
    shutdown_signal().await;

    provisioner.stop().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("dbharness")
        .version("0.1.0")
        .about("Ephemeral PostgreSQL for integration tests")
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (error, warn, info, debug, trace)")
                .global(true),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("up")
                .about("Start a database, print its configuration overlay and hold it until interrupted")
                .arg(
                    Arg::new("config")
                        .short('c')
                        .long("config")
                        .value_name("FILE")
                        .help("Harness configuration file path")
                        .default_value(DEFAULT_HARNESS_CONFIG),
                )
                .arg(
                    Arg::new("image")
                        .short('i')
                        .long("image")
                        .value_name("IMAGE")
                        .help("PostgreSQL image reference, e.g. postgres:16-alpine"),
                )
                .arg(
                    Arg::new("format")
                        .short('f')
                        .long("format")
                        .value_name("FORMAT")
                        .help("Overlay output format")
                        .value_parser(["env", "toml"])
                        .default_value("env"),
                ),
        )
        .subcommand(
            Command::new("sample-config")
                .about("Write a default harness configuration file")
                .arg(
                    Arg::new("path")
                        .value_name("PATH")
                        .help("Where to write the file")
                        .default_value(DEFAULT_HARNESS_CONFIG),
                ),
        )
        .get_matches();

    match matches.get_one::<String>("log-level") {
        Some(level) => env_logger::Builder::new().parse_filters(level).init(),
        None => {
            if std::env::var("RUST_LOG").is_err() {
                std::env::set_var("RUST_LOG", "warn");
            }
            env_logger::init();
        }
    }

    match matches.subcommand() {
        Some(("up", sub)) => up(sub).await,
        Some(("sample-config", sub)) => {
            let path = sub
                .get_one::<String>("path")
                .map(String::as_str)
                .unwrap_or(DEFAULT_HARNESS_CONFIG);
            create_sample_config(Path::new(path))?;
            println!("Sample configuration written to: {path}");
            Ok(())
        }
        _ => Ok(()),
    }
}
