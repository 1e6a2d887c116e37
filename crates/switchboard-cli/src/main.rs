//! Switchboard CLI
//!
//! Command-line interface for testing and operating switchboard routing
//! configurations

mod commands;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use switchboard_config_file::{FileConfigSource, GatewayConfig};
use switchboard_core::RouteRequest;
use switchboard_observability::{LoggingConfig, RoutingMetrics, init_logging};
use switchboard_routing::RoutingObserver;

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(about = "Switchboard - rule-based model routing", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (YAML, TOML or JSON)
    #[arg(
        short,
        long,
        value_name = "FILE",
        env = "SWITCHBOARD_CONFIG",
        default_value = "~/.switchboard/config.yaml",
        global = true
    )]
    config: PathBuf,

    /// Log filter, overrides the configuration file (e.g. debug)
    #[arg(long, value_name = "LEVEL", env = "SWITCHBOARD_LOG", global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Route one request and print the decision
    Route {
        /// JSON file holding the request body
        #[arg(short, long, value_name = "FILE")]
        request: PathBuf,

        /// Token count of the request
        #[arg(short, long, default_value = "0")]
        tokens: u64,

        /// Session ID attached to the request
        #[arg(long)]
        session_id: Option<String>,

        /// Print the full result as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },
    /// List rules in evaluation order
    Rules,
    /// Print the configuration with a slot-based router migrated to rules
    Migrate,
    /// Keep the configuration loaded and reload it on change
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let source = FileConfigSource::new(cli.config.clone())
        .with_context(|| format!("Failed to open config file {}", cli.config.display()))?;
    let raw = source.read_raw()?;

    // Logging comes up before the rest of the file is interpreted so
    // migration and validation messages are visible
    let mut logging: LoggingConfig = match raw.get("logging") {
        Some(section) => serde_json::from_value(section.clone()).context("Invalid logging section")?,
        None => LoggingConfig::default(),
    };
    if let Some(level) = cli.log_level {
        logging.level = level;
    }
    init_logging(&logging)?;

    let config = GatewayConfig::from_value(raw)?;
    config.validate()?;
    let modules = commands::module_loader(source.path())?;

    match cli.command {
        Commands::Route {
            request,
            tokens,
            session_id,
            json,
        } => {
            let body: serde_json::Value = serde_json::from_str(
                &std::fs::read_to_string(&request)
                    .with_context(|| format!("Failed to read request file {}", request.display()))?,
            )
            .context("Request file is not valid JSON")?;
            let mut request = RouteRequest::new(body);
            if let Some(session_id) = session_id {
                request = request.with_session_id(session_id);
            }

            let dispatcher = commands::build_dispatcher(&config, modules.clone(), None)?;
            let dispatch = commands::route(&dispatcher, &config, &request, tokens).await;
            println!("{}", commands::render_dispatch(&dispatch, json)?);
            dispatcher.release(&dispatch)?;
            dispatcher.groups().shutdown();
        }
        Commands::Rules => {
            let dispatcher = commands::build_dispatcher(&config, modules.clone(), None)?;
            print!("{}", commands::render_rules(&dispatcher.engine().rule_set()));
            dispatcher.groups().shutdown();
        }
        Commands::Migrate => {
            print!("{}", commands::render_config(&config)?);
        }
        Commands::Watch => {
            let metrics = Arc::new(RoutingMetrics::new()?);
            let observer: Arc<dyn RoutingObserver> = metrics.clone();
            let dispatcher = commands::build_dispatcher(&config, modules, Some(observer))?;
            commands::watch(&source, &dispatcher).await?;

            println!("{}", serde_json::to_string_pretty(&dispatcher.engine().stats())?);
            print!("{}", metrics.gather_text()?);
            dispatcher.groups().shutdown();
        }
    }

    Ok(())
}
