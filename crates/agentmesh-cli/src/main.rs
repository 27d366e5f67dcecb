//! agentmesh CLI: run an in-process agent mesh and inspect its configuration.

mod cli;
mod demo;
mod ui;

use crate::cli::{Cli, Commands};
use agentmesh_kernel::config::{default_config_path, load_config, to_toml, try_load_config};
use agentmesh_kernel::AgentMesh;
use agentmesh_types::config::MeshConfig;
use clap::Parser;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info};

/// Initialize stderr tracing. `RUST_LOG` wins over the configured level.
fn init_tracing(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Set up logging from the config's level, then load the config for real so
/// any fallback warning is logged.
fn boot_config(path: Option<&Path>) -> MeshConfig {
    let level = try_load_config(path)
        .map(|c| c.log_level)
        .unwrap_or_else(|_| "info".to_string());
    init_tracing(&level);
    load_config(path)
}

fn main() {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Run {
            demo,
            stats_interval,
        } => {
            let config = boot_config(config_path);
            cmd_run(config, demo, stats_interval);
        }
        Commands::Demo => {
            let config = boot_config(config_path);
            cmd_demo(config);
        }
        Commands::Config { json } => cmd_config(config_path, json),
        Commands::Check => cmd_check(config_path),
    }
}

fn build_mesh(config: MeshConfig) -> AgentMesh {
    match AgentMesh::new(config) {
        Ok(mesh) => mesh,
        Err(e) => {
            error!(error = %e, "Failed to build agent mesh");
            std::process::exit(1);
        }
    }
}

fn build_runtime() -> tokio::runtime::Runtime {
    match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "Failed to create Tokio runtime");
            std::process::exit(1);
        }
    }
}

fn cmd_run(config: MeshConfig, demo: bool, stats_interval: u64) {
    let rt = build_runtime();
    rt.block_on(async {
        let mesh = build_mesh(config);
        if let Err(e) = mesh.start() {
            error!(error = %e, "Failed to start agent mesh");
            std::process::exit(1);
        }

        if demo {
            let summary = demo::run_once(&mesh).await;
            info!(
                requests = summary.requests,
                responses = summary.responses,
                events = summary.events_seen,
                "Demo scenario finished"
            );
        }

        info!("Agent mesh running, press Ctrl+C to stop");
        let period = Duration::from_secs(stats_interval.max(1));
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupt received, shutting down");
                    break;
                }
                _ = tokio::time::sleep(period), if stats_interval > 0 => {
                    let snapshot = mesh.snapshot();
                    info!(
                        messages = snapshot.bus.messages_published,
                        agents = snapshot.bus.registered_agents,
                        pending_requests = snapshot.bus.pending_requests,
                        events = snapshot.events.events_published,
                        queue_depth = snapshot.events.queue_depth,
                        services = snapshot.registry.total_services,
                        "Mesh statistics"
                    );
                }
            }
        }

        if let Err(e) = mesh.stop().await {
            error!(error = %e, "Failed to stop agent mesh cleanly");
        }
    });
}

fn cmd_demo(config: MeshConfig) {
    let rt = build_runtime();
    rt.block_on(async {
        let mesh = build_mesh(config);
        if let Err(e) = mesh.start() {
            error!(error = %e, "Failed to start agent mesh");
            std::process::exit(1);
        }
        let summary = demo::run_once(&mesh).await;
        let snapshot = mesh.snapshot();
        if let Err(e) = mesh.stop().await {
            error!(error = %e, "Failed to stop agent mesh cleanly");
        }

        ui::section("Demo summary");
        ui::kv("Requests", summary.requests);
        ui::kv("Responses", summary.responses);
        ui::kv("Events seen", summary.events_seen);
        ui::kv("Messages", snapshot.bus.messages_published);
        ui::kv("Fast path", snapshot.bus.fast_path_responses);
        ui::kv("Services", snapshot.registry.total_services);
        ui::blank();
    });
}

fn cmd_config(path: Option<&Path>, json: bool) {
    let config = load_config(path);
    let rendered = if json {
        serde_json::to_string_pretty(&config).map_err(|e| e.to_string())
    } else {
        to_toml(&config).map_err(|e| e.to_string())
    };
    match rendered {
        Ok(text) => println!("{text}"),
        Err(e) => {
            eprintln!("Failed to render config: {e}");
            std::process::exit(1);
        }
    }
}

fn cmd_check(path: Option<&Path>) {
    let shown = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);
    ui::section("Config check");
    ui::kv("Path", shown.display());

    if !shown.exists() {
        ui::check_ok("No config file, defaults apply");
        ui::hint("Create the file to override max_message_history, heartbeat_timeout_seconds, ...");
        return;
    }
    match try_load_config(path) {
        Ok(config) => {
            ui::check_ok("Config is valid");
            ui::kv("Log level", &config.log_level);
            ui::kv("Heartbeat", format!("{}s", config.heartbeat_timeout_seconds));
        }
        Err(e) => {
            ui::check_fail(&e.to_string(), "Fix the value above or delete the file to use defaults");
            std::process::exit(1);
        }
    }
}
