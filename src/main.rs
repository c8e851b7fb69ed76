//! Routekeeper CLI
//!
//! Usage:
//!   routekeeper [--config <path>] bootstrap [--http3]
//!   routekeeper [--config <path>] assign-domain <host> <none|letsencrypt> [email]
//!   routekeeper [--config <path>] http3 <on|off>
//!   routekeeper [--config <path>] dashboard <on|off>
//!   routekeeper [--config <path>] env <file>
//!   routekeeper [--config <path>] access-log <on|off>
//!   routekeeper [--config <path>] show <name|main>
//!   routekeeper [--config <path>] status
//!   routekeeper [--config <path>] run

use anyhow::Context;
use routekeeper::config::Settings;
use routekeeper::docker::{DockerOrchestrator, Endpoint};
use routekeeper::jobs::JobRegistry;
use routekeeper::routing::{AdminState, CertificateType};
use routekeeper::settings::ProxyAdmin;
use routekeeper::static_config::Bootstrap;
use routekeeper::{PKG_NAME, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, PartialEq)]
enum Command {
    Help,
    Version,
    Bootstrap { http3: bool },
    AssignDomain(AdminState),
    Http3(bool),
    Dashboard(bool),
    Env(PathBuf),
    AccessLog(bool),
    Show(String),
    Status,
    Run,
}

#[derive(Debug, PartialEq)]
struct Invocation {
    config: Option<PathBuf>,
    command: Command,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("routekeeper=debug".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let invocation = parse_args(&args)?;

    match invocation.command {
        Command::Help => {
            print_help();
            return Ok(());
        }
        Command::Version => {
            println!("{} {}", PKG_NAME, VERSION);
            return Ok(());
        }
        _ => {}
    }

    let settings = match &invocation.config {
        Some(path) => Settings::load(path).map_err(|e| {
            error!(path = %path.display(), error = %e, "Failed to load settings");
            e
        })?,
        None => Settings::from_env()?,
    };
    info!(environment = ?settings.environment, app = %settings.app_name, "Settings loaded");

    let docker_host = std::env::var("DOCKER_HOST").ok();
    let endpoint = Endpoint::resolve(
        settings.proxy.docker_host.as_deref(),
        docker_host.as_deref(),
        &settings.proxy.docker_socket,
    )?;
    let orchestrator = Arc::new(DockerOrchestrator::connect(&endpoint).await.map_err(|e| {
        error!(%endpoint, error = %e, "Cannot reach the Docker daemon, start dockerd or set DOCKER_HOST");
        e
    })?);
    let jobs = Arc::new(JobRegistry::new());
    let admin = ProxyAdmin::new(&settings, orchestrator, jobs.clone());

    match invocation.command {
        Command::Bootstrap { http3 } => {
            bootstrap(&admin, http3).await?;
        }
        Command::AssignDomain(state) => {
            let doc = admin.assign_domain(&state)?;
            println!("{}", serde_yaml::to_string(&doc)?);
        }
        Command::Http3(enabled) => {
            admin.toggle_http3(enabled).await?;
            println!("HTTP/3 {}", on_off(enabled));
        }
        Command::Dashboard(enabled) => {
            admin.toggle_dashboard(enabled).await?;
            println!("Dashboard {}", on_off(enabled));
        }
        Command::Env(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read environment file '{}'", path.display()))?;
            admin.write_proxy_env(&text).await?;
            if let Some(env) = admin.read_proxy_env().await? {
                println!("{}", env);
            }
        }
        Command::AccessLog(enabled) => {
            admin.set_access_log(enabled)?;
            println!("Access log {}", on_off(enabled));
        }
        Command::Show(name) => {
            let raw = if name == "main" {
                admin.main_config().read_raw()?
            } else {
                admin.store().read_raw(&name)?
            };
            match raw {
                Some(text) => print!("{}", text),
                None => anyhow::bail!("No document named '{}'", name),
            }
        }
        Command::Status => match admin.proxy_status().await? {
            Some(options) => {
                println!("Service:   present");
                println!("HTTP/3:    {}", on_off(options.enable_http3));
                println!("Dashboard: {}", on_off(options.enable_dashboard));
            }
            None => println!("Service:   absent, run bootstrap"),
        },
        Command::Run => {
            bootstrap(&admin, false).await?;
            if settings.docker_cleanup {
                admin.set_docker_cleanup(true);
            }
            info!(jobs = jobs.len(), "Running, press Ctrl+C to stop");
            wait_for_shutdown().await?;
            jobs.shutdown();
            info!("Shutdown complete");
        }
        Command::Help | Command::Version => {}
    }

    Ok(())
}

async fn bootstrap(admin: &ProxyAdmin, http3: bool) -> anyhow::Result<()> {
    let report = admin.bootstrap(http3).await.map_err(|e| {
        if e.state_unknown() {
            warn!(error = %e, "Proxy service state is unknown, inspect it before retrying");
        }
        e
    })?;
    info!(
        server_config_created = report.server_config_created,
        middlewares_created = report.middlewares_created,
        main_config_created = matches!(report.main_config, Bootstrap::Created(_)),
        "Bootstrap complete"
    );
    Ok(())
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C, shutting down");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down");
    }

    Ok(())
}

fn parse_args(args: &[String]) -> anyhow::Result<Invocation> {
    let mut config = None;
    let mut rest = args;

    while let Some(first) = rest.first() {
        match first.as_str() {
            "--config" | "-c" => {
                let path = rest.get(1).context("--config requires a path")?;
                config = Some(PathBuf::from(path));
                rest = &rest[2..];
            }
            _ => break,
        }
    }

    Ok(Invocation {
        config,
        command: parse_command(rest)?,
    })
}

fn parse_command(args: &[String]) -> anyhow::Result<Command> {
    let Some(first) = args.first() else {
        return Ok(Command::Help);
    };

    let command = match first.as_str() {
        "help" | "--help" | "-h" => Command::Help,
        "version" | "--version" | "-V" => Command::Version,
        "bootstrap" | "init" => Command::Bootstrap {
            http3: args[1..].iter().any(|a| a == "--http3"),
        },
        "assign-domain" | "domain" => {
            let host = args.get(1).context("assign-domain requires a host")?;
            let certificate = args.get(2).map(String::as_str).unwrap_or("none");
            let certificate_type = CertificateType::parse(certificate).with_context(|| {
                format!("Unknown certificate type '{}', expected none or letsencrypt", certificate)
            })?;
            Command::AssignDomain(AdminState {
                host: Some(host.clone()),
                certificate_type,
                lets_encrypt_email: args.get(3).cloned(),
            })
        }
        "http3" => Command::Http3(parse_switch(args.get(1))?),
        "dashboard" => Command::Dashboard(parse_switch(args.get(1))?),
        "access-log" => Command::AccessLog(parse_switch(args.get(1))?),
        "env" => Command::Env(PathBuf::from(args.get(1).context("env requires a file")?)),
        "show" => Command::Show(args.get(1).context("show requires a document name")?.clone()),
        "status" => Command::Status,
        "run" | "serve" => Command::Run,
        other => anyhow::bail!("Unknown command: {}. Run 'routekeeper help' for usage.", other),
    };
    Ok(command)
}

fn parse_switch(arg: Option<&String>) -> anyhow::Result<bool> {
    match arg.map(String::as_str) {
        Some("on" | "true" | "enable") => Ok(true),
        Some("off" | "false" | "disable") => Ok(false),
        Some(other) => anyhow::bail!("Expected on or off, got '{}'", other),
        None => anyhow::bail!("Expected on or off"),
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "enabled"
    } else {
        "disabled"
    }
}

fn print_help() {
    println!(
        r#"{} {} - keeps the Traefik proxy in line with administrator settings

USAGE:
    routekeeper [--config <path>] <command>

COMMANDS:
    bootstrap [--http3]                           Write missing config and start the proxy service
    assign-domain <host> <none|letsencrypt> [email]  Route the application at <host>
    http3 <on|off>                                Toggle HTTP/3
    dashboard <on|off>                            Publish or withdraw the dashboard port
    env <file>                                    Replace the proxy environment from a file
    access-log <on|off>                           Toggle the proxy access log
    show <name|main>                              Print a routing document or the main config
    status                                        Show the switches on the running proxy service
    run                                           Bootstrap, then run maintenance jobs until Ctrl+C

ENVIRONMENT:
    TRAEFIK_PORT        Plaintext port (default 80)
    TRAEFIK_SSL_PORT    TLS port (default 443)
    PORT                Managed application port (default 3000)
    ROUTEKEEPER_ENV     development or production (default production)
    RUST_LOG            Log filter"#,
        PKG_NAME, VERSION
    );
}
