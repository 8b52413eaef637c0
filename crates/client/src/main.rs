mod child;
mod output;
mod proxy;

use std::process::ExitCode;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use common::config::Config;
use common::lease::LeaseManager;
use common::{host, process, trust};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use crate::output::Output;

#[derive(Parser)]
#[command(author, version, about = "Run local apps behind a local HTTPS reverse proxy", long_about = None)]
struct Cli {
    /// Output JSON for scripting
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command with an allocated port, routed at https://<name>.localhost
    Run {
        /// App route name (lowercase letters, digits and dashes)
        name: String,

        /// Custom hostname (default: <name>.localhost)
        #[arg(long)]
        host: Option<String>,

        /// Start the proxy with sudo if it is not already running
        #[arg(short, long)]
        privileged: bool,

        /// Command and arguments to execute; `@PORT` is replaced by the port
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// List registered apps
    Ls,
    /// Remove an app's lease and routes
    Rm {
        name: String,
    },
    /// Manage the proxy lifecycle
    Proxy {
        #[command(subcommand)]
        command: ProxyCommands,
    },
    /// Show environment and health diagnostics
    Doctor,
}

#[derive(Subcommand)]
enum ProxyCommands {
    /// Start the proxy if no proxy is running
    Start {
        /// Spawn the proxy with sudo so it can bind 80/443
        #[arg(short, long)]
        privileged: bool,
    },
    /// Stop the portwrap-managed proxy
    Stop,
    /// Show proxy status
    Status,
    /// Trust the proxy's local CA
    Trust,
    /// Show proxy logs
    Logs,
}

/// What every command needs: the lease engine and the output mode.
pub struct Context {
    pub manager: LeaseManager,
    pub out: Output,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let out = Output::new(cli.json);

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    if process::is_root() && !out.is_json() {
        eprintln!(
            "warning: running portwrap with sudo is discouraged; use `portwrap proxy start --privileged` instead"
        );
    }

    match dispatch(cli.command, out).await {
        Ok(code) => code,
        Err(e) => {
            out.error(&e);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(command: Commands, out: Output) -> anyhow::Result<ExitCode> {
    let config = Config::load().context("invalid configuration")?;
    let manager = LeaseManager::new(config)?;
    let ctx = Context { manager, out };

    match command {
        Commands::Run {
            name,
            host,
            privileged,
            command,
        } => return run_app(&ctx, &name, host.as_deref(), privileged, &command).await,
        Commands::Ls => list(&ctx).await?,
        Commands::Rm { name } => remove(&ctx, &name).await?,
        Commands::Proxy { command } => match command {
            ProxyCommands::Start { privileged } => proxy::start(&ctx, privileged).await?,
            ProxyCommands::Stop => proxy::stop(&ctx).await?,
            ProxyCommands::Status => proxy::status(&ctx).await?,
            ProxyCommands::Trust => proxy::trust(&ctx).await?,
            ProxyCommands::Logs => proxy::logs(&ctx).await?,
        },
        Commands::Doctor => doctor(&ctx).await?,
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_app(
    ctx: &Context,
    name: &str,
    custom_host: Option<&str>,
    privileged: bool,
    command: &[String],
) -> anyhow::Result<ExitCode> {
    // Reject bad input before anything gets started.
    host::validate_name(name)?;
    host::host_for_app(name, custom_host)?;

    proxy::ensure_running(ctx, privileged).await?;

    let pid = std::process::id();
    let lease = match ctx.manager.acquire(name, custom_host, pid).await {
        Ok(lease) => lease,
        Err(e) => {
            if proxy::daemon_pid(ctx).await.is_some() {
                let logs = ctx.manager.config().log_file();
                return Err(e).with_context(|| format!("logs: {}", logs.display()));
            }
            return Err(e.into());
        }
    };

    let warnings: &[&str] = if lease.trusted {
        &[]
    } else {
        &[
            "HTTPS cert is issued by the proxy's local CA and is not trusted yet",
            "run: portwrap proxy trust",
            "or: sudo portwrap proxy trust",
        ]
    };
    ctx.out.report(
        json!({
            "ok": true,
            "action": "run",
            "name": lease.name,
            "port": lease.port,
            "https_url": lease.https_url,
            "http_url": lease.http_url,
            "trusted": lease.trusted,
            "warnings": warnings,
        }),
        || {
            for warning in warnings {
                println!("warning: {warning}");
            }
            println!("{} -> {}", lease.name, lease.https_url);
            println!("http fallback: {}", lease.http_url);
        },
    )?;

    let result = child::run(&lease, command).await;
    ctx.manager.release(name, pid).await;
    Ok(ExitCode::from(result?))
}

async fn list(ctx: &Context) -> anyhow::Result<()> {
    let status = ctx.manager.status().await?;
    ctx.out.report(
        json!({
            "ok": true,
            "running": status.running,
            "apps": status.apps,
            "https_port": status.https_port,
        }),
        || {
            if !status.running {
                println!("no apps registered (proxy not running)");
                return;
            }
            if status.apps.is_empty() {
                println!("no apps registered");
            }
            for app in &status.apps {
                println!(
                    "{} -> {} (port {}, pid {})",
                    app.name,
                    app.https_url(status.https_port),
                    app.port,
                    app.pid
                );
            }
        },
    )
}

async fn remove(ctx: &Context, name: &str) -> anyhow::Result<()> {
    host::validate_name(name)?;
    if !ctx.manager.admin().healthy().await {
        anyhow::bail!("proxy is not running");
    }
    let removed = ctx.manager.remove(name).await?;
    ctx.out.report(
        json!({"ok": true, "action": "remove", "name": name, "removed": removed}),
        || {
            if removed {
                println!("removed route for {name:?}");
            } else {
                println!("no app named {name:?}");
            }
        },
    )
}

async fn doctor(ctx: &Context) -> anyhow::Result<()> {
    let config = ctx.manager.config();
    let admin = ctx.manager.admin();
    let reachable = admin.healthy().await;
    let topology = if reachable {
        Some(common::topology::inspect(admin).await)
    } else {
        None
    };
    let managed = matches!(
        &topology,
        Some(Ok(t)) if t.ownership == common::topology::ProxyOwnership::SelfManaged
    );
    let trusted = trust::is_trusted(admin).await;
    let tracked = ctx.manager.store().load().map(|s| s.apps.len());

    let mut payload = json!({
        "ok": true,
        "state_dir": config.state_dir.display().to_string(),
        "state_file": config.state_file().display().to_string(),
        "state_lock": config.lock_file().display().to_string(),
        "storage_dir": config.caddy_data_dir.display().to_string(),
        "caddy_admin": reachable,
        "admin_url": admin.base_url(),
        "trusted": trusted,
    });
    if managed {
        payload["pid_file"] = json!(config.pid_file().display().to_string());
        payload["log_file"] = json!(config.log_file().display().to_string());
    }
    match &topology {
        Some(Ok(t)) => {
            payload["caddy_source"] = json!(t.ownership.source());
            payload["http_port"] = json!(t.http_port);
            payload["https_port"] = json!(t.https_port);
        }
        Some(Err(e)) => payload["caddy_inspect_error"] = json!(e.to_string()),
        None => {}
    }
    match &tracked {
        Ok(n) => payload["tracked_apps"] = json!(n),
        Err(e) => payload["tracked_apps_error"] = json!(e.to_string()),
    }

    ctx.out.report(payload, || {
        println!("portwrap doctor");
        println!("state dir:   {}", config.state_dir.display());
        println!("state file:  {}", config.state_file().display());
        println!("state lock:  {}", config.lock_file().display());
        if managed {
            println!("pid file:    {}", config.pid_file().display());
            println!("log file:    {}", config.log_file().display());
        }
        println!("storage dir: {}", config.caddy_data_dir.display());
        println!("caddy admin: {reachable} ({})", admin.base_url());
        match &topology {
            Some(Ok(t)) => {
                println!("caddy source: {}", t.ownership.source());
                println!("http/https:   {}/{}", t.http_port, t.https_port);
            }
            Some(Err(e)) => println!("caddy inspect error: {e}"),
            None => {}
        }
        println!("trust (local CA): {trusted}");
        match &tracked {
            Ok(n) => println!("tracked apps: {n}"),
            Err(e) => println!("tracked apps: unknown ({e})"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_takes_trailing_command() {
        let cli = Cli::try_parse_from([
            "portwrap", "run", "api", "--host", "api.dev.test", "-p", "--", "uvicorn", "--port",
            "@PORT",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                name,
                host,
                privileged,
                command,
            } => {
                assert_eq!(name, "api");
                assert_eq!(host.as_deref(), Some("api.dev.test"));
                assert!(privileged);
                assert_eq!(command, vec!["uvicorn", "--port", "@PORT"]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn run_requires_a_command() {
        assert!(Cli::try_parse_from(["portwrap", "run", "api"]).is_err());
    }

    #[test]
    fn json_flag_is_global() {
        let cli = Cli::try_parse_from(["portwrap", "proxy", "status", "--json"]).unwrap();
        assert!(cli.json);
        assert!(matches!(
            cli.command,
            Commands::Proxy {
                command: ProxyCommands::Status
            }
        ));
    }
}
