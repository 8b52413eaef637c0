//! `portwrap proxy ...`: starting, stopping and inspecting the proxy.

use std::env;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _};
use common::topology::{self, ProxyOwnership};
use common::{process, trust, CaddySource};
use serde_json::json;
use tracing::{debug, info};

use crate::Context;

const DAEMON_BIN: &str = "portwrap-daemon";
const START_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Variables the daemon needs to see when it is started through sudo.
const PRESERVED_ENV: &[&str] = &[
    "XDG_STATE_HOME",
    "PORTWRAP_STATE_DIR",
    "PORTWRAP_ADMIN_URL",
    "PORTWRAP_ADMIN_TIMEOUT_MS",
    "PORTWRAP_PORT_RANGE",
    "PORTWRAP_CADDY_BIN",
    "PORTWRAP_CADDY_DATA_DIR",
    "CADDY_DATA_DIR",
    "RUST_LOG",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    AlreadyRunning,
    UsingUnmanaged,
    Started,
}

impl StartOutcome {
    fn as_str(self) -> &'static str {
        match self {
            StartOutcome::AlreadyRunning => "already_running",
            StartOutcome::UsingUnmanaged => "using_unmanaged",
            StartOutcome::Started => "started",
        }
    }
}

/// PID of a live daemon that owns the currently running proxy. A PID file
/// left behind by a dead daemon is removed.
pub async fn daemon_pid(ctx: &Context) -> Option<u32> {
    let store = ctx.manager.store();
    let pid = store.read_pid()?;
    if !process::is_alive(pid) {
        debug!(pid, "removing stale daemon pid file");
        let _ = store.clear_pid();
        return None;
    }
    match topology::inspect(ctx.manager.admin()).await {
        Ok(topo) if topo.ownership == ProxyOwnership::SelfManaged => Some(pid),
        Ok(_) => {
            debug!(pid, "proxy is not self-managed; dropping pid file");
            let _ = store.clear_pid();
            None
        }
        Err(_) => None,
    }
}

/// Makes sure a control plane answers, starting the daemon when none does.
pub async fn ensure_running(ctx: &Context, privileged: bool) -> anyhow::Result<()> {
    if ctx.manager.admin().healthy().await {
        return Ok(());
    }
    start_daemon(ctx, privileged).await?;
    if !ctx.manager.admin().healthy().await {
        bail!(
            "proxy admin API at {} is still unavailable",
            ctx.manager.admin().base_url()
        );
    }
    Ok(())
}

pub async fn start_daemon(ctx: &Context, privileged: bool) -> anyhow::Result<StartOutcome> {
    if privileged && process::is_root() {
        bail!(
            "do not run `portwrap proxy start --privileged` under sudo; run it as your normal user"
        );
    }
    if daemon_pid(ctx).await.is_some() {
        return Ok(StartOutcome::AlreadyRunning);
    }
    if ctx.manager.admin().healthy().await {
        return Ok(StartOutcome::UsingUnmanaged);
    }

    let config = ctx.manager.config();
    let bin = daemon_binary();
    let log_path = config.log_file();
    fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("failed to create {}", config.state_dir.display()))?;
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;

    let mut cmd = if privileged {
        let mut sudo = Command::new("sudo");
        sudo.arg(format!("--preserve-env={}", PRESERVED_ENV.join(",")))
            .arg(&bin)
            .stdin(Stdio::inherit());
        sudo
    } else {
        let mut direct = Command::new(&bin);
        direct.stdin(Stdio::null());
        direct
    };
    cmd.stdout(log.try_clone().context("failed to duplicate log handle")?)
        .stderr(log);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let child = cmd
        .spawn()
        .with_context(|| format!("failed to start {}", bin.display()))?;
    info!(pid = child.id(), bin = %bin.display(), privileged, "daemon spawned");

    ctx.manager
        .admin()
        .wait_ready(START_TIMEOUT)
        .await
        .with_context(|| format!("proxy failed to start (see {})", log_path.display()))?;
    Ok(StartOutcome::Started)
}

/// `PORTWRAP_DAEMON_BIN`, else the daemon installed next to this executable,
/// else whatever `PATH` resolves.
fn daemon_binary() -> PathBuf {
    if let Some(bin) = env::var_os("PORTWRAP_DAEMON_BIN") {
        return PathBuf::from(bin);
    }
    let sibling = env::current_exe().ok().and_then(|exe| {
        let path = exe
            .parent()?
            .join(format!("{DAEMON_BIN}{}", env::consts::EXE_SUFFIX));
        path.is_file().then_some(path)
    });
    sibling.unwrap_or_else(|| PathBuf::from(DAEMON_BIN))
}

pub async fn start(ctx: &Context, privileged: bool) -> anyhow::Result<()> {
    let outcome = start_daemon(ctx, privileged).await?;
    let admin = ctx.manager.admin().base_url().to_string();
    ctx.out.report(
        json!({
            "ok": true,
            "action": "proxy_start",
            "result": outcome.as_str(),
            "privileged": privileged,
            "admin": admin,
        }),
        || match outcome {
            StartOutcome::AlreadyRunning => println!("proxy is already running"),
            StartOutcome::UsingUnmanaged => {
                println!("an unmanaged proxy is already running at {admin}");
                println!("portwrap will use it directly");
            }
            StartOutcome::Started if privileged => println!("proxy started (privileged)"),
            StartOutcome::Started => println!("proxy started"),
        },
    )
}

pub async fn stop(ctx: &Context) -> anyhow::Result<()> {
    let admin = ctx.manager.admin();

    let (result, pid) = if let Some(pid) = daemon_pid(ctx).await {
        process::terminate(pid).with_context(|| format!("failed to signal daemon {pid}"))?;
        wait_for_exit(pid, STOP_TIMEOUT).await;
        ("stopped", Some(pid))
    } else if let Some(pid) = ctx.manager.store().read_pid().filter(|p| process::is_alive(*p)) {
        process::terminate(pid).with_context(|| format!("failed to signal daemon {pid}"))?;
        ("signaled", Some(pid))
    } else if admin.healthy().await {
        match topology::inspect(admin).await {
            Ok(topo) if topo.ownership == ProxyOwnership::SelfManaged => {
                // Our servers, but no daemon left to supervise them.
                admin.stop().await.context("failed to stop proxy")?;
                ("stopped", None)
            }
            _ => ("using_unmanaged", None),
        }
    } else {
        ("not_running", None)
    };

    ctx.out.report(
        json!({"ok": true, "action": "proxy_stop", "result": result, "pid": pid}),
        || match result {
            "using_unmanaged" => println!("using an unmanaged proxy; nothing for portwrap to stop"),
            "not_running" => println!("proxy is not running"),
            _ => println!("proxy stopped"),
        },
    )
}

async fn wait_for_exit(pid: u32, timeout: Duration) {
    let started = Instant::now();
    let mut delay = Duration::from_millis(50);
    while process::is_alive(pid) && started.elapsed() < timeout {
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(Duration::from_millis(500));
    }
}

pub async fn status(ctx: &Context) -> anyhow::Result<()> {
    let status = ctx.manager.status().await?;
    let owner = match status.caddy_source {
        CaddySource::Managed => "managed proxy",
        CaddySource::Unmanaged => "unmanaged proxy",
    };
    ctx.out.report(
        json!({"ok": true, "running": status.running, "owner": owner, "status": status}),
        || {
            if !status.running {
                println!("proxy is not running");
                return;
            }
            let mode = if status.root { "sudo" } else { "unprivileged" };
            match status.caddy_source {
                CaddySource::Managed => {
                    let pid = match status.pid {
                        0 => "-".to_string(),
                        pid => pid.to_string(),
                    };
                    println!("proxy running (pid {pid}, {mode}, {owner})");
                }
                CaddySource::Unmanaged => println!("proxy running ({owner})"),
            }
            println!("http: {}, https: {}", status.http_port, status.https_port);
            println!("ca trusted: {}", status.trusted);
            if status.apps.is_empty() {
                println!("apps: none");
                return;
            }
            println!("apps:");
            for app in &status.apps {
                println!(
                    "- {} -> {} (port {}, pid {})",
                    app.name,
                    app.https_url(status.https_port),
                    app.port,
                    app.pid
                );
            }
        },
    )
}

pub async fn trust(ctx: &Context) -> anyhow::Result<()> {
    ensure_running(ctx, false).await?;
    trust::install(ctx.manager.config(), ctx.manager.admin())
        .await
        .context("failed to trust the local CA")?;
    ctx.out.report(
        json!({"ok": true, "action": "proxy_trust", "trusted": true}),
        || println!("trust complete"),
    )
}

pub async fn logs(ctx: &Context) -> anyhow::Result<()> {
    let managed = ctx.manager.admin().healthy().await
        && matches!(
            topology::inspect(ctx.manager.admin()).await,
            Ok(topo) if topo.ownership == ProxyOwnership::SelfManaged
        );
    if !managed {
        return ctx.out.report(
            json!({"ok": true, "managed": false, "log_file": "", "content": ""}),
            || println!("no managed proxy logs (currently using an unmanaged proxy)"),
        );
    }

    let path = ctx.manager.config().log_file();
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };
    ctx.out.report(
        json!({
            "ok": true,
            "managed": true,
            "log_file": path.display().to_string(),
            "content": content,
        }),
        || {
            println!("log file: {}", path.display());
            if content.is_empty() {
                println!("(empty)");
            } else {
                print!("{content}");
            }
        },
    )
}
