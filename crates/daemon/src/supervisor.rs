//! Lifetime of the self-managed proxy: start it, hand it the existing leases,
//! wait for a stop request, then put the state back to unmanaged.

use std::process::ExitStatus;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use common::config::Config;
use common::lease::LeaseManager;
use common::{ports, process, CaddySource};
use tokio::process::Child;
use tracing::{error, info, warn};

use crate::caddy;

const READY_TIMEOUT: Duration = Duration::from_secs(3);
const STOP_GRACE: Duration = Duration::from_secs(5);

enum Exit {
    Signal(&'static str),
    ProxyExited(std::io::Result<ExitStatus>),
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let manager = LeaseManager::new(config.clone()).context("failed to build admin client")?;
    if manager.admin().healthy().await {
        bail!(
            "a proxy admin API is already answering at {}; nothing to supervise",
            manager.admin().base_url()
        );
    }

    let ports = ports::choose_proxy_ports(process::is_root())?;
    let config_path = config.caddy_config_file();
    caddy::write_config(&config_path, &caddy::render(&config, ports))?;

    let mut signals = Signals::install()?;
    let mut child = caddy::spawn(&config.caddy_bin, &config_path)?;
    info!(
        pid = child.id(),
        http_port = ports.http,
        https_port = ports.https,
        config = %config_path.display(),
        "proxy spawned"
    );

    if let Err(e) = manager.admin().wait_ready(READY_TIMEOUT).await {
        kill(&mut child).await;
        return Err(e).context("proxy admin API did not come up");
    }

    if let Err(e) = adopt(&manager).await {
        stop(&manager, &mut child).await;
        return Err(e).context("failed to route existing leases through the new proxy");
    }
    manager.store().write_pid(std::process::id())?;
    info!(pid = std::process::id(), "daemon ready");

    let exit = tokio::select! {
        signal = signals.recv() => Exit::Signal(signal),
        status = child.wait() => Exit::ProxyExited(status),
    };

    let result = match exit {
        Exit::Signal(signal) => {
            info!(signal, "shutting down");
            stop(&manager, &mut child).await;
            Ok(())
        }
        Exit::ProxyExited(Ok(status)) => {
            error!(%status, "proxy exited unexpectedly");
            Err(anyhow!("proxy exited unexpectedly ({status})"))
        }
        Exit::ProxyExited(Err(e)) => Err(e).context("failed to wait for proxy"),
    };

    if let Err(e) = revert_to_unmanaged(&manager).await {
        warn!(error = %e, "failed to reset state after shutdown");
    }
    if let Err(e) = manager.store().clear_pid() {
        warn!(error = %e, "failed to remove pid file");
    }
    result
}

/// Records the new proxy as managed and routes every surviving lease to it.
async fn adopt(manager: &LeaseManager) -> anyhow::Result<()> {
    let lock = manager.store().lock().await?;
    let mut state = manager.load_live(&lock)?;
    let topology = manager.commit(&lock, &mut state).await?;
    info!(
        apps = state.apps.len(),
        evicted = state.evicted.len(),
        http_port = topology.http_port,
        https_port = topology.https_port,
        "leases adopted"
    );
    Ok(())
}

async fn revert_to_unmanaged(manager: &LeaseManager) -> common::Result<()> {
    let _lock = manager.store().lock().await?;
    let mut state = manager.store().load()?;
    state.caddy_source = CaddySource::Unmanaged;
    manager.store().save(&state)
}

/// Asks the proxy to stop through its admin API and kills it if that fails
/// or it lingers.
async fn stop(manager: &LeaseManager, child: &mut Child) {
    if let Err(e) = manager.admin().stop().await {
        warn!(error = %e, "graceful stop failed; killing proxy");
        kill(child).await;
        return;
    }
    match tokio::time::timeout(STOP_GRACE, child.wait()).await {
        Ok(Ok(status)) => info!(%status, "proxy stopped"),
        Ok(Err(e)) => warn!(error = %e, "failed to wait for proxy"),
        Err(_) => {
            warn!(grace_secs = STOP_GRACE.as_secs(), "proxy still running after stop; killing");
            kill(child).await;
        }
    }
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "failed to kill proxy");
    }
}

#[cfg(unix)]
struct Signals {
    term: tokio::signal::unix::Signal,
    int: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn install() -> anyhow::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            term: signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?,
            int: signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.term.recv() => "SIGTERM",
            _ = self.int.recv() => "SIGINT",
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn install() -> anyhow::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> &'static str {
        let _ = tokio::signal::ctrl_c().await;
        "ctrl-c"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::AdminClientConfig;
    use common::ProxyState;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers every request with an empty 200, like an idle admin API.
    async fn healthy_admin() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = sock.read(&mut buf).await;
                    let _ = sock
                        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                        .await;
                });
            }
        });
        format!("http://{addr}")
    }

    fn config(dir: &std::path::Path, base_url: String) -> Config {
        let mut config = Config::with_state_dir(dir);
        config.admin = AdminClientConfig {
            base_url,
            timeout: Duration::from_secs(1),
        };
        config.caddy_bin = dir.join("no-such-caddy");
        config
    }

    #[tokio::test]
    async fn refuses_when_a_proxy_is_already_running() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), healthy_admin().await);

        let err = run(config.clone()).await.unwrap_err();

        assert!(err.to_string().contains("already answering"), "{err:#}");
        assert!(!config.caddy_config_file().exists());
        assert!(!config.pid_file().exists());
    }

    #[tokio::test]
    async fn shutdown_marks_state_unmanaged() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            LeaseManager::new(config(dir.path(), "http://127.0.0.1:9".into())).unwrap();
        let mut state = ProxyState {
            caddy_source: CaddySource::Managed,
            ..Default::default()
        };
        state.set_ports(8080, 8443);
        manager.store().save(&state).unwrap();

        revert_to_unmanaged(&manager).await.unwrap();

        let state = manager.store().load().unwrap();
        assert_eq!(state.caddy_source, CaddySource::Unmanaged);
        assert_eq!((state.http_port, state.https_port), (8080, 8443));
    }
}
