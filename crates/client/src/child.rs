//! Running the wrapped command.

use std::process::ExitStatus;

use anyhow::Context;
use common::Lease;
use reqwest::Url;
use tokio::process::{Child, Command};
use tracing::debug;

const PORT_PLACEHOLDER: &str = "@PORT";

/// Replaces every `@PORT` in the arguments with the leased port.
pub fn apply_port_template(args: &[String], port: u16) -> Vec<String> {
    let port = port.to_string();
    args.iter()
        .map(|arg| arg.replace(PORT_PLACEHOLDER, &port))
        .collect()
}

/// `scheme://host[:port]` with the port dropped when it is 80 or 443.
/// Anything that does not parse as an absolute URL is returned unchanged.
pub fn normalize_host_url(raw: &str) -> String {
    let Ok(url) = Url::parse(raw) else {
        return raw.to_string();
    };
    let Some(host) = url.host_str() else {
        return raw.to_string();
    };
    match url.port() {
        None | Some(80) | Some(443) => format!("{}://{host}", url.scheme()),
        Some(port) => format!("{}://{host}:{port}", url.scheme()),
    }
}

/// Exit code for the wrapper: the child's own code, `128 + signo` when it was
/// killed by a signal.
pub fn exit_code(status: ExitStatus) -> u8 {
    if let Some(code) = status.code() {
        return u8::try_from(code).unwrap_or(1);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signo) = status.signal() {
            return u8::try_from(128 + signo).unwrap_or(1);
        }
    }
    1
}

/// Spawns the command with the lease in its environment and waits for it,
/// forwarding termination signals. Stdio is inherited.
pub async fn run(lease: &Lease, command: &[String]) -> anyhow::Result<u8> {
    let args = apply_port_template(command, lease.port);
    let (program, rest) = args.split_first().context("missing command after `--`")?;

    let mut child = Command::new(program)
        .args(rest)
        .env("PORT", lease.port.to_string())
        .env("PORTWRAP_APP", &lease.name)
        .env("PORTWRAP_HOST", normalize_host_url(&lease.https_url))
        .spawn()
        .with_context(|| format!("failed to start {program}"))?;
    debug!(pid = child.id(), program = %program, "child started");

    let status = wait_forwarding_signals(&mut child)
        .await
        .context("failed to wait for child")?;
    debug!(%status, "child exited");
    Ok(exit_code(status))
}

#[cfg(unix)]
async fn wait_forwarding_signals(child: &mut Child) -> std::io::Result<ExitStatus> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut int = signal(SignalKind::interrupt())?;
    let mut term = signal(SignalKind::terminate())?;
    let mut hup = signal(SignalKind::hangup())?;
    let mut quit = signal(SignalKind::quit())?;

    loop {
        let signo = tokio::select! {
            status = child.wait() => return status,
            _ = int.recv() => libc::SIGINT,
            _ = term.recv() => libc::SIGTERM,
            _ = hup.recv() => libc::SIGHUP,
            _ = quit.recv() => libc::SIGQUIT,
        };
        if let Some(pid) = child.id() {
            debug!(pid, signo, "forwarding signal");
            if let Err(e) = common::process::signal(pid, signo) {
                debug!(pid, signo, error = %e, "signal forward failed");
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_forwarding_signals(child: &mut Child) -> std::io::Result<ExitStatus> {
    child.wait().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_placeholder_is_replaced_everywhere() {
        let args = vec![
            "uvicorn".to_string(),
            "--port".to_string(),
            "@PORT".to_string(),
            "--url=http://x:@PORT/@PORT".to_string(),
        ];
        assert_eq!(
            apply_port_template(&args, 11000),
            vec!["uvicorn", "--port", "11000", "--url=http://x:11000/11000"]
        );
    }

    #[test]
    fn host_url_normalization() {
        assert_eq!(normalize_host_url("https://api.localhost"), "https://api.localhost");
        assert_eq!(normalize_host_url("https://api.localhost:443"), "https://api.localhost");
        assert_eq!(normalize_host_url("https://api.localhost:8443"), "https://api.localhost:8443");
        assert_eq!(normalize_host_url("https://api.localhost:80/"), "https://api.localhost");
        assert_eq!(normalize_host_url("not a url"), "not a url");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_codes_are_propagated() {
        let status = Command::new("sh").args(["-c", "exit 7"]).status().await.unwrap();
        assert_eq!(exit_code(status), 7);

        let status = Command::new("sh").args(["-c", "kill -TERM $$"]).status().await.unwrap();
        assert_eq!(exit_code(status), 128 + 15);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_sees_lease_environment() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("env.txt");
        let lease = Lease {
            name: "api".into(),
            host: "api.localhost".into(),
            port: 11042,
            http_url: "http://api.localhost:8080".into(),
            https_url: "https://api.localhost:8443".into(),
            trusted: false,
        };
        let script = format!(
            "echo \"$PORT $PORTWRAP_APP $PORTWRAP_HOST $1\" > {}",
            out.display()
        );
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            script,
            "sh".to_string(),
            "@PORT".to_string(),
        ];

        let code = run(&lease, &command).await.unwrap();

        assert_eq!(code, 0);
        assert_eq!(
            std::fs::read_to_string(&out).unwrap().trim(),
            "11042 api https://api.localhost:8443 11042"
        );
    }
}
