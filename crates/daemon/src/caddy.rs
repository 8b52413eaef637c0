//! Bootstrap config and process handling for the supervised Caddy instance.

use std::fs;
use std::path::Path;
use std::process::Stdio;

use anyhow::Context;
use common::config::Config;
use common::ports::ProxyPorts;
use common::topology::{MANAGED_HTTPS_SERVER, MANAGED_HTTP_SERVER};
use serde_json::{json, Map, Value};
use tokio::process::{Child, Command};

/// Initial config: admin endpoint, shared certificate storage, the two
/// managed servers with no routes, and an internal-issuer catch-all policy.
pub fn render(config: &Config, ports: ProxyPorts) -> Value {
    let mut servers = Map::new();
    servers.insert(
        MANAGED_HTTP_SERVER.to_string(),
        json!({
            "listen": [format!(":{}", ports.http)],
            "routes": [],
        }),
    );
    servers.insert(
        MANAGED_HTTPS_SERVER.to_string(),
        json!({
            "listen": [format!(":{}", ports.https)],
            "tls_connection_policies": [{}],
            "routes": [],
        }),
    );

    json!({
        "admin": {"listen": config.admin.listen_address()},
        "storage": {
            "module": "file_system",
            "root": config.caddy_data_dir,
        },
        "apps": {
            "http": {"servers": servers},
            "tls": {
                "automation": {
                    "policies": [{"issuers": [{"module": "internal"}]}],
                },
            },
        },
    })
}

pub fn write_config(path: &Path, config: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let body = serde_json::to_vec_pretty(config).context("failed to encode proxy config")?;
    fs::write(path, body).with_context(|| format!("failed to write {}", path.display()))
}

/// Starts `caddy run --config <path>`. Output goes wherever the daemon's own
/// output goes, which is `daemon.log` when launched by `portwrap proxy start`.
pub fn spawn(caddy_bin: &Path, config_path: &Path) -> anyhow::Result<Child> {
    Command::new(caddy_bin)
        .arg("run")
        .arg("--config")
        .arg(config_path)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to start {}", caddy_bin.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use common::config::AdminClientConfig;

    fn config() -> Config {
        let mut config = Config::with_state_dir("/tmp/portwrap-test");
        config.admin = AdminClientConfig {
            base_url: "http://127.0.0.1:2999".into(),
            timeout: Duration::from_secs(1),
        };
        config.caddy_data_dir = "/tmp/caddy-data".into();
        config
    }

    #[test]
    fn rendered_config_shape() {
        let value = render(
            &config(),
            ProxyPorts {
                http: 8080,
                https: 8443,
            },
        );

        assert_eq!(value["admin"]["listen"], "127.0.0.1:2999");
        assert_eq!(value["storage"]["module"], "file_system");
        assert_eq!(value["storage"]["root"], "/tmp/caddy-data");

        let servers = &value["apps"]["http"]["servers"];
        assert_eq!(servers["portwrap-http"]["listen"], json!([":8080"]));
        assert_eq!(servers["portwrap-http"]["routes"], json!([]));
        assert!(servers["portwrap-http"].get("tls_connection_policies").is_none());
        assert_eq!(servers["portwrap-https"]["listen"], json!([":8443"]));
        assert_eq!(servers["portwrap-https"]["tls_connection_policies"], json!([{}]));

        assert_eq!(
            value["apps"]["tls"]["automation"]["policies"],
            json!([{"issuers": [{"module": "internal"}]}])
        );
    }

    #[test]
    fn rendered_config_resolves_as_self_managed() {
        let value = render(
            &config(),
            ProxyPorts {
                http: 9080,
                https: 9443,
            },
        );
        let servers: common::topology::Servers =
            serde_json::from_value(value["apps"]["http"]["servers"].clone()).unwrap();
        let topology = common::topology::resolve(&servers).unwrap();

        assert_eq!(
            topology.ownership,
            common::topology::ProxyOwnership::SelfManaged
        );
        assert_eq!((topology.http_port, topology.https_port), (9080, 9443));
    }

    #[test]
    fn config_file_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("caddy.json");
        write_config(&path, &json!({"admin": {}})).unwrap();

        let read: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(read, json!({"admin": {}}));
    }
}
