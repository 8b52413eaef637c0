//! Local CA lookup and trust-store checks.
//!
//! Installing the CA is delegated to the proxy binary (`caddy trust`), which
//! knows every platform store. This module only fetches the root and checks
//! whether the platform root store (or a system bundle) already contains it.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info};
use x509_parser::pem::Pem;

use crate::admin::AdminClient;
use crate::config::Config;
use crate::{Error, Result};

pub const LOCAL_CA_ID: &str = "local";

const SYSTEM_BUNDLES: &[&str] = &[
    "/etc/ssl/certs/ca-certificates.crt",
    "/etc/pki/tls/certs/ca-bundle.crt",
    "/etc/ssl/ca-bundle.pem",
    "/etc/pki/ca-trust/extracted/pem/tls-ca-bundle.pem",
    "/etc/ssl/cert.pem",
    "/usr/local/etc/openssl/cert.pem",
];

const SYSTEM_CERT_DIRS: &[&str] = &["/etc/ssl/certs", "/usr/local/share/ca-certificates"];

#[derive(Debug, Clone)]
pub struct RootCertificate {
    pub pem: String,
    pub der: Vec<u8>,
    pub subject: String,
}

#[derive(Deserialize)]
struct CaInfo {
    root_certificate: String,
}

impl RootCertificate {
    pub fn from_pem(pem: &str) -> Result<Self> {
        let (_, block) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
            .map_err(|e| Error::TrustUnavailable(format!("invalid root certificate PEM: {e}")))?;
        let subject = block
            .parse_x509()
            .map_err(|e| Error::TrustUnavailable(format!("invalid root certificate: {e}")))?
            .subject()
            .to_string();
        Ok(Self {
            pem: pem.to_string(),
            der: block.contents.clone(),
            subject,
        })
    }
}

pub async fn fetch_root(admin: &AdminClient, ca_id: &str) -> Result<RootCertificate> {
    let path = format!("/pki/ca/{ca_id}");
    let info: CaInfo = admin
        .get_json(&path)
        .await
        .map_err(|e| Error::TrustUnavailable(e.to_string()))?
        .ok_or_else(|| Error::TrustUnavailable(format!("CA {ca_id:?} does not exist")))?;
    RootCertificate::from_pem(&info.root_certificate)
}

/// Whether the certificate is a trusted root: present in the platform store
/// (the keychain on macOS, the system store on Windows, the OpenSSL locations
/// elsewhere) or in one of the known bundle files.
///
/// Blocking; the platform store can take a while to enumerate.
pub fn is_installed(cert: &RootCertificate) -> bool {
    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        debug!(error = %e, "skipping unreadable platform root");
    }
    contains_der(native.certs.iter().map(|c| &c[..]), &cert.der)
        || bundle_files().iter().any(|path| bundle_contains(path, &cert.der))
}

fn contains_der<'a>(mut certs: impl Iterator<Item = &'a [u8]>, der: &[u8]) -> bool {
    certs.any(|c| c == der)
}

async fn is_installed_blocking(cert: RootCertificate) -> bool {
    tokio::task::spawn_blocking(move || is_installed(&cert))
        .await
        .unwrap_or(false)
}

/// Fetches the local CA and checks it against the platform roots. Any failure
/// reads as "not trusted".
pub async fn is_trusted(admin: &AdminClient) -> bool {
    match fetch_root(admin, LOCAL_CA_ID).await {
        Ok(cert) => is_installed_blocking(cert).await,
        Err(e) => {
            debug!(error = %e, "trust check unavailable");
            false
        }
    }
}

/// Installs the proxy's local CA into the system stores via `caddy trust`.
pub async fn install(config: &Config, admin: &AdminClient) -> Result<()> {
    let cert = fetch_root(admin, LOCAL_CA_ID).await?;
    let subject = cert.subject.clone();
    if is_installed_blocking(cert).await {
        debug!(%subject, "local CA already trusted");
        return Ok(());
    }
    info!(%subject, "installing local CA");
    let status = tokio::process::Command::new(&config.caddy_bin)
        .arg("trust")
        .arg("--address")
        .arg(config.admin.listen_address())
        .status()
        .await
        .map_err(|e| {
            Error::TrustUnavailable(format!("failed to run {}: {e}", config.caddy_bin.display()))
        })?;
    if !status.success() {
        return Err(Error::TrustUnavailable(format!(
            "{} trust exited with {status}",
            config.caddy_bin.display()
        )));
    }
    Ok(())
}

fn bundle_files() -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = env::var_os("SSL_CERT_FILE")
        .map(PathBuf::from)
        .into_iter()
        .chain(SYSTEM_BUNDLES.iter().map(PathBuf::from))
        .collect();

    let dirs = env::var_os("SSL_CERT_DIR")
        .map(|v| env::split_paths(&v).collect::<Vec<_>>())
        .unwrap_or_default()
        .into_iter()
        .chain(SYSTEM_CERT_DIRS.iter().map(PathBuf::from));
    for dir in dirs {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        files.extend(
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    p.extension()
                        .is_some_and(|ext| ext == "pem" || ext == "crt")
                }),
        );
    }
    files
}

fn bundle_contains(path: &Path, der: &[u8]) -> bool {
    let Ok(raw) = fs::read(path) else {
        return false;
    };
    Pem::iter_from_buffer(&raw)
        .filter_map(|pem| pem.ok())
        .any(|pem| pem.contents == der)
}
