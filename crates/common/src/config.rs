use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

pub const DEFAULT_ADMIN_URL: &str = "http://127.0.0.1:2019";
pub const DEFAULT_ADMIN_TIMEOUT: Duration = Duration::from_secs(4);
pub const DEFAULT_PORT_RANGE: PortRange = PortRange {
    start: 11000,
    end: 19999,
};

const STATE_FILE: &str = "state.json";
const LOCK_FILE: &str = "state.lock";
const PID_FILE: &str = "daemon.pid";
const LOG_FILE: &str = "daemon.log";
const CADDY_CONFIG_FILE: &str = "caddy.json";

/// Connection settings for the proxy admin API, passed explicitly to
/// [`crate::admin::AdminClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminClientConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for AdminClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_ADMIN_URL.to_string(),
            timeout: DEFAULT_ADMIN_TIMEOUT,
        }
    }
}

impl AdminClientConfig {
    /// `host:port` of the admin endpoint, as Caddy expects in `admin.listen`.
    pub fn listen_address(&self) -> &str {
        let rest = self
            .base_url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.base_url);
        rest.split('/').next().unwrap_or(rest)
    }
}

/// Inclusive range of local ports handed out to apps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn iter(&self) -> std::ops::RangeInclusive<u16> {
        self.start..=self.end
    }
}

impl FromStr for PortRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidConfig {
            key: "PORTWRAP_PORT_RANGE",
            value: s.to_string(),
        };
        let (start, end) = s.trim().split_once('-').ok_or_else(invalid)?;
        let start: u16 = start.trim().parse().map_err(|_| invalid())?;
        let end: u16 = end.trim().parse().map_err(|_| invalid())?;
        if start == 0 || start > end {
            return Err(invalid());
        }
        Ok(Self { start, end })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub state_dir: PathBuf,
    pub admin: AdminClientConfig,
    pub port_range: PortRange,
    pub caddy_bin: PathBuf,
    pub caddy_data_dir: PathBuf,
}

impl Config {
    /// Defaults rooted at an explicit state directory, without consulting the
    /// environment.
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        let home = home_dir();
        Self {
            state_dir: state_dir.into(),
            admin: AdminClientConfig::default(),
            port_range: DEFAULT_PORT_RANGE,
            caddy_bin: PathBuf::from("caddy"),
            caddy_data_dir: caddy_data_dir_for_home(&home),
        }
    }

    /// Defaults overridden by `PORTWRAP_*` environment variables.
    pub fn load() -> Result<Self> {
        let state_dir = env::var_os("PORTWRAP_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_state_dir);
        let mut cfg = Self::with_state_dir(state_dir);

        if let Ok(url) = env::var("PORTWRAP_ADMIN_URL") {
            let url = url.trim().trim_end_matches('/').to_string();
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(Error::InvalidConfig {
                    key: "PORTWRAP_ADMIN_URL",
                    value: url,
                });
            }
            cfg.admin.base_url = url;
        }
        if let Ok(ms) = env::var("PORTWRAP_ADMIN_TIMEOUT_MS") {
            let ms: u64 = ms.trim().parse().map_err(|_| Error::InvalidConfig {
                key: "PORTWRAP_ADMIN_TIMEOUT_MS",
                value: ms.clone(),
            })?;
            cfg.admin.timeout = Duration::from_millis(ms);
        }
        if let Ok(range) = env::var("PORTWRAP_PORT_RANGE") {
            cfg.port_range = range.parse()?;
        }
        if let Some(bin) = env::var_os("PORTWRAP_CADDY_BIN") {
            cfg.caddy_bin = PathBuf::from(bin);
        }
        if let Some(dir) =
            env::var_os("PORTWRAP_CADDY_DATA_DIR").or_else(|| env::var_os("CADDY_DATA_DIR"))
        {
            cfg.caddy_data_dir = PathBuf::from(dir);
        }
        Ok(cfg)
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.state_dir.join(LOCK_FILE)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.state_dir.join(PID_FILE)
    }

    pub fn log_file(&self) -> PathBuf {
        self.state_dir.join(LOG_FILE)
    }

    pub fn caddy_config_file(&self) -> PathBuf {
        self.state_dir.join(CADDY_CONFIG_FILE)
    }
}

fn default_state_dir() -> PathBuf {
    let base = env::var_os("XDG_STATE_HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .unwrap_or_else(|| home_dir().join(".local").join("state"));
    base.join("portwrap")
}

/// Home directory of the invoking user. Under `sudo` this is the home of
/// `SUDO_USER`, so state stays shared with unprivileged runs.
pub fn home_dir() -> PathBuf {
    if crate::process::is_root() {
        if let Some(home) = env::var("SUDO_USER").ok().and_then(|u| home_for_user(&u)) {
            return home;
        }
    }
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(unix)]
fn home_for_user(user: &str) -> Option<PathBuf> {
    use std::ffi::{CStr, CString};

    let name = CString::new(user).ok()?;
    // SAFETY: getpwnam returns null or a pointer to static storage; the
    // directory string is copied out before any other passwd lookup.
    unsafe {
        let entry = libc::getpwnam(name.as_ptr());
        if entry.is_null() || (*entry).pw_dir.is_null() {
            return None;
        }
        let dir = CStr::from_ptr((*entry).pw_dir).to_str().ok()?;
        (!dir.is_empty()).then(|| PathBuf::from(dir))
    }
}

#[cfg(not(unix))]
fn home_for_user(_user: &str) -> Option<PathBuf> {
    None
}

fn caddy_data_dir_for_home(home: &Path) -> PathBuf {
    if cfg!(target_os = "macos") {
        home.join("Library").join("Application Support").join("Caddy")
    } else if cfg!(windows) {
        home.join("AppData").join("Roaming").join("Caddy")
    } else {
        home.join(".local").join("share").join("caddy")
    }
}
