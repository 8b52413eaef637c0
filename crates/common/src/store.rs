//! File-backed state store.
//!
//! `state.json` is only mutated while holding the exclusive `flock` on
//! `state.lock`. Writes go to a temporary sibling and are renamed into place,
//! so readers never observe a partially written document.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::Config;
use crate::{Error, ProxyState, Result, STATE_VERSION};

/// Exclusive cross-process lock on the state directory. Released on drop.
///
/// Operations that read-modify-write the state take `&StateLock` to prove the
/// caller holds it; the lock is never taken twice by one operation.
#[derive(Debug)]
pub struct StateLock {
    file: File,
    path: PathBuf,
}

impl StateLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "failed to release state lock");
        }
    }
}

/// Only the schema version, so a newer file is recognized even when the rest
/// of its shape no longer parses.
#[derive(Deserialize)]
struct VersionHeader {
    #[serde(default)]
    version: u32,
}

enum Contents {
    Missing,
    Corrupt(serde_json::Error),
    Valid(ProxyState),
}

#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
    state_path: PathBuf,
    lock_path: PathBuf,
    pid_path: PathBuf,
}

impl StateStore {
    pub fn new(config: &Config) -> Self {
        Self {
            dir: config.state_dir.clone(),
            state_path: config.state_file(),
            lock_path: config.lock_file(),
            pid_path: config.pid_file(),
        }
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn pid_path(&self) -> &Path {
        &self.pid_path
    }

    fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .map_err(Error::io(format!("create state dir {}", self.dir.display())))
    }

    /// Blocks until the exclusive state lock is held. There is no timeout.
    pub async fn lock(&self) -> Result<StateLock> {
        self.ensure_dir()?;
        let path = self.lock_path.clone();
        let task = tokio::task::spawn_blocking(move || lock_blocking(path));
        match task.await {
            Ok(result) => result,
            Err(join) => Err(Error::LockAcquisition {
                path: self.lock_path.clone(),
                source: io::Error::other(join),
            }),
        }
    }

    /// Reads the persisted state. A missing file yields the default state.
    ///
    /// A file written by a newer schema is an error, checked before anything
    /// else is parsed. An otherwise unparsable file reads as the default
    /// state and stays on disk; it is moved aside by the [`save`](Self::save)
    /// that replaces it. Loading never modifies the state directory.
    pub fn load(&self) -> Result<ProxyState> {
        match self.read_contents()? {
            Contents::Missing => Ok(ProxyState::default()),
            Contents::Corrupt(e) => {
                warn!(
                    path = %self.state_path.display(),
                    error = %e,
                    "state file is corrupt; starting from empty state"
                );
                Ok(ProxyState::default())
            }
            Contents::Valid(state) => Ok(state),
        }
    }

    fn read_contents(&self) -> Result<Contents> {
        let raw = match fs::read(&self.state_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Contents::Missing),
            Err(e) => {
                return Err(Error::io(format!("read {}", self.state_path.display()))(e));
            }
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Contents::Missing);
        }

        let header: VersionHeader = match serde_json::from_slice(&raw) {
            Ok(header) => header,
            Err(e) => return Ok(Contents::Corrupt(e)),
        };
        if header.version > STATE_VERSION {
            return Err(Error::UnsupportedStateVersion {
                path: self.state_path.clone(),
                found: header.version,
                supported: STATE_VERSION,
            });
        }

        let mut state: ProxyState = match serde_json::from_slice(&raw) {
            Ok(state) => state,
            Err(e) => return Ok(Contents::Corrupt(e)),
        };
        if state.version == 0 {
            debug!("migrating unversioned state file to version {STATE_VERSION}");
            state.version = STATE_VERSION;
        }
        for (name, app) in state.apps.iter_mut() {
            if app.name.is_empty() {
                app.name = name.clone();
            }
        }
        Ok(Contents::Valid(state))
    }

    /// Atomically replaces the state file. A corrupt file being replaced is
    /// first renamed to `state.json.corrupt-<unix-ts>`.
    pub fn save(&self, state: &ProxyState) -> Result<()> {
        self.ensure_dir()?;
        let mut body = serde_json::to_vec_pretty(state).map_err(Error::json("state"))?;
        body.push(b'\n');

        if let Contents::Corrupt(e) = self.read_contents()? {
            let moved_to = self.quarantine()?;
            warn!(
                path = %self.state_path.display(),
                moved_to = %moved_to.display(),
                error = %e,
                "moved corrupt state file aside"
            );
        }

        let tmp = self.state_path.with_extension("json.tmp");
        let write = || -> io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
            fs::rename(&tmp, &self.state_path)
        };
        write().map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Error::io(format!("write {}", self.state_path.display()))(e)
        })
    }

    fn quarantine(&self) -> Result<PathBuf> {
        let stamp = chrono::Utc::now().timestamp();
        let mut name = self.state_path.as_os_str().to_owned();
        name.push(format!(".corrupt-{stamp}"));
        let target = PathBuf::from(name);
        fs::rename(&self.state_path, &target)
            .map_err(Error::io(format!("move corrupt {}", self.state_path.display())))?;
        Ok(target)
    }

    pub fn read_pid(&self) -> Option<u32> {
        fs::read_to_string(&self.pid_path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    pub fn write_pid(&self, pid: u32) -> Result<()> {
        self.ensure_dir()?;
        fs::write(&self.pid_path, pid.to_string())
            .map_err(Error::io(format!("write {}", self.pid_path.display())))
    }

    pub fn clear_pid(&self) -> Result<()> {
        match fs::remove_file(&self.pid_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(format!("remove {}", self.pid_path.display()))(e)),
        }
    }
}

fn lock_blocking(path: PathBuf) -> Result<StateLock> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path);
    let file = match file {
        Ok(file) => file,
        Err(source) => return Err(Error::LockAcquisition { path, source }),
    };
    if let Err(source) = file.lock_exclusive() {
        return Err(Error::LockAcquisition { path, source });
    }
    debug!(path = %path.display(), "acquired state lock");
    Ok(StateLock { file, path })
}
