//! Lease lifecycle: the only code path that mutates `state.json`.
//!
//! Every operation runs as one critical section under the state lock:
//! reload, evict dead owners, mutate, push routes and TLS policy to the
//! proxy, persist. A failure before the persist step leaves the file as it
//! was.

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::admin::AdminClient;
use crate::config::Config;
use crate::store::{StateLock, StateStore};
use crate::topology::{self, ServerTopology};
use crate::{host, ports, process, routes, tls, trust};
use crate::{AppLease, Lease, ProxyState, ProxyStatus, Result};

#[derive(Debug, Clone)]
pub struct LeaseManager {
    config: Config,
    store: StateStore,
    admin: AdminClient,
}

impl LeaseManager {
    pub fn new(config: Config) -> Result<Self> {
        let admin = AdminClient::new(&config.admin)?;
        Ok(Self::with_admin(config, admin))
    }

    pub fn with_admin(config: Config, admin: AdminClient) -> Self {
        let store = StateStore::new(&config);
        Self {
            config,
            store,
            admin,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn admin(&self) -> &AdminClient {
        &self.admin
    }

    /// Registers `name` for `pid`, allocating a port on first use, and routes
    /// its host to that port.
    pub async fn acquire(&self, name: &str, custom_host: Option<&str>, pid: u32) -> Result<Lease> {
        host::validate_name(name)?;
        let host = host::host_for_app(name, custom_host)?;

        let lock = self.store.lock().await?;
        let mut state = self.load_live(&lock)?;

        let app = match state.apps.get_mut(name) {
            Some(app) => {
                debug!(name, old_pid = app.pid, pid, "re-acquiring existing lease");
                if app.host != host {
                    info!(name, from = %app.host, to = %host, "lease host changed");
                    app.host = host;
                }
                app.pid = pid;
                app.started_at = Utc::now();
                app.clone()
            }
            None => {
                let port = ports::allocate(self.config.port_range, &state.used_ports())?;
                let app = AppLease {
                    name: name.to_string(),
                    host,
                    port,
                    pid,
                    started_at: Utc::now(),
                };
                state.apps.insert(name.to_string(), app.clone());
                app
            }
        };

        let topology = self.commit(&lock, &mut state).await?;
        drop(lock);

        info!(
            name,
            host = %app.host,
            port = app.port,
            pid,
            "lease acquired"
        );
        let trusted = trust::is_trusted(&self.admin).await;
        Ok(Lease::new(
            &app,
            topology.http_port,
            topology.https_port,
            trusted,
        ))
    }

    /// Drops the lease for `name` if `pid` still owns it. Never fails: errors
    /// are logged, and a lease re-acquired by another process is left alone.
    pub async fn release(&self, name: &str, pid: u32) {
        if let Err(e) = self.try_release(name, pid).await {
            warn!(name, pid, error = %e, "failed to release lease");
        }
    }

    async fn try_release(&self, name: &str, pid: u32) -> Result<()> {
        let lock = self.store.lock().await?;
        let mut state = self.load_live(&lock)?;
        match state.apps.get(name).map(|app| app.pid) {
            None => {
                debug!(name, "release: no lease recorded");
                return self.persist_if_evicted(&lock, &mut state).await;
            }
            Some(owner_pid) if owner_pid != pid => {
                info!(
                    event = "release_owner_mismatch",
                    name,
                    pid,
                    owner_pid,
                    "release ignored; lease is owned by another process"
                );
                return self.persist_if_evicted(&lock, &mut state).await;
            }
            Some(_) => {}
        }
        state.apps.remove(name);
        self.commit(&lock, &mut state).await?;
        info!(name, pid, "lease released");
        Ok(())
    }

    /// Deletes `name` regardless of owner. Returns whether a lease existed.
    pub async fn remove(&self, name: &str) -> Result<bool> {
        host::validate_name(name)?;
        let lock = self.store.lock().await?;
        let mut state = self.load_live(&lock)?;
        if state.apps.remove(name).is_none() {
            self.persist_if_evicted(&lock, &mut state).await?;
            return Ok(false);
        }
        self.commit(&lock, &mut state).await?;
        info!(name, "lease removed");
        Ok(true)
    }

    /// Aggregate view of the proxy and the live leases. When the control
    /// plane is down this reports `running: false` with the local leases.
    pub async fn status(&self) -> Result<ProxyStatus> {
        if !self.admin.healthy().await {
            let lock = self.store.lock().await?;
            let mut state = self.store.load()?;
            if !state.evict_dead().is_empty() {
                self.store.save(&state)?;
            }
            drop(lock);
            return Ok(ProxyStatus {
                running: false,
                caddy_source: state.caddy_source,
                root: state.root,
                http_port: state.http_port,
                https_port: state.https_port,
                trusted: false,
                pid: 0,
                apps: state.apps.into_values().collect(),
            });
        }

        let lock = self.store.lock().await?;
        let mut state = self.load_live(&lock)?;
        self.persist_if_evicted(&lock, &mut state).await?;
        drop(lock);

        let topology = topology::inspect(&self.admin).await?;
        let pid = match topology.ownership {
            topology::ProxyOwnership::SelfManaged => self
                .store
                .read_pid()
                .filter(|pid| process::is_alive(*pid))
                .unwrap_or(0),
            topology::ProxyOwnership::External => 0,
        };
        Ok(ProxyStatus {
            running: true,
            caddy_source: topology.ownership.source(),
            root: topology.is_root(),
            http_port: topology.http_port,
            https_port: topology.https_port,
            trusted: trust::is_trusted(&self.admin).await,
            pid,
            apps: state.into_inner().apps.into_values().collect(),
        })
    }

    /// Live leases sorted by name.
    pub async fn list(&self) -> Result<Vec<AppLease>> {
        Ok(self.status().await?.apps)
    }

    /// Pushes the routes and TLS policy for `state` to the proxy and returns
    /// the topology they were written to.
    pub async fn apply(&self, _lock: &StateLock, state: &ProxyState) -> Result<ServerTopology> {
        let servers = topology::fetch_servers(&self.admin).await?;
        let topology = topology::resolve(&servers)?;
        routes::reconcile(&self.admin, &servers, &topology, &state.apps).await?;
        tls::sync(&self.admin, state.apps.values()).await?;
        Ok(topology)
    }

    /// Loads the state with dead owners already evicted. The evicted state is
    /// only persisted by the caller.
    pub fn load_live(&self, _lock: &StateLock) -> Result<LiveState> {
        let mut state = self.store.load()?;
        let evicted = state.evict_dead();
        if !evicted.is_empty() {
            info!(apps = ?evicted, "evicted leases with dead owners");
        }
        Ok(LiveState { state, evicted })
    }

    /// Applies `state` to the proxy, records the topology it landed on and
    /// persists it.
    pub async fn commit(&self, lock: &StateLock, state: &mut ProxyState) -> Result<ServerTopology> {
        let topology = self.apply(lock, state).await?;
        state.caddy_source = topology.ownership.source();
        state.set_ports(topology.http_port, topology.https_port);
        self.store.save(state)?;
        Ok(topology)
    }

    async fn persist_if_evicted(&self, lock: &StateLock, live: &mut LiveState) -> Result<()> {
        if live.evicted.is_empty() {
            return Ok(());
        }
        self.commit(lock, live).await.map(|_| ())
    }
}

/// State after eviction, remembering which apps were dropped.
#[derive(Debug)]
pub struct LiveState {
    state: ProxyState,
    pub evicted: Vec<String>,
}

impl std::ops::Deref for LiveState {
    type Target = ProxyState;

    fn deref(&self) -> &ProxyState {
        &self.state
    }
}

impl std::ops::DerefMut for LiveState {
    fn deref_mut(&mut self) -> &mut ProxyState {
        &mut self.state
    }
}

impl LiveState {
    pub fn into_inner(self) -> ProxyState {
        self.state
    }
}
