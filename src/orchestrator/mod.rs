pub mod control;
pub mod session;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::core::{CoreOptions, CoreSupervisor, ProxyCore};
use crate::error::ConnectError;
use crate::node::NodeDescriptor;
use crate::platform::{self, AutostartRegistrar, SystemProxy};
use crate::prefs::{JsonPreferenceStore, PreferenceStore, Preferences};
use crate::probe::{select_least_delay, LatencyProbe, TcpProber};
use crate::settings::{AppPaths, Settings};
use crate::subscription::{NodeDirectory, SubscriptionDirectory};

pub use self::control::{spawn, Command, OrchestratorHandle};
pub use self::session::{should_fail_over, ConnectionSession, ConnectionState, StatusSnapshot};

const DISCONNECTED_MESSAGE: &str = "Disconnected";
const AUTOSTART_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub connect_probe_timeout: Duration,
    pub health_probe_timeout: Duration,
    pub failover_margin_ms: u64,
    pub health_interval: Duration,
    pub speed_interval: Duration,
    /// Local inbound the system hook points traffic at.
    pub proxy_port: u16,
    pub autostart_timeout: Duration,
}

impl From<&Settings> for OrchestratorConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            connect_probe_timeout: Duration::from_millis(settings.connect_probe_timeout_ms),
            health_probe_timeout: Duration::from_millis(settings.health_probe_timeout_ms),
            failover_margin_ms: settings.failover_margin_ms,
            health_interval: Duration::from_secs(settings.health_interval_secs),
            speed_interval: Duration::from_millis(settings.speed_interval_ms),
            proxy_port: settings.http_port,
            autostart_timeout: AUTOSTART_TIMEOUT,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

pub struct Collaborators {
    pub directory: Arc<dyn NodeDirectory>,
    pub prober: Arc<dyn LatencyProbe>,
    pub core: Box<dyn ProxyCore>,
    pub proxy: Box<dyn SystemProxy>,
    pub prefs: Box<dyn PreferenceStore>,
    pub autostart: Box<dyn AutostartRegistrar>,
}

impl Collaborators {
    pub fn system(paths: &AppPaths, settings: &Settings) -> Self {
        Self {
            directory: Arc::new(SubscriptionDirectory::new(settings.subscription_paths(paths))),
            prober: Arc::new(TcpProber),
            core: Box::new(CoreSupervisor::new(CoreOptions::new(paths, settings))),
            proxy: platform::default_proxy(),
            prefs: Box::new(JsonPreferenceStore::new(paths.state_path())),
            autostart: platform::default_autostart(),
        }
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    directory: Arc<dyn NodeDirectory>,
    prober: Arc<dyn LatencyProbe>,
    core: Box<dyn ProxyCore>,
    proxy: Box<dyn SystemProxy>,
    prefs: Arc<Mutex<Box<dyn PreferenceStore>>>,
    autostart: Arc<dyn AutostartRegistrar>,
    session: Option<ConnectionSession>,
    session_epoch: u64,
    tun_enabled: bool,
    message: String,
    autostart_attempted: bool,
    status_tx: watch::Sender<StatusSnapshot>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            directory,
            prober,
            core,
            proxy,
            prefs,
            autostart,
        } = collaborators;
        let tun_enabled = prefs.load().tun_enabled;
        let (status_tx, _) = watch::channel(StatusSnapshot {
            tun_enabled,
            ..StatusSnapshot::default()
        });

        Self {
            config,
            directory,
            prober,
            core,
            proxy,
            prefs: Arc::new(Mutex::new(prefs)),
            autostart: Arc::from(autostart),
            session: None,
            session_epoch: 0,
            tun_enabled,
            message: DISCONNECTED_MESSAGE.to_string(),
            autostart_attempted: false,
            status_tx,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        if self.session.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&ConnectionSession> {
        self.session.as_ref()
    }

    /// Bumped every time a new session becomes active.
    pub fn session_epoch(&self) -> u64 {
        self.session_epoch
    }

    pub fn tun_enabled(&self) -> bool {
        self.tun_enabled
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status_tx.subscribe()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state(),
            message: self.message.clone(),
            node: self.session.as_ref().map(|s| s.node.name.clone()),
            delay_ms: self.session.as_ref().map(|s| s.delay_ms),
            speed_kbps: self.session.as_ref().map_or(0.0, |s| s.speed_kbps),
            tun_enabled: self.tun_enabled,
        }
    }

    fn publish(&self) -> StatusSnapshot {
        let snapshot = self.snapshot();
        self.status_tx.send_replace(snapshot.clone());
        snapshot
    }

    pub async fn toggle(&mut self) -> StatusSnapshot {
        if self.is_connected() {
            info!("disconnect requested");
            self.disconnect().await;
            self.message = DISCONNECTED_MESSAGE.to_string();
        } else {
            info!("connect requested");
            self.establish().await;
        }
        self.publish()
    }

    pub async fn tun_mode_changed(&mut self, enabled: bool) -> StatusSnapshot {
        self.tun_enabled = enabled;
        if let Err(e) = update_prefs(&self.prefs, |prefs| prefs.tun_enabled = enabled) {
            warn!(error = %e, "failed to persist tun preference");
        }

        if self.is_connected() {
            info!(tun = enabled, "tun mode changed; reconnecting");
            self.disconnect().await;
            self.establish().await;
        }
        self.publish()
    }

    /// Recovers a dead core, or fails over to a clearly faster node.
    pub async fn health_check(&mut self) -> StatusSnapshot {
        if !self.is_connected() {
            return self.snapshot();
        }

        if !self.core.is_running() {
            warn!("proxy core is gone; reconnecting");
            self.disconnect().await;
            self.establish().await;
            return self.publish();
        }

        let nodes = self.directory.load_nodes().await;
        if nodes.len() < 2 {
            debug!(candidates = nodes.len(), "not enough nodes to consider failover");
            return self.snapshot();
        }

        let results = self
            .prober
            .probe_all(&nodes, self.config.health_probe_timeout)
            .await;
        let Some(session) = self.session.as_mut() else {
            return self.snapshot();
        };
        if let Some(fresh) = results
            .iter()
            .find(|r| r.node.original_uri == session.node.original_uri)
        {
            session.delay_ms = fresh.delay_ms;
        }

        let Some(best) = select_least_delay(results) else {
            debug!("no node answered the health probe");
            return self.publish();
        };
        if !should_fail_over(
            session,
            &best.node.original_uri,
            best.delay_ms,
            self.config.failover_margin_ms,
        ) {
            return self.publish();
        }

        info!(
            from = %session.node.name,
            from_delay_ms = session.delay_ms,
            to = %best.node.name,
            to_delay_ms = best.delay_ms,
            "failing over to faster node"
        );
        self.disconnect().await;
        self.message = match self.activate(best.node, best.delay_ms).await {
            Ok(message) => message,
            Err(e) => {
                warn!(tag = e.tag(), error = %e, "failover failed");
                e.to_string()
            }
        };
        self.publish()
    }

    pub async fn sample_throughput(&mut self) -> StatusSnapshot {
        if !self.is_connected() {
            return self.snapshot();
        }
        let traffic = self.core.query_cumulative_traffic().await;
        if let Some(session) = self.session.as_mut() {
            match traffic {
                Ok(bytes) => {
                    session.record_traffic(bytes, Instant::now());
                }
                Err(e) => {
                    debug!(error = %e, "traffic counters unavailable");
                    session.record_idle();
                }
            }
        }
        self.publish()
    }

    /// Tears everything down regardless of state. Safe to call repeatedly.
    pub async fn shutdown(&mut self) -> StatusSnapshot {
        self.disconnect().await;
        self.message = DISCONNECTED_MESSAGE.to_string();
        self.publish()
    }

    async fn establish(&mut self) {
        self.message = match self.connect().await {
            Ok(message) => message,
            Err(e) => {
                warn!(tag = e.tag(), error = %e, "connect failed");
                e.to_string()
            }
        };
    }

    async fn connect(&mut self) -> Result<String, ConnectError> {
        let nodes = self.directory.load_nodes().await;
        if nodes.is_empty() {
            return Err(ConnectError::NoNodesAvailable);
        }

        let best = self
            .prober
            .pick_least_delay(&nodes, self.config.connect_probe_timeout)
            .await
            .ok_or(ConnectError::AllProbesTimedOut)?;
        debug!(node = %best.node.name, delay_ms = best.delay_ms, "selected node");

        let message = self.activate(best.node, best.delay_ms).await?;
        self.register_autostart_once();
        Ok(message)
    }

    /// Starts the core and enables the hook; on hook failure the core is
    /// stopped again so nothing is left behind.
    async fn activate(&mut self, node: NodeDescriptor, delay_ms: u64) -> Result<String, ConnectError> {
        let message = self.core.start(&node, self.tun_enabled).await?;
        if let Err(e) = self.proxy.set_enabled(true, self.config.proxy_port) {
            warn!(error = %e, "enabling system proxy failed; stopping core");
            self.core.stop().await;
            return Err(ConnectError::SystemHookFailure(e.to_string()));
        }

        info!(node = %node.name, delay_ms, tun = self.tun_enabled, "connected");
        self.session = Some(ConnectionSession::new(node, delay_ms));
        self.session_epoch = self.session_epoch.wrapping_add(1);
        Ok(message)
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.proxy.set_enabled(false, self.config.proxy_port) {
            debug!(error = %e, "disabling system proxy failed");
        }
        self.core.stop().await;
        if let Some(session) = self.session.take() {
            info!(node = %session.node.name, "disconnected");
        }
    }

    fn register_autostart_once(&mut self) {
        if self.autostart_attempted {
            return;
        }
        self.autostart_attempted = true;

        let configured = lock_prefs(&self.prefs).load().autostart_configured;
        if configured {
            return;
        }
        let registrar = Arc::clone(&self.autostart);
        let prefs = Arc::clone(&self.prefs);
        let timeout = self.config.autostart_timeout;
        tokio::spawn(async move {
            let registered = tokio::time::timeout(timeout, registrar.ensure_registered())
                .await
                .unwrap_or(false);
            if !registered {
                debug!("autostart not registered");
                return;
            }
            match update_prefs(&prefs, |prefs| prefs.autostart_configured = true) {
                Ok(()) => info!("autostart registered"),
                Err(e) => warn!(error = %e, "failed to persist autostart flag"),
            }
        });
    }
}

fn lock_prefs(
    store: &Mutex<Box<dyn PreferenceStore>>,
) -> std::sync::MutexGuard<'_, Box<dyn PreferenceStore>> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

fn update_prefs(
    store: &Mutex<Box<dyn PreferenceStore>>,
    change: impl FnOnce(&mut Preferences),
) -> std::io::Result<()> {
    let store = lock_prefs(store);
    let mut prefs = store.load();
    change(&mut prefs);
    store.save(&prefs)
}
