pub mod config;
pub mod process;
pub mod stats;

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;

use crate::error::ConnectError;
use crate::node::NodeDescriptor;
use crate::settings::{ensure_dir, AppPaths, Settings};

pub use self::config::{build_core_config, LocalPorts};
pub use self::stats::{parse_statsquery, TrafficCounters};

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[async_trait]
pub trait ProxyCore: Send {
    /// Launches the core for `node`. The caller must `stop` any previous run
    /// first. On error nothing is left running.
    async fn start(&mut self, node: &NodeDescriptor, tun_enabled: bool)
        -> Result<String, ConnectError>;

    async fn stop(&mut self);

    fn is_running(&mut self) -> bool;

    /// Uplink plus downlink bytes of the proxy outbound since the core started.
    /// 0 when nothing runs.
    async fn query_cumulative_traffic(&mut self) -> Result<u64, ConnectError>;
}

#[derive(Debug, Clone)]
pub struct CoreOptions {
    pub exe_path: PathBuf,
    pub runtime_dir: PathBuf,
    pub config_path: PathBuf,
    pub log_path: PathBuf,
    pub ports: LocalPorts,
    pub settle: Duration,
    pub stop_timeout: Duration,
    pub stats_timeout: Duration,
    pub log_max_bytes: u64,
    pub log_keep_bytes: u64,
}

impl CoreOptions {
    pub fn new(paths: &AppPaths, settings: &Settings) -> Self {
        Self {
            exe_path: paths.core_exe(),
            runtime_dir: paths.runtime_dir(),
            config_path: paths.active_config_path(),
            log_path: paths.core_log_path(),
            ports: LocalPorts {
                socks: settings.socks_port,
                http: settings.http_port,
                api: settings.api_port,
            },
            settle: settings.core_settle(),
            stop_timeout: settings.core_stop_timeout(),
            stats_timeout: settings.stats_query_timeout(),
            log_max_bytes: settings.core_log_max_bytes,
            log_keep_bytes: settings.core_log_keep_bytes,
        }
    }
}

pub struct CoreSupervisor {
    options: CoreOptions,
    child: Option<Child>,
    #[cfg(target_os = "windows")]
    job: Option<process::JobHandle>,
}

impl CoreSupervisor {
    pub fn new(options: CoreOptions) -> Self {
        Self {
            options,
            child: None,
            #[cfg(target_os = "windows")]
            job: None,
        }
    }

    pub fn options(&self) -> &CoreOptions {
        &self.options
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    fn write_config(&self, node: &NodeDescriptor, tun_enabled: bool) -> Result<(), ConnectError> {
        ensure_dir(&self.options.runtime_dir).map_err(ConnectError::ConfigWrite)?;
        let config = build_core_config(node, tun_enabled, self.options.ports, &self.options.runtime_dir);
        let content = serde_json::to_string_pretty(&config)
            .map_err(|e| ConnectError::ConfigWrite(e.into()))?;
        fs::write(&self.options.config_path, content).map_err(ConnectError::ConfigWrite)
    }

    fn spawn(&mut self) -> Result<(), ConnectError> {
        if let Err(e) = process::trim_log_file(
            &self.options.log_path,
            self.options.log_keep_bytes,
            self.options.log_max_bytes,
        ) {
            debug!(error = %e, "core log trim failed");
        }
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.options.log_path)
            .map_err(ConnectError::CoreSpawn)?;

        let mut cmd = Command::new(&self.options.exe_path);
        cmd.arg("run").arg("-c").arg(&self.options.config_path);
        if let Some(dir) = self.options.exe_path.parent() {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(log_file.try_clone().map_err(ConnectError::CoreSpawn)?));
        cmd.stderr(Stdio::from(log_file));

        #[cfg(target_os = "windows")]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let child = cmd.spawn().map_err(ConnectError::CoreSpawn)?;

        #[cfg(target_os = "windows")]
        {
            match process::JobHandle::create() {
                Ok(job) => {
                    if !job.assign(&child) {
                        debug!("failed to assign core to job object");
                    }
                    self.job = Some(job);
                }
                Err(e) => debug!(error = %e, "job object unavailable"),
            }
        }

        self.child = Some(child);
        Ok(())
    }

    /// Takes the handle if the process has exited, returning its exit code.
    fn reap(&mut self) -> Option<Option<i32>> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                self.release();
                Some(status.code())
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "cannot query core status");
                self.release();
                Some(None)
            }
        }
    }

    fn release(&mut self) {
        self.child = None;
        #[cfg(target_os = "windows")]
        {
            self.job = None;
        }
    }
}

#[async_trait]
impl ProxyCore for CoreSupervisor {
    async fn start(
        &mut self,
        node: &NodeDescriptor,
        tun_enabled: bool,
    ) -> Result<String, ConnectError> {
        if !self.options.exe_path.exists() {
            return Err(ConnectError::CoreBinaryMissing(self.options.exe_path.clone()));
        }
        if self.child.is_some() {
            warn!("core start requested while a previous run is supervised; stopping it");
            self.stop().await;
        }

        self.write_config(node, tun_enabled)?;
        self.spawn()?;
        info!(
            node = %node.name,
            address = %node.address(),
            tun = tun_enabled,
            pid = ?self.pid(),
            "proxy core launched"
        );

        tokio::time::sleep(self.options.settle).await;

        if let Some(code) = self.reap() {
            warn!(code = ?code, "proxy core exited during settle interval");
            return Err(ConnectError::CoreExitedEarly { code });
        }
        Ok(format!("Connected: {} ({})", node.name, node.address()))
    }

    async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        if matches!(child.try_wait(), Ok(None)) {
            let descendants = process::kill_descendants(child.id());
            if let Err(e) = child.kill() {
                debug!(error = %e, "core kill failed");
            }

            let deadline = Instant::now() + self.options.stop_timeout;
            loop {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        debug!(code = ?status.code(), descendants, "proxy core stopped");
                        break;
                    }
                    Ok(None) if Instant::now() >= deadline => {
                        warn!(pid = child.id(), "proxy core did not exit in time");
                        break;
                    }
                    Ok(None) => tokio::time::sleep(STOP_POLL_INTERVAL).await,
                    Err(e) => {
                        debug!(error = %e, "core wait failed");
                        break;
                    }
                }
            }
        }

        self.release();
    }

    fn is_running(&mut self) -> bool {
        self.reap();
        self.child.is_some()
    }

    async fn query_cumulative_traffic(&mut self) -> Result<u64, ConnectError> {
        if !self.is_running() || !self.options.exe_path.exists() {
            return Ok(0);
        }

        let mut cmd = tokio::process::Command::new(&self.options.exe_path);
        cmd.arg("api")
            .arg("statsquery")
            .arg("--server")
            .arg(format!("{}:{}", config::LOCAL_HOST, self.options.ports.api))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = self.options.exe_path.parent() {
            cmd.current_dir(dir);
        }

        #[cfg(target_os = "windows")]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let output = match tokio::time::timeout(self.options.stats_timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ConnectError::StatsQueryFailure(e.to_string())),
            Err(_) => return Err(ConnectError::StatsQueryFailure("timed out".to_string())),
        };
        if !output.status.success() {
            debug!(code = ?output.status.code(), "statsquery exited with failure status");
        }

        let text = String::from_utf8_lossy(&output.stdout);
        Ok(parse_statsquery(&text).total())
    }
}

impl Drop for CoreSupervisor {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            process::kill_descendants(child.id());
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
