pub mod console;
pub mod core;
pub mod error;
pub mod logging;
pub mod node;
pub mod orchestrator;
pub mod platform;
pub mod prefs;
pub mod probe;
pub mod settings;
pub mod subscription;
pub mod throughput;

use std::time::Duration;

use tokio::io::BufReader;
use tracing::{error, info, warn};

pub use crate::error::{ConnectError, NodeParseError};
pub use crate::node::NodeDescriptor;
pub use crate::orchestrator::{
    Collaborators, ConnectionState, Orchestrator, OrchestratorConfig, OrchestratorHandle,
    StatusSnapshot,
};
pub use crate::settings::{AppPaths, Settings};

/// Passed by the logon task; connect as soon as the process is up.
pub const AUTOSTART_ARG: &str = "--autostart";

const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

async fn serve(paths: AppPaths, autostart_launch: bool) {
    let settings = Settings::load(&paths);
    let orchestrator = Orchestrator::new(
        OrchestratorConfig::from(&settings),
        Collaborators::system(&paths, &settings),
    );
    let (handle, join) = orchestrator::spawn(orchestrator);
    info!(base = %paths.base_dir().display(), "ready; {}", console::HELP);

    let interrupt = interrupted();
    tokio::pin!(interrupt);

    let mut stopped = false;
    if autostart_launch {
        tokio::select! {
            reply = handle.toggle() => {
                if let Some(snapshot) = reply {
                    console::print_status(&snapshot);
                }
            }
            _ = &mut interrupt => stopped = true,
        }
    }
    if !stopped {
        let stdin = BufReader::new(tokio::io::stdin());
        console::run_console(&handle, stdin, interrupt.as_mut()).await;
    }

    if let Some(snapshot) = handle.shutdown().await {
        console::print_status(&snapshot);
    }
    drop(handle);
    if let Err(e) = join.await {
        error!(error = %e, "control loop ended abnormally");
    }
}

pub fn run() {
    logging::init_logging();
    let autostart_launch = std::env::args().any(|arg| arg == AUTOSTART_ARG);

    let paths = match AppPaths::discover() {
        Ok(paths) => paths,
        Err(e) => {
            error!(error = %e, "cannot resolve installation directory");
            std::process::exit(1);
        }
    };
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "cannot start async runtime");
            std::process::exit(1);
        }
    };

    runtime.block_on(serve(paths, autostart_launch));
    // a pending stdin read would otherwise hold the process open
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
}
