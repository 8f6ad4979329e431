use std::future::Future;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{info, warn};

use crate::orchestrator::{Command, OrchestratorHandle, StatusSnapshot};

pub const HELP: &str = "commands: toggle | tun on | tun off | status | quit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Send(Command),
    Status,
    Quit,
    Help,
    Empty,
}

fn parse_line(line: &str) -> Action {
    match line.trim().to_ascii_lowercase().as_str() {
        "" => Action::Empty,
        "toggle" => Action::Send(Command::Toggle),
        "tun on" => Action::Send(Command::TunChanged(true)),
        "tun off" => Action::Send(Command::TunChanged(false)),
        "status" => Action::Status,
        "quit" | "exit" => Action::Quit,
        _ => Action::Help,
    }
}

pub fn print_status(snapshot: &StatusSnapshot) {
    match serde_json::to_string(snapshot) {
        Ok(json) => println!("{json}"),
        Err(e) => warn!(error = %e, "cannot encode status"),
    }
}

/// Reads line commands until `quit`, end of input or `interrupt`. The
/// interrupt also cuts short a command that is still in flight.
pub async fn run_console<R, I>(handle: &OrchestratorHandle, input: R, interrupt: I)
where
    R: AsyncBufRead + Unpin,
    I: Future<Output = ()>,
{
    tokio::pin!(interrupt);
    let mut lines = input.lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "stdin read failed");
                    break;
                }
            },
            _ = &mut interrupt => {
                info!("interrupted");
                break;
            }
        };

        let command = match parse_line(&line) {
            Action::Send(command) => command,
            Action::Status => {
                print_status(&handle.status());
                continue;
            }
            Action::Quit => break,
            Action::Help => {
                println!("{HELP}");
                continue;
            }
            Action::Empty => continue,
        };

        let reply = tokio::select! {
            reply = handle.send(command) => reply,
            _ = &mut interrupt => {
                info!(?command, "interrupted while a command was running");
                break;
            }
        };
        match reply {
            Some(snapshot) => print_status(&snapshot),
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use tokio::io::BufReader;

    use super::*;
    use crate::core::{CoreOptions, CoreSupervisor};
    use crate::node::NodeDescriptor;
    use crate::orchestrator::{self, Collaborators, Orchestrator, OrchestratorConfig};
    use crate::platform;
    use crate::prefs::JsonPreferenceStore;
    use crate::probe::{LatencyProbe, ProbeResult};
    use crate::settings::{AppPaths, Settings};
    use crate::subscription::SubscriptionDirectory;

    struct StalledProber;

    #[async_trait]
    impl LatencyProbe for StalledProber {
        async fn probe(&self, _node: &NodeDescriptor, _timeout: Duration) -> Option<ProbeResult> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            None
        }
    }

    fn stalled_orchestrator(base: &std::path::Path) -> Orchestrator {
        let paths = AppPaths::new(base);
        let subscriptions = base.join("subscriptions.txt");
        std::fs::write(&subscriptions, "vless://id@edge.example:443?type=tcp#Edge\n").unwrap();

        let collaborators = Collaborators {
            directory: Arc::new(SubscriptionDirectory::new(vec![subscriptions])),
            prober: Arc::new(StalledProber),
            core: Box::new(CoreSupervisor::new(CoreOptions::new(&paths, &Settings::default()))),
            proxy: platform::default_proxy(),
            prefs: Box::new(JsonPreferenceStore::new(paths.state_path())),
            autostart: platform::default_autostart(),
        };
        Orchestrator::new(OrchestratorConfig::default(), collaborators)
    }

    #[test]
    fn test_parse_line() {
        assert_eq!(parse_line(" Toggle "), Action::Send(Command::Toggle));
        assert_eq!(parse_line("tun on"), Action::Send(Command::TunChanged(true)));
        assert_eq!(parse_line("TUN OFF"), Action::Send(Command::TunChanged(false)));
        assert_eq!(parse_line("status"), Action::Status);
        assert_eq!(parse_line("exit"), Action::Quit);
        assert_eq!(parse_line(""), Action::Empty);
        assert_eq!(parse_line("connect please"), Action::Help);
    }

    #[tokio::test]
    async fn test_interrupt_cuts_running_command_short() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, _join) = orchestrator::spawn(stalled_orchestrator(dir.path()));

        let input = BufReader::new(&b"toggle\n"[..]);
        let interrupt = tokio::time::sleep(Duration::from_millis(50));
        let started = Instant::now();
        let finished =
            tokio::time::timeout(Duration::from_secs(5), run_console(&handle, input, interrupt)).await;

        assert!(finished.is_ok());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_end_of_input_returns() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, _join) = orchestrator::spawn(stalled_orchestrator(dir.path()));

        let input = BufReader::new(&b"status\nhelp\n\n"[..]);
        let finished = tokio::time::timeout(
            Duration::from_secs(5),
            run_console(&handle, input, std::future::pending::<()>()),
        )
        .await;
        assert!(finished.is_ok());
    }
}
