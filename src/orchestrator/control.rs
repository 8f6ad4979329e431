use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::debug;

use super::{Orchestrator, StatusSnapshot};

const QUEUE_DEPTH: usize = 32;
const MIN_PERIOD: time::Duration = time::Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Toggle,
    TunChanged(bool),
    HealthTick,
    SpeedTick,
    Shutdown,
}

struct Request {
    command: Command,
    reply: Option<oneshot::Sender<StatusSnapshot>>,
}

/// Once every handle is dropped the loop shuts down.
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::Sender<Request>,
    status: watch::Receiver<StatusSnapshot>,
}

impl OrchestratorHandle {
    /// Queues `command` and waits for the snapshot it produced. `None` once
    /// the loop has stopped.
    pub async fn send(&self, command: Command) -> Option<StatusSnapshot> {
        let (reply, response) = oneshot::channel();
        let request = Request {
            command,
            reply: Some(reply),
        };
        self.commands.send(request).await.ok()?;
        response.await.ok()
    }

    pub async fn toggle(&self) -> Option<StatusSnapshot> {
        self.send(Command::Toggle).await
    }

    pub async fn set_tun(&self, enabled: bool) -> Option<StatusSnapshot> {
        self.send(Command::TunChanged(enabled)).await
    }

    pub async fn shutdown(&self) -> Option<StatusSnapshot> {
        self.send(Command::Shutdown).await
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.clone()
    }
}

pub fn spawn(orchestrator: Orchestrator) -> (OrchestratorHandle, JoinHandle<()>) {
    let (commands, queue) = mpsc::channel(QUEUE_DEPTH);
    let handle = OrchestratorHandle {
        commands,
        status: orchestrator.subscribe(),
    };
    let join = tokio::spawn(run_loop(orchestrator, queue));
    (handle, join)
}

fn arm(period: time::Duration) -> Interval {
    let period = period.max(MIN_PERIOD);
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn run_loop(mut orchestrator: Orchestrator, mut queue: mpsc::Receiver<Request>) {
    let mut health: Option<Interval> = None;
    let mut speed: Option<Interval> = None;
    let mut armed_epoch = None;

    loop {
        let request = tokio::select! {
            request = queue.recv() => match request {
                Some(request) => request,
                None => {
                    debug!("all handles dropped; shutting down");
                    orchestrator.shutdown().await;
                    break;
                }
            },
            _ = next_tick(&mut health) => Request { command: Command::HealthTick, reply: None },
            _ = next_tick(&mut speed) => Request { command: Command::SpeedTick, reply: None },
        };

        let snapshot = match request.command {
            Command::Toggle => orchestrator.toggle().await,
            Command::TunChanged(enabled) => orchestrator.tun_mode_changed(enabled).await,
            Command::HealthTick => orchestrator.health_check().await,
            Command::SpeedTick => orchestrator.sample_throughput().await,
            Command::Shutdown => orchestrator.shutdown().await,
        };
        if let Some(reply) = request.reply {
            let _ = reply.send(snapshot);
        }
        if request.command == Command::Shutdown {
            break;
        }

        // timers follow the session: off while disconnected, fresh per session
        if orchestrator.is_connected() {
            let epoch = orchestrator.session_epoch();
            if armed_epoch != Some(epoch) {
                let config = orchestrator.config();
                health = Some(arm(config.health_interval));
                speed = Some(arm(config.speed_interval));
                armed_epoch = Some(epoch);
            }
        } else {
            health = None;
            speed = None;
            armed_epoch = None;
        }
    }
}
