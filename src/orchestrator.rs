//! The system orchestrator: the top-level control surface.
//!
//! Given a validated [`System`], the orchestrator launches the local host
//! controller, bridges control to every remote host's agent, and owns the
//! run-state machine (`Stopped → Running ⇄ Paused → Draining → Stopped`).
//! It also serves the local host's control endpoint so detached CLI
//! invocations (`stableflow stop <cfg>` and friends) can reach a system
//! started earlier.
//!
//! Remote hosts are never addressed per-process: the operator starts a
//! `stableflow agent` on each remote host, the orchestrator dials the
//! agent's control endpoint, and every broadcast is replayed there.

use std::sync::Arc;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, instrument, warn};

use crate::config::{ConfigError, System};
use crate::control::ControlFrame;
use crate::error::RuntimeError;
use crate::host::{HostController, HostEvent, HostOptions};
use crate::signal::{ControlSignal, RunState};

struct RemoteBridge {
    id_host: String,
    writer: Option<OwnedWriteHalf>,
}

/// A running system, as seen from the starting terminal.
pub struct Orchestrator {
    system: Arc<System>,
    id_run: uuid::Uuid,
    state: RunState,
    local: HostController,
    remotes: Vec<RemoteBridge>,
    /// Signals arriving on the control endpoint from detached invocations.
    ctrl: flume::Receiver<ControlSignal>,
    origin: String,
}

impl Orchestrator {
    /// Launch the system: local workers via the host controller, remote
    /// hosts via their agents, and the control server for detached CLIs.
    #[instrument(skip_all, fields(id_system = %system.id_system))]
    pub async fn start(system: Arc<System>, opts: HostOptions) -> Result<Self, RuntimeError> {
        let local_host = system
            .local_host()
            .ok_or_else(|| {
                RuntimeError::ConfigInvalid(ConfigError::at("host", "no host is marked local"))
            })?
            .clone();

        let listener = TcpListener::bind(local_host.ctrl_endpoint()).await?;
        let (ctrl_tx, ctrl_rx) = flume::unbounded();
        tokio::spawn(serve_control(listener, ctrl_tx));

        let local = HostController::launch(system.clone(), &local_host.id_host, &opts).await?;

        let mut remotes = Vec::new();
        for host in system.hosts.iter().filter(|h| !h.is_local) {
            let writer = match dial_agent(&host.ctrl_endpoint()).await {
                Ok(writer) => Some(writer),
                Err(err) => {
                    warn!(
                        id_host = %host.id_host,
                        endpoint = %host.ctrl_endpoint(),
                        error = %err,
                        "remote agent unreachable; its processes will not be driven"
                    );
                    None
                }
            };
            remotes.push(RemoteBridge {
                id_host: host.id_host.clone(),
                writer,
            });
        }

        let id_run = uuid::Uuid::new_v4();
        info!(
            %id_run,
            hosts = system.hosts.len(),
            processes = system.processes.len(),
            "system started"
        );
        let origin = format!("system.{}", system.id_system);
        Ok(Self {
            system,
            id_run,
            state: RunState::Stopped.started(),
            local,
            remotes,
            ctrl: ctrl_rx,
            origin,
        })
    }

    /// Unique id of this run, stamped into the start log line.
    #[must_use]
    pub fn id_run(&self) -> uuid::Uuid {
        self.id_run
    }

    /// Current run state.
    #[must_use]
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Apply one control signal to the whole system.
    pub async fn control(&mut self, signal: ControlSignal) {
        if signal == ControlSignal::ControlReset {
            self.reset().await;
            return;
        }
        self.state = self.state.apply(signal);
        debug!(%signal, state = %self.state, "control applied");
        self.broadcast(signal).await;
    }

    /// Re-initialize every component, queues left in place. In-flight
    /// envelopes are drained first: tick generation pauses for one period so
    /// gathered-but-unprocessed data clears, then the reset broadcast goes
    /// out and the clock resumes.
    pub async fn reset(&mut self) {
        let was_running = self.state == RunState::Running;
        if was_running {
            self.broadcast(ControlSignal::ControlPause).await;
            tokio::time::sleep(self.system.tick_period).await;
        }
        self.broadcast(ControlSignal::ControlReset).await;
        if was_running {
            self.broadcast(ControlSignal::ControlPause).await;
        }
        self.state = self.state.apply(ControlSignal::ControlReset);
    }

    async fn broadcast(&mut self, signal: ControlSignal) {
        self.local.control(signal);
        let frame = ControlFrame::signal(signal, self.origin.clone());
        for remote in &mut self.remotes {
            let Some(writer) = remote.writer.as_mut() else {
                continue;
            };
            if let Err(err) = frame.write_to(writer).await {
                warn!(id_host = %remote.id_host, error = %err, "remote control bridge lost");
                remote.writer = None;
            }
        }
    }

    /// Drive the system until every local worker has exited. Returns the
    /// system exit code. `SIGINT` on the orchestrating terminal is treated
    /// as a controlled stop.
    pub async fn wait(mut self) -> i32 {
        let events = self.local.events();
        loop {
            tokio::select! {
                event = events.recv_async() => match event {
                    Ok(HostEvent::Escalated(signal)) => {
                        self.state = self.state.apply(signal);
                        // Local escalation must reach remote hosts too.
                        let frame = ControlFrame::signal(signal, self.origin.clone());
                        for remote in &mut self.remotes {
                            if let Some(writer) = remote.writer.as_mut() {
                                if frame.write_to(writer).await.is_err() {
                                    remote.writer = None;
                                }
                            }
                        }
                    }
                    Ok(HostEvent::ProcessExited { id_process, code }) => {
                        debug!(%id_process, code, "worker exited");
                    }
                    // Host controller finished: every worker is down.
                    Err(_) => break,
                },
                signal = self.ctrl.recv_async() => {
                    if let Ok(signal) = signal {
                        info!(%signal, "control received");
                        self.control(signal).await;
                    }
                }
                interrupt = tokio::signal::ctrl_c() => {
                    if interrupt.is_ok() {
                        info!("interrupted; stopping system");
                        self.control(ControlSignal::ExitOkControlled).await;
                    }
                }
            }
        }
        self.state = self.state.drained();
        let code = self.local.join().await;
        info!(code, "system stopped");
        code
    }
}

async fn serve_control(listener: TcpListener, ctrl: flume::Sender<ControlSignal>) {
    loop {
        let Ok((stream, peer)) = listener.accept().await else {
            return;
        };
        let ctrl = ctrl.clone();
        tokio::spawn(async move {
            let (mut reader, _writer) = stream.into_split();
            loop {
                match ControlFrame::read_from(&mut reader).await {
                    Ok(Some(ControlFrame::Signal { signal, origin })) => {
                        debug!(%peer, %signal, %origin, "control frame");
                        if ctrl.send(signal).is_err() {
                            return;
                        }
                    }
                    Ok(Some(ControlFrame::Hello { .. })) => {}
                    Ok(None) | Err(_) => return,
                }
            }
        });
    }
}

async fn dial_agent(endpoint: &str) -> std::io::Result<OwnedWriteHalf> {
    let mut last_err = None;
    for _ in 0..10 {
        match TcpStream::connect(endpoint).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                let (_reader, writer) = stream.into_split();
                return Ok(writer);
            }
            Err(err) => {
                last_err = Some(err);
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "agent unreachable")
    }))
}

/// Deliver one control signal to a system already running on this machine,
/// through its local control endpoint. Used by the detached CLI commands.
pub async fn send_control(system: &System, signal: ControlSignal) -> Result<(), RuntimeError> {
    let host = system.local_host().ok_or_else(|| {
        RuntimeError::ConfigInvalid(ConfigError::at("host", "no host is marked local"))
    })?;
    let mut stream = TcpStream::connect(host.ctrl_endpoint())
        .await
        .map_err(RuntimeError::Io)?;
    ControlFrame::signal(signal, format!("cli.{}", system.id_system))
        .write_to(&mut stream)
        .await
        .map_err(RuntimeError::Io)?;
    Ok(())
}
