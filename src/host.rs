//! The host controller: one machine's worth of worker processes.
//!
//! Per configured host, the controller spawns one worker process per process
//! definition (the crate's own binary in worker mode), keeps a handle table,
//! and forwards control frames over a loopback control channel each worker
//! attaches to at startup. Worker liveness is tracked through process exit:
//! an exit nobody asked for escalates to the surviving siblings —
//! `exit_ok_controlled` when the worker finished cleanly on its own,
//! `exit_ex_controlled` otherwise — and is reported upward so the
//! orchestrator can extend the shutdown to remote hosts.
//!
//! The same control-frame protocol drives remote hosts: a remote agent binds
//! its host's control endpoint, runs a controller for its own processes, and
//! replays the frames the orchestrator sends it. The orchestrator never
//! addresses a remote worker directly.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use futures_util::future::select_all;
use rustc_hash::FxHashMap;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::{ConfigError, System};
use crate::control::ControlFrame;
use crate::error::RuntimeError;
use crate::process::SupervisorHandle;
use crate::signal::ControlSignal;

/// How a controller spawns its workers.
#[derive(Clone, Debug)]
pub struct HostOptions {
    /// Config document handed to every worker.
    pub cfg_path: PathBuf,
    /// Raw `addr=value` overrides replayed on every worker's loader.
    pub overrides: Vec<String>,
    /// Binary executed in worker mode; defaults to the current executable.
    pub worker_cmd: PathBuf,
}

impl HostOptions {
    #[must_use]
    pub fn new(cfg_path: impl Into<PathBuf>) -> Self {
        Self {
            cfg_path: cfg_path.into(),
            overrides: Vec::new(),
            worker_cmd: std::env::current_exe()
                .unwrap_or_else(|_| PathBuf::from("stableflow")),
        }
    }
}

/// Notifications a controller emits while its workers run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostEvent {
    /// A worker exited (requested or not).
    ProcessExited { id_process: String, code: i32 },
    /// An unrequested exit was escalated to the surviving siblings.
    Escalated(ControlSignal),
}

struct Worker {
    id_process: String,
    child: Child,
}

type ConnTable = Arc<tokio::sync::Mutex<FxHashMap<String, OwnedWriteHalf>>>;

/// Controller for the worker processes of one host.
///
/// The controller body runs as a background task; this handle forwards
/// control signals in and surfaces [`HostEvent`]s out.
pub struct HostController {
    id_host: String,
    control: flume::Sender<ControlSignal>,
    events: flume::Receiver<HostEvent>,
    done: JoinHandle<i32>,
}

impl HostController {
    /// Spawn one worker per process configured on `id_host` and start
    /// supervising them.
    #[instrument(skip_all, fields(id_host = %id_host))]
    pub async fn launch(
        system: Arc<System>,
        id_host: &str,
        opts: &HostOptions,
    ) -> Result<Self, RuntimeError> {
        let host = system.host(id_host).ok_or_else(|| {
            RuntimeError::ConfigInvalid(ConfigError::at(
                format!("host.{id_host}"),
                "unknown host",
            ))
        })?;
        let attach = host.worker_endpoint();
        let listener = TcpListener::bind(&attach).await?;
        let conns: ConnTable = Arc::default();
        tokio::spawn(accept_workers(listener, conns.clone()));

        let mut children = Vec::new();
        for process in system.processes_of(id_host) {
            let mut command = Command::new(&opts.worker_cmd);
            command
                .arg("worker")
                .arg("--process")
                .arg(&process.id_process)
                .arg("--attach")
                .arg(&attach)
                .arg(&opts.cfg_path)
                .stdin(Stdio::null())
                .kill_on_drop(true);
            for over in &opts.overrides {
                command.arg("--override").arg(over);
            }
            let child = command.spawn().map_err(RuntimeError::Io)?;
            info!(id_process = %process.id_process, pid = child.id(), "worker spawned");
            children.push(Worker {
                id_process: process.id_process.clone(),
                child,
            });
        }

        let (control_tx, control_rx) = flume::unbounded();
        let (events_tx, events_rx) = flume::unbounded();
        let done = tokio::spawn(supervise(
            id_host.to_string(),
            children,
            conns,
            control_rx,
            events_tx,
        ));
        Ok(Self {
            id_host: id_host.to_string(),
            control: control_tx,
            events: events_rx,
            done,
        })
    }

    /// Forward a control signal to every worker on this host.
    pub fn control(&self, signal: ControlSignal) -> bool {
        self.control.send(signal).is_ok()
    }

    /// Clone of the control sender, for tasks that outlive a borrow of the
    /// controller.
    #[must_use]
    pub fn control_sender(&self) -> flume::Sender<ControlSignal> {
        self.control.clone()
    }

    /// Event stream: worker exits and sibling escalations.
    #[must_use]
    pub fn events(&self) -> flume::Receiver<HostEvent> {
        self.events.clone()
    }

    #[must_use]
    pub fn id_host(&self) -> &str {
        &self.id_host
    }

    /// Wait for every worker to exit; returns the host exit code (first
    /// non-zero worker code, else 0).
    pub async fn join(self) -> i32 {
        drop(self.control);
        self.done.await.unwrap_or(1)
    }
}

async fn accept_workers(listener: TcpListener, conns: ConnTable) {
    loop {
        let Ok((stream, peer)) = listener.accept().await else {
            return;
        };
        let _ = stream.set_nodelay(true);
        let conns = conns.clone();
        tokio::spawn(async move {
            let (mut reader, writer) = stream.into_split();
            match ControlFrame::read_from(&mut reader).await {
                Ok(Some(ControlFrame::Hello { id_process })) => {
                    debug!(%peer, %id_process, "worker attached");
                    conns.lock().await.insert(id_process, writer);
                }
                other => {
                    warn!(%peer, ?other, "connection did not identify as a worker");
                }
            }
        });
    }
}

enum Step {
    Exited(usize, Option<std::process::ExitStatus>),
    Control(Option<ControlSignal>),
}

async fn supervise(
    id_host: String,
    mut children: Vec<Worker>,
    conns: ConnTable,
    control: flume::Receiver<ControlSignal>,
    events: flume::Sender<HostEvent>,
) -> i32 {
    let mut code = 0;
    let mut shutting_down = false;
    while !children.is_empty() {
        let step = {
            let waits = children
                .iter_mut()
                .map(|w| Box::pin(w.child.wait()))
                .collect::<Vec<_>>();
            tokio::select! {
                (result, index, _) = select_all(waits) => Step::Exited(index, result.ok()),
                signal = control.recv_async() => Step::Control(signal.ok()),
            }
        };
        match step {
            Step::Exited(index, status) => {
                let worker = children.remove(index);
                // A worker killed by signal reports no code; that is the
                // immediate-exit path.
                let child_code = status.and_then(|s| s.code()).unwrap_or(137);
                info!(
                    id_host = %id_host,
                    id_process = %worker.id_process,
                    code = child_code,
                    "worker exited"
                );
                let _ = events.send(HostEvent::ProcessExited {
                    id_process: worker.id_process.clone(),
                    code: child_code,
                });
                if code == 0 {
                    code = child_code;
                }
                if !shutting_down && !children.is_empty() {
                    let escalation = if child_code == 0 {
                        ControlSignal::ExitOkControlled
                    } else {
                        warn!(
                            id_process = %worker.id_process,
                            code = child_code,
                            "unexpected worker exit, stopping siblings"
                        );
                        ControlSignal::ExitExControlled
                    };
                    shutting_down = true;
                    forward(&conns, escalation, &id_host).await;
                    let _ = events.send(HostEvent::Escalated(escalation));
                }
            }
            Step::Control(Some(signal)) => {
                if signal.is_exit() {
                    shutting_down = true;
                }
                if signal == ControlSignal::ExitExImmediate {
                    for worker in &mut children {
                        let _ = worker.child.start_kill();
                    }
                } else {
                    forward(&conns, signal, &id_host).await;
                }
            }
            Step::Control(None) => {
                // Controller handle dropped without an explicit stop.
                shutting_down = true;
                forward(&conns, ControlSignal::ExitOkControlled, &id_host).await;
            }
        }
    }
    code
}

/// Write a signal frame to every attached worker, pruning dead connections.
async fn forward(conns: &ConnTable, signal: ControlSignal, origin: &str) {
    let frame = ControlFrame::signal(signal, format!("host.{origin}"));
    let mut table = conns.lock().await;
    let ids: Vec<String> = table.keys().cloned().collect();
    for id in ids {
        let Some(writer) = table.get_mut(&id) else {
            continue;
        };
        if let Err(err) = frame.write_to(writer).await {
            warn!(id_process = %id, error = %err, "worker control connection lost");
            table.remove(&id);
        }
    }
}

/// Worker-side attach: dial the host's control channel, identify with a
/// hello frame, then feed incoming signal frames into the supervisor. Loss
/// of the channel means the host controller is gone, which winds the worker
/// down cleanly.
pub async fn attach_worker(
    endpoint: &str,
    id_process: &str,
    handle: SupervisorHandle,
) -> std::io::Result<()> {
    let mut last_err = None;
    let mut stream = None;
    for _ in 0..50 {
        match TcpStream::connect(endpoint).await {
            Ok(s) => {
                stream = Some(s);
                break;
            }
            Err(err) => {
                last_err = Some(err);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
    let Some(stream) = stream else {
        return Err(last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "attach failed")
        }));
    };
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    ControlFrame::Hello {
        id_process: id_process.to_string(),
    }
    .write_to(&mut writer)
    .await?;

    tokio::spawn(async move {
        // Writer half must stay alive or the host sees a dead connection.
        let _writer = writer;
        loop {
            match ControlFrame::read_from(&mut reader).await {
                Ok(Some(ControlFrame::Signal { signal, origin })) => {
                    debug!(%signal, %origin, "control frame received");
                    if !handle.send(signal) {
                        break;
                    }
                }
                Ok(Some(ControlFrame::Hello { .. })) => {}
                Ok(None) | Err(_) => {
                    debug!("control channel closed");
                    let _ = handle.send(ControlSignal::ExitOkControlled);
                    break;
                }
            }
        }
    });
    Ok(())
}
