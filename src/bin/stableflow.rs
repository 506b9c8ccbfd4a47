//! Command-line surface of the stableflow runtime.
//!
//! `start` loads, validates and launches a system and stays in the
//! foreground until it stops. `stop`, `pause`, `step` and `reset` load the
//! same document only to locate the running system's control endpoint and
//! deliver one signal to it. The hidden `worker` and `agent` modes are how
//! the host controller and remote bridging execute this same binary.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, warn};

use stableflow::component::ComponentRegistry;
use stableflow::components::builtin_registry;
use stableflow::config::{self, Override, System};
use stableflow::control::ControlFrame;
use stableflow::error::{ErrorSink, RuntimeError};
use stableflow::host::{attach_worker, HostController, HostOptions};
use stableflow::orchestrator::{send_control, Orchestrator};
use stableflow::process::ProcessSupervisor;
use stableflow::signal::{ControlSignal, CONFIG_ERROR_EXIT_CODE};
use stableflow::telemetry;

#[derive(Parser)]
#[command(
    name = "stableflow",
    version,
    about = "Configuration-driven dataflow runtime"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Launch the system described by a config document and run it to
    /// completion.
    Start {
        path_cfg: PathBuf,
        /// Dot-path override, `addr=value`; may repeat, applied in order.
        #[arg(long = "override", value_name = "ADDR=VALUE")]
        overrides: Vec<String>,
    },
    /// Stop a running system (drain, then exit).
    Stop {
        path_cfg: PathBuf,
        #[arg(long = "override", value_name = "ADDR=VALUE")]
        overrides: Vec<String>,
    },
    /// Pause tick generation.
    Pause {
        path_cfg: PathBuf,
        #[arg(long = "override", value_name = "ADDR=VALUE")]
        overrides: Vec<String>,
    },
    /// Advance exactly one tick while paused.
    Step {
        path_cfg: PathBuf,
        #[arg(long = "override", value_name = "ADDR=VALUE")]
        overrides: Vec<String>,
    },
    /// Re-initialize every component, queues left in place.
    Reset {
        path_cfg: PathBuf,
        #[arg(long = "override", value_name = "ADDR=VALUE")]
        overrides: Vec<String>,
    },
    /// Run one configured process and attach to the host controller.
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        process: String,
        #[arg(long)]
        attach: String,
        path_cfg: PathBuf,
        #[arg(long = "override", value_name = "ADDR=VALUE")]
        overrides: Vec<String>,
    },
    /// Drive this host's processes on behalf of a remote orchestrator.
    #[command(hide = true)]
    Agent {
        #[arg(long)]
        host: String,
        path_cfg: PathBuf,
        #[arg(long = "override", value_name = "ADDR=VALUE")]
        overrides: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    telemetry::init();
    let cli = Cli::parse();
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    match cli.command {
        Command::Start { path_cfg, overrides } => {
            let registry = builtin_registry();
            let system = match load(&path_cfg, &overrides, &registry) {
                Ok(system) => system,
                Err(code) => return code,
            };
            let mut opts = HostOptions::new(&path_cfg);
            opts.overrides = overrides;
            match Orchestrator::start(system.clone(), opts).await {
                Ok(orchestrator) => orchestrator.wait().await,
                Err(err) => fail(&system, err),
            }
        }
        Command::Stop { path_cfg, overrides } => {
            deliver(&path_cfg, &overrides, ControlSignal::ExitOkControlled).await
        }
        Command::Pause { path_cfg, overrides } => {
            deliver(&path_cfg, &overrides, ControlSignal::ControlPause).await
        }
        Command::Step { path_cfg, overrides } => {
            deliver(&path_cfg, &overrides, ControlSignal::ControlStep).await
        }
        Command::Reset { path_cfg, overrides } => {
            deliver(&path_cfg, &overrides, ControlSignal::ControlReset).await
        }
        Command::Worker {
            process,
            attach,
            path_cfg,
            overrides,
        } => {
            let registry = builtin_registry();
            let system = match load(&path_cfg, &overrides, &registry) {
                Ok(system) => system,
                Err(code) => return code,
            };
            match ProcessSupervisor::build(system.clone(), &process, &registry).await {
                Ok((supervisor, handle)) => {
                    #[cfg(unix)]
                    if let Err(err) = stableflow::process::install_os_signals(&handle) {
                        warn!(error = %err, "cannot install signal handlers");
                    }
                    if let Err(err) = attach_worker(&attach, &process, handle.clone()).await {
                        return fail(&system, RuntimeError::Io(err));
                    }
                    supervisor.run().await
                }
                Err(err) => fail(&system, err),
            }
        }
        Command::Agent {
            host,
            path_cfg,
            overrides,
        } => {
            let registry = builtin_registry();
            let system = match load(&path_cfg, &overrides, &registry) {
                Ok(system) => system,
                Err(code) => return code,
            };
            let mut opts = HostOptions::new(&path_cfg);
            opts.overrides = overrides;
            match run_agent(system.clone(), &host, opts).await {
                Ok(code) => code,
                Err(err) => fail(&system, err),
            }
        }
    }
}

/// Serve this host's control endpoint and replay orchestrator frames onto
/// the local controller.
async fn run_agent(
    system: Arc<System>,
    id_host: &str,
    opts: HostOptions,
) -> Result<i32, RuntimeError> {
    let host = system
        .host(id_host)
        .ok_or_else(|| {
            RuntimeError::ConfigInvalid(config::ConfigError::at(
                format!("host.{id_host}"),
                "unknown host",
            ))
        })?
        .clone();
    let listener = tokio::net::TcpListener::bind(host.ctrl_endpoint())
        .await
        .map_err(RuntimeError::Io)?;
    let controller = HostController::launch(system, id_host, &opts).await?;

    let (ctrl_tx, ctrl_rx) = flume::unbounded::<ControlSignal>();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let ctrl_tx = ctrl_tx.clone();
            tokio::spawn(async move {
                let (mut reader, _writer) = stream.into_split();
                while let Ok(Some(frame)) = ControlFrame::read_from(&mut reader).await {
                    if let ControlFrame::Signal { signal, .. } = frame {
                        if ctrl_tx.send(signal).is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });

    let forwarder = {
        let events = controller.events();
        let control = controller.control_sender();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    signal = ctrl_rx.recv_async() => match signal {
                        Ok(signal) => {
                            if control.send(signal).is_err() {
                                return;
                            }
                        }
                        Err(_) => return,
                    },
                    event = events.recv_async() => {
                        if event.is_err() {
                            return;
                        }
                    }
                }
            }
        })
    };

    let code = controller.join().await;
    forwarder.abort();
    Ok(code)
}

/// Load a system, printing a diagnostic and writing the config-error record
/// on rejection.
fn load(
    path: &Path,
    raw_overrides: &[String],
    registry: &ComponentRegistry,
) -> Result<Arc<System>, i32> {
    let overrides = match raw_overrides
        .iter()
        .map(|text| Override::parse(text))
        .collect::<Result<Vec<_>, _>>()
    {
        Ok(overrides) => overrides,
        Err(err) => return Err(reject(err)),
    };
    match config::load_path(path, &overrides, Some(registry)) {
        Ok(system) => Ok(Arc::new(system)),
        Err(err) => Err(reject(err)),
    }
}

fn reject(err: config::ConfigError) -> i32 {
    error!(path = err.path(), "{err}");
    let record = RuntimeError::ConfigInvalid(err).to_record();
    if let Err(sink_err) = ErrorSink::default().write(&record) {
        error!(error = %sink_err, "cannot write error record");
    }
    CONFIG_ERROR_EXIT_CODE
}

fn fail(system: &System, err: RuntimeError) -> i32 {
    error!("{err}");
    let record = err.to_record();
    if let Err(sink_err) = system.error_sink.write(&record) {
        error!(error = %sink_err, "cannot write error record");
    }
    err.exit_code()
}

async fn deliver(path: &Path, raw_overrides: &[String], signal: ControlSignal) -> i32 {
    let registry = builtin_registry();
    let system = match load(path, raw_overrides, &registry) {
        Ok(system) => system,
        Err(code) => return code,
    };
    match send_control(&system, signal).await {
        Ok(()) => 0,
        Err(err) => fail(&system, err),
    }
}
