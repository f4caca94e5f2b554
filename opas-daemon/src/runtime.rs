use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};

use opas_core::{config, PipelineConfig};
use opas_pipeline::{pipeline, RunReport};

use crate::error::{io_err, DaemonError};
use crate::paths::{logs_dir, run_dir, socket_path};
use crate::protocol::{DaemonRequest, DaemonResponse};
use crate::schedule;

/// Last completed run, shared between processor and status handler.
type LastReport = Arc<RwLock<Option<RunReport>>>;

struct RunJob {
    source: &'static str,
    dry_run: bool,
    respond_to: oneshot::Sender<Result<RunReport, String>>,
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the daemon runtime.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;

    let config = Arc::new(config::load_at(&home)?);
    let (fire_hour, fire_minute) = config.fire_time()?;
    let last_report: LastReport = Arc::new(RwLock::new(None));
    let started_at_unix = unix_seconds_now();

    let (run_tx, run_rx) = mpsc::channel::<RunJob>(8);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let scheduler_handle = {
        let shutdown = shutdown_tx.clone();
        let run_tx = run_tx.clone();
        tokio::spawn(async move {
            let result =
                scheduler_task(fire_hour, fire_minute, run_tx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let processor_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let config = config.clone();
        let last_report = last_report.clone();
        tokio::spawn(async move {
            let result =
                processor_task(home, config, last_report, run_rx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let config = config.clone();
        let last_report = last_report.clone();
        let run_tx = run_tx.clone();
        tokio::spawn(async move {
            let result = socket_server_task(
                home,
                config,
                last_report,
                run_tx,
                shutdown.clone(),
                shutdown.subscribe(),
                started_at_unix,
                (fire_hour, fire_minute),
            )
            .await;
            let _ = shutdown.send(());
            result
        })
    };

    let rotation_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        tokio::spawn(async move {
            let result = log_rotation_task(home, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (scheduler_result, processor_result, socket_result, rotation_result, signal_result) = tokio::join!(
        scheduler_handle,
        processor_handle,
        socket_handle,
        rotation_handle,
        signal_handle
    );

    handle_join("scheduler", scheduler_result)?;
    handle_join("processor", processor_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("log_rotation", rotation_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

async fn scheduler_task(
    fire_hour: u32,
    fire_minute: u32,
    run_tx: mpsc::Sender<RunJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    loop {
        let fire_at = schedule::next_fire_after(Utc::now(), fire_hour, fire_minute);
        let wait = schedule::wait_until(Utc::now(), fire_at);
        tracing::info!(fire_at = %fire_at, "next scheduled run");

        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tokio::time::sleep(wait) => {
                match enqueue_run(&run_tx, "scheduler", false).await {
                    Ok(report) => {
                        tracing::info!(
                            run_id = %report.run_id,
                            written = report.written,
                            changed = report.changed_paths,
                            published = report.published(),
                            duration_ms = report.duration_ms as u64,
                            "scheduled run completed",
                        );
                    }
                    Err(err) => {
                        // Failed run; the next trigger self-heals.
                        tracing::error!(error = %err, "scheduled run failed");
                    }
                }
            }
        }
    }

    Ok(())
}

async fn processor_task(
    home: PathBuf,
    config: Arc<PipelineConfig>,
    last_report: LastReport,
    mut run_rx: mpsc::Receiver<RunJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            maybe_job = run_rx.recv() => {
                let Some(job) = maybe_job else { break };
                tracing::info!(source = job.source, dry_run = job.dry_run, "pipeline run starting");

                let home_for_run = home.clone();
                let config_for_run = config.clone();
                let dry_run = job.dry_run;
                let outcome = tokio::task::spawn_blocking(move || {
                    pipeline::run(&home_for_run, &config_for_run, dry_run)
                })
                .await
                .map_err(|err| DaemonError::Protocol(format!("run task join error: {err}")))?;

                let outcome = match outcome {
                    Ok(report) => {
                        if !report.dry_run {
                            let mut guard = last_report.write().await;
                            *guard = Some(report.clone());
                        }
                        Ok(report)
                    }
                    Err(err) => Err(err.to_string()),
                };

                let _ = job.respond_to.send(outcome);
            }
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn socket_server_task(
    home: PathBuf,
    config: Arc<PipelineConfig>,
    last_report: LastReport,
    run_tx: mpsc::Sender<RunJob>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
    started_at_unix: u64,
    fire_time: (u32, u32),
) -> Result<(), DaemonError> {
    let run = run_dir(&home);
    if !run.exists() {
        fs::create_dir_all(&run).map_err(|e| io_err(&run, e))?;
    }

    let socket = socket_path(&home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let home = home.clone();
                let config = config.clone();
                let last_report = last_report.clone();
                let run_tx = run_tx.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(
                        stream,
                        home,
                        config,
                        last_report,
                        run_tx,
                        shutdown_tx,
                        started_at_unix,
                        fire_time,
                    ).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_socket_client(
    stream: UnixStream,
    home: PathBuf,
    config: Arc<PipelineConfig>,
    last_report: LastReport,
    run_tx: mpsc::Sender<RunJob>,
    shutdown_tx: broadcast::Sender<()>,
    started_at_unix: u64,
    fire_time: (u32, u32),
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: Result<DaemonRequest, _> = serde_json::from_str(&line);
        let request = match request {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let cmd = request.cmd.clone();
        let response = match cmd.as_str() {
            "status" => {
                let payload = build_status_payload(
                    &home,
                    &config,
                    last_report.clone(),
                    started_at_unix,
                    fire_time,
                )
                .await;
                DaemonResponse::ok(payload)
            }
            "run" => {
                let dry_run = request.dry_run.unwrap_or(false);
                match enqueue_run(&run_tx, "socket", dry_run).await {
                    Ok(report) => DaemonResponse::ok(json!(report)),
                    Err(err) => DaemonResponse::error(err.to_string()),
                }
            }
            "stop" => {
                let _ = shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
            other => DaemonResponse::error(format!("unknown command '{other}'")),
        };

        write_response(&mut writer, &response).await?;
        if cmd == "stop" {
            break;
        }
    }

    Ok(())
}

async fn build_status_payload(
    home: &Path,
    config: &PipelineConfig,
    last_report: LastReport,
    started_at_unix: u64,
    (fire_hour, fire_minute): (u32, u32),
) -> Value {
    // Snapshot the report under a read lock, dropped before JSON assembly.
    let last_run: Value = {
        let guard = last_report.read().await;
        guard
            .as_ref()
            .map(|report| json!(report))
            .unwrap_or(Value::Null)
    };

    let next_fire = schedule::next_fire_after(Utc::now(), fire_hour, fire_minute);

    json!({
        "running": true,
        "started_at_unix": started_at_unix,
        "schedule_at": config.schedule.at,
        "next_fire_at_unix": next_fire.timestamp(),
        "repo": config.repo.display().to_string(),
        "output_dir": config.output_dir.display().to_string(),
        "last_run": last_run,
        "socket": socket_path(home).display().to_string(),
    })
}

async fn enqueue_run(
    run_tx: &mpsc::Sender<RunJob>,
    source: &'static str,
    dry_run: bool,
) -> Result<RunReport, DaemonError> {
    let (tx, rx) = oneshot::channel();
    run_tx
        .send(RunJob {
            source,
            dry_run,
            respond_to: tx,
        })
        .await
        .map_err(|_| DaemonError::ChannelClosed("run queue"))?;

    let outcome = rx
        .await
        .map_err(|_| DaemonError::ChannelClosed("run response"))?;
    outcome.map_err(DaemonError::Protocol)
}

async fn log_rotation_task(
    home: PathBuf,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    // Skip the first (immediate) tick to avoid rotating on startup.
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let home = home.clone();
                tokio::task::spawn_blocking(move || {
                    crate::log_rotation::rotate_logs(&home);
                })
                .await
                .ok(); // rotation errors are logged inside rotate_logs; never crash the daemon
            }
        }
    }
    Ok(())
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    let run = run_dir(home);
    if !run.exists() {
        fs::create_dir_all(&run).map_err(|e| io_err(&run, e))?;
    }
    let logs = logs_dir(home);
    if !logs.exists() {
        fs::create_dir_all(&logs).map_err(|e| io_err(&logs, e))?;
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
