//! Fan out to several worker processes sharing one port.
//!
//! The supervisor re-runs the current executable once per worker with the same
//! arguments plus `--worker-id <n>`. Children inherit the environment, so they
//! resolve exactly the same configuration (signing secret included) as the
//! supervisor did. Workers share nothing in memory: accounts must live in a
//! store every worker can reach, which configuration validation enforces.

use std::{
    ffi::OsString,
    future::Future,
    io,
    path::{Path, PathBuf},
    process::ExitStatus,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use tokio::{process::Command, sync::watch, task::JoinSet};
use tracing::{error, info, warn, Level};

use crate::{config::ServerConfig, server::shutdown_signal};

/// How long workers get to finish in-flight requests before being killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Pause before replacing a worker that exited, so a crash loop doesn't spin.
const RESPAWN_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct WorkerExit {
    worker_id: usize,
    pid: Option<u32>,
    status: io::Result<ExitStatus>,
}

/// The command line for worker `worker_id`.
pub fn worker_command(exe: &Path, args: &[OsString], worker_id: usize) -> Command {
    let mut command = Command::new(exe);
    command
        .args(args)
        .arg("--worker-id")
        .arg(worker_id.to_string())
        .kill_on_drop(true);
    command
}

pub async fn run(config: &ServerConfig) -> Result<()> {
    let exe = std::env::current_exe().context("cannot locate the server executable")?;
    let args: Vec<OsString> = std::env::args_os().skip(1).collect();

    info!(
        pid = std::process::id(),
        workers = config.workers,
        "supervisor running on port {}",
        config.port
    );

    supervise_workers(
        &exe,
        &args,
        config.workers,
        config.respawn,
        shutdown_signal(),
    )
    .await?;

    info!("supervisor stopped");

    Ok(())
}

/// Keep `workers` copies of `exe` running until `shutdown` resolves, then
/// stop them all and wait for every one of them.
async fn supervise_workers(
    exe: &Path,
    args: &[OsString],
    workers: usize,
    respawn: bool,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut running = JoinSet::new();

    for worker_id in 0..workers {
        running.spawn(supervise(
            exe.to_path_buf(),
            args.to_vec(),
            worker_id,
            Duration::ZERO,
            shutdown_rx.clone(),
        ));
    }

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutting down workers");
                // receivers live in the worker tasks; a send error only means none are left
                let _ = shutdown_tx.send(true);
                break;
            }
            Some(joined) = running.join_next() => {
                let exit = joined.context("worker supervision task failed")?;
                log_exit(&exit);

                if respawn {
                    info!(worker_id = exit.worker_id, "respawning worker");
                    running.spawn(supervise(
                        exe.to_path_buf(),
                        args.to_vec(),
                        exit.worker_id,
                        RESPAWN_DELAY,
                        shutdown_rx.clone(),
                    ));
                } else if running.is_empty() {
                    bail!("all workers have exited");
                }
            }
        }
    }

    while let Some(joined) = running.join_next().await {
        log_exit(&joined.context("worker supervision task failed")?);
    }

    Ok(())
}

/// Clean exits are routine; anything else must show up at the default
/// verbosity.
fn exit_level(status: &io::Result<ExitStatus>) -> Level {
    match status {
        Ok(status) if status.success() => Level::INFO,
        _ => Level::ERROR,
    }
}

fn log_exit(exit: &WorkerExit) {
    if exit_level(&exit.status) == Level::INFO {
        info!(worker_id = exit.worker_id, pid = ?exit.pid, "worker exited");
        return;
    }

    match &exit.status {
        Ok(status) => {
            error!(worker_id = exit.worker_id, pid = ?exit.pid, "worker died: {status}");
        }
        Err(err) => {
            error!(worker_id = exit.worker_id, pid = ?exit.pid, "worker failed: {err}");
        }
    }
}

/// Ask a worker to shut down gracefully.
#[cfg(unix)]
fn terminate(pid: u32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

    let ret = unsafe { libc::kill(pid, libc::SIGTERM) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn terminate(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "graceful termination needs unix signals",
    ))
}

async fn supervise(
    exe: PathBuf,
    args: Vec<OsString>,
    worker_id: usize,
    delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> WorkerExit {
    if !delay.is_zero() {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                return WorkerExit { worker_id, pid: None, status: Ok(ExitStatus::default()) };
            }
        }
    }

    let mut child = match worker_command(&exe, &args, worker_id).spawn() {
        Ok(child) => child,
        Err(err) => {
            return WorkerExit {
                worker_id,
                pid: None,
                status: Err(err),
            }
        }
    };

    let pid = child.id();
    info!(worker_id, pid = ?pid, "worker started");

    let status = tokio::select! {
        status = child.wait() => status,
        _ = shutdown.changed() => {
            if let Some(pid) = pid {
                if let Err(err) = terminate(pid) {
                    warn!(worker_id, pid, "cannot signal worker: {err}");
                }
            }

            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!(worker_id, pid = ?pid, "worker ignored shutdown, killing it");
                    match child.kill().await {
                        Ok(()) => child.wait().await,
                        Err(err) => Err(err),
                    }
                }
            }
        }
    };

    WorkerExit {
        worker_id,
        pid,
        status,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    /// Resolves once the workers have appended `starts` lines to `path`.
    async fn started(path: PathBuf, starts: usize) {
        loop {
            let seen = std::fs::read_to_string(&path)
                .map(|log| log.lines().count())
                .unwrap_or(0);
            if seen >= starts {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    // `sh -c <script> <log>` runs with $0 set to the log file
    fn shell(script: &str, log: &Path) -> Vec<OsString> {
        vec![
            OsString::from("-c"),
            OsString::from(script),
            log.as_os_str().to_owned(),
        ]
    }

    #[test]
    fn worker_command_appends_worker_id() {
        let args = vec![OsString::from("--port"), OsString::from("5000")];

        let command = worker_command(Path::new("/usr/local/bin/auth-server"), &args, 3);
        let command = command.as_std();

        assert_eq!(command.get_program(), "/usr/local/bin/auth-server");
        let passed: Vec<_> = command.get_args().collect();
        assert_eq!(passed, ["--port", "5000", "--worker-id", "3"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn crashed_worker_is_reported() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let exit = supervise(
            PathBuf::from("/bin/sh"),
            vec![OsString::from("-c"), OsString::from("exit 3")],
            0,
            Duration::ZERO,
            shutdown_rx,
        )
        .await;

        // sh treats the trailing --worker-id 0 as positional parameters
        assert_eq!(exit.worker_id, 0);
        assert!(exit.pid.is_some());
        assert_eq!(exit.status.unwrap().code(), Some(3));
    }

    #[tokio::test]
    async fn missing_executable_is_reported() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let exit = supervise(
            PathBuf::from("/definitely/not/here"),
            Vec::new(),
            1,
            Duration::ZERO,
            shutdown_rx,
        )
        .await;

        assert_eq!(exit.worker_id, 1);
        assert!(exit.pid.is_none());
        assert!(exit.status.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_terminates_workers_gracefully() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("starts");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = tokio::spawn(supervise(
            PathBuf::from("/bin/sh"),
            shell(
                "trap 'exit 7' TERM; echo started >> \"$0\"; while true; do sleep 0.1; done",
                &log,
            ),
            0,
            Duration::ZERO,
            shutdown_rx,
        ));

        started(log, 1).await;
        let begun = Instant::now();
        shutdown_tx.send(true).unwrap();
        let exit = worker.await.unwrap();

        assert!(begun.elapsed() < SHUTDOWN_GRACE, "{:?}", begun.elapsed());
        assert_eq!(exit.status.unwrap().code(), Some(7));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn gives_up_once_every_worker_has_exited() {
        let args = vec![OsString::from("-c"), OsString::from("exit 3")];

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            supervise_workers(
                Path::new("/bin/sh"),
                &args,
                2,
                false,
                std::future::pending(),
            ),
        )
        .await
        .unwrap();

        let err = result.unwrap_err();
        assert!(err.to_string().contains("all workers have exited"), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn respawns_workers_that_exit() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("starts");
        let args = shell("echo started >> \"$0\"; exit 1", &log);

        let result = tokio::time::timeout(
            Duration::from_secs(15),
            supervise_workers(Path::new("/bin/sh"), &args, 1, true, started(log.clone(), 3)),
        )
        .await
        .unwrap();

        assert!(result.is_ok(), "{result:?}");
        let starts = std::fs::read_to_string(&log).unwrap().lines().count();
        assert!(starts >= 3, "worker started {starts} times");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_drains_every_worker() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("starts");
        let args = shell(
            "trap 'exit 0' TERM; echo started >> \"$0\"; while true; do sleep 0.1; done",
            &log,
        );

        let begun = Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(15),
            supervise_workers(Path::new("/bin/sh"), &args, 2, false, started(log, 2)),
        )
        .await
        .unwrap();

        assert!(result.is_ok(), "{result:?}");
        assert!(begun.elapsed() < SHUTDOWN_GRACE, "{:?}", begun.elapsed());
    }

    #[cfg(unix)]
    #[test]
    fn failed_exits_are_logged_as_errors() {
        use std::os::unix::process::ExitStatusExt;

        assert_eq!(exit_level(&Ok(ExitStatus::from_raw(0))), Level::INFO);
        assert_eq!(exit_level(&Ok(ExitStatus::from_raw(3 << 8))), Level::ERROR);
        // killed by SIGKILL
        assert_eq!(exit_level(&Ok(ExitStatus::from_raw(9))), Level::ERROR);
        assert_eq!(
            exit_level(&Err(io::Error::from(io::ErrorKind::NotFound))),
            Level::ERROR
        );
    }
}
