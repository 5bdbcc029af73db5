use std::{io, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Child,
    task::JoinHandle,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::telemetry::{DecodedLine, LineDecoder, LineSplitter, LogLine, LogSource};

use super::{events::EventBus, state::SessionEnd};

// Set to false to silence the per-session worker logs.
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StreamStats {
    pub records: u64,
    pub logs: u64,
    pub bytes: u64,
}

/// Decode engine stdout until EOF, publishing records and demoted lines.
pub(crate) async fn pump_stdout<R>(
    mut reader: R,
    bus: EventBus,
    max_line_bytes: usize,
    session_id: String,
) -> StreamStats
where
    R: AsyncRead + Unpin,
{
    let mut decoder = LineDecoder::new(max_line_bytes);
    let mut stats = StreamStats::default();
    let mut buf = vec![0u8; READ_CHUNK_BYTES];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                stats.bytes += n as u64;
                for decoded in decoder.push(&buf[..n]) {
                    publish_decoded(&bus, decoded, &mut stats);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                log_warn!("stdout read failed for session {session_id}: {err}");
                break;
            }
        }
    }

    if let Some(decoded) = decoder.finish() {
        publish_decoded(&bus, decoded, &mut stats);
    }

    log_debug!(
        "stdout closed for session {session_id}: {} records, {} log lines, {} bytes",
        stats.records,
        stats.logs,
        stats.bytes
    );
    stats
}

/// Forward every stderr line verbatim as a log line.
pub(crate) async fn pump_stderr<R>(
    mut reader: R,
    bus: EventBus,
    max_line_bytes: usize,
    session_id: String,
) -> StreamStats
where
    R: AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::new(max_line_bytes);
    let mut stats = StreamStats::default();
    let mut buf = vec![0u8; READ_CHUNK_BYTES];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                stats.bytes += n as u64;
                for line in splitter.push(&buf[..n]) {
                    stats.logs += 1;
                    bus.publish_log(LogLine::new(LogSource::Stderr, line.into_text()));
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                log_warn!("stderr read failed for session {session_id}: {err}");
                break;
            }
        }
    }

    if let Some(line) = splitter.finish() {
        stats.logs += 1;
        bus.publish_log(LogLine::new(LogSource::Stderr, line.into_text()));
    }

    log_debug!("stderr closed for session {session_id}: {} lines", stats.logs);
    stats
}

fn publish_decoded(bus: &EventBus, decoded: DecodedLine, stats: &mut StreamStats) {
    match decoded {
        DecodedLine::Record(record) => {
            stats.records += 1;
            bus.publish_record(record);
        }
        DecodedLine::Log(text) => {
            stats.logs += 1;
            bus.publish_log(LogLine::new(LogSource::Stdout, text));
        }
    }
}

/// Everything the supervisor needs to own for one engine run.
pub(crate) struct SupervisedChild {
    pub session_id: String,
    pub child: Child,
    pub readers: Vec<JoinHandle<StreamStats>>,
    pub cancel: CancellationToken,
    pub stop_grace: Duration,
    pub drain_timeout: Duration,
}

/// Wait for the engine to exit on its own or for a stop request, then make
/// sure the process tree is gone and the output readers are finished.
pub(crate) async fn supervise(task: SupervisedChild) -> SessionEnd {
    let SupervisedChild {
        session_id,
        mut child,
        readers,
        cancel,
        stop_grace,
        drain_timeout,
    } = task;

    let pid = child.id();

    let end = tokio::select! {
        exited = leader_exit(&mut child, pid) => {
            if let Err(err) = exited {
                log_warn!("waiting on engine for session {session_id} failed: {err}");
            }
            // Helpers the engine forked may still hold the pipes open.
            signal_group(pid, Signal::Kill);
            match child.wait().await {
                Ok(status) => SessionEnd::Exited(status),
                Err(err) => {
                    log_warn!("reaping engine for session {session_id} failed: {err}");
                    SessionEnd::WaitFailed
                }
            }
        },
        _ = cancel.cancelled() => terminate(&mut child, pid, stop_grace, &session_id).await,
    };

    drain_readers(readers, drain_timeout, &session_id).await;

    log_info!("session {session_id} finished: {}", end.describe());
    end
}

async fn terminate(
    child: &mut Child,
    pid: Option<u32>,
    grace: Duration,
    session_id: &str,
) -> SessionEnd {
    if !signal_group(pid, Signal::Terminate) {
        if let Err(err) = child.start_kill() {
            log_warn!("failed to signal engine for session {session_id}: {err}");
        }
    }

    match time::timeout(grace, leader_exit(child, pid)).await {
        Ok(exited) => {
            if let Err(err) = exited {
                log_warn!("waiting on engine for session {session_id} failed: {err}");
            }
            signal_group(pid, Signal::Kill);
            SessionEnd::Terminated {
                exit: child.wait().await.ok(),
                forced: false,
            }
        }
        Err(_) => {
            log_warn!(
                "engine for session {session_id} ignored stop for {}ms; killing",
                grace.as_millis()
            );
            signal_group(pid, Signal::Kill);
            let exit = match time::timeout(grace, child.kill()).await {
                Ok(Ok(())) => child.try_wait().ok().flatten(),
                Ok(Err(err)) => {
                    log_warn!("kill failed for session {session_id}: {err}");
                    None
                }
                Err(_) => None,
            };
            SessionEnd::Terminated { exit, forced: true }
        }
    }
}

/// Resolves once the engine has exited. On unix the leader is left as a
/// zombie so its pid keeps reserving the group id until the caller has
/// signalled the rest of the group and reaped it with `Child::wait`.
async fn leader_exit(child: &mut Child, pid: Option<u32>) -> io::Result<()> {
    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            return wait_unreaped(pid).await;
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
    child.wait().await.map(|_| ())
}

#[cfg(unix)]
async fn wait_unreaped(pid: u32) -> io::Result<()> {
    let id = libc::id_t::from(pid);
    tokio::task::spawn_blocking(move || loop {
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::waitid(libc::P_PID, id, &mut info, libc::WEXITED | libc::WNOWAIT) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    })
    .await
    .map_err(io::Error::other)?
}

async fn drain_readers(readers: Vec<JoinHandle<StreamStats>>, limit: Duration, session_id: &str) {
    let deadline = Instant::now() + limit;
    for mut handle in readers {
        match time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => log_warn!("output reader for session {session_id} failed: {err}"),
            Err(_) => {
                log_warn!("output reader for session {session_id} did not finish; aborting");
                handle.abort();
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

/// Signal the engine's whole process group. Returns false when no signal
/// could be delivered this way.
#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: Signal) -> bool {
    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return false;
    };
    let signo = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // The engine is spawned as the leader of its own group.
    let result = unsafe { libc::kill(-pid, signo) };
    result == 0
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: Signal) -> bool {
    false
}
