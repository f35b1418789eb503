//! Process launching - shell resolution, environment construction, stdio wiring

use std::collections::HashMap;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use nix::unistd::Pid;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::pty::PtyMaster;
use crate::channel::ChannelIo;
use crate::wire::PtyRequest;

/// Shells tried in order at handler construction; the first one found wins.
const SHELL_CANDIDATES: &[&str] = &["/bin/bash", "/usr/local/bin/bash", "/bin/sh", "bash", "sh"];

/// Used when no candidate resolves, making shell resolution infallible.
const FALLBACK_SHELL: &str = "/bin/sh";

const PUMP_BUFFER: usize = 8 * 1024;

/// Resolve the shell every session of this handler will run.
pub(super) fn locate_shell() -> PathBuf {
    SHELL_CANDIDATES
        .iter()
        .find_map(|candidate| look_path(candidate))
        .unwrap_or_else(|| PathBuf::from(FALLBACK_SHELL))
}

/// `PATH`-style lookup: names with a slash are checked directly, bare names
/// are searched across the daemon's `PATH`.
fn look_path(candidate: &str) -> Option<PathBuf> {
    if candidate.contains('/') {
        let path = PathBuf::from(candidate);
        return is_executable(&path).then_some(path);
    }

    let search_path = std::env::var_os("PATH")?;
    std::env::split_paths(&search_path)
        .map(|dir| dir.join(candidate))
        .find(|path| is_executable(path))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Build the child's environment vector.
///
/// `PATH` and `LANG` are pinned and `HOME`/`USER` always come from the
/// daemon's own environment, so none of the four can be overridden through
/// per-channel `env` requests.
pub(super) fn build_environment(env: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut vars = Vec::with_capacity(env.len() + 4);

    vars.push(("PATH".to_string(), "/bin:/usr/bin".to_string()));
    vars.push(("LANG".to_string(), "en_US.UTF8".to_string()));

    for (name, value) in env {
        if !matches!(name.as_str(), "HOME" | "USER" | "PATH" | "LANG") {
            vars.push((name.clone(), value.clone()));
        }
    }

    vars.push((
        "HOME".to_string(),
        std::env::var("HOME").unwrap_or_default(),
    ));
    vars.push((
        "USER".to_string(),
        std::env::var("USER").unwrap_or_default(),
    ));

    vars
}

/// A started child plus everything the session must track for it.
pub(super) struct Launched {
    pub child: Child,
    pub pid: Pid,
    pub pty_master: Option<PtyMaster>,
    /// Pumps teardown drains before closing the channel.
    pub pumps: Vec<JoinHandle<()>>,
    /// Pumps the waiter drains before reporting the exit, so the exit
    /// notification never outruns the child's final output.
    pub drain: Vec<JoinHandle<()>>,
}

/// Launch without a PTY: stdout and stderr stream to the channel and its
/// stderr sub-stream, and a detached copier feeds the stdin pipe until the
/// peer signals EOF or the channel closes.
pub(super) fn launch(
    shell: &Path,
    args: &[String],
    env: Vec<(String, String)>,
    io: ChannelIo,
    closed: CancellationToken,
) -> Result<Launched> {
    let mut command = Command::new(shell);
    command
        .args(args)
        .env_clear()
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().context("spawning shell")?;
    let pid = child_pid(&child)?;

    let stdin = child.stdin.take().context("child stdin missing")?;
    let stdout = child.stdout.take().context("child stdout missing")?;
    let stderr = child.stderr.take().context("child stderr missing")?;

    let (channel_read, channel_write) = tokio::io::split(io.data);

    // Detached on purpose: it ends at peer EOF or channel close, and closing
    // the stdin pipe is what tells the child no more input is coming.
    tokio::spawn(async move {
        let mut reader = channel_read;
        let mut stdin = stdin;
        tokio::select! {
            result = tokio::io::copy(&mut reader, &mut stdin) => {
                if let Err(err) = result {
                    debug!(error = %err, "stdin copy ended");
                }
            }
            _ = closed.cancelled() => {}
        }
    });

    let stdout_pump = tokio::spawn(async move {
        let mut stdout = stdout;
        let mut writer = channel_write;
        if let Err(err) = tokio::io::copy(&mut stdout, &mut writer).await {
            debug!(error = %err, "stdout copy ended");
        }
    });

    let stderr_pump = tokio::spawn(async move {
        let mut stderr = stderr;
        let mut writer = io.stderr;
        if let Err(err) = tokio::io::copy(&mut stderr, &mut writer).await {
            debug!(error = %err, "stderr copy ended");
        }
    });

    Ok(Launched {
        child,
        pid,
        pty_master: None,
        pumps: Vec::new(),
        drain: vec![stdout_pump, stderr_pump],
    })
}

/// Launch on a PTY: the child becomes a session leader with the slave as its
/// controlling terminal and all three stdio streams bound to it. The master
/// stays with the session; a bidirectional pump pair bridges channel and
/// master.
pub(super) fn launch_with_pty(
    shell: &Path,
    args: &[String],
    env: Vec<(String, String)>,
    pty_request: &PtyRequest,
    io: ChannelIo,
    closed: CancellationToken,
) -> Result<Launched> {
    let (master, slave) = PtyMaster::open(pty_request.columns, pty_request.rows)?;
    master.apply_modes(&pty_request.modelist);
    if let Err(err) = master.set_window_size(pty_request.columns, pty_request.rows) {
        debug!(error = %err, "failed to set initial window size");
    }

    let mut command = Command::new(shell);
    command
        .args(args)
        .env_clear()
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    let slave_fd = slave.as_raw_fd();
    // SAFETY: setsid/ioctl/dup2/close are async-signal-safe.
    unsafe {
        command.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            libc::dup2(slave_fd, 0);
            libc::dup2(slave_fd, 1);
            libc::dup2(slave_fd, 2);
            if slave_fd > 2 {
                libc::close(slave_fd);
            }
            Ok(())
        });
    }

    let child = command.spawn().context("spawning shell on pty")?;
    // The child holds its own copies now; the parent must not keep the slave
    // open or the master never sees EOF.
    drop(slave);
    let pid = child_pid(&child)?;

    let (channel_read, channel_write) = tokio::io::split(io.data);

    let to_pty = {
        let master = master.clone();
        let closed = closed.clone();
        tokio::spawn(async move {
            let mut reader = channel_read;
            let mut buf = vec![0u8; PUMP_BUFFER];
            loop {
                tokio::select! {
                    read = reader.read(&mut buf) => match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if master.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    },
                    _ = closed.cancelled() => break,
                }
            }
        })
    };

    let from_pty = {
        let master = master.clone();
        tokio::spawn(async move {
            // The stderr sub-stream is unused on a PTY but stays open until
            // the output drains.
            let _stderr = io.stderr;
            let mut writer = channel_write;
            let mut buf = vec![0u8; PUMP_BUFFER];
            loop {
                match master.read(&mut buf).await {
                    // EIO here means the slave side is gone: the child is done.
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if writer.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    };

    Ok(Launched {
        child,
        pid,
        pty_master: Some(master),
        pumps: vec![to_pty, from_pty],
        drain: Vec::new(),
    })
}

fn child_pid(child: &Child) -> Result<Pid> {
    let raw = child.id().context("child exited before its pid was read")?;
    Ok(Pid::from_raw(raw as i32))
}
