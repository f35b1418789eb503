//! Session channel handling - request dispatch, launch, exit reporting, teardown
//!
//! One [`Session`] exists per accepted channel. Control requests mutate its
//! state under a single mutex; the first `exec` or `shell` request commits it
//! to a running child. From there four concerns run concurrently: the serial
//! request dispatcher, the I/O pumps, the keepalive ticker, and the waiter
//! that reaps the child and reports its exit. All of them converge on
//! [`Session::teardown`], which runs exactly once.

mod launcher;
mod pty;
mod signals;

use std::collections::HashMap;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::{
    ChannelIo, ChannelOpen, ChannelRequest, RequestSender, SessionChannel, SESSION_CHANNEL_TYPE,
};
use crate::config::Config;
use crate::scp::{is_scp_command, ScpCopier};
use crate::wire::{
    self, EnvRequest, ExecRequest, ExitSignalMessage, ExitStatusMessage, PtyRequest, SignalRequest,
    SubsystemRequest, WindowChangeRequest,
};

use launcher::Launched;
use pty::PtyMaster;

/// Accepts inbound session-channel opens and services them.
///
/// The handler resolves the shell once at construction and stamps every
/// session with the same default environment, keepalive interval, and scp
/// copier.
pub struct SessionChannelHandler {
    shell_path: PathBuf,
    default_env: HashMap<String, String>,
    keepalive_interval: Duration,
    copier: Arc<dyn ScpCopier>,
}

impl SessionChannelHandler {
    pub fn new(
        default_env: HashMap<String, String>,
        keepalive_interval: Duration,
        copier: Arc<dyn ScpCopier>,
    ) -> Self {
        Self {
            shell_path: launcher::locate_shell(),
            default_env,
            keepalive_interval,
            copier,
        }
    }

    pub fn from_config(config: &Config, copier: Arc<dyn ScpCopier>) -> Self {
        Self::new(
            config.session.default_env.clone(),
            config.session.keepalive_interval(),
            copier,
        )
    }

    /// Accept an inbound channel-open and service its requests until the
    /// peer is done. Channel types other than "session" are rejected.
    pub async fn handle_channel_open(&self, open: ChannelOpen) {
        if open.channel_type() != SESSION_CHANNEL_TYPE {
            debug!(
                channel_type = open.channel_type(),
                "rejecting channel open"
            );
            open.reject("unsupported channel type");
            return;
        }

        let (session, requests) = Session::new(self, open.accept());
        session.service_requests(requests).await;
    }
}

/// Mutable per-channel state, guarded by the session mutex. The mutex is
/// held across state mutation and the launch commit, never across channel
/// I/O or the child wait.
struct SessionState {
    env: HashMap<String, String>,
    alloc_pty: bool,
    pty_request: PtyRequest,
    /// Presence is the running predicate: a second exec/shell is rejected.
    child: Option<Pid>,
    pty_master: Option<PtyMaster>,
    io: Option<ChannelIo>,
    /// Outstanding I/O copiers teardown drains before closing anything.
    pumps: Vec<JoinHandle<()>>,
    keepalive_stop: Option<CancellationToken>,
    complete: bool,
}

struct Session {
    id: Uuid,
    shell_path: PathBuf,
    keepalive_interval: Duration,
    copier: Arc<dyn ScpCopier>,
    outbound: RequestSender,
    closed: CancellationToken,
    state: Mutex<SessionState>,
}

impl Session {
    fn new(
        handler: &SessionChannelHandler,
        channel: SessionChannel,
    ) -> (Arc<Self>, mpsc::Receiver<ChannelRequest>) {
        let (io, requests, outbound, closed) = channel.into_parts();
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            shell_path: handler.shell_path.clone(),
            keepalive_interval: handler.keepalive_interval,
            copier: Arc::clone(&handler.copier),
            outbound,
            closed,
            state: Mutex::new(SessionState {
                env: handler.default_env.clone(),
                alloc_pty: false,
                pty_request: PtyRequest::default(),
                child: None,
                pty_master: None,
                io: Some(io),
                pumps: Vec::new(),
                keepalive_stop: None,
                complete: false,
            }),
        });
        (session, requests)
    }

    /// Consume the channel's request stream in arrival order. Dispatch
    /// finishes request N before reading request N+1, so control requests
    /// apply in peer-send order.
    async fn service_requests(self: Arc<Self>, mut requests: mpsc::Receiver<ChannelRequest>) {
        while let Some(mut request) = requests.recv().await {
            if self.state.lock().await.complete {
                request.reply(false);
                continue;
            }

            match request.kind() {
                wire::ENV_REQUEST => self.handle_env_request(&mut request).await,
                wire::PTY_REQUEST => self.handle_pty_request(&mut request).await,
                wire::WINDOW_CHANGE_REQUEST => {
                    self.handle_window_change_request(&mut request).await
                }
                wire::SIGNAL_REQUEST => self.handle_signal_request(&mut request).await,
                wire::EXEC_REQUEST => {
                    Arc::clone(&self).handle_exec_request(&mut request).await
                }
                wire::SHELL_REQUEST => {
                    Arc::clone(&self).handle_shell_request(&mut request).await
                }
                wire::SUBSYSTEM_REQUEST => self.handle_subsystem_request(&mut request).await,
                other => {
                    debug!(session = %self.id, kind = other, "unknown request type");
                    request.reply(false);
                }
            }
        }
        debug!(session = %self.id, "request stream ended");
    }

    async fn handle_env_request(&self, request: &mut ChannelRequest) {
        let message = match EnvRequest::decode(request.payload()) {
            Ok(message) => message,
            Err(err) => {
                warn!(session = %self.id, error = %err, "malformed env request");
                request.reply(false);
                return;
            }
        };

        let mut state = self.state.lock().await;
        state.env.insert(message.name, message.value);
        drop(state);

        request.reply(true);
    }

    async fn handle_pty_request(&self, request: &mut ChannelRequest) {
        let message = match PtyRequest::decode(request.payload()) {
            Ok(message) => message,
            Err(err) => {
                warn!(session = %self.id, error = %err, "malformed pty request");
                request.reply(false);
                return;
            }
        };

        let mut state = self.state.lock().await;
        state.alloc_pty = true;
        state.env.insert("TERM".to_string(), message.term.clone());
        state.pty_request = message;
        drop(state);

        request.reply(true);
    }

    async fn handle_window_change_request(&self, request: &mut ChannelRequest) {
        let message = match WindowChangeRequest::decode(request.payload()) {
            Ok(message) => message,
            Err(err) => {
                warn!(session = %self.id, error = %err, "malformed window-change request");
                request.reply(false);
                return;
            }
        };

        let mut state = self.state.lock().await;
        if state.alloc_pty {
            state.pty_request.columns = message.columns;
            state.pty_request.rows = message.rows;
        }
        if let Some(master) = &state.pty_master {
            let (columns, rows) = (state.pty_request.columns, state.pty_request.rows);
            if let Err(err) = master.set_window_size(columns, rows) {
                // The resize is best-effort; the reply stays positive.
                warn!(session = %self.id, error = %err, "failed to set window size");
            }
        }
        drop(state);

        request.reply(true);
    }

    async fn handle_signal_request(&self, request: &mut ChannelRequest) {
        let message = match SignalRequest::decode(request.payload()) {
            Ok(message) => message,
            Err(err) => {
                warn!(session = %self.id, error = %err, "malformed signal request");
                request.reply(false);
                return;
            }
        };

        let state = self.state.lock().await;
        if let Some(pid) = state.child {
            let signal = signals::os_signal(&message.signal);
            if let Err(err) = signals::deliver(pid, signal) {
                warn!(
                    session = %self.id,
                    signal = %message.signal,
                    error = %err,
                    "failed to deliver signal"
                );
            }
        }
        drop(state);

        request.reply(true);
    }

    async fn handle_exec_request(self: Arc<Self>, request: &mut ChannelRequest) {
        let message = match ExecRequest::decode(request.payload()) {
            Ok(message) => message,
            Err(err) => {
                warn!(session = %self.id, error = %err, "malformed exec request");
                request.reply(false);
                return;
            }
        };

        if is_scp_command(&message.command) {
            info!(session = %self.id, command = %message.command, "handling scp command");
            self.execute_scp(&message.command, request).await;
        } else {
            self.execute_shell(request, vec!["-c".to_string(), message.command])
                .await;
        }
    }

    async fn handle_shell_request(self: Arc<Self>, request: &mut ChannelRequest) {
        self.execute_shell(request, Vec::new()).await;
    }

    async fn handle_subsystem_request(&self, request: &mut ChannelRequest) {
        match SubsystemRequest::decode(request.payload()) {
            Ok(message) => {
                debug!(session = %self.id, subsystem = %message.name, "subsystem not supported");
            }
            Err(err) => {
                warn!(session = %self.id, error = %err, "malformed subsystem request");
            }
        }
        request.reply(false);
    }

    /// Commit the session to a running child. The positive reply goes out
    /// before the child starts: the SSH protocol requires it to precede any
    /// exit notification.
    async fn execute_shell(self: Arc<Self>, request: &mut ChannelRequest, args: Vec<String>) {
        let mut state = self.state.lock().await;

        if state.child.is_some() {
            warn!(session = %self.id, "command already started");
            request.reply(false);
            return;
        }
        let Some(io) = state.io.take() else {
            request.reply(false);
            return;
        };
        let env = launcher::build_environment(&state.env);

        request.reply(true);

        let launched = if state.alloc_pty {
            launcher::launch_with_pty(
                &self.shell_path,
                &args,
                env,
                &state.pty_request,
                io,
                self.closed.clone(),
            )
        } else {
            launcher::launch(&self.shell_path, &args, env, io, self.closed.clone())
        };

        let Launched {
            child,
            pid,
            pty_master,
            pumps,
            drain,
        } = match launched {
            Ok(launched) => launched,
            Err(err) => {
                error!(session = %self.id, error = %err, "launch failed");
                drop(state);
                self.send_exit_status(255).await;
                self.teardown().await;
                return;
            }
        };

        debug!(session = %self.id, pid = pid.as_raw(), "child started");
        state.child = Some(pid);
        state.pty_master = pty_master;
        state.pumps.extend(pumps);

        let stop = CancellationToken::new();
        state.keepalive_stop = Some(stop.clone());
        drop(state);

        if !self.keepalive_interval.is_zero() {
            tokio::spawn(Arc::clone(&self).keepalive(pid, stop));
        }
        tokio::spawn(self.wait_for_child(child, drain));
    }

    /// Hand the channel to the scp copier instead of a shell. The keepalive
    /// is deliberately not started on this path.
    async fn execute_scp(self: Arc<Self>, command: &str, request: &mut ChannelRequest) {
        let io = {
            let mut state = self.state.lock().await;
            match state.io.take() {
                Some(io) => io,
                None => {
                    request.reply(false);
                    return;
                }
            }
        };

        request.reply(true);

        let status = match self.copier.copy(command, io).await {
            Ok(()) => 0,
            Err(err) => {
                error!(session = %self.id, error = %err, "scp copy failed");
                1
            }
        };

        self.send_exit_status(status).await;
        self.teardown().await;
    }

    /// Reap the child, flush its remaining output, report the exit, tear
    /// down.
    async fn wait_for_child(
        self: Arc<Self>,
        mut child: tokio::process::Child,
        drain: Vec<JoinHandle<()>>,
    ) {
        let status = child.wait().await;
        for pump in drain {
            let _ = pump.await;
        }
        self.send_exit_message(status).await;
        self.teardown().await;
    }

    /// Emit exactly one of `exit-status` / `exit-signal` for a reaped child.
    /// Anything that cannot be decoded reports status 255.
    async fn send_exit_message(&self, status: io::Result<ExitStatus>) {
        let status = match status {
            Ok(status) => status,
            Err(err) => {
                error!(session = %self.id, error = %err, "failed to wait for child");
                self.send_exit_status(255).await;
                return;
            }
        };

        if let Some(code) = status.code() {
            debug!(session = %self.id, code, "child exited");
            self.send_exit_status(code as u32).await;
        } else if let Some(raw) = status.signal() {
            let message = ExitSignalMessage {
                signal: signals::ssh_signal_name(raw).unwrap_or_default().to_string(),
                core_dumped: status.core_dumped(),
                error_message: String::new(),
                language_tag: String::new(),
            };
            debug!(session = %self.id, signal = %message.signal, "child killed by signal");
            if let Err(err) = self
                .outbound
                .send(wire::EXIT_SIGNAL, false, message.encode())
                .await
            {
                warn!(session = %self.id, error = %err, "failed to send exit-signal");
            }
        } else {
            self.send_exit_status(255).await;
        }
    }

    async fn send_exit_status(&self, status: u32) {
        let message = ExitStatusMessage { status };
        if let Err(err) = self
            .outbound
            .send(wire::EXIT_STATUS, false, message.encode())
            .await
        {
            warn!(session = %self.id, error = %err, "failed to send exit-status");
        }
    }

    /// Probe the peer on a fixed cadence. A failed probe means the transport
    /// is gone: the child gets SIGHUP and the loop ends. The loop never
    /// sends an exit notification itself.
    async fn keepalive(self: Arc<Self>, pid: Pid, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(self.keepalive_interval);
        // interval fires immediately; the first probe waits a full period
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self
                        .outbound
                        .send(wire::KEEPALIVE_REQUEST, true, Vec::new())
                        .await
                    {
                        Ok(_) => debug!(session = %self.id, "keepalive"),
                        Err(_) => {
                            info!(session = %self.id, "keepalive failed, hanging up child");
                            if let Err(err) = signals::deliver(pid, Some(Signal::SIGHUP)) {
                                warn!(session = %self.id, error = %err, "failed to hang up child");
                            }
                            return;
                        }
                    }
                }
                _ = stop.cancelled() => return,
            }
        }
    }

    /// Convergence point for every exit path. Idempotent: the first call
    /// drains the pumps and closes the channel, the PTY master, and the
    /// keepalive; later calls return immediately.
    ///
    /// The pumps drain before anything closes so outstanding writes to the
    /// peer complete. The child is never killed here; that is the peer's
    /// job via signal requests.
    async fn teardown(&self) {
        let mut state = self.state.lock().await;
        if state.complete {
            return;
        }

        let pumps = std::mem::take(&mut state.pumps);
        for pump in pumps {
            let _ = pump.await;
        }

        state.complete = true;
        self.closed.cancel();
        state.io = None;
        state.pty_master = None;
        if let Some(stop) = state.keepalive_stop.take() {
            stop.cancel();
        }
        debug!(session = %self.id, "session complete");
    }
}
