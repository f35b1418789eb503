//! Typed payloads for the session-channel request types

use super::{Reader, WireError, Writer};

/// Request types consumed by a session channel.
pub const ENV_REQUEST: &str = "env";
pub const PTY_REQUEST: &str = "pty-req";
pub const WINDOW_CHANGE_REQUEST: &str = "window-change";
pub const SIGNAL_REQUEST: &str = "signal";
pub const EXEC_REQUEST: &str = "exec";
pub const SHELL_REQUEST: &str = "shell";
pub const SUBSYSTEM_REQUEST: &str = "subsystem";

/// Request types emitted on a session channel.
pub const EXIT_STATUS: &str = "exit-status";
pub const EXIT_SIGNAL: &str = "exit-signal";
pub const KEEPALIVE_REQUEST: &str = "keepalive@cloudfoundry.org";

/// `env` payload: one environment variable for the child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvRequest {
    pub name: String,
    pub value: String,
}

impl EnvRequest {
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let msg = Self {
            name: r.read_string()?,
            value: r.read_string()?,
        };
        r.finish()?;
        Ok(msg)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_string(&self.name).put_string(&self.value);
        w.into_bytes()
    }
}

/// `pty-req` payload: terminal name, dimensions, and the encoded modelist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub columns: u32,
    pub rows: u32,
    pub width_px: u32,
    pub height_px: u32,
    pub modelist: Vec<u8>,
}

impl PtyRequest {
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let msg = Self {
            term: r.read_string()?,
            columns: r.read_u32()?,
            rows: r.read_u32()?,
            width_px: r.read_u32()?,
            height_px: r.read_u32()?,
            modelist: r.read_bytes()?,
        };
        r.finish()?;
        Ok(msg)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_string(&self.term)
            .put_u32(self.columns)
            .put_u32(self.rows)
            .put_u32(self.width_px)
            .put_u32(self.height_px)
            .put_bytes(&self.modelist);
        w.into_bytes()
    }
}

/// `window-change` payload: a resize of an already-negotiated terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowChangeRequest {
    pub columns: u32,
    pub rows: u32,
    pub width_px: u32,
    pub height_px: u32,
}

impl WindowChangeRequest {
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let msg = Self {
            columns: r.read_u32()?,
            rows: r.read_u32()?,
            width_px: r.read_u32()?,
            height_px: r.read_u32()?,
        };
        r.finish()?;
        Ok(msg)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u32(self.columns)
            .put_u32(self.rows)
            .put_u32(self.width_px)
            .put_u32(self.height_px);
        w.into_bytes()
    }
}

/// `signal` payload: an SSH signal name without the `SIG` prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalRequest {
    pub signal: String,
}

impl SignalRequest {
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let msg = Self {
            signal: r.read_string()?,
        };
        r.finish()?;
        Ok(msg)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_string(&self.signal);
        w.into_bytes()
    }
}

/// `exec` payload: the command line to hand to the shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub command: String,
}

impl ExecRequest {
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let msg = Self {
            command: r.read_string()?,
        };
        r.finish()?;
        Ok(msg)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_string(&self.command);
        w.into_bytes()
    }
}

/// `subsystem` payload: the name of the requested subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsystemRequest {
    pub name: String,
}

impl SubsystemRequest {
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let msg = Self {
            name: r.read_string()?,
        };
        r.finish()?;
        Ok(msg)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_string(&self.name);
        w.into_bytes()
    }
}

/// `exit-status` payload: the child exited normally with this code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatusMessage {
    pub status: u32,
}

impl ExitStatusMessage {
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let msg = Self {
            status: r.read_u32()?,
        };
        r.finish()?;
        Ok(msg)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u32(self.status);
        w.into_bytes()
    }
}

/// `exit-signal` payload: the child was terminated by a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitSignalMessage {
    pub signal: String,
    pub core_dumped: bool,
    pub error_message: String,
    pub language_tag: String,
}

impl ExitSignalMessage {
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let msg = Self {
            signal: r.read_string()?,
            core_dumped: r.read_bool()?,
            error_message: r.read_string()?,
            language_tag: r.read_string()?,
        };
        r.finish()?;
        Ok(msg)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_string(&self.signal)
            .put_bool(self.core_dumped)
            .put_string(&self.error_message)
            .put_string(&self.language_tag);
        w.into_bytes()
    }
}
