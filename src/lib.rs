//! gantry - the session-channel core of an SSH daemon for container hosts
//!
//! This crate implements the server-side handler for SSH "session" channels:
//! the state machine that receives per-channel requests (`env`, `pty-req`,
//! `window-change`, `signal`, `exec`, `shell`, `subsystem`), launches a child
//! process with or without a pseudoterminal, pumps bytes between the channel
//! and the child, keeps the peer alive, and reports the child's exit.
//!
//! # Architecture
//!
//! - [`channel`] models the channel itself: a bidirectional byte stream with a
//!   stderr sub-stream, a serial inbound request queue, and an outbound
//!   request path back to the peer.
//! - [`session`] owns the per-channel state machine: request dispatch,
//!   process launching, PTY management, exit reporting, and teardown.
//! - [`wire`] is the SSH wire codec for request payloads.
//! - [`scp`] defines the file-copy collaborator invoked for `scp` commands.
//! - [`config`] carries the daemon-facing knobs (keepalive interval, default
//!   environment).
//!
//! The SSH transport itself (framing, key exchange, authentication,
//! channel-open negotiation) is the embedding daemon's job; it hands accepted
//! session channels to [`session::SessionChannelHandler`].

pub mod channel;
pub mod config;
pub mod scp;
pub mod session;
pub mod wire;
