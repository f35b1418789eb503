//! Session channel plumbing - byte streams, request queues, open handshake
//!
//! A session channel is three things at once: a bidirectional byte stream to
//! the peer, a secondary stderr sub-stream, and a pair of request paths (a
//! serial inbound queue consumed by the session's dispatcher, and an outbound
//! path for exit notifications and keepalives). The transport adapter builds
//! a [`ChannelOpen`] per incoming channel-open and keeps the [`PeerChannel`]
//! half; the daemon side receives a [`SessionChannel`].

use thiserror::Error;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Channel type handled by the session core.
pub const SESSION_CHANNEL_TYPE: &str = "session";

/// In-flight window for each byte stream.
const STREAM_BUFFER: usize = 64 * 1024;

/// Inbound requests queued ahead of the dispatcher.
const REQUEST_QUEUE: usize = 32;

/// The sending half of a request was dropped: the peer (or the transport
/// carrying it) is gone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("channel closed")]
pub struct ChannelClosed;

/// A single channel request, in either direction.
///
/// When the sender asked for a reply, [`ChannelRequest::reply`] delivers it;
/// otherwise replying is a no-op. A request dropped without a reply reads as
/// a failure on the requesting side.
#[derive(Debug)]
pub struct ChannelRequest {
    kind: String,
    want_reply: bool,
    payload: Vec<u8>,
    reply: Option<oneshot::Sender<bool>>,
}

impl ChannelRequest {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Answer the request. Only the first call sends anything.
    pub fn reply(&mut self, accepted: bool) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(accepted);
        }
    }
}

/// The two byte streams of a channel, daemon side: `data` carries peer input
/// and child output, `stderr` carries child diagnostics.
pub struct ChannelIo {
    pub data: DuplexStream,
    pub stderr: DuplexStream,
}

/// Outbound request path from the session back to the peer.
#[derive(Clone)]
pub struct RequestSender {
    tx: mpsc::UnboundedSender<ChannelRequest>,
}

impl RequestSender {
    /// Send a request to the peer. With `want_reply` the call resolves to the
    /// peer's answer; without, it resolves as soon as the request is queued.
    pub async fn send(
        &self,
        kind: &str,
        want_reply: bool,
        payload: Vec<u8>,
    ) -> Result<bool, ChannelClosed> {
        let (reply_tx, reply_rx) = if want_reply {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        self.tx
            .send(ChannelRequest {
                kind: kind.to_string(),
                want_reply,
                payload,
                reply: reply_tx,
            })
            .map_err(|_| ChannelClosed)?;

        match reply_rx {
            Some(rx) => rx.await.map_err(|_| ChannelClosed),
            None => Ok(true),
        }
    }
}

/// Daemon-side half of an accepted session channel.
pub struct SessionChannel {
    io: ChannelIo,
    requests: mpsc::Receiver<ChannelRequest>,
    outbound: RequestSender,
    closed: CancellationToken,
}

impl SessionChannel {
    /// Decompose the channel for the session to own piecewise: byte streams,
    /// the serial request stream, the outbound request path, and the close
    /// token the session cancels at teardown.
    pub fn into_parts(
        self,
    ) -> (
        ChannelIo,
        mpsc::Receiver<ChannelRequest>,
        RequestSender,
        CancellationToken,
    ) {
        (self.io, self.requests, self.outbound, self.closed)
    }
}

/// Peer-side half of a session channel, held by the transport adapter (and by
/// tests standing in for a real SSH client).
#[derive(Debug)]
pub struct PeerChannel {
    /// Write: bytes for the child's stdin. Read: the child's stdout.
    pub data: DuplexStream,
    /// Read-only: the child's stderr.
    pub stderr: DuplexStream,
    requests: mpsc::Sender<ChannelRequest>,
    outbound: Option<mpsc::UnboundedReceiver<ChannelRequest>>,
    closed: CancellationToken,
}

impl PeerChannel {
    /// Send a channel request to the session. Returns the session's reply
    /// when one was asked for.
    pub async fn send_request(
        &self,
        kind: &str,
        want_reply: bool,
        payload: Vec<u8>,
    ) -> Result<Option<bool>, ChannelClosed> {
        let (reply_tx, reply_rx) = if want_reply {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        self.requests
            .send(ChannelRequest {
                kind: kind.to_string(),
                want_reply,
                payload,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ChannelClosed)?;

        match reply_rx {
            Some(rx) => rx.await.map(Some).map_err(|_| ChannelClosed),
            None => Ok(None),
        }
    }

    /// Receive the next request emitted by the session (exit notifications,
    /// keepalives). `None` once the session is gone.
    pub async fn recv_request(&mut self) -> Option<ChannelRequest> {
        match self.outbound.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Detach the outbound request stream, e.g. to drop it and simulate a
    /// dead transport.
    pub fn take_request_stream(&mut self) -> Option<mpsc::UnboundedReceiver<ChannelRequest>> {
        self.outbound.take()
    }

    /// Token cancelled when the session closes the channel.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// Build a connected channel pair.
pub fn channel_pair() -> (SessionChannel, PeerChannel) {
    let (server_data, peer_data) = tokio::io::duplex(STREAM_BUFFER);
    let (server_stderr, peer_stderr) = tokio::io::duplex(STREAM_BUFFER);
    let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let closed = CancellationToken::new();

    let session = SessionChannel {
        io: ChannelIo {
            data: server_data,
            stderr: server_stderr,
        },
        requests: request_rx,
        outbound: RequestSender { tx: outbound_tx },
        closed: closed.clone(),
    };
    let peer = PeerChannel {
        data: peer_data,
        stderr: peer_stderr,
        requests: request_tx,
        outbound: Some(outbound_rx),
        closed,
    };
    (session, peer)
}

/// The peer's channel-open was rejected.
#[derive(Debug, Clone, Error)]
#[error("channel open rejected: {reason}")]
pub struct OpenRejected {
    pub reason: String,
}

/// An inbound channel-open awaiting an accept/reject decision.
///
/// The transport adapter constructs one per incoming open and hands it to the
/// session handler; the returned receiver resolves with the peer half on
/// accept or the rejection reason otherwise.
pub struct ChannelOpen {
    channel_type: String,
    decision: oneshot::Sender<Result<PeerChannel, OpenRejected>>,
}

impl ChannelOpen {
    pub fn new(
        channel_type: impl Into<String>,
    ) -> (Self, oneshot::Receiver<Result<PeerChannel, OpenRejected>>) {
        let (decision, pending) = oneshot::channel();
        (
            Self {
                channel_type: channel_type.into(),
                decision,
            },
            pending,
        )
    }

    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    /// Accept the open, handing the peer half back to the transport.
    pub fn accept(self) -> SessionChannel {
        let (session, peer) = channel_pair();
        let _ = self.decision.send(Ok(peer));
        session
    }

    /// Reject the open with a reason.
    pub fn reject(self, reason: impl Into<String>) {
        let _ = self.decision.send(Err(OpenRejected {
            reason: reason.into(),
        }));
    }
}
