//! # Switch Node
//!
//! A [`Switch`] is one peer in the telex network. It owns at most one
//! receiving UDP socket, bound by [`Switch::start_listening`] and released
//! by [`Switch::stop_listening`]. Outbound sends open a fresh ephemeral
//! socket per datagram; there is no connection state to keep.
//!
//! ## Receive Path
//!
//! `start_listening` spawns a background task that reads datagrams, parses
//! each into a [`Telex`], and fans the result out to every [`TelexStream`]
//! obtained from [`Switch::subscribe`]. A malformed datagram is logged and
//! skipped, and the loop keeps serving subsequent datagrams.
//! `stop_listening` signals the task, waits for it to exit, and closes the
//! dispatch channel, so every stream ends deterministically once the
//! listener is gone.
//!
//! Handles are cheap to clone and share one underlying node; cloning a
//! `Switch` never duplicates the socket.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::telex::{MAX_TELEX_SIZE, Telex};

/// Receive buffer size. Comfortably larger than anything this switch will
/// send; receivers tolerate whatever size the OS delivers.
const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Capacity of the dispatch channel feeding subscribers.
/// A subscriber that falls this far behind misses telexes instead of
/// blocking the receive loop.
const SUBSCRIBER_CAPACITY: usize = 256;

/// Consecutive receive failures after which the socket is considered dead
/// and the receive loop stops.
const MAX_CONSECUTIVE_RECV_ERRORS: u32 = 8;

// ============================================================================
// Errors and outcomes
// ============================================================================

/// Outbound transmission failure.
#[derive(Debug)]
pub enum SendError {
    /// The encoded telex exceeds [`MAX_TELEX_SIZE`]. Rejected before any
    /// socket is opened.
    MessageTooLarge { size: usize },
    /// The OS refused the bind or the transmit.
    Transport(io::Error),
    /// [`Switch::send_telex`] was given a telex without an endpoint.
    NoDestination,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::MessageTooLarge { size } => {
                write!(f, "telex is {} bytes, limit is {} bytes", size, MAX_TELEX_SIZE)
            }
            SendError::Transport(err) => write!(f, "datagram transmit failed: {}", err),
            SendError::NoDestination => write!(f, "telex has no destination endpoint"),
        }
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SendError::Transport(err) => Some(err),
            _ => None,
        }
    }
}

/// The requested listening port could not be bound.
#[derive(Debug)]
pub struct BindError {
    pub port: u16,
    pub source: io::Error,
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to bind receive socket on port {}: {}",
            self.port, self.source
        )
    }
}

impl std::error::Error for BindError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// What [`Switch::start_listening`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenOutcome {
    /// A receive socket was bound and the receive loop is running.
    Started,
    /// A receive socket already exists; nothing was changed.
    AlreadyListening,
}

// ============================================================================
// Subscriptions
// ============================================================================

/// One telex delivered by the receive loop, with the sender's transport
/// address. The JSON body carries no source information.
#[derive(Clone, Debug)]
pub struct ReceivedTelex {
    pub telex: Telex,
    pub from: SocketAddr,
}

/// A subscription to received telexes.
///
/// Dropping the stream revokes the subscription; other streams are
/// unaffected. When the switch stops listening the stream ends and
/// [`TelexStream::recv`] returns `None`.
pub struct TelexStream {
    rx: broadcast::Receiver<ReceivedTelex>,
}

impl TelexStream {
    /// Wait for the next telex. Returns `None` once the switch has
    /// stopped listening and all queued telexes were consumed.
    pub async fn recv(&mut self) -> Option<ReceivedTelex> {
        loop {
            match self.rx.recv().await {
                Ok(received) => return Some(received),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "subscriber lagging, telexes dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// ============================================================================
// Switch
// ============================================================================

/// Handle state for the bound receive socket and its loop task.
struct Listener {
    port: u16,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct SwitchState {
    listener: Option<Listener>,
    dispatch_tx: broadcast::Sender<ReceivedTelex>,
}

struct SwitchShared {
    identity: String,
    state: Mutex<SwitchState>,
}

/// One switch node. Construct with [`Switch::new`] and pass clones to
/// whatever needs it.
#[derive(Clone)]
pub struct Switch {
    shared: Arc<SwitchShared>,
}

impl Switch {
    /// Create a switch with the given protocol identity.
    ///
    /// The identity is an opaque string supplied by the caller, normally
    /// [`derive_identity`](crate::derive_identity) over the public
    /// address. The switch stores it verbatim.
    pub fn new(identity: impl Into<String>) -> Self {
        let (dispatch_tx, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Self {
            shared: Arc::new(SwitchShared {
                identity: identity.into(),
                state: Mutex::new(SwitchState {
                    listener: None,
                    dispatch_tx,
                }),
            }),
        }
    }

    /// This switch's protocol identity.
    pub fn identity(&self) -> &str {
        &self.shared.identity
    }

    /// Send one telex datagram to `destination`.
    ///
    /// The size ceiling is enforced before any socket is opened. Each send
    /// binds a fresh ephemeral socket matching the destination's address
    /// family and releases it when done, whatever the outcome.
    pub async fn send(&self, text: &str, destination: SocketAddr) -> Result<(), SendError> {
        let bytes = text.as_bytes();
        if bytes.len() > MAX_TELEX_SIZE {
            return Err(SendError::MessageTooLarge { size: bytes.len() });
        }

        let bind_addr: SocketAddr = if destination.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(SendError::Transport)?;

        let written = socket
            .send_to(bytes, destination)
            .await
            .map_err(SendError::Transport)?;
        if written != bytes.len() {
            return Err(SendError::Transport(io::Error::other(format!(
                "short send: {} of {} bytes",
                written,
                bytes.len()
            ))));
        }

        debug!(to = %destination, len = bytes.len(), "telex sent");
        Ok(())
    }

    /// Send an outbound telex to its recorded endpoint.
    ///
    /// The wire form is the payload object's compact JSON; see
    /// [`Telex::payload_json`].
    pub async fn send_telex(&self, telex: &Telex) -> Result<(), SendError> {
        let destination = telex.endpoint().ok_or(SendError::NoDestination)?;
        self.send(&telex.payload_json(), destination).await
    }

    /// Bind a receive socket on `port` (all interfaces) and start the
    /// receive loop.
    ///
    /// At most one receive socket exists per switch: if one is already
    /// bound this returns [`ListenOutcome::AlreadyListening`] without
    /// touching it, whatever port was asked for. The check and the bind
    /// happen under one lock, so concurrent callers cannot both bind.
    /// Port 0 requests an ephemeral port; [`Switch::listening_port`]
    /// reports the resolved value.
    pub async fn start_listening(&self, port: u16) -> Result<ListenOutcome, BindError> {
        let mut state = self.shared.state.lock().await;
        if state.listener.is_some() {
            debug!(port, "start requested while already listening");
            return Ok(ListenOutcome::AlreadyListening);
        }

        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
            .await
            .map_err(|source| BindError { port, source })?;
        let local_port = socket
            .local_addr()
            .map_err(|source| BindError { port, source })?
            .port();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(receive_loop(socket, state.dispatch_tx.clone(), shutdown_rx));
        state.listener = Some(Listener {
            port: local_port,
            shutdown_tx,
            task,
        });

        info!(port = local_port, "switch listening");
        Ok(ListenOutcome::Started)
    }

    /// Stop listening and end every subscription.
    ///
    /// Signals the receive loop, waits for it to exit, then closes the
    /// dispatch channel: once this returns no subscriber will see another
    /// telex, even from a datagram that was in flight. Calling while not
    /// listening is a no-op.
    pub async fn stop_listening(&self) {
        let mut state = self.shared.state.lock().await;
        let Some(listener) = state.listener.take() else {
            return;
        };

        let _ = listener.shutdown_tx.send(true);
        if let Err(join_err) = listener.task.await {
            warn!(error = %join_err, "receive loop ended abnormally");
        }

        // Replacing the sender drops the last handle to the old channel,
        // so outstanding streams observe closure rather than silence.
        state.dispatch_tx = broadcast::channel(SUBSCRIBER_CAPACITY).0;
        info!(port = listener.port, "switch stopped listening");
    }

    /// Subscribe to received telexes.
    ///
    /// The stream delivers telexes until the next [`Switch::stop_listening`],
    /// then ends. Subscribing is allowed before the listener starts.
    pub async fn subscribe(&self) -> TelexStream {
        let state = self.shared.state.lock().await;
        TelexStream {
            rx: state.dispatch_tx.subscribe(),
        }
    }

    /// The bound receive port, or 0 when not listening.
    pub async fn listening_port(&self) -> u16 {
        let state = self.shared.state.lock().await;
        state.listener.as_ref().map_or(0, |listener| listener.port)
    }

    /// Whether a receive socket is currently bound.
    pub async fn is_listening(&self) -> bool {
        self.shared.state.lock().await.listener.is_some()
    }

    /// Release the receive socket and subscriptions. Call on process
    /// teardown; equivalent to [`Switch::stop_listening`].
    pub async fn shutdown(&self) {
        self.stop_listening().await;
    }
}

// ============================================================================
// Receive loop
// ============================================================================

async fn receive_loop(
    socket: UdpSocket,
    dispatch_tx: broadcast::Sender<ReceivedTelex>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    let mut consecutive_errors: u32 = 0;

    loop {
        tokio::select! {
            biased;

            // Fires on the stop signal or when the switch was dropped;
            // either way the loop must not re-arm the receive.
            _ = shutdown_rx.changed() => {
                debug!("receive loop shutting down");
                break;
            }

            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, from)) => {
                        consecutive_errors = 0;
                        handle_datagram(&buf[..len], from, &dispatch_tx);
                    }
                    Err(err) => {
                        consecutive_errors += 1;
                        if consecutive_errors >= MAX_CONSECUTIVE_RECV_ERRORS {
                            error!(error = %err, "receive socket failed repeatedly, stopping listener");
                            break;
                        }
                        warn!(error = %err, "datagram receive failed");
                    }
                }
            }
        }
    }
}

/// Decode and dispatch one datagram. Failures are contained here: a bad
/// datagram is logged and dropped, never surfaced to the loop.
fn handle_datagram(bytes: &[u8], from: SocketAddr, dispatch_tx: &broadcast::Sender<ReceivedTelex>) {
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => {
            warn!(%from, error = %err, "discarding non-UTF-8 datagram");
            return;
        }
    };

    let telex = match Telex::parse(text) {
        Ok(telex) => telex,
        Err(err) => {
            warn!(%from, error = %err, "discarding malformed telex");
            return;
        }
    };

    debug!(%from, len = bytes.len(), "telex received");
    if dispatch_tx.send(ReceivedTelex { telex, from }).is_err() {
        trace!("no subscribers for received telex");
    }
}
