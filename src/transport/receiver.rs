// ABOUTME: TCP listener decoding length-prefixed frames from peer senders
// ABOUTME: Delivers (source address, payload) pairs on a channel, skipping keepalive frames

//! Frame receiver.
//!
//! The receiving side of [`TcpMultiSender`](super::tcp_sender::TcpMultiSender):
//! accepts connections from cluster members and forwards every non-empty
//! frame on an mpsc channel.
//!
//! ```ignore
//! let mut receiver = FrameReceiver::new("0.0.0.0:4000".parse()?);
//! let (addr, mut frames) = receiver.start().await?;
//!
//! while let Some((from, payload)) = frames.recv().await {
//!     handle(from, payload);
//! }
//!
//! receiver.stop().await?;
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::frame::read_frame;

/// Buffered frames before readers apply backpressure to their connections
const CHANNEL_CAPACITY: usize = 1024;

/// How often the accept loop rechecks the shutdown flag
const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// A received frame and the address it came from
pub type ReceivedFrame = (SocketAddr, Vec<u8>);

/// Errors that can occur while running the receiver
#[derive(Debug, Error)]
pub enum ReceiverError {
    /// Failed to bind the listener
    #[error("Failed to bind frame receiver on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Receiver is not running when expected
    #[error("Frame receiver is not running")]
    NotRunning,

    /// Receiver is already running
    #[error("Frame receiver is already running")]
    AlreadyRunning,
}

/// Accepts peer connections and decodes their frames
pub struct FrameReceiver {
    bind_addr: SocketAddr,
    local_addr: Option<SocketAddr>,
    shutdown: Arc<AtomicBool>,
    listener_handle: Option<JoinHandle<()>>,
}

impl FrameReceiver {
    /// Receiver that will listen on `bind_addr` (port 0 picks a free port)
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            local_addr: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            listener_handle: None,
        }
    }

    /// Bind and start accepting; returns the bound address and the frame channel
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` if started twice, `BindFailed` if the address is unavailable.
    pub async fn start(&mut self) -> Result<(SocketAddr, mpsc::Receiver<ReceivedFrame>), ReceiverError> {
        if self.is_running() {
            return Err(ReceiverError::AlreadyRunning);
        }
        self.shutdown.store(false, Ordering::SeqCst);

        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|source| ReceiverError::BindFailed {
                addr: self.bind_addr,
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ReceiverError::BindFailed {
                addr: self.bind_addr,
                source,
            })?;
        self.local_addr = Some(local_addr);
        info!(addr = %local_addr, "Frame receiver started");

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let shutdown = Arc::clone(&self.shutdown);
        self.listener_handle = Some(tokio::spawn(async move {
            Self::accept_loop(listener, tx, shutdown).await;
        }));

        Ok((local_addr, rx))
    }

    /// Stop accepting and close every connection
    ///
    /// # Errors
    ///
    /// `NotRunning` if the receiver was never started or already stopped.
    pub async fn stop(&mut self) -> Result<(), ReceiverError> {
        if !self.is_running() {
            return Err(ReceiverError::NotRunning);
        }

        info!(addr = ?self.local_addr, "Stopping frame receiver");
        self.shutdown.store(true, Ordering::SeqCst);

        if let Some(handle) = self.listener_handle.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
        self.local_addr = None;
        Ok(())
    }

    /// Bound address while running
    pub const fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Whether the accept loop is running
    pub fn is_running(&self) -> bool {
        self.listener_handle.is_some() && !self.shutdown.load(Ordering::SeqCst)
    }

    async fn accept_loop(listener: TcpListener, tx: mpsc::Sender<ReceivedFrame>, shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::SeqCst) {
            match tokio::time::timeout(ACCEPT_POLL, listener.accept()).await {
                Ok(Ok((stream, peer_addr))) => {
                    debug!(peer = %peer_addr, "Accepted peer connection");
                    let tx = tx.clone();
                    let shutdown = Arc::clone(&shutdown);
                    tokio::spawn(async move {
                        Self::handle_connection(stream, peer_addr, tx, shutdown).await;
                    });
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Accept error");
                }
                Err(_) => {
                    // Timeout, recheck shutdown
                }
            }
        }
        debug!("Frame receiver accept loop ended");
    }

    async fn handle_connection(
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        tx: mpsc::Sender<ReceivedFrame>,
        shutdown: Arc<AtomicBool>,
    ) {
        loop {
            let frame = tokio::select! {
                frame = read_frame(&mut stream) => frame,
                () = async {
                    while !shutdown.load(Ordering::SeqCst) {
                        tokio::time::sleep(ACCEPT_POLL).await;
                    }
                } => break,
            };

            match frame {
                Ok(Some(payload)) if payload.is_empty() => {}
                Ok(Some(payload)) => {
                    if tx.send((peer_addr, payload)).await.is_err() {
                        debug!(peer = %peer_addr, "Frame consumer gone, closing connection");
                        break;
                    }
                }
                Ok(None) => {
                    debug!(peer = %peer_addr, "Peer closed connection");
                    break;
                }
                Err(e) => {
                    warn!(peer = %peer_addr, error = %e, "Dropping connection after bad frame");
                    break;
                }
            }
        }
    }
}

impl Drop for FrameReceiver {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for FrameReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReceiver")
            .field("bind_addr", &self.bind_addr)
            .field("local_addr", &self.local_addr)
            .field("running", &self.is_running())
            .finish()
    }
}
