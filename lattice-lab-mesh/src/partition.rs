//! Controllable listener for partition testing.
//!
//! Wraps a TCP listener so a test can flip a node into "partitioned" mode:
//! new connections are refused and every in-flight connection is severed.
//! Healing restores acceptance; severed connections stay dead and clients
//! reconnect on their own.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tonic::transport::server::{Connected, TcpConnectInfo};
use tracing::debug;

/// Handle for flipping a [`ControllableListener`] between connected and
/// partitioned. Cloneable so it survives the listener moving into a server.
#[derive(Clone)]
pub struct PartitionGate {
    state: Arc<GateState>,
}

struct GateState {
    blocked: AtomicBool,
    live: Mutex<Vec<Arc<AtomicBool>>>,
}

impl PartitionGate {
    /// Isolate the node: refuse new connections and sever in-flight ones.
    pub fn partition(&self) {
        self.state.blocked.store(true, Ordering::SeqCst);
        let mut live = self.state.live.lock().unwrap_or_else(|e| e.into_inner());
        for severed in live.drain(..) {
            severed.store(true, Ordering::SeqCst);
        }
        debug!("listener partitioned");
    }

    /// Restore connectivity for new connections.
    pub fn heal(&self) {
        self.state.blocked.store(false, Ordering::SeqCst);
        debug!("listener healed");
    }
}

/// TCP listener that can be partitioned and healed at runtime.
pub struct ControllableListener {
    listener: TcpListener,
    gate: PartitionGate,
}

impl ControllableListener {
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            gate: PartitionGate {
                state: Arc::new(GateState {
                    blocked: AtomicBool::new(false),
                    live: Mutex::new(Vec::new()),
                }),
            },
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn gate(&self) -> PartitionGate {
        self.gate.clone()
    }

    /// Consume the listener into a connection stream suitable for
    /// `serve_with_incoming`. Connections accepted while partitioned are
    /// dropped on the floor.
    pub fn into_incoming(
        self,
    ) -> impl tokio_stream::Stream<Item = io::Result<PartitionedIo>> + Send {
        futures_util::stream::unfold(self, |this| async move {
            loop {
                match this.listener.accept().await {
                    Ok((stream, _)) => {
                        if this.gate.state.blocked.load(Ordering::SeqCst) {
                            // Refuse while partitioned.
                            drop(stream);
                            continue;
                        }
                        let severed = Arc::new(AtomicBool::new(false));
                        this.gate
                            .state
                            .live
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .push(severed.clone());
                        return Some((
                            Ok(PartitionedIo {
                                inner: stream,
                                severed,
                            }),
                            this,
                        ));
                    }
                    Err(e) => return Some((Err(e), this)),
                }
            }
        })
    }
}

/// A TCP stream that starts failing all IO once its partition flag is set.
pub struct PartitionedIo {
    inner: TcpStream,
    severed: Arc<AtomicBool>,
}

impl PartitionedIo {
    fn check_severed(&self) -> io::Result<()> {
        if self.severed.load(Ordering::SeqCst) {
            Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection severed by partition",
            ))
        } else {
            Ok(())
        }
    }
}

impl AsyncRead for PartitionedIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Err(e) = self.check_severed() {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PartitionedIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Err(e) = self.check_severed() {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Err(e) = self.check_severed() {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl Connected for PartitionedIo {
    type ConnectInfo = TcpConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.inner.connect_info()
    }
}
