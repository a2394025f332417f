//! UDP broadcast reactor.
//!
//! Owns the discovery socket and shuttles bytes between it and the
//! [`BootstrapEngine`]:
//! - inbound datagrams are checked by [`decode_frame`] and handed to the engine
//! - write requests from the engine are served by asking it for a payload,
//!   framing it and broadcasting it

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, trace, warn};

use crate::engine::{BootstrapEngine, Received, WriteNotifier};
use crate::error::Result;
use crate::framing::{decode_frame, encode_frame};

/// Counted write requests shared between the engine and the reactor.
///
/// Each request turns into exactly one write. Requests made while the reactor
/// is busy are counted, not merged.
#[derive(Debug, Clone, Default)]
pub struct WriteSignal {
    pending: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl WriteSignal {
    pub fn new() -> Self {
        Self::default()
    }

    fn fire(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_one();
    }

    /// Number of writes currently owed.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Wait until at least one write is owed and take all of them.
    ///
    /// Cancel safe: nothing is taken unless the future completes.
    pub async fn take(&self) -> usize {
        loop {
            let owed = self.pending.swap(0, Ordering::AcqRel);
            if owed > 0 {
                return owed;
            }
            self.notify.notified().await;
        }
    }
}

impl WriteNotifier for WriteSignal {
    fn request_write(&self, delay: Duration) {
        if delay.is_zero() {
            self.fire();
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let signal = self.clone();
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    signal.fire();
                });
            }
            Err(_) => self.fire(),
        }
    }
}

/// Bind a UDP socket able to send broadcasts.
pub fn bind_socket(addr: SocketAddr, sndbuf: usize, rcvbuf: usize) -> Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    socket.set_send_buffer_size(sndbuf)?;
    socket.set_recv_buffer_size(rcvbuf)?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;

    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    let socket = UdpSocket::from_std(std_socket)?;

    info!(%addr, sndbuf, rcvbuf, "Discovery socket bound");
    Ok(socket)
}

enum Event {
    Datagram(std::io::Result<(usize, SocketAddr)>),
    Write(usize),
    Shutdown,
}

/// Event loop for one discovery socket.
pub struct BroadcastReactor {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    engine: Arc<BootstrapEngine>,
    signal: WriteSignal,
    max_datagram: usize,
}

impl BroadcastReactor {
    pub fn new(
        socket: UdpSocket,
        target: SocketAddr,
        engine: Arc<BootstrapEngine>,
        signal: WriteSignal,
        max_datagram: usize,
    ) -> Self {
        Self {
            socket: Arc::new(socket),
            target,
            engine,
            signal,
            max_datagram,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Run until `shutdown` turns true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut buf = vec![0u8; self.max_datagram];
        debug!(target = %self.target, "Broadcast reactor running");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let event = tokio::select! {
                recv = self.socket.recv_from(&mut buf) => Event::Datagram(recv),
                owed = self.signal.take() => Event::Write(owed),
                changed = shutdown.changed() => match changed {
                    Ok(()) => continue,
                    Err(_) => Event::Shutdown,
                },
            };

            match event {
                Event::Datagram(Ok((len, from))) => self.handle_datagram(&buf[..len], from),
                Event::Datagram(Err(e)) => warn!(error = %e, "Discovery receive failed"),
                Event::Write(owed) => {
                    for _ in 0..owed {
                        self.write_once().await;
                    }
                }
                Event::Shutdown => break,
            }
        }

        debug!("Broadcast reactor stopped");
        Ok(())
    }

    fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let payload = match decode_frame(datagram) {
            Ok(payload) => payload,
            Err(e) => {
                trace!(%from, error = %e, "Dropping malformed datagram");
                return;
            }
        };
        if let Received::Dropped = self.engine.on_frame_received(payload) {
            trace!(%from, "Dropping undecodable payload");
        }
    }

    async fn write_once(&self) {
        let payload = match self.engine.on_write_requested() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to build discovery payload");
                return;
            }
        };
        let frame = match encode_frame(&payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Discovery payload does not fit a frame");
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&frame, self.target).await {
            warn!(target = %self.target, error = %e, "Discovery send failed");
        }
    }
}

impl std::fmt::Debug for BroadcastReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastReactor")
            .field("target", &self.target)
            .field("max_datagram", &self.max_datagram)
            .finish_non_exhaustive()
    }
}
