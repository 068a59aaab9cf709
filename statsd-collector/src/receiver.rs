//! The UDP listener feeding packets to the aggregator.
use std::{
    io,
    net::{SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use tracing::{debug, error, info, warn};

use crate::worker::Worker;

/// Largest datagram the receiver accepts.
pub const MAX_PACKET_SIZE: usize = 64 * 1024;

// How long a read blocks before the loop checks for shutdown again.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Listens for StatsD datagrams and forwards them to the packet channel.
///
/// Forwarding never blocks: when the packet channel is full, the datagram is dropped and counted.
pub struct UdpReceiver {
    addr: SocketAddr,
    packets: Sender<Bytes>,
    drops: Arc<AtomicU64>,
    local_addr: Option<SocketAddr>,
    worker: Worker<()>,
}

impl UdpReceiver {
    /// Creates a new `UdpReceiver` that will listen on `addr` once started.
    pub fn new(addr: SocketAddr, packets: Sender<Bytes>) -> Self {
        Self {
            addr,
            packets,
            drops: Arc::new(AtomicU64::new(0)),
            local_addr: None,
            worker: Worker::new("statsd-receiver"),
        }
    }

    /// Gets the address the receiver was configured to listen on.
    pub fn configured_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Gets the address the socket is bound to, once started.
    ///
    /// This differs from the configured address when listening on port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Gets the number of datagrams dropped because the packet channel was full.
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Returns `true` if the receiver thread is running.
    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Binds the socket and starts the receiver thread.
    ///
    /// Does nothing if the receiver is already running.
    ///
    /// # Errors
    ///
    /// If the socket cannot be bound or configured, or if the thread cannot be spawned, an error is returned.
    pub fn start(&mut self) -> io::Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let socket = UdpSocket::bind(self.addr)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let local_addr = socket.local_addr()?;

        let packets = self.packets.clone();
        let drops = Arc::clone(&self.drops);
        self.worker.start(move |shutdown| run(&socket, &shutdown, &packets, &drops))?;

        info!(addr = %local_addr, "Listening for StatsD packets.");
        self.local_addr = Some(local_addr);
        Ok(())
    }

    /// Stops the receiver thread and closes the socket.
    pub fn stop(&mut self) {
        self.worker.stop();
    }
}

fn run(socket: &UdpSocket, shutdown: &Receiver<()>, packets: &Sender<Bytes>, drops: &AtomicU64) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];

    while let Err(TryRecvError::Empty) = shutdown.try_recv() {
        let len = match socket.recv_from(&mut buf) {
            Ok((len, _)) => len,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => continue,
            Err(e) => {
                error!(error = %e, "Failed to receive datagram.");
                continue;
            }
        };

        match packets.try_send(Bytes::copy_from_slice(&buf[..len])) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = drops.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 1000 == 0 {
                    warn!(dropped, "Packet queue is full, dropping datagrams.");
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("Packet channel disconnected.");
                break;
            }
        }
    }
}
