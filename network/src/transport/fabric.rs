//! In-memory datagram fabric for tests: lossless and ordered by default,
//! with a pluggable drop filter for loss and partition scenarios.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

type DropFilter = Box<dyn Fn(SocketAddr, SocketAddr) -> bool + Send + Sync>;

struct Inner {
    endpoints: HashMap<SocketAddr, tokio::sync::mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>>,
    next_port: u16,
    drop_filter: Option<DropFilter>,
    delivered: u64,
    dropped: u64,
}

/// A process-local datagram network.
pub struct Fabric(Mutex<Inner>);

impl Fabric {
    pub fn new() -> Arc<Fabric> {
        Arc::new(Fabric(Mutex::new(Inner {
            endpoints: HashMap::new(),
            next_port: 4100,
            drop_filter: None,
            delivered: 0,
            dropped: 0,
        })))
    }

    /// Creates a new endpoint with a unique fake address.
    pub fn bind(self: &Arc<Self>) -> FabricSocket {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut inner = self.0.lock();
        let addr =
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 3, 0, 1)), inner.next_port);
        inner.next_port += 1;
        inner.endpoints.insert(addr, tx);
        FabricSocket { fabric: self.clone(), addr, rx: tokio::sync::Mutex::new(rx) }
    }

    /// Installs a filter; datagrams for which it returns true are dropped.
    pub fn set_drop_filter(
        &self,
        filter: impl Fn(SocketAddr, SocketAddr) -> bool + Send + Sync + 'static,
    ) {
        self.0.lock().drop_filter = Some(Box::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        self.0.lock().drop_filter = None;
    }

    /// (delivered, dropped) counters, for asserting "no wire traffic".
    pub fn stats(&self) -> (u64, u64) {
        let inner = self.0.lock();
        (inner.delivered, inner.dropped)
    }

    fn send(&self, from: SocketAddr, to: SocketAddr, bytes: Vec<u8>) {
        let mut inner = self.0.lock();
        if inner.drop_filter.as_ref().is_some_and(|f| f(from, to)) {
            inner.dropped += 1;
            return;
        }
        match inner.endpoints.get(&to) {
            Some(tx) => {
                // A closed endpoint behaves like an unreachable host.
                if tx.send((bytes, from)).is_ok() {
                    inner.delivered += 1;
                } else {
                    inner.dropped += 1;
                }
            }
            None => inner.dropped += 1,
        }
    }
}

pub struct FabricSocket {
    fabric: Arc<Fabric>,
    addr: SocketAddr,
    rx: tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
}

impl FabricSocket {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) {
        self.fabric.send(self.addr, addr, buf.to_vec());
    }

    pub async fn recv_from(&self) -> std::io::Result<(Vec<u8>, SocketAddr)> {
        match self.rx.lock().await.recv().await {
            Some((bytes, from)) => Ok((bytes, from)),
            None => Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "fabric closed")),
        }
    }
}

impl Drop for FabricSocket {
    fn drop(&mut self) {
        self.fabric.0.lock().endpoints.remove(&self.addr);
    }
}
