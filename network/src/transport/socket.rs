use crate::transport::fabric::FabricSocket;
use std::net::SocketAddr;

/// The datagram substrate: a real UDP socket in production, an in-memory
/// fabric endpoint in tests. Reliability lives entirely above this layer.
pub enum DatagramSocket {
    Udp(tokio::net::UdpSocket),
    Fabric(FabricSocket),
}

impl DatagramSocket {
    pub async fn bind_udp(addr: SocketAddr) -> std::io::Result<DatagramSocket> {
        Ok(DatagramSocket::Udp(tokio::net::UdpSocket::bind(addr).await?))
    }

    pub fn local_addr(&self) -> SocketAddr {
        match self {
            DatagramSocket::Udp(socket) => {
                socket.local_addr().expect("bound socket has an address")
            }
            DatagramSocket::Fabric(socket) => socket.local_addr(),
        }
    }

    pub async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> std::io::Result<()> {
        match self {
            DatagramSocket::Udp(socket) => {
                socket.send_to(buf, addr).await?;
            }
            DatagramSocket::Fabric(socket) => socket.send_to(buf, addr),
        }
        Ok(())
    }

    pub async fn recv_from(&self) -> std::io::Result<(Vec<u8>, SocketAddr)> {
        match self {
            DatagramSocket::Udp(socket) => {
                let mut buf = vec![0u8; 65536];
                let (n, addr) = socket.recv_from(&mut buf).await?;
                buf.truncate(n);
                Ok((buf, addr))
            }
            DatagramSocket::Fabric(socket) => socket.recv_from().await,
        }
    }
}
