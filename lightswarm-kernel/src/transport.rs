/**
 * TRANSPORT - Datagrammes UDP de l'essaim
 *
 * RÔLE :
 * Un seul port UDP (2910 par défaut) en mode broadcast : réception de toutes
 * les trames des membres, émission des commandes vers tout l'essaim.
 *
 * Pas de retry ni de timeout : le protocole est best-effort, un échec d'envoi
 * est remonté à l'appelant qui le logge.
 */

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{debug, info};

/// Taille maximale lue par datagramme ; une trame log fait au plus 261 octets
pub const MAX_DATAGRAM: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to enable broadcast: {0}")]
    Broadcast(#[source] io::Error),
    #[error("receive failed: {0}")]
    Receive(#[source] io::Error),
    #[error("send to {target} failed: {source}")]
    Send {
        target: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("transport closed")]
    Closed,
}

pub trait Transport: Send + Sync {
    fn recv(&self, buf: &mut [u8]) -> impl Future<Output = Result<(usize, SocketAddr), TransportError>> + Send;
    fn send_broadcast(&self, bytes: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send;
}

pub struct UdpTransport {
    socket: UdpSocket,
    broadcast: SocketAddr,
}

impl UdpTransport {
    pub async fn bind(bind: SocketAddr, broadcast: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|source| TransportError::Bind { addr: bind, source })?;
        socket.set_broadcast(true).map_err(TransportError::Broadcast)?;
        info!(%bind, %broadcast, "UDP transport ready");
        Ok(Self { socket, broadcast })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Transport for UdpTransport {
    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), TransportError> {
        self.socket.recv_from(buf).await.map_err(TransportError::Receive)
    }

    async fn send_broadcast(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let sent = self
            .socket
            .send_to(bytes, self.broadcast)
            .await
            .map_err(|source| TransportError::Send {
                target: self.broadcast,
                source,
            })?;
        debug!(bytes = sent, target = %self.broadcast, "datagram sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_send_and_receive() {
        let receiver = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), "127.0.0.1:9".parse().unwrap())
            .await
            .unwrap();
        let target = receiver.local_addr().unwrap();
        let sender = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), target).await.unwrap();

        sender.send_broadcast(&[0xF0, 0x01, 0x07]).await.unwrap();

        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, from) = receiver.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &[0xF0, 0x01, 0x07]);
        assert_eq!(from, sender.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_bind_conflict_reports_address() {
        let first = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), "127.0.0.1:9".parse().unwrap())
            .await
            .unwrap();
        let taken = first.local_addr().unwrap();
        let err = UdpTransport::bind(taken, "127.0.0.1:9".parse().unwrap())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Bind { addr, .. } if addr == taken));
    }
}
