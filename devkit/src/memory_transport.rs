/*!
Transport en mémoire pour tests sans réseau

Remplace le socket UDP du kernel :
- le test injecte des datagrammes comme s'ils venaient d'un membre
- tout ce que le kernel diffuse est enregistré pour assertions
*/

use lightswarm_kernel::protocol::Packet;
use lightswarm_kernel::transport::{Transport, TransportError};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

type Datagram = (Vec<u8>, SocketAddr);

/// Côté kernel : implémente Transport
pub struct MemoryTransport {
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

/// Côté test : injection et inspection
#[derive(Clone)]
pub struct MemoryNetwork {
    inbound: mpsc::UnboundedSender<Datagram>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

pub fn memory_transport() -> (MemoryTransport, MemoryNetwork) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sent = Arc::new(Mutex::new(Vec::new()));
    (
        MemoryTransport {
            inbound: tokio::sync::Mutex::new(rx),
            sent: sent.clone(),
        },
        MemoryNetwork { inbound: tx, sent },
    )
}

impl Transport for MemoryTransport {
    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), TransportError> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some((bytes, source)) => {
                // comme UDP : un datagramme trop long est tronqué
                let len = bytes.len().min(buf.len());
                buf[..len].copy_from_slice(&bytes[..len]);
                Ok((len, source))
            }
            None => Err(TransportError::Closed),
        }
    }

    async fn send_broadcast(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.sent.lock().push(bytes.to_vec());
        log::info!("📤 [MOCK] broadcast {} bytes", bytes.len());
        Ok(())
    }
}

impl MemoryNetwork {
    pub fn inject(&self, bytes: Vec<u8>, source: SocketAddr) -> anyhow::Result<()> {
        self.inbound
            .send((bytes, source))
            .map_err(|_| anyhow::anyhow!("kernel transport closed"))?;
        log::info!("📨 [MOCK] datagram from {source}");
        Ok(())
    }

    pub fn sent_bytes(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    /// Diffusions du kernel décodées (les trames invalides sont ignorées)
    pub fn sent_packets(&self) -> Vec<Packet> {
        self.sent
            .lock()
            .iter()
            .filter_map(|bytes| Packet::decode(bytes).ok())
            .collect()
    }
}
