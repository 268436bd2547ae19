//! Simulated mesh network for tests and the demo gateway.
//!
//! Joined nodes exchange [`MeshPacket`]s through an in-process hub with
//! configurable loss and latency; `0xFFFFFFFF` broadcasts to every other
//! node.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;

use crate::{MeshPacket, RadioError, RadioLink, BROADCAST_ADDR};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MeshConfig {
    pub packet_loss: f32,
    pub latency: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            packet_loss: 0.0,
            latency: Duration::from_millis(0),
        }
    }
}

#[derive(Debug, Default)]
struct MeshStats {
    packets_sent: u64,
    packets_dropped: u64,
    bytes_sent: u64,
}

/// In-process hub all simulated nodes hang off.
pub struct SimulatedMesh {
    config: MeshConfig,
    nodes: Mutex<HashMap<u32, mpsc::Sender<MeshPacket>>>,
    stats: Mutex<MeshStats>,
}

impl SimulatedMesh {
    pub fn new(config: MeshConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            nodes: Mutex::new(HashMap::new()),
            stats: Mutex::new(MeshStats::default()),
        })
    }

    pub async fn join(self: &Arc<Self>, node_id: u32) -> SimulatedRadio {
        let (tx, rx) = mpsc::channel(256);
        self.nodes.lock().await.insert(node_id, tx);
        SimulatedRadio {
            node_id,
            mesh: Arc::clone(self),
            receiver: Mutex::new(rx),
        }
    }

    pub async fn stats(&self) -> (u64, u64, u64) {
        let stats = self.stats.lock().await;
        (stats.packets_sent, stats.packets_dropped, stats.bytes_sent)
    }

    async fn deliver(&self, packet: MeshPacket) -> Result<(), RadioError> {
        if self.config.latency > Duration::ZERO {
            sleep(self.config.latency).await;
        }

        let drop_packet = {
            let mut rng = rand::rng();
            rng.random::<f32>() < self.config.packet_loss
        };
        if drop_packet {
            let mut stats = self.stats.lock().await;
            stats.packets_dropped += 1;
            debug!("simulated mesh dropped a packet");
            return Ok(());
        }

        {
            let mut stats = self.stats.lock().await;
            stats.packets_sent += 1;
            stats.bytes_sent += packet.payload.len() as u64;
        }

        let nodes = self.nodes.lock().await;
        if packet.to == BROADCAST_ADDR {
            // Best-effort fan-out; a lagging peer is not a send failure.
            for (&id, tx) in nodes.iter() {
                if id != packet.from {
                    let _ = tx.send(packet.clone()).await;
                }
            }
            Ok(())
        } else {
            match nodes.get(&packet.to) {
                Some(tx) => tx
                    .send(packet.clone())
                    .await
                    .map_err(|_| RadioError::SendFailed),
                None => {
                    trace!("simulated mesh: node {} not joined", packet.to);
                    Err(RadioError::SendFailed)
                }
            }
        }
    }
}

/// One node's handle onto the simulated mesh.
pub struct SimulatedRadio {
    node_id: u32,
    mesh: Arc<SimulatedMesh>,
    receiver: Mutex<mpsc::Receiver<MeshPacket>>,
}

impl SimulatedRadio {
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub async fn receive(&self) -> Option<MeshPacket> {
        self.receiver.lock().await.recv().await
    }
}

impl RadioLink for SimulatedRadio {
    async fn send(&self, packet: MeshPacket) -> Result<(), RadioError> {
        self.mesh.deliver(packet).await
    }
}
