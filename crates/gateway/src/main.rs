//! Gateway binary: TAK server on one side, mesh radio on the other.
//!
//! Wires the certificate store, the mTLS server, the bridge, and the
//! forwarder into a single `Core` and pumps events between them. The radio
//! side runs over the in-process simulated mesh; a hardware driver slots in
//! behind the same `RadioLink` trait.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use meshtak_bridge::{Bridge, BridgeError, Forwarder, Outbound};
use meshtak_cot::{parse_event, CotEvent};
use meshtak_radio::simulated::{MeshConfig, SimulatedRadio};
use meshtak_radio::{
    MeshPacket, RadioLink, SimulatedMesh, PORT_ATAK_FORWARDER, PORT_ATAK_PLUGIN,
};
use meshtak_server::{
    build_tls_config, CertStore, MemoryKeyring, ServerConfig, ServerEvent, TakServer,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
struct GatewayConfig {
    enabled: bool,
    port: u16,
    node_id: u32,
    channel: u32,
    cert_dir: PathBuf,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8089,
            node_id: 0x4D54,
            channel: 0,
            cert_dir: PathBuf::from("certs"),
        }
    }
}

impl GatewayConfig {
    fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("writing {}", path.display()))
    }
}

struct Core {
    server: TakServer,
    bridge: Bridge,
    forwarder: Forwarder,
    node_id: u32,
    channel: u32,
}

impl Core {
    async fn handle_client_event(&mut self, radio: &SimulatedRadio, event: CotEvent) {
        let outbound = match self.bridge.route_outbound(&event) {
            Ok(outbound) => outbound,
            Err(e) => {
                warn!("cannot route {}: {}", event.uid, e);
                return;
            }
        };
        let result: Result<(), BridgeError> = match outbound {
            Outbound::Packet(packet) => radio
                .send(MeshPacket::broadcast(
                    self.node_id,
                    self.channel,
                    PORT_ATAK_PLUGIN,
                    packet.to_bytes(),
                ))
                .await
                .map_err(Into::into),
            Outbound::Direct(payload) | Outbound::Fountain(payload) => {
                self.forwarder
                    .send_payload(radio, self.node_id, self.channel, payload)
                    .await
            }
        };
        if let Err(e) = result {
            warn!("radio send failed for {}: {}", event.uid, e);
        }
    }

    async fn handle_radio_packet(&mut self, radio: &SimulatedRadio, packet: MeshPacket) {
        match packet.port {
            PORT_ATAK_PLUGIN => match self.bridge.handle_plugin_frame(&packet.payload) {
                Ok(Some(event)) => self.server.broadcast(&event).await,
                Ok(None) => {}
                Err(e) => debug!("dropping plugin frame from {:x}: {}", packet.from, e),
            },
            PORT_ATAK_FORWARDER => {
                match self
                    .forwarder
                    .handle_frame(radio, self.node_id, &packet)
                    .await
                {
                    Ok(Some(xml)) => match parse_event(&xml) {
                        Ok(event) => self.server.broadcast(&event).await,
                        Err(e) => debug!("undecodable CoT from {:x}: {}", packet.from, e),
                    },
                    Ok(None) => {}
                    Err(e) => debug!("dropping forwarder frame from {:x}: {}", packet.from, e),
                }
            }
            other => debug!("ignoring packet on port {}", other),
        }
    }

    async fn run(
        mut self,
        radio: SimulatedRadio,
        mut events: mpsc::Receiver<ServerEvent>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                ev = events.recv() => match ev {
                    None => break,
                    Some(ServerEvent::Event { event, .. }) => {
                        self.handle_client_event(&radio, event).await;
                    }
                    Some(ServerEvent::Connected { conn_id, endpoint }) => {
                        info!("TAK client {} at {}", conn_id, endpoint);
                    }
                    Some(ServerEvent::Disconnected { conn_id }) => {
                        info!("TAK client {} gone", conn_id);
                    }
                    Some(ServerEvent::ListenerFailed { error: e }) => {
                        bail!("listener failed: {e}");
                    }
                },
                pkt = radio.receive() => match pkt {
                    None => break,
                    Some(packet) => self.handle_radio_packet(&radio, packet).await,
                }
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config_path = std::env::var("MESHTAK_CONFIG").unwrap_or_else(|_| "meshtak.json".into());
    let config_path = PathBuf::from(config_path);
    let mut config = GatewayConfig::load(&config_path)?;
    if !config.enabled {
        info!("gateway disabled in config, exiting");
        return Ok(());
    }

    let store = CertStore::new(MemoryKeyring::default());
    let tls = match load_tls(&store, &config.cert_dir) {
        Ok(tls) => tls,
        Err(e) => {
            // Certificate problems clear the enabled flag so the UI can
            // surface a configuration error instead of a crash loop.
            error!("TLS setup failed: {e:#}");
            config.enabled = false;
            let _ = config.save(&config_path);
            bail!("refusing to start without usable certificates");
        }
    };

    let (server, events) = TakServer::start(
        tls,
        ServerConfig {
            port: config.port,
            ..Default::default()
        },
    )
    .await?;
    info!(
        "gateway up: TAK clients on {}, mesh node {:08x}",
        server.local_addr(),
        config.node_id
    );

    let mesh = SimulatedMesh::new(MeshConfig::default());
    let radio = mesh.join(config.node_id).await;

    let core = Core {
        server,
        bridge: Bridge::new(),
        forwarder: Forwarder::new(),
        node_id: config.node_id,
        channel: config.channel,
    };
    core.run(radio, events).await
}

fn load_tls(
    store: &CertStore<MemoryKeyring>,
    cert_dir: &Path,
) -> Result<std::sync::Arc<meshtak_server::TlsConfig>> {
    let identity_pem = std::fs::read(cert_dir.join("server.pem"))
        .with_context(|| format!("reading {}/server.pem", cert_dir.display()))?;
    let ca_pem = std::fs::read(cert_dir.join("ca.pem"))
        .with_context(|| format!("reading {}/ca.pem", cert_dir.display()))?;

    store.install_bundled_identity(&identity_pem)?;
    store.import_client_ca(&ca_pem)?;

    let identity = store.active_server_identity()?;
    let anchors = store.client_ca_anchors()?;
    Ok(build_tls_config(identity, anchors)?)
}
