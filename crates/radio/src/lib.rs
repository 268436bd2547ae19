//! Radio-link layer for the TAK mesh gateway: the mesh datagram
//! abstraction plus the codecs that ride on it.

use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod fountain;
pub mod lcg;
pub mod simulated;
pub mod soliton;
pub mod zlib;

pub use fountain::{Ack, AckKind, DataBlock, FountainReceiver, TransferKind};
pub use lcg::JavaRandom;
pub use simulated::SimulatedMesh;

/// Meshtastic ATAK plugin port (compact-binary TAK packets).
pub const PORT_ATAK_PLUGIN: u32 = 72;
/// Meshtastic ATAK forwarder port (compressed / fountain-coded CoT).
pub const PORT_ATAK_FORWARDER: u32 = 257;
/// Broadcast destination node id.
pub const BROADCAST_ADDR: u32 = 0xFFFF_FFFF;

#[derive(Debug, Error)]
pub enum RadioError {
    #[error("payload too large for the mesh ({0} bytes)")]
    PayloadTooLarge(usize),

    #[error("radio send failed")]
    SendFailed,

    #[error("zlib compression failed")]
    CompressionFailed,

    #[error("payload decode failed")]
    DecodeFailed,

    #[error("malformed packet")]
    MalformedPacket,
}

/// One opaque mesh datagram as the radio driver delivers it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshPacket {
    pub from: u32,
    pub to: u32,
    pub channel: u32,
    pub port: u32,
    pub payload: Vec<u8>,
}

impl MeshPacket {
    pub fn broadcast(from: u32, channel: u32, port: u32, payload: Vec<u8>) -> Self {
        Self {
            from,
            to: BROADCAST_ADDR,
            channel,
            port,
            payload,
        }
    }
}

/// The radio-driver surface this crate consumes. The production driver talks
/// to the attached Meshtastic node; tests and the demo gateway use
/// [`SimulatedMesh`].
pub trait RadioLink {
    fn send(&self, packet: MeshPacket) -> impl Future<Output = Result<(), RadioError>> + Send;
}
