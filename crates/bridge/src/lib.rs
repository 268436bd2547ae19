//! Bidirectional bridge between CoT events and the Meshtastic radio link.

use thiserror::Error;

pub mod forwarder;
pub mod packet;
pub mod translate;

pub use forwarder::{Forwarder, PendingTransfer, ACK_REPEAT_DELAY, INTER_BLOCK_DELAY};
pub use packet::{GeoChat, MemberRole, PayloadVariant, Pli, TakPacket, Team};
pub use translate::{parse_receipt, Bridge, Outbound, Receipt, ALL_CHAT_ROOMS};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("packet parse failed: {0}")]
    ParseFailed(String),

    #[error(transparent)]
    Radio(#[from] meshtak_radio::RadioError),
}
