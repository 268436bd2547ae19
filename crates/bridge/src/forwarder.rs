//! Generic-CoT transport on the forwarder port.
//!
//! Outbound: zlib-compressed CoT, sent as a single datagram under the
//! fountain threshold or as a paced fountain transfer above it. Inbound:
//! demultiplexes ACK frames, fountain data blocks, and direct payloads;
//! completed transfers are acknowledged twice, 50 ms apart, unicast to the
//! sender.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use meshtak_radio::fountain::{
    self, Ack, AckKind, DataBlock, FountainReceiver, FOUNTAIN_THRESHOLD,
};
use meshtak_radio::{zlib, MeshPacket, RadioLink, PORT_ATAK_FORWARDER};

use crate::BridgeError;

/// Pacing between fountain blocks on the air.
pub const INTER_BLOCK_DELAY: Duration = Duration::from_millis(100);
/// Gap between the two Complete ACKs.
pub const ACK_REPEAT_DELAY: Duration = Duration::from_millis(50);

/// Pending sends older than this are swept when a new transfer registers;
/// the receiver-side 60 s expiry is the authoritative timeout.
const PENDING_SWEEP_AGE: Duration = Duration::from_secs(300);

#[derive(Clone, Debug)]
pub struct PendingTransfer {
    pub transfer_id: u32,
    pub total_blocks: u16,
    pub hash: [u8; 8],
    started: Instant,
}

pub struct Forwarder {
    pending: HashMap<u32, PendingTransfer>,
    receiver: FountainReceiver,
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl Forwarder {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            receiver: FountainReceiver::new(),
        }
    }

    pub fn pending_transfers(&self) -> usize {
        self.pending.len()
    }

    /// Send a type-prefixed forwarder payload, choosing direct or fountain
    /// by the threshold.
    pub async fn send_payload<R: RadioLink>(
        &mut self,
        radio: &R,
        from: u32,
        channel: u32,
        payload: Vec<u8>,
    ) -> Result<(), BridgeError> {
        if payload.len() < FOUNTAIN_THRESHOLD {
            radio
                .send(MeshPacket::broadcast(
                    from,
                    channel,
                    PORT_ATAK_FORWARDER,
                    payload,
                ))
                .await?;
            return Ok(());
        }

        let transfer_id = fountain::new_transfer_id();
        let blocks = fountain::encode_transfer(transfer_id, &payload)?;
        self.register_pending(PendingTransfer {
            transfer_id,
            total_blocks: blocks.len() as u16,
            hash: fountain::sha256_prefix8(&payload),
            started: Instant::now(),
        });
        info!(
            "fountain transfer {:06x}: {} bytes in {} blocks",
            transfer_id,
            payload.len(),
            blocks.len()
        );

        for (i, block) in blocks.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(INTER_BLOCK_DELAY).await;
            }
            radio
                .send(MeshPacket::broadcast(
                    from,
                    channel,
                    PORT_ATAK_FORWARDER,
                    block.to_bytes(),
                ))
                .await?;
        }
        Ok(())
    }

    fn register_pending(&mut self, transfer: PendingTransfer) {
        self.pending
            .retain(|_, p| p.started.elapsed() < PENDING_SWEEP_AGE);
        self.pending.insert(transfer.transfer_id, transfer);
    }

    /// Handle one forwarder-port datagram. Returns decompressed CoT XML
    /// bytes when the frame (direct or completed transfer) carries an event.
    pub async fn handle_frame<R: RadioLink>(
        &mut self,
        radio: &R,
        self_node: u32,
        packet: &MeshPacket,
    ) -> Result<Option<Vec<u8>>, BridgeError> {
        let payload = &packet.payload;
        if payload.is_empty() {
            return Ok(None);
        }

        if fountain::is_ack_frame(payload) {
            match Ack::from_bytes(payload) {
                Ok(ack) => self.handle_ack(&ack),
                Err(e) => debug!("dropping ACK frame: {}", e),
            }
            return Ok(None);
        }

        if fountain::is_fountain_frame(payload) {
            let block = match DataBlock::from_bytes(payload) {
                Ok(block) => block,
                Err(e) => {
                    debug!("dropping fountain frame ({} bytes): {}", payload.len(), e);
                    return Ok(None);
                }
            };
            let Some(done) = self.receiver.accept(&block) else {
                return Ok(None);
            };

            let ack = Ack::complete(done.transfer_id, done.blocks_received, done.hash);
            for i in 0..2 {
                if i > 0 {
                    tokio::time::sleep(ACK_REPEAT_DELAY).await;
                }
                radio
                    .send(MeshPacket {
                        from: self_node,
                        to: packet.from,
                        channel: packet.channel,
                        port: PORT_ATAK_FORWARDER,
                        payload: ack.to_bytes(),
                    })
                    .await?;
            }
            return Ok(unwrap_payload(&done.payload));
        }

        Ok(unwrap_payload(payload))
    }

    fn handle_ack(&mut self, ack: &Ack) {
        match ack.kind {
            AckKind::Complete => match self.pending.get(&ack.transfer_id) {
                Some(pending) if pending.hash == ack.data_hash => {
                    info!(
                        "transfer {:06x} confirmed by peer ({} blocks received)",
                        ack.transfer_id, ack.received
                    );
                    self.pending.remove(&ack.transfer_id);
                }
                Some(_) => warn!(
                    "transfer {:06x} ACK hash mismatch, peer decoded different bytes",
                    ack.transfer_id
                ),
                None => debug!("ACK for unknown transfer {:06x}", ack.transfer_id),
            },
            AckKind::NeedMore => {
                // Parsed but unactioned: there is no retransmission path in
                // the current profile.
                debug!(
                    "peer needs {} more blocks for transfer {:06x}",
                    ack.needed, ack.transfer_id
                );
            }
        }
    }
}

/// Strip the transport-type byte and inflate. Decode failure is soft: the
/// body is handed on as raw UTF-8.
fn unwrap_payload(payload: &[u8]) -> Option<Vec<u8>> {
    let body = payload.get(1..)?;
    match zlib::decompress(body) {
        Ok(xml) => Some(xml),
        Err(_) => {
            debug!("payload not zlib, treating as raw bytes");
            Some(body.to_vec())
        }
    }
}
