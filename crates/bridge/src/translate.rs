//! CoT <-> compact-binary translation and outbound routing.
//!
//! Recognized friendly-position and GeoChat events are projected losslessly
//! onto the plugin-port packet; everything else rides the forwarder port as
//! compressed XML, fountain-coded when large. The bridge also owns the
//! process-wide callsign directory used to resolve direct-message targets.

use std::collections::HashMap;

use chrono::Duration;
use log::{debug, info};
use prost::Message;

use meshtak_cot::model::UNKNOWN_VALUE;
use meshtak_cot::{serialize_event, Chat, Contact, CotEvent, Group, Status, Track};
use meshtak_radio::fountain::{TransferKind, FOUNTAIN_THRESHOLD};
use meshtak_radio::zlib;

use crate::packet::{
    self, GeoChat, MemberRole, PayloadVariant, Pli, TakPacket, Team, COMPRESSED_MARKER,
};
use crate::BridgeError;

/// The broadcast chatroom name ATAK uses; anything else is treated as a
/// direct-message recipient callsign.
pub const ALL_CHAT_ROOMS: &str = "All Chat Rooms";

const UNKNOWN_CALLSIGN: &str = "Unknown";

/// Where an outgoing CoT event goes on the radio.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    /// Compact-binary packet on the plugin port.
    Packet(TakPacket),
    /// Single compressed datagram on the forwarder port.
    Direct(Vec<u8>),
    /// Fountain-coded transfer on the forwarder port.
    Fountain(Vec<u8>),
}

/// A chat body that is actually a read receipt, handled internally.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Receipt {
    Delivered(String),
    Read(String),
}

pub fn parse_receipt(message: &str) -> Option<Receipt> {
    if let Some(id) = message.strip_prefix("ACK:D:") {
        return Some(Receipt::Delivered(id.to_string()));
    }
    if let Some(id) = message.strip_prefix("ACK:R:") {
        return Some(Receipt::Read(id.to_string()));
    }
    None
}

pub struct Bridge {
    /// callsign -> device uid, fed by every received PLI and chat.
    directory: HashMap<String, String>,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Bridge {
    pub fn new() -> Self {
        Self {
            directory: HashMap::new(),
        }
    }

    pub fn resolve_callsign(&self, callsign: &str) -> Option<&str> {
        self.directory.get(callsign).map(String::as_str)
    }

    pub fn register_callsign(&mut self, callsign: impl Into<String>, uid: impl Into<String>) {
        self.directory.insert(callsign.into(), uid.into());
    }

    /// Classify an outgoing CoT event onto one of the radio transports.
    pub fn route_outbound(&mut self, event: &CotEvent) -> Result<Outbound, BridgeError> {
        if event.is_pli() {
            return Ok(Outbound::Packet(self.pli_to_packet(event)));
        }
        if event.is_chat() {
            return Ok(Outbound::Packet(self.chat_to_packet(event)));
        }

        let xml = serialize_event(event);
        // Compression failure is soft: fall through to the raw bytes.
        let body = match zlib::compress(xml.as_bytes()) {
            Ok(compressed) => compressed,
            Err(_) => {
                debug!("compression failed for {}, sending raw", event.uid);
                xml.into_bytes()
            }
        };
        let mut payload = Vec::with_capacity(body.len() + 1);
        payload.push(TransferKind::Cot as u8);
        payload.extend_from_slice(&body);

        if payload.len() < FOUNTAIN_THRESHOLD {
            Ok(Outbound::Direct(payload))
        } else {
            Ok(Outbound::Fountain(payload))
        }
    }

    fn pli_to_packet(&mut self, event: &CotEvent) -> TakPacket {
        let callsign = event
            .contact
            .as_ref()
            .map(|c| c.callsign.clone())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| UNKNOWN_CALLSIGN.to_string());
        self.directory.insert(callsign.clone(), event.uid.clone());

        let hae = event.point.hae;
        let altitude = if !hae.is_finite() || hae == UNKNOWN_VALUE {
            0
        } else {
            hae.round() as i32
        };

        TakPacket {
            is_compressed: false,
            contact: Some(packet::Contact {
                callsign,
                device_callsign: event.uid.clone(),
            }),
            group: event.group.as_ref().map(|g| packet::Group {
                role: MemberRole::from_name(&g.role) as i32,
                team: Team::from_name(&g.name) as i32,
            }),
            status: event
                .status
                .as_ref()
                .and_then(|s| s.battery)
                .map(|battery| packet::Status { battery }),
            payload_variant: Some(PayloadVariant::Pli(Pli {
                latitude_i: (event.point.lat * 1e7).round() as i32,
                longitude_i: (event.point.lon * 1e7).round() as i32,
                altitude,
                speed: event
                    .track
                    .map(|t| t.speed.max(0.0).round() as u32)
                    .unwrap_or(0),
                course: event
                    .track
                    .map(|t| t.course.max(0.0).round() as u32)
                    .unwrap_or(0),
            })),
        }
    }

    fn chat_to_packet(&mut self, event: &CotEvent) -> TakPacket {
        // b-t-f must carry a chat substructure on the wire; synthesize one
        // from remarks when the upstream omitted it.
        let chat = event.chat.clone().unwrap_or_else(|| Chat {
            message: event.remarks.clone().unwrap_or_default(),
            sender_callsign: None,
            chatroom: ALL_CHAT_ROOMS.to_string(),
        });

        let (sender_uid, uid_room, message_id) = event.geochat_parts();
        let chatroom = if chat.chatroom.is_empty() {
            uid_room
        } else {
            chat.chatroom.clone()
        };
        let callsign = chat
            .sender_callsign
            .clone()
            .or_else(|| event.contact.as_ref().map(|c| c.callsign.clone()))
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| UNKNOWN_CALLSIGN.to_string());
        self.directory.insert(callsign.clone(), sender_uid.clone());

        let (to, to_callsign) = if chatroom == ALL_CHAT_ROOMS {
            (ALL_CHAT_ROOMS.to_string(), ALL_CHAT_ROOMS.to_string())
        } else {
            match self.directory.get(&chatroom) {
                Some(uid) => (uid.clone(), chatroom.clone()),
                // Unknown recipient: degraded but non-fatal.
                None => (chatroom.clone(), chatroom.clone()),
            }
        };

        TakPacket {
            is_compressed: false,
            contact: Some(packet::Contact {
                callsign,
                device_callsign: format!("{}|{}", sender_uid, message_id),
            }),
            group: None,
            status: None,
            payload_variant: Some(PayloadVariant::Chat(GeoChat {
                message: chat.message,
                to: Some(to),
                to_callsign: Some(to_callsign),
            })),
        }
    }

    /// Handle a plugin-port payload; returns the reconstructed CoT event to
    /// broadcast, or `None` when the payload is a duplicate compressed copy,
    /// a read receipt, or malformed.
    pub fn handle_plugin_frame(&mut self, payload: &[u8]) -> Result<Option<CotEvent>, BridgeError> {
        if payload.starts_with(&COMPRESSED_MARKER) {
            debug!("ignoring compressed duplicate on plugin port");
            return Ok(None);
        }
        let packet =
            TakPacket::decode(payload).map_err(|e| BridgeError::ParseFailed(e.to_string()))?;
        match &packet.payload_variant {
            Some(PayloadVariant::Pli(pli)) => Ok(Some(self.pli_to_cot(&packet, pli))),
            Some(PayloadVariant::Chat(chat)) => {
                if let Some(receipt) = parse_receipt(&chat.message) {
                    info!("chat receipt intercepted: {:?}", receipt);
                    return Ok(None);
                }
                Ok(Some(self.chat_to_cot(&packet, chat)))
            }
            None => {
                debug!("plugin packet without payload variant, dropping");
                Ok(None)
            }
        }
    }

    fn pli_to_cot(&mut self, packet: &TakPacket, pli: &Pli) -> CotEvent {
        let (callsign, device_uid) = contact_parts(packet);
        if !callsign.is_empty() && callsign != UNKNOWN_CALLSIGN {
            self.directory.insert(callsign.clone(), device_uid.clone());
        }

        let mut ev = CotEvent::new(device_uid, "a-f-G-U-C");
        ev.stale = ev.time + Duration::minutes(5);
        ev.point.lat = pli.latitude_i as f64 / 1e7;
        ev.point.lon = pli.longitude_i as f64 / 1e7;
        // Altitude 0 stays 0; the peer has no unknown-altitude sentinel.
        ev.point.hae = pli.altitude as f64;
        ev.contact = Some(Contact {
            callsign,
            endpoint: None,
            phone: None,
        });
        ev.group = Some(Group {
            name: packet.team().name().to_string(),
            role: packet.role().name().to_string(),
        });
        ev.status = packet.status.as_ref().map(|s| Status {
            battery: Some(s.battery),
        });
        if pli.speed != 0 || pli.course != 0 {
            ev.track = Some(Track {
                speed: pli.speed as f64,
                course: pli.course as f64,
            });
        }
        ev
    }

    fn chat_to_cot(&mut self, packet: &TakPacket, chat: &GeoChat) -> CotEvent {
        let (callsign, smuggled) = contact_parts(packet);
        let (sender_uid, message_id) = match smuggled.split_once('|') {
            Some((uid, id)) => (uid.to_string(), id.to_string()),
            None => (smuggled.clone(), smuggled.clone()),
        };
        if !callsign.is_empty() && callsign != UNKNOWN_CALLSIGN {
            self.directory.insert(callsign.clone(), sender_uid.clone());
        }

        let to = chat.to.clone().unwrap_or_else(|| ALL_CHAT_ROOMS.to_string());
        let chatroom = if to == ALL_CHAT_ROOMS {
            ALL_CHAT_ROOMS.to_string()
        } else {
            chat.to_callsign.clone().filter(|c| !c.is_empty()).unwrap_or(to)
        };

        let mut ev = CotEvent::new(
            format!("GeoChat.{}.{}.{}", sender_uid, chatroom, message_id),
            "b-t-f",
        );
        ev.how = "h-g-i-g-o".to_string();
        ev.stale = ev.time + Duration::minutes(10);
        ev.chat = Some(Chat {
            message: chat.message.clone(),
            sender_callsign: Some(callsign),
            chatroom,
        });
        ev.remarks = Some(chat.message.clone());
        ev
    }
}

fn contact_parts(packet: &TakPacket) -> (String, String) {
    match &packet.contact {
        Some(contact) => (
            if contact.callsign.is_empty() {
                UNKNOWN_CALLSIGN.to_string()
            } else {
                contact.callsign.clone()
            },
            contact.device_callsign.clone(),
        ),
        None => (UNKNOWN_CALLSIGN.to_string(), String::new()),
    }
}
