//! Two gateways on a simulated mesh: CoT in on one side, CoT out on the
//! other, across both radio transports.

use std::time::Duration;

use meshtak_bridge::{Bridge, Forwarder, Outbound, PayloadVariant, TakPacket};
use meshtak_cot::{parse_event, serialize_event, Chat, CotEvent};
use meshtak_radio::simulated::{MeshConfig, SimulatedRadio};
use meshtak_radio::{
    MeshPacket, RadioLink, SimulatedMesh, PORT_ATAK_FORWARDER, PORT_ATAK_PLUGIN,
};
use prost::Message;

const NODE_A: u32 = 0x1001;
const NODE_B: u32 = 0x1002;

struct Gateway {
    bridge: Bridge,
    forwarder: Forwarder,
    radio: SimulatedRadio,
    node_id: u32,
}

impl Gateway {
    async fn join(mesh: &std::sync::Arc<SimulatedMesh>, node_id: u32) -> Self {
        Self {
            bridge: Bridge::new(),
            forwarder: Forwarder::new(),
            radio: mesh.join(node_id).await,
            node_id,
        }
    }

    async fn send_cot(&mut self, event: &CotEvent) {
        match self.bridge.route_outbound(event).unwrap() {
            Outbound::Packet(packet) => self
                .radio
                .send(MeshPacket::broadcast(
                    self.node_id,
                    0,
                    PORT_ATAK_PLUGIN,
                    packet.to_bytes(),
                ))
                .await
                .unwrap(),
            Outbound::Direct(payload) | Outbound::Fountain(payload) => self
                .forwarder
                .send_payload(&self.radio, self.node_id, 0, payload)
                .await
                .unwrap(),
        }
    }

    /// Pump inbound packets until a CoT event pops out or the mesh goes
    /// quiet.
    async fn recv_cot(&mut self) -> Option<CotEvent> {
        loop {
            let packet = tokio::time::timeout(Duration::from_secs(5), self.radio.receive())
                .await
                .ok()??;
            match packet.port {
                PORT_ATAK_PLUGIN => {
                    if let Some(event) = self.bridge.handle_plugin_frame(&packet.payload).unwrap()
                    {
                        return Some(event);
                    }
                }
                PORT_ATAK_FORWARDER => {
                    if let Some(xml) = self
                        .forwarder
                        .handle_frame(&self.radio, self.node_id, &packet)
                        .await
                        .unwrap()
                    {
                        return parse_event(&xml).ok();
                    }
                }
                _ => {}
            }
        }
    }
}

#[tokio::test(start_paused = true)]
async fn loopback_pli_lands_on_plugin_port() {
    let mesh = SimulatedMesh::new(MeshConfig::default());
    let mut a = Gateway::join(&mesh, NODE_A).await;
    let b = mesh.join(NODE_B).await;

    let xml = br#"<event version="2.0" uid="U1" type="a-f-G-U-C" time="2025-01-01T00:00:00Z" start="2025-01-01T00:00:00Z" stale="2025-01-01T00:10:00Z" how="m-g"><point lat="37.5" lon="-122.25" hae="9999999" ce="9999999" le="9999999"/><detail><contact callsign="ALPHA"/><__group name="Cyan" role="Team Member"/></detail></event>"#;
    let event = parse_event(xml).unwrap();
    a.send_cot(&event).await;

    let packet = b.receive().await.unwrap();
    assert_eq!(packet.port, PORT_ATAK_PLUGIN);
    let tak = TakPacket::decode(packet.payload.as_slice()).unwrap();
    let Some(PayloadVariant::Pli(pli)) = &tak.payload_variant else {
        panic!("expected PLI payload");
    };
    assert_eq!(pli.latitude_i, 375000000);
    assert_eq!(pli.longitude_i, -1222500000);
    assert_eq!(pli.altitude, 0);
    assert_eq!(tak.contact.as_ref().unwrap().callsign, "ALPHA");
    assert_eq!(tak.team().name(), "Cyan");
    assert_eq!(tak.role().name(), "Team Member");
}

#[tokio::test(start_paused = true)]
async fn chat_crosses_the_mesh_with_message_id() {
    let mesh = SimulatedMesh::new(MeshConfig::default());
    let mut a = Gateway::join(&mesh, NODE_A).await;
    let mut b = Gateway::join(&mesh, NODE_B).await;

    let mut event = CotEvent::new("GeoChat.ANDROID-abc.All Chat Rooms.MID42", "b-t-f");
    event.chat = Some(Chat {
        message: "rally at checkpoint 2".into(),
        sender_callsign: Some("ALPHA".into()),
        chatroom: "All Chat Rooms".into(),
    });
    a.send_cot(&event).await;

    let got = b.recv_cot().await.expect("chat did not arrive");
    assert_eq!(got.uid, "GeoChat.ANDROID-abc.All Chat Rooms.MID42");
    assert_eq!(got.event_type, "b-t-f");
    let chat = got.chat.as_ref().unwrap();
    assert_eq!(chat.message, "rally at checkpoint 2");
    assert_eq!(chat.chatroom, "All Chat Rooms");

    // The reconstructed event serializes with the threading fields intact.
    let rendered = serialize_event(&got);
    assert!(rendered.contains(r#"messageId="MID42""#));
    assert!(rendered.contains(r#"uid0="ANDROID-abc""#));
}

#[tokio::test(start_paused = true)]
async fn small_generic_cot_rides_the_direct_path() {
    let mesh = SimulatedMesh::new(MeshConfig::default());
    let mut a = Gateway::join(&mesh, NODE_A).await;
    let mut b = Gateway::join(&mesh, NODE_B).await;

    let mut event = CotEvent::new("marker-7", "b-m-p-s-m");
    event.remarks = Some("dropped marker".into());
    a.send_cot(&event).await;

    let got = b.recv_cot().await.expect("marker did not arrive");
    assert_eq!(got.uid, "marker-7");
    assert_eq!(got.event_type, "b-m-p-s-m");
    assert_eq!(got.remarks.as_deref(), Some("dropped marker"));
}

#[tokio::test(start_paused = true)]
async fn unknown_detail_survives_the_fountain_path() {
    let mesh = SimulatedMesh::new(MeshConfig::default());

    // Incompressible filler pushes the compressed payload over the fountain
    // threshold (a few source blocks).
    let filler: String = (0..600u32)
        .map(|i| char::from_u32(0x41 + (i.wrapping_mul(2654435761) % 26)).unwrap())
        .collect();
    let raw_detail = format!(
        r#"<color argb="-65536"/><shape><ellipse major="100" minor="50"/></shape><blob data="{}"/>"#,
        filler
    );
    let mut event = CotEvent::new("shape-1", "u-d-f");
    event.raw_detail = raw_detail.clone();

    // The fountain is best-effort per transfer; a fresh transfer id retries
    // the same event until one peels.
    for _attempt in 0..12 {
        let mut a = Gateway::join(&mesh, NODE_A).await;
        let mut b = Gateway::join(&mesh, NODE_B).await;

        match a.bridge.route_outbound(&event).unwrap() {
            Outbound::Fountain(_) => {}
            other => panic!("expected fountain path, got {other:?}"),
        }
        a.send_cot(&event).await;

        let got = tokio::time::timeout(Duration::from_secs(10), b.recv_cot()).await;
        if let Ok(Some(got)) = got {
            assert_eq!(got.uid, "shape-1");
            assert_eq!(got.raw_detail, raw_detail, "raw detail must be byte-identical");
            // Completion also pushed two ACKs back to the sender.
            let ack1 = a.radio.receive().await.unwrap();
            let ack2 = a.radio.receive().await.unwrap();
            assert_eq!(&ack1.payload[..3], b"FTN");
            assert_eq!(ack1.payload.len(), 19);
            assert_eq!(ack2.payload, ack1.payload);
            return;
        }
        // Undecodable with this transfer's block set; try again.
    }
    panic!("fountain transfer failed 12 times in a row");
}

#[tokio::test(start_paused = true)]
async fn directory_learned_from_pli_routes_direct_messages() {
    let mesh = SimulatedMesh::new(MeshConfig::default());
    let mut a = Gateway::join(&mesh, NODE_A).await;
    let mut b = Gateway::join(&mesh, NODE_B).await;

    // B's position teaches A that BRAVO lives at ANDROID-xyz.
    let xml = br#"<event version="2.0" uid="ANDROID-xyz" type="a-f-G-U-C" time="2025-01-01T00:00:00Z" start="2025-01-01T00:00:00Z" stale="2025-01-01T00:10:00Z" how="m-g"><point lat="1" lon="2" hae="3" ce="9999999" le="9999999"/><detail><contact callsign="BRAVO"/></detail></event>"#;
    b.send_cot(&parse_event(xml).unwrap()).await;
    let learned = a.recv_cot().await.expect("PLI did not arrive");
    assert_eq!(learned.contact.as_ref().unwrap().callsign, "BRAVO");

    // Now a DM from A to BRAVO resolves to the device uid.
    let mut dm = CotEvent::new("GeoChat.ANDROID-aaa.BRAVO.MID9", "b-t-f");
    dm.chat = Some(Chat {
        message: "priv".into(),
        sender_callsign: Some("ALPHA".into()),
        chatroom: "BRAVO".into(),
    });
    let Outbound::Packet(packet) = a.bridge.route_outbound(&dm).unwrap() else {
        panic!("expected packet");
    };
    let Some(PayloadVariant::Chat(chat)) = &packet.payload_variant else {
        panic!("expected chat");
    };
    assert_eq!(chat.to.as_deref(), Some("ANDROID-xyz"));
    assert_eq!(chat.to_callsign.as_deref(), Some("BRAVO"));
}
