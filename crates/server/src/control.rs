//! TAK protocol negotiation and keepalive events.

use meshtak_cot::{serialize_event, CotEvent};

/// First event on every connection: advertise XML-only transport
/// (TAK Protocol version 0).
pub fn protocol_support(server_uid: &str) -> CotEvent {
    let mut ev = CotEvent::new(server_uid, "t-x-takp-v");
    ev.how = "m-g".to_string();
    ev.raw_detail = r#"<TakProtocolSupport version="0"/>"#.to_string();
    ev
}

/// Reply to a client's `t-x-takp-q` negotiation request.
pub fn protocol_response(server_uid: &str) -> CotEvent {
    let mut ev = CotEvent::new(server_uid, "t-x-takp-r");
    ev.how = "m-g".to_string();
    ev.raw_detail = r#"<TakResponse status="true"/>"#.to_string();
    ev
}

/// Periodic keepalive; empty detail.
pub fn keepalive() -> CotEvent {
    let mut ev = CotEvent::new("takPong", "t-x-d-d");
    ev.how = "h-g-i-g-o".to_string();
    ev
}

pub fn to_wire(ev: &CotEvent) -> Vec<u8> {
    let mut bytes = serialize_event(ev).into_bytes();
    bytes.push(b'\n');
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshtak_cot::parse_event;

    #[test]
    fn protocol_support_advertises_version_zero() {
        let xml = serialize_event(&protocol_support("srv-1"));
        assert!(xml.contains(r#"type="t-x-takp-v""#));
        assert!(xml.contains(r#"<TakProtocolSupport version="0"/>"#));
        // Still a parseable event on the client side.
        let back = parse_event(xml.as_bytes()).unwrap();
        assert_eq!(back.event_type, "t-x-takp-v");
        assert_eq!(back.raw_detail, r#"<TakProtocolSupport version="0"/>"#);
    }

    #[test]
    fn protocol_response_is_positive() {
        let xml = serialize_event(&protocol_response("srv-1"));
        assert!(xml.contains(r#"type="t-x-takp-r""#));
        assert!(xml.contains(r#"<TakResponse status="true"/>"#));
    }

    #[test]
    fn keepalive_shape() {
        let xml = serialize_event(&keepalive());
        assert!(xml.contains(r#"uid="takPong""#));
        assert!(xml.contains(r#"type="t-x-d-d""#));
    }

    #[test]
    fn wire_form_is_newline_terminated() {
        let bytes = to_wire(&keepalive());
        assert_eq!(*bytes.last().unwrap(), b'\n');
    }
}
