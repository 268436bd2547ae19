//! Streaming CoT XML parser and serializer.
//!
//! The parser walks the byte stream SAX-style and commits exactly one
//! [`CotEvent`] when `</event>` closes. Recognized `<detail>` children are
//! lifted into typed fields; every other direct child subtree is captured
//! verbatim into `raw_detail` so it can be re-emitted untouched.

use std::io::Cursor;

use chrono::{DateTime, NaiveDateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use crate::model::{Chat, Contact, CotEvent, Group, Point, Status, Track, UNKNOWN_VALUE};
use crate::CotError;

const RECOGNIZED_DETAIL_CHILDREN: &[&str] = &[
    "contact",
    "__group",
    "status",
    "track",
    "__chat",
    "chatgrp",
    "remarks",
    "link",
    "uid",
    "__serverdestination",
];

pub fn xml_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
    out
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(value) {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.fZ") {
        return Some(t.and_utc());
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%SZ")
        .ok()
        .map(|t| t.and_utc())
}

struct AttrMap {
    pairs: Vec<(String, String)>,
}

impl AttrMap {
    fn from_start<R: std::io::BufRead>(e: &BytesStart, reader: &Reader<R>) -> Self {
        let mut pairs = Vec::new();
        for attr in e.attributes().flatten() {
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            if let Ok(value) = attr.decode_and_unescape_value(reader) {
                pairs.push((key, value.into_owned()));
            }
        }
        Self { pairs }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    fn get_time(&self, key: &str) -> DateTime<Utc> {
        self.get(key)
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now)
    }
}

/// Reconstruct an opening tag for the raw-detail buffer. Attribute values are
/// re-emitted with their original escaping, quotes normalized to double.
fn raw_open_tag(e: &BytesStart, self_closing: bool) -> String {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut out = String::with_capacity(name.len() + 32);
    out.push('<');
    out.push_str(&name);
    for attr in e.attributes().flatten() {
        out.push(' ');
        out.push_str(&String::from_utf8_lossy(attr.key.as_ref()));
        out.push_str("=\"");
        out.push_str(&String::from_utf8_lossy(&attr.value));
        out.push('"');
    }
    out.push_str(if self_closing { "/>" } else { ">" });
    out
}

fn raw_close_tag(name: &[u8], out: &mut String) {
    out.push_str("</");
    out.push_str(&String::from_utf8_lossy(name));
    out.push('>');
}

fn is_recognized(name: &str) -> bool {
    RECOGNIZED_DETAIL_CHILDREN.contains(&name)
}

/// Parse one complete CoT event.
///
/// The input must be UTF-8 containing a single `<event>...</event>` (the
/// stream framer upstream guarantees the latter); anything outside the
/// event element is ignored.
pub fn parse_event(data: &[u8]) -> Result<CotEvent, CotError> {
    std::str::from_utf8(data).map_err(|_| CotError::EncodingFailed)?;

    let mut reader = Reader::from_reader(Cursor::new(data));
    reader.trim_text(false);

    let mut buf = Vec::new();

    let mut event: Option<CotEvent> = None;
    let mut in_detail = false;
    // Open-element count of an unrecognized <detail> child subtree being
    // captured verbatim.
    let mut raw_depth = 0usize;
    let mut raw_buf = String::new();
    // Open-element count of a recognized <detail> child subtree.
    let mut consumed_depth = 0usize;
    let mut in_remarks = false;
    let mut remarks_text = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if raw_depth > 0 {
                    raw_buf.push_str(&raw_open_tag(&e, false));
                    raw_depth += 1;
                    buf.clear();
                    continue;
                }
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                match name.as_str() {
                    "event" if event.is_none() => {
                        event = Some(open_event(&e, &reader)?);
                    }
                    "point" if event.is_some() && !in_detail => {
                        if let Some(ev) = event.as_mut() {
                            ev.point = open_point(&e, &reader);
                        }
                    }
                    "detail" if event.is_some() && !in_detail => in_detail = true,
                    _ if in_detail => {
                        if is_recognized(&name) {
                            if let Some(ev) = event.as_mut() {
                                open_detail_child(&e, &reader, &name, ev, &mut in_remarks, false);
                            }
                            consumed_depth += 1;
                        } else if consumed_depth == 0 {
                            raw_buf.push_str(&raw_open_tag(&e, false));
                            raw_depth = 1;
                        } else {
                            // Unrecognized grandchild of a recognized child;
                            // consumed with its parent.
                            consumed_depth += 1;
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) => {
                if raw_depth > 0 {
                    raw_buf.push_str(&raw_open_tag(&e, true));
                    buf.clear();
                    continue;
                }
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                match name.as_str() {
                    "point" if event.is_some() && !in_detail => {
                        if let Some(ev) = event.as_mut() {
                            ev.point = open_point(&e, &reader);
                        }
                    }
                    _ if in_detail => {
                        if is_recognized(&name) {
                            if let Some(ev) = event.as_mut() {
                                open_detail_child(&e, &reader, &name, ev, &mut in_remarks, true);
                            }
                        } else if consumed_depth == 0 {
                            raw_buf.push_str(&raw_open_tag(&e, true));
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(e)) => {
                if raw_depth > 0 {
                    raw_buf.push_str(&String::from_utf8_lossy(e.as_ref()));
                } else if in_remarks {
                    if let Ok(text) = e.unescape() {
                        remarks_text.push_str(&text);
                    }
                }
            }
            Ok(Event::CData(e)) => {
                if raw_depth > 0 {
                    raw_buf.push_str("<![CDATA[");
                    raw_buf.push_str(&String::from_utf8_lossy(e.as_ref()));
                    raw_buf.push_str("]]>");
                } else if in_remarks {
                    remarks_text.push_str(&String::from_utf8_lossy(e.as_ref()));
                }
            }
            Ok(Event::End(e)) => {
                let name = e.name().as_ref().to_vec();
                if raw_depth > 0 {
                    raw_close_tag(&name, &mut raw_buf);
                    raw_depth -= 1;
                } else if name == b"detail" {
                    in_detail = false;
                    consumed_depth = 0;
                } else if in_detail && consumed_depth > 0 {
                    if name == b"remarks" {
                        in_remarks = false;
                    }
                    consumed_depth -= 1;
                } else if name == b"event" {
                    let mut ev = event.take().ok_or_else(|| {
                        CotError::ParseFailed("</event> without <event>".into())
                    })?;
                    if !remarks_text.is_empty() {
                        ev.remarks = Some(remarks_text.trim().to_string());
                    }
                    ev.raw_detail = raw_buf;
                    if let (Some(chat), Some(remarks)) = (ev.chat.as_mut(), ev.remarks.as_ref()) {
                        if chat.message.is_empty() {
                            chat.message = remarks.clone();
                        }
                    }
                    return Ok(ev);
                }
            }
            Ok(Event::Eof) => {
                return Err(CotError::ParseFailed("no </event> before end of input".into()))
            }
            Err(e) => return Err(CotError::ParseFailed(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
}

fn open_event<R: std::io::BufRead>(
    e: &BytesStart,
    reader: &Reader<R>,
) -> Result<CotEvent, CotError> {
    let attrs = AttrMap::from_start(e, reader);
    let uid = attrs
        .get("uid")
        .ok_or(CotError::MissingAttribute("uid"))?
        .to_string();
    let event_type = attrs
        .get("type")
        .ok_or(CotError::MissingAttribute("type"))?
        .to_string();
    let mut ev = CotEvent::new(uid, event_type);
    ev.time = attrs.get_time("time");
    ev.start = attrs.get_time("start");
    ev.stale = attrs.get_time("stale");
    if let Some(how) = attrs.get("how") {
        ev.how = how.to_string();
    }
    Ok(ev)
}

fn open_point<R: std::io::BufRead>(e: &BytesStart, reader: &Reader<R>) -> Point {
    let attrs = AttrMap::from_start(e, reader);
    Point {
        lat: attrs.get_f64("lat", 0.0),
        lon: attrs.get_f64("lon", 0.0),
        hae: attrs.get_f64("hae", UNKNOWN_VALUE),
        ce: attrs.get_f64("ce", UNKNOWN_VALUE),
        le: attrs.get_f64("le", UNKNOWN_VALUE),
    }
}

fn open_detail_child<R: std::io::BufRead>(
    e: &BytesStart,
    reader: &Reader<R>,
    name: &str,
    ev: &mut CotEvent,
    in_remarks: &mut bool,
    self_closing: bool,
) {
    let attrs = AttrMap::from_start(e, reader);
    match name {
        "contact" => {
            ev.contact = Some(Contact {
                callsign: attrs.get("callsign").unwrap_or_default().to_string(),
                endpoint: attrs.get("endpoint").map(str::to_string),
                phone: attrs.get("phone").map(str::to_string),
            });
        }
        "__group" => {
            let mut group = Group::default();
            if let Some(n) = attrs.get("name") {
                group.name = n.to_string();
            }
            if let Some(r) = attrs.get("role") {
                group.role = r.to_string();
            }
            ev.group = Some(group);
        }
        "status" => {
            ev.status = Some(Status {
                battery: attrs.get("battery").and_then(|b| b.parse().ok()),
            });
        }
        "track" => {
            ev.track = Some(Track {
                speed: attrs.get_f64("speed", 0.0),
                course: attrs.get_f64("course", 0.0),
            });
        }
        "__chat" => {
            let chat = ev.chat.get_or_insert_with(Chat::default);
            if let Some(room) = attrs.get("chatroom") {
                chat.chatroom = room.to_string();
            }
            if let Some(sender) = attrs.get("senderCallsign") {
                chat.sender_callsign = Some(sender.to_string());
            }
        }
        "remarks" => {
            if self_closing {
                ev.remarks = Some(String::new());
            } else {
                *in_remarks = true;
            }
        }
        // chatgrp, link, uid, __serverdestination carry nothing the model
        // keeps; they are re-synthesized on serialization.
        _ => {}
    }
}

fn format_time(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn push_num(out: &mut String, value: f64) {
    // Whole-number doubles print without a trailing ".0" to match the
    // compact attribute style TAK clients emit.
    if value.fract() == 0.0 && value.abs() < 1e15 {
        out.push_str(&format!("{}", value as i64));
    } else {
        out.push_str(&format!("{}", value));
    }
}

/// Serialize a CoT event with the fixed attribute order TAK peers expect.
pub fn serialize_event(ev: &CotEvent) -> String {
    let mut out = String::with_capacity(512);
    out.push_str("<event version=\"2.0\" uid=\"");
    out.push_str(&xml_escape(&ev.uid));
    out.push_str("\" type=\"");
    out.push_str(&xml_escape(&ev.event_type));
    out.push_str("\" time=\"");
    out.push_str(&format_time(&ev.time));
    out.push_str("\" start=\"");
    out.push_str(&format_time(&ev.start));
    out.push_str("\" stale=\"");
    out.push_str(&format_time(&ev.stale));
    out.push_str("\" how=\"");
    out.push_str(&xml_escape(&ev.how));
    out.push_str("\">");

    out.push_str("<point lat=\"");
    push_num(&mut out, ev.point.lat);
    out.push_str("\" lon=\"");
    push_num(&mut out, ev.point.lon);
    out.push_str("\" hae=\"");
    push_num(&mut out, ev.point.hae);
    out.push_str("\" ce=\"");
    push_num(&mut out, ev.point.ce);
    out.push_str("\" le=\"");
    push_num(&mut out, ev.point.le);
    out.push_str("\"/>");

    out.push_str("<detail>");

    if let Some(contact) = &ev.contact {
        out.push_str("<contact callsign=\"");
        out.push_str(&xml_escape(&contact.callsign));
        out.push('"');
        if let Some(endpoint) = &contact.endpoint {
            out.push_str(" endpoint=\"");
            out.push_str(&xml_escape(endpoint));
            out.push('"');
        }
        if let Some(phone) = &contact.phone {
            out.push_str(" phone=\"");
            out.push_str(&xml_escape(phone));
            out.push('"');
        }
        out.push_str("/>");
    }

    if let Some(group) = &ev.group {
        out.push_str("<__group name=\"");
        out.push_str(&xml_escape(&group.name));
        out.push_str("\" role=\"");
        out.push_str(&xml_escape(&group.role));
        out.push_str("\"/>");
    }

    if let Some(status) = &ev.status {
        if let Some(battery) = status.battery {
            out.push_str(&format!("<status battery=\"{}\"/>", battery));
        }
    }

    if let Some(track) = &ev.track {
        out.push_str("<track speed=\"");
        push_num(&mut out, track.speed);
        out.push_str("\" course=\"");
        push_num(&mut out, track.course);
        out.push_str("\"/>");
    }

    if ev.is_chat() {
        serialize_chat_detail(ev, &mut out);
    } else if let Some(remarks) = &ev.remarks {
        out.push_str("<remarks>");
        out.push_str(&xml_escape(remarks));
        out.push_str("</remarks>");
    }

    if !ev.raw_detail.is_empty() {
        out.push_str(&ev.raw_detail);
    }

    out.push_str("</detail></event>");
    out
}

/// GeoChat detail block: `__chat` with nested `chatgrp`, a `link` back to
/// the sender, a `__serverdestination`, and the BAO-sourced `remarks`.
fn serialize_chat_detail(ev: &CotEvent, out: &mut String) {
    let (sender_uid, uid_room, message_id) = ev.geochat_parts();
    let chat = ev.chat.clone().unwrap_or_default();
    let chatroom = if chat.chatroom.is_empty() {
        uid_room
    } else {
        chat.chatroom.clone()
    };
    let sender_callsign = chat
        .sender_callsign
        .clone()
        .unwrap_or_else(|| sender_uid.clone());
    let message = if chat.message.is_empty() {
        ev.remarks.clone().unwrap_or_default()
    } else {
        chat.message.clone()
    };

    out.push_str("<__chat parent=\"RootContactGroup\" groupOwner=\"false\" messageId=\"");
    out.push_str(&xml_escape(&message_id));
    out.push_str("\" chatroom=\"");
    out.push_str(&xml_escape(&chatroom));
    out.push_str("\" id=\"");
    out.push_str(&xml_escape(&chatroom));
    out.push_str("\" senderCallsign=\"");
    out.push_str(&xml_escape(&sender_callsign));
    out.push_str("\"><chatgrp uid0=\"");
    out.push_str(&xml_escape(&sender_uid));
    out.push_str("\" uid1=\"");
    out.push_str(&xml_escape(&chatroom));
    out.push_str("\" id=\"");
    out.push_str(&xml_escape(&chatroom));
    out.push_str("\"/></__chat>");

    out.push_str("<link uid=\"");
    out.push_str(&xml_escape(&sender_uid));
    out.push_str("\" type=\"a-f-G-U-C\" relation=\"p-p\"/>");

    out.push_str("<__serverdestination destinations=\"127.0.0.1:8089:tcp:");
    out.push_str(&xml_escape(&sender_uid));
    out.push_str("\"/>");

    out.push_str("<remarks source=\"BAO.F.ATAK.");
    out.push_str(&xml_escape(&sender_uid));
    out.push_str("\" to=\"");
    out.push_str(&xml_escape(&chatroom));
    out.push_str("\" time=\"");
    out.push_str(&format_time(&ev.time));
    out.push_str("\">");
    out.push_str(&xml_escape(&message));
    out.push_str("</remarks>");
}
