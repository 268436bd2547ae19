use chrono::{DateTime, Duration, Utc};

/// TAK sentinel for "no value" in point fields.
pub const UNKNOWN_VALUE: f64 = 9999999.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Point {
    pub lat: f64,
    pub lon: f64,
    pub hae: f64,
    pub ce: f64,
    pub le: f64,
}

impl Default for Point {
    fn default() -> Self {
        Self {
            lat: 0.0,
            lon: 0.0,
            hae: UNKNOWN_VALUE,
            ce: UNKNOWN_VALUE,
            le: UNKNOWN_VALUE,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Contact {
    pub callsign: String,
    pub endpoint: Option<String>,
    pub phone: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Group {
    pub name: String,
    pub role: String,
}

impl Default for Group {
    fn default() -> Self {
        Self {
            name: "Cyan".to_string(),
            role: "Team Member".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Status {
    pub battery: Option<u32>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Track {
    pub speed: f64,
    pub course: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Chat {
    pub message: String,
    pub sender_callsign: Option<String>,
    pub chatroom: String,
}

/// One Cursor-on-Target event.
///
/// `uid`, `event_type` and `point` have no defaults; everything else does.
/// `raw_detail` holds any `<detail>` child the parser does not recognize,
/// verbatim, so it survives a round trip untouched.
#[derive(Clone, Debug, PartialEq)]
pub struct CotEvent {
    pub uid: String,
    pub event_type: String,
    pub time: DateTime<Utc>,
    pub start: DateTime<Utc>,
    pub stale: DateTime<Utc>,
    pub how: String,
    pub point: Point,
    pub contact: Option<Contact>,
    pub group: Option<Group>,
    pub status: Option<Status>,
    pub track: Option<Track>,
    pub chat: Option<Chat>,
    pub remarks: Option<String>,
    pub raw_detail: String,
}

impl CotEvent {
    pub fn new(uid: impl Into<String>, event_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            uid: uid.into(),
            event_type: event_type.into(),
            time: now,
            start: now,
            stale: now + Duration::minutes(5),
            how: "m-g".to_string(),
            point: Point::default(),
            contact: None,
            group: None,
            status: None,
            track: None,
            chat: None,
            remarks: None,
            raw_detail: String::new(),
        }
    }

    /// GeoChat text message?
    pub fn is_chat(&self) -> bool {
        self.event_type == "b-t-f"
    }

    /// Friendly ground-unit position report?
    pub fn is_pli(&self) -> bool {
        self.event_type.starts_with("a-f-G") || self.event_type.starts_with("a-f-g")
    }

    /// TAK protocol negotiation or ping traffic, handled by the server and
    /// never forwarded to the radio.
    pub fn is_control(&self) -> bool {
        self.event_type.starts_with("t-x-takp")
            || self.event_type == "t-x-c-t"
            || self.uid == "ping"
    }

    /// Split a `GeoChat.<senderUid>.<chatroom>.<messageId>` uid.
    ///
    /// Returns `(sender_uid, chatroom, message_id)`; falls back to the event
    /// uid for sender and message id when the uid is not in GeoChat form.
    pub fn geochat_parts(&self) -> (String, String, String) {
        let mut parts = self.uid.splitn(4, '.');
        if parts.next() == Some("GeoChat") {
            if let (Some(sender), Some(room), Some(msg_id)) =
                (parts.next(), parts.next(), parts.next())
            {
                return (sender.to_string(), room.to_string(), msg_id.to_string());
            }
        }
        let room = self
            .chat
            .as_ref()
            .map(|c| c.chatroom.clone())
            .unwrap_or_default();
        (self.uid.clone(), room, self.uid.clone())
    }
}
