//! Compact-binary TAK packet carried on the Meshtastic ATAK plugin port.
//!
//! Wire-compatible with the ATAK plugin protobufs: field tags and enum
//! values here are fixed by the Android peer.

use prost::Message;

/// Marker prefix of a duplicate compressed copy on the plugin port
/// (`is_compressed = true` as the leading varint field). Ignored silently.
pub const COMPRESSED_MARKER: [u8; 2] = [0x08, 0x01];

#[derive(Clone, PartialEq, Message)]
pub struct TakPacket {
    /// Whether the remaining fields are TAK-plugin compressed.
    #[prost(bool, tag = "1")]
    pub is_compressed: bool,

    #[prost(message, optional, tag = "2")]
    pub contact: Option<Contact>,

    #[prost(message, optional, tag = "3")]
    pub group: Option<Group>,

    #[prost(message, optional, tag = "4")]
    pub status: Option<Status>,

    #[prost(oneof = "PayloadVariant", tags = "5, 6")]
    pub payload_variant: Option<PayloadVariant>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum PayloadVariant {
    /// Position report.
    #[prost(message, tag = "5")]
    Pli(Pli),

    /// GeoChat text message.
    #[prost(message, tag = "6")]
    Chat(GeoChat),
}

#[derive(Clone, PartialEq, Message)]
pub struct Contact {
    #[prost(string, tag = "1")]
    pub callsign: String,

    /// Device uid for PLI; `"<deviceUid>|<messageId>"` for chat, packing
    /// the message id into the only spare identity field on the wire.
    #[prost(string, tag = "2")]
    pub device_callsign: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Group {
    #[prost(enumeration = "MemberRole", tag = "1")]
    pub role: i32,

    #[prost(enumeration = "Team", tag = "2")]
    pub team: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct Status {
    /// Battery percent.
    #[prost(uint32, tag = "1")]
    pub battery: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct Pli {
    /// Degrees x 1e7.
    #[prost(sfixed32, tag = "1")]
    pub latitude_i: i32,

    /// Degrees x 1e7.
    #[prost(sfixed32, tag = "2")]
    pub longitude_i: i32,

    /// Meters; 0 means unknown.
    #[prost(int32, tag = "3")]
    pub altitude: i32,

    #[prost(uint32, tag = "4")]
    pub speed: u32,

    #[prost(uint32, tag = "5")]
    pub course: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct GeoChat {
    #[prost(string, tag = "1")]
    pub message: String,

    /// Destination device uid, or `"All Chat Rooms"`.
    #[prost(string, optional, tag = "2")]
    pub to: Option<String>,

    #[prost(string, optional, tag = "3")]
    pub to_callsign: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum Team {
    UnspecifiedColor = 0,
    White = 1,
    Yellow = 2,
    Orange = 3,
    Magenta = 4,
    Red = 5,
    Maroon = 6,
    Purple = 7,
    DarkBlue = 8,
    Blue = 9,
    Cyan = 10,
    Teal = 11,
    Green = 12,
    DarkGreen = 13,
    Brown = 14,
}

impl Team {
    pub fn from_name(name: &str) -> Self {
        match name {
            "White" => Team::White,
            "Yellow" => Team::Yellow,
            "Orange" => Team::Orange,
            "Magenta" => Team::Magenta,
            "Red" => Team::Red,
            "Maroon" => Team::Maroon,
            "Purple" => Team::Purple,
            "Dark Blue" => Team::DarkBlue,
            "Blue" => Team::Blue,
            "Cyan" => Team::Cyan,
            "Teal" => Team::Teal,
            "Green" => Team::Green,
            "Dark Green" => Team::DarkGreen,
            "Brown" => Team::Brown,
            _ => Team::Cyan,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Team::White => "White",
            Team::Yellow => "Yellow",
            Team::Orange => "Orange",
            Team::Magenta => "Magenta",
            Team::Red => "Red",
            Team::Maroon => "Maroon",
            Team::Purple => "Purple",
            Team::DarkBlue => "Dark Blue",
            Team::Blue => "Blue",
            Team::UnspecifiedColor | Team::Cyan => "Cyan",
            Team::Teal => "Teal",
            Team::Green => "Green",
            Team::DarkGreen => "Dark Green",
            Team::Brown => "Brown",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum MemberRole {
    Unspecified = 0,
    TeamMember = 1,
    TeamLead = 2,
    Hq = 3,
    Sniper = 4,
    Medic = 5,
    ForwardObserver = 6,
    Rto = 7,
    K9 = 8,
}

impl MemberRole {
    pub fn from_name(name: &str) -> Self {
        match name {
            "Team Member" => MemberRole::TeamMember,
            "Team Lead" => MemberRole::TeamLead,
            "HQ" => MemberRole::Hq,
            "Sniper" => MemberRole::Sniper,
            "Medic" => MemberRole::Medic,
            "Forward Observer" => MemberRole::ForwardObserver,
            "RTO" => MemberRole::Rto,
            "K9" => MemberRole::K9,
            _ => MemberRole::TeamMember,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MemberRole::Unspecified | MemberRole::TeamMember => "Team Member",
            MemberRole::TeamLead => "Team Lead",
            MemberRole::Hq => "HQ",
            MemberRole::Sniper => "Sniper",
            MemberRole::Medic => "Medic",
            MemberRole::ForwardObserver => "Forward Observer",
            MemberRole::Rto => "RTO",
            MemberRole::K9 => "K9",
        }
    }
}

impl TakPacket {
    pub fn team(&self) -> Team {
        self.group
            .as_ref()
            .and_then(|g| Team::try_from(g.team).ok())
            .unwrap_or(Team::Cyan)
    }

    pub fn role(&self) -> MemberRole {
        self.group
            .as_ref()
            .and_then(|g| MemberRole::try_from(g.role).ok())
            .unwrap_or(MemberRole::TeamMember)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }
}
