//! Cursor-on-Target event model and XML codec

use thiserror::Error;

pub mod model;
pub mod xml;

pub use model::{Chat, Contact, CotEvent, Group, Point, Status, Track, UNKNOWN_VALUE};
pub use xml::{parse_event, serialize_event, xml_escape};

#[derive(Debug, Error)]
pub enum CotError {
    #[error("malformed CoT XML: {0}")]
    ParseFailed(String),

    #[error("event is missing required attribute `{0}`")]
    MissingAttribute(&'static str),

    #[error("byte stream is not valid UTF-8")]
    EncodingFailed,
}
