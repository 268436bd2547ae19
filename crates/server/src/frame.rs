//! Byte-stream framing for the CoT wire protocol.
//!
//! TAK Protocol v0 is a plain XML stream; messages are delimited by
//! `</event>`. The framer accumulates bytes per connection and carves out
//! `[<event, </event>]` ranges; a closing tag with no opening tag ahead of
//! it is dropped together with its prefix.

const EVENT_OPEN: &[u8] = b"<event";
const EVENT_CLOSE: &[u8] = b"</event>";

/// DoS guard: buffer and per-message cap.
pub const MAX_BUFFER: usize = 8 * 1024 * 1024;

#[derive(Default)]
pub struct StreamFramer {
    buf: Vec<u8>,
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

impl StreamFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append bytes and return every complete message they finish.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(bytes);
        let mut messages = Vec::new();

        while let Some(close_at) = find(&self.buf, EVENT_CLOSE) {
            let end = close_at + EVENT_CLOSE.len();
            match rfind(&self.buf[..close_at], EVENT_OPEN) {
                Some(start) => {
                    let message = self.buf[start..end].to_vec();
                    self.buf.drain(..end);
                    if message.len() <= MAX_BUFFER {
                        messages.push(message);
                    }
                }
                None => {
                    // Orphan close: drop it and everything before it.
                    self.buf.drain(..end);
                }
            }
        }

        if self.buf.len() > MAX_BUFFER {
            self.buf.clear();
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVENT: &[u8] = br#"<event uid="A" type="t"><point/></event>"#;

    #[test]
    fn single_event_in_one_read() {
        let mut framer = StreamFramer::new();
        let out = framer.push(EVENT);
        assert_eq!(out, vec![EVENT.to_vec()]);
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn event_split_at_every_byte_boundary() {
        for cut in 1..EVENT.len() {
            let mut framer = StreamFramer::new();
            assert!(framer.push(&EVENT[..cut]).is_empty(), "cut={cut}");
            let out = framer.push(&EVENT[cut..]);
            assert_eq!(out, vec![EVENT.to_vec()], "cut={cut}");
        }
    }

    #[test]
    fn multiple_events_with_whitespace() {
        let mut framer = StreamFramer::new();
        let mut stream = Vec::new();
        stream.extend_from_slice(b"\n  ");
        stream.extend_from_slice(EVENT);
        stream.extend_from_slice(b"\r\n");
        stream.extend_from_slice(EVENT);
        stream.extend_from_slice(b"   ");
        let out = framer.push(&stream);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|m| m == EVENT));
    }

    #[test]
    fn xml_declaration_prefix_is_skipped() {
        let mut framer = StreamFramer::new();
        let mut stream = b"<?xml version=\"1.0\" standalone=\"yes\"?>\n".to_vec();
        stream.extend_from_slice(EVENT);
        let out = framer.push(&stream);
        assert_eq!(out, vec![EVENT.to_vec()]);
    }

    #[test]
    fn orphan_close_dropped_with_prefix() {
        let mut framer = StreamFramer::new();
        let mut stream = b"garbage</event>".to_vec();
        stream.extend_from_slice(EVENT);
        let out = framer.push(&stream);
        assert_eq!(out, vec![EVENT.to_vec()]);
    }

    #[test]
    fn three_way_arbitrary_cuts() {
        // Concatenate three events, cut the stream at a spread of points.
        let mut stream = Vec::new();
        for _ in 0..3 {
            stream.extend_from_slice(EVENT);
            stream.push(b'\n');
        }
        for step in [1usize, 2, 3, 7, 13, 40] {
            let mut framer = StreamFramer::new();
            let mut got = Vec::new();
            for chunk in stream.chunks(step) {
                got.extend(framer.push(chunk));
            }
            assert_eq!(got.len(), 3, "step={step}");
            assert!(got.iter().all(|m| m == EVENT));
        }
    }

    #[test]
    fn oversized_buffer_is_cleared() {
        let mut framer = StreamFramer::new();
        // No closing tag anywhere; exceed the cap.
        let junk = vec![b'x'; MAX_BUFFER + 1];
        assert!(framer.push(&junk).is_empty());
        assert_eq!(framer.buffered(), 0);
        // The framer still works afterwards.
        assert_eq!(framer.push(EVENT), vec![EVENT.to_vec()]);
    }
}
