use crate::error::ConnectionError;
use crate::stanza::ns;

/// One unit recovered from the inbound byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// The server opened its side of the `<stream:stream>` envelope.
    StreamOpen,
    /// The server closed the envelope; no further frames will follow.
    StreamClose,
    /// A complete top-level element (stanza, features, SASL exchange, ...).
    Stanza(String),
}

/// Incremental splitter that cuts a raw XML byte stream into complete
/// top-level elements without building a DOM.
///
/// The scanner tracks element depth and quoting only; it does not validate
/// the XML. Markup delimiters are all ASCII, so scanning bytes is safe even
/// when a read boundary lands inside a multi-byte character. `>` inside
/// comments is not special-cased; servers do not send comments mid-stream.
#[derive(Debug, Default)]
pub struct StanzaFramer {
    buf: Vec<u8>,
    scan: usize,
    depth: usize,
    frame_start: usize,
    in_tag: bool,
    tag_start: usize,
    quote: Option<u8>,
}

impl StanzaFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard all buffered state. Required before a stream restart, where
    /// the server begins an entirely new envelope.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Feed a chunk of bytes and collect every unit completed by it.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<FrameEvent>, ConnectionError> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();

        while self.scan < self.buf.len() {
            let b = self.buf[self.scan];
            if self.in_tag {
                if let Some(q) = self.quote {
                    if b == q {
                        self.quote = None;
                    }
                } else if b == b'"' || b == b'\'' {
                    self.quote = Some(b);
                } else if b == b'>' {
                    self.in_tag = false;
                    self.close_tag(&mut events)?;
                }
            } else if b == b'<' {
                self.in_tag = true;
                self.tag_start = self.scan;
                self.quote = None;
            }
            // Text at depth zero between stanzas (whitespace keepalives) is
            // skipped implicitly.
            self.scan += 1;
        }

        self.compact();
        Ok(events)
    }

    fn close_tag(&mut self, events: &mut Vec<FrameEvent>) -> Result<(), ConnectionError> {
        let tag = &self.buf[self.tag_start..=self.scan];

        if tag.starts_with(b"<?") || tag.starts_with(b"<!") {
            // XML prolog or doctype; nothing to do.
            return Ok(());
        }

        if tag[1] == b'/' {
            if self.depth == 0 {
                if tag_name(&tag[2..]) == b"stream:stream" {
                    events.push(FrameEvent::StreamClose);
                }
                return Ok(());
            }
            self.depth -= 1;
            if self.depth == 0 {
                events.push(self.take_frame(self.frame_start)?);
            }
            return Ok(());
        }

        if tag[tag.len() - 2] == b'/' {
            if self.depth == 0 {
                events.push(self.take_frame(self.tag_start)?);
            }
            return Ok(());
        }

        if self.depth == 0 {
            if tag_name(&tag[1..]) == b"stream:stream" {
                events.push(FrameEvent::StreamOpen);
                return Ok(());
            }
            self.frame_start = self.tag_start;
        }
        self.depth += 1;
        Ok(())
    }

    fn take_frame(&self, start: usize) -> Result<FrameEvent, ConnectionError> {
        let frame = String::from_utf8(self.buf[start..=self.scan].to_vec())
            .map_err(|error| ConnectionError::Stream(format!("invalid UTF-8 frame: {error}")))?;
        Ok(FrameEvent::Stanza(frame))
    }

    fn compact(&mut self) {
        let keep_from = if self.depth > 0 {
            self.frame_start
        } else if self.in_tag {
            self.tag_start
        } else {
            self.scan
        };

        if keep_from == 0 {
            return;
        }

        self.buf.drain(..keep_from);
        self.scan -= keep_from;
        if self.depth > 0 {
            self.frame_start -= keep_from;
        } else {
            self.frame_start = 0;
        }
        if self.in_tag {
            self.tag_start -= keep_from;
        } else {
            self.tag_start = 0;
        }
    }
}

fn tag_name(rest: &[u8]) -> &[u8] {
    let end = rest
        .iter()
        .position(|&b| matches!(b, b' ' | b'\t' | b'\r' | b'\n' | b'>' | b'/'))
        .unwrap_or(rest.len());
    &rest[..end]
}

/// Stamp the default `jabber:client` namespace onto a frame whose root tag
/// has none. Frames cut out of the stream lose the namespace they inherited
/// from the envelope, and the DOM parser needs it back.
pub fn ensure_default_ns(frame: &str) -> String {
    let bytes = frame.as_bytes();
    let mut quote: Option<u8> = None;
    let mut tag_end = None;
    for (i, &b) in bytes.iter().enumerate() {
        match quote {
            Some(q) => {
                if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'>' => {
                    tag_end = Some(i);
                    break;
                }
                _ => {}
            },
        }
    }

    let Some(end) = tag_end else {
        return frame.to_string();
    };
    if root_has_default_ns(&frame[..end]) {
        return frame.to_string();
    }

    let insert_at = if bytes[end - 1] == b'/' { end - 1 } else { end };
    format!(
        "{} xmlns='{}'{}",
        frame[..insert_at].trim_end(),
        ns::CLIENT,
        &frame[insert_at..]
    )
}

fn root_has_default_ns(root_tag: &str) -> bool {
    // Blank out quoted attribute values so their content cannot fake an
    // xmlns declaration, then look for the bare attribute name.
    let mut blanked = String::with_capacity(root_tag.len());
    let mut quote: Option<char> = None;
    for c in root_tag.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                    blanked.push(c);
                } else {
                    blanked.push('_');
                }
            }
            None => {
                if c == '"' || c == '\'' {
                    quote = Some(c);
                }
                blanked.push(c);
            }
        }
    }

    blanked
        .split_whitespace()
        .any(|attr| attr.starts_with("xmlns=") || attr == "xmlns")
}
