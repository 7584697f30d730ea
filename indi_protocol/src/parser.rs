//! Incremental XML tokenizer for the INDI stream.
//!
//! The server never frames its messages: the stream is a sequence of
//! top-level XML elements with no enclosing document. [`StreamParser::feed`]
//! accepts arbitrary byte chunks and returns every top-level element that
//! became complete, keeping any trailing partial element for the next call.
//! Only the subset of XML the protocol uses is understood: elements,
//! attributes, character data, entity references, CDATA, comments and
//! processing instructions.

use crate::error::{IndiError, Result};
use log::debug;

/// Nesting deeper than this is never produced by an INDI server
const MAX_DEPTH: usize = 16;

/// A single tag longer than this is treated as garbage
const MAX_TAG_LEN: usize = 64 * 1024;

const COMMENT_OPEN: &[u8] = b"<!--";
const CDATA_OPEN: &[u8] = b"<![CDATA[";

/// A fully parsed XML element
#[derive(Debug, Clone, PartialEq, Default)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlElement>,
    pub text: String,
}

impl XmlElement {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Look up an attribute value by name
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Look up an attribute that the protocol requires
    pub fn require(&self, key: &str) -> Result<&str> {
        self.attr(key).ok_or_else(|| {
            IndiError::protocol(
                format!("<{}> is missing required attribute '{}'", self.name, key),
                self.summary(),
            )
        })
    }

    /// The start tag with its attributes, for diagnostics
    pub fn summary(&self) -> String {
        let mut tag = format!("<{}", self.name);
        for (key, value) in &self.attributes {
            tag.push_str(&format!(" {}=\"{}\"", key, value));
        }
        tag.push('>');
        tag
    }
}

#[derive(Debug, Default)]
struct OpenElement {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<XmlElement>,
    text: Vec<u8>,
}

impl OpenElement {
    fn finish(self) -> XmlElement {
        XmlElement {
            name: self.name,
            attributes: self.attributes,
            children: self.children,
            text: String::from_utf8_lossy(&self.text).into_owned(),
        }
    }
}

enum Markup<'a> {
    Ignored,
    CharData(&'a [u8]),
    Open { tag: &'a [u8], self_closing: bool },
    Close(&'a [u8]),
}

/// Stateful parser turning a byte stream into top-level [`XmlElement`]s
#[derive(Debug, Default)]
pub struct StreamParser {
    buffer: Vec<u8>,
    stack: Vec<OpenElement>,
    /// The current top-level element hit an error and is dropped when it closes
    poisoned: bool,
    /// Structure was lost; stray closing tags are ignored until the next top-level element
    resyncing: bool,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a top-level element has started but not yet completed
    pub fn has_partial(&self) -> bool {
        !self.stack.is_empty() || !self.buffer.is_empty()
    }

    /// Bytes held back waiting for more input
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop all partial state, e.g. after reconnecting
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.stack.clear();
        self.poisoned = false;
        self.resyncing = false;
    }

    /// Append bytes and return every top-level element completed by them, in stream order.
    ///
    /// Malformed input is reported in place as `Err(IndiError::Protocol)`; the
    /// parser then resynchronizes and keeps going, so later elements are still
    /// returned.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<XmlElement>> {
        let mut out = Vec::new();
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.extend_from_slice(bytes);

        let mut pos = 0;
        while pos < buffer.len() {
            if buffer[pos] != b'<' {
                let end = buffer[pos..]
                    .iter()
                    .position(|&b| b == b'<')
                    .map_or(buffer.len(), |i| pos + i);
                let hold_back = end == buffer.len();
                let take = text_run_len(&buffer[pos..end], hold_back);
                if take == 0 {
                    break;
                }
                self.handle_text(&buffer[pos..pos + take], &mut out);
                pos += take;
                continue;
            }

            match scan_markup(&buffer[pos..]) {
                Some(len) => {
                    self.handle_markup(&buffer[pos..pos + len], &mut out);
                    pos += len;
                }
                None if buffer.len() - pos > MAX_TAG_LEN => {
                    out.push(Err(IndiError::protocol(
                        "unterminated tag",
                        &buffer[pos..pos + 64],
                    )));
                    self.discard_open_elements();
                    // Skip past this '<' and resynchronize at the next one
                    pos += 1;
                }
                None => break,
            }
        }

        buffer.drain(..pos);
        self.buffer = buffer;
        out
    }

    fn handle_text(&mut self, raw: &[u8], out: &mut Vec<Result<XmlElement>>) {
        match self.stack.last_mut() {
            Some(open) => {
                if !self.poisoned {
                    decode_entities(raw, &mut open.text);
                }
            }
            None => {
                if !self.resyncing && raw.iter().any(|b| !b.is_ascii_whitespace()) {
                    out.push(Err(IndiError::protocol(
                        "character data outside of any element",
                        raw,
                    )));
                }
            }
        }
    }

    fn handle_markup(&mut self, token: &[u8], out: &mut Vec<Result<XmlElement>>) {
        match classify(token) {
            Markup::Ignored => {}
            Markup::CharData(data) => match self.stack.last_mut() {
                Some(open) => {
                    if !self.poisoned {
                        open.text.extend_from_slice(data);
                    }
                }
                None => self.handle_text(data, out),
            },
            Markup::Open { tag, self_closing } => self.open_element(tag, self_closing, out),
            Markup::Close(name) => self.close_element(name, token, out),
        }
    }

    fn open_element(&mut self, tag: &[u8], self_closing: bool, out: &mut Vec<Result<XmlElement>>) {
        if self.stack.is_empty() {
            self.resyncing = false;
            self.poisoned = false;
        }

        if self.poisoned {
            if !self_closing {
                self.stack.push(OpenElement {
                    name: tag_name(tag),
                    ..Default::default()
                });
            }
            return;
        }

        let (name, attributes) = match parse_tag(tag) {
            Ok(parsed) => parsed,
            Err(e) => {
                out.push(Err(e));
                self.poison_or_resync(tag, self_closing);
                return;
            }
        };

        if self.stack.len() >= MAX_DEPTH {
            out.push(Err(IndiError::protocol("elements nested too deeply", tag)));
            self.poison_or_resync(tag, self_closing);
            return;
        }

        let open = OpenElement {
            name,
            attributes,
            ..Default::default()
        };

        if self_closing {
            self.complete(open.finish(), out);
        } else {
            self.stack.push(open);
        }
    }

    fn close_element(&mut self, name: &[u8], token: &[u8], out: &mut Vec<Result<XmlElement>>) {
        let name = String::from_utf8_lossy(name);
        let name = name.trim();

        let Some(open) = self.stack.pop() else {
            if !self.resyncing {
                out.push(Err(IndiError::protocol("unexpected closing tag", token)));
            }
            return;
        };

        if open.name != name {
            out.push(Err(IndiError::protocol(
                format!("mismatched closing tag, expected </{}>", open.name),
                token,
            )));
            self.discard_open_elements();
            return;
        }

        if self.poisoned {
            if self.stack.is_empty() {
                debug!("Dropped malformed <{}> element", open.name);
                self.poisoned = false;
            }
            return;
        }

        self.complete(open.finish(), out);
    }

    fn complete(&mut self, element: XmlElement, out: &mut Vec<Result<XmlElement>>) {
        match self.stack.last_mut() {
            Some(parent) => parent.children.push(element),
            None => out.push(Ok(element)),
        }
    }

    /// Drop the top-level element that contains a bad tag, keeping nesting in sync
    fn poison_or_resync(&mut self, tag: &[u8], self_closing: bool) {
        let name = tag_name(tag);
        if name.is_empty() {
            // Without a name the matching close tag cannot be found
            self.discard_open_elements();
            return;
        }
        if self_closing {
            self.poisoned = !self.stack.is_empty();
            return;
        }

        self.poisoned = true;
        self.stack.push(OpenElement {
            name,
            ..Default::default()
        });
    }

    fn discard_open_elements(&mut self) {
        self.stack.clear();
        self.poisoned = false;
        self.resyncing = true;
    }
}

/// How much of a text run can be consumed now.
///
/// A run that reaches the end of the buffer may end in the middle of an
/// entity reference, which is held back until more bytes arrive.
fn text_run_len(run: &[u8], at_buffer_end: bool) -> usize {
    if !at_buffer_end {
        return run.len();
    }
    match run.iter().rposition(|&b| b == b'&') {
        Some(amp) if !run[amp..].contains(&b';') && run.len() - amp < 12 => amp,
        _ => run.len(),
    }
}

/// Length of the markup token starting at `input[0] == b'<'`, or `None` if incomplete
fn scan_markup(input: &[u8]) -> Option<usize> {
    if input.starts_with(COMMENT_OPEN) {
        return find(&input[COMMENT_OPEN.len()..], b"-->").map(|i| COMMENT_OPEN.len() + i + 3);
    }
    if input.starts_with(CDATA_OPEN) {
        return find(&input[CDATA_OPEN.len()..], b"]]>").map(|i| CDATA_OPEN.len() + i + 3);
    }
    if input.len() < CDATA_OPEN.len()
        && (COMMENT_OPEN.starts_with(input) || CDATA_OPEN.starts_with(input))
    {
        return None;
    }
    if input.starts_with(b"<?") {
        return find(&input[2..], b"?>").map(|i| 2 + i + 2);
    }

    let mut quote = None;
    for (i, &b) in input.iter().enumerate().skip(1) {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None if b == b'>' => return Some(i + 1),
            None => {}
        }
    }
    None
}

fn classify(token: &[u8]) -> Markup<'_> {
    if token.starts_with(COMMENT_OPEN) || token.starts_with(b"<?") || token.starts_with(b"<!") {
        if token.starts_with(CDATA_OPEN) {
            return Markup::CharData(&token[CDATA_OPEN.len()..token.len() - 3]);
        }
        return Markup::Ignored;
    }
    if let Some(name) = token.strip_prefix(b"</") {
        return Markup::Close(&name[..name.len() - 1]);
    }

    let inner = &token[1..token.len() - 1];
    match inner.strip_suffix(b"/") {
        Some(tag) => Markup::Open {
            tag,
            self_closing: true,
        },
        None => Markup::Open {
            tag: inner,
            self_closing: false,
        },
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn tag_name(tag: &[u8]) -> String {
    let end = tag
        .iter()
        .position(|b| b.is_ascii_whitespace())
        .unwrap_or(tag.len());
    String::from_utf8_lossy(&tag[..end]).into_owned()
}

/// Split `name attr="v" ...` into the element name and its decoded attributes
fn parse_tag(tag: &[u8]) -> Result<(String, Vec<(String, String)>)> {
    let name = tag_name(tag);
    if name.is_empty() || name.contains(['<', '=', '"', '\'']) {
        return Err(IndiError::protocol("invalid element name", tag));
    }

    let mut attributes = Vec::new();
    let mut rest = &tag[name.len()..];
    loop {
        rest = trim_start(rest);
        if rest.is_empty() {
            break;
        }

        let key_end = rest
            .iter()
            .position(|&b| b == b'=' || b.is_ascii_whitespace())
            .ok_or_else(|| IndiError::protocol("attribute without value", tag))?;
        let key = String::from_utf8_lossy(&rest[..key_end]).into_owned();

        rest = trim_start(&rest[key_end..]);
        rest = rest
            .strip_prefix(b"=")
            .ok_or_else(|| IndiError::protocol(format!("expected '=' after '{}'", key), tag))?;
        rest = trim_start(rest);

        let quote = match rest.first() {
            Some(&q) if q == b'"' || q == b'\'' => q,
            _ => {
                return Err(IndiError::protocol(
                    format!("unquoted value for attribute '{}'", key),
                    tag,
                ))
            }
        };
        let value_end = rest[1..]
            .iter()
            .position(|&b| b == quote)
            .ok_or_else(|| IndiError::protocol("unterminated attribute value", tag))?;

        let mut value = Vec::with_capacity(value_end);
        decode_entities(&rest[1..1 + value_end], &mut value);
        if !attributes.iter().any(|(k, _)| *k == key) {
            attributes.push((key, String::from_utf8_lossy(&value).into_owned()));
        }

        rest = &rest[value_end + 2..];
    }

    Ok((name, attributes))
}

fn trim_start(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

/// Append `raw` to `out`, replacing XML entity references.
///
/// Unknown or malformed references are copied through unchanged.
fn decode_entities(raw: &[u8], out: &mut Vec<u8>) {
    if !raw.contains(&b'&') {
        out.extend_from_slice(raw);
        return;
    }

    let mut i = 0;
    while i < raw.len() {
        if raw[i] != b'&' {
            out.push(raw[i]);
            i += 1;
            continue;
        }

        let window = &raw[i + 1..raw.len().min(i + 12)];
        let decoded = window.iter().position(|&b| b == b';').and_then(|semi| {
            let entity = &window[..semi];
            let ch = match entity {
                b"lt" => Some('<'),
                b"gt" => Some('>'),
                b"amp" => Some('&'),
                b"quot" => Some('"'),
                b"apos" => Some('\''),
                _ => numeric_reference(entity),
            };
            ch.map(|c| (c, semi + 2))
        });

        match decoded {
            Some((ch, consumed)) => {
                let mut utf8 = [0u8; 4];
                out.extend_from_slice(ch.encode_utf8(&mut utf8).as_bytes());
                i += consumed;
            }
            None => {
                out.push(b'&');
                i += 1;
            }
        }
    }
}

fn numeric_reference(entity: &[u8]) -> Option<char> {
    let digits = entity.strip_prefix(b"#")?;
    let digits = std::str::from_utf8(digits).ok()?;
    let code = match digits.strip_prefix(['x', 'X']) {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => digits.parse().ok()?,
    };
    char::from_u32(code)
}
