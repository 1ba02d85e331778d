//! DBGp wire codec: inbound packet framing and outbound command formatting.
//!
//! Engine to proxy framing is `<decimal-length>\0<xml-payload>\0`; the
//! payload is one XML document per chunk. Proxy to engine commands are
//! `name( -key value)* -i <transaction>( --base64)?\0`.
//!
//! Chunks are parsed as delivered: a read that splits or coalesces packets
//! surfaces as a frame error on that connection. See `parse_chunk`.

use std::sync::atomic::{AtomicU64, Ordering};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use indexmap::IndexMap;
use quick_xml::events::Event as XmlEvent;
use quick_xml::Reader;
use regex::Regex;

use crate::{Error, Result};

/// Ordered command arguments as they will appear on the wire.
pub type CommandArgs = IndexMap<String, String>;

/// The reserved argument key carrying the transaction id.
pub const TRANSACTION_ARG: &str = "i";

static NEXT_TRANSACTION: AtomicU64 = AtomicU64::new(1);

/// Returns the next transaction id. Ids are process-wide, start at 1, and
/// are never reused within the process lifetime.
pub fn next_transaction_id() -> u64 {
    NEXT_TRANSACTION.fetch_add(1, Ordering::Relaxed)
}

/// One XML element of a packet payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    pub attributes: IndexMap<String, String>,
    pub children: Vec<Element>,
    pub text: Option<String>,
}

impl Element {
    fn new(name: String) -> Self {
        Self {
            name,
            attributes: IndexMap::new(),
            children: Vec::new(),
            text: None,
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|child| child.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |child| child.name == name)
    }

    /// JSON rendering for relay payloads: attributes under `@`, inline text
    /// under `#`, children grouped by tag name.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        if !self.attributes.is_empty() {
            let attrs: serde_json::Map<String, serde_json::Value> = self
                .attributes
                .iter()
                .map(|(key, value)| (key.clone(), serde_json::Value::String(value.clone())))
                .collect();
            map.insert("@".to_string(), serde_json::Value::Object(attrs));
        }
        if let Some(text) = &self.text {
            map.insert("#".to_string(), serde_json::Value::String(text.clone()));
        }
        for child in &self.children {
            let entry = map
                .entry(child.name.clone())
                .or_insert_with(|| serde_json::Value::Array(Vec::new()));
            if let serde_json::Value::Array(items) = entry {
                items.push(child.to_json());
            }
        }
        serde_json::Value::Object(map)
    }
}

/// An engine-reported error carried inside a packet.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineError {
    pub code: Option<String>,
    pub message: Option<String>,
}

/// A parsed protocol message. Immutable after parse.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    root: Element,
    error: Option<EngineError>,
}

impl Packet {
    pub fn name(&self) -> &str {
        &self.root.name
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.root.attribute(key)
    }

    pub fn attributes(&self) -> &IndexMap<String, String> {
        &self.root.attributes
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.root.child(name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.root.children_named(name)
    }

    pub fn text(&self) -> Option<&str> {
        self.root.text.as_deref()
    }

    pub fn error(&self) -> Option<&EngineError> {
        self.error.as_ref()
    }

    pub fn root(&self) -> &Element {
        &self.root
    }
}

/// Parses one framed chunk into a [`Packet`].
///
/// The chunk must be exactly `<length>\0<data>\0`, with the announced length
/// equal to the byte length of `<data>`. No buffering across chunks is
/// attempted; a partial packet fails here and terminates the connection it
/// arrived on.
pub fn parse_chunk(chunk: &[u8]) -> Result<Packet> {
    let parts: Vec<&[u8]> = chunk.split(|byte| *byte == 0).collect();
    if parts.len() != 3 || !parts[2].is_empty() {
        return Err(Error::frame(format!(
            "expected `length\\0data\\0`, got {} NUL-delimited parts",
            parts.len()
        )));
    }

    let announced: usize = std::str::from_utf8(parts[0])
        .ok()
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| Error::frame("length prefix is not a decimal number"))?;
    if announced != parts[1].len() {
        return Err(Error::frame(format!(
            "announced packet length {announced} does not match data length {}",
            parts[1].len()
        )));
    }

    let data = std::str::from_utf8(parts[1])
        .map_err(|_| Error::format("packet payload is not valid UTF-8"))?;
    let declaration = Regex::new(r"^\s*<\?xml\s")?;
    if !declaration.is_match(data) {
        return Err(Error::format("packet payload is not an XML document"));
    }

    let root = parse_document(data)?;
    let error = root.child("error").map(|element| EngineError {
        code: element.attribute("code").map(str::to_string),
        message: element
            .child("message")
            .and_then(|message| message.text.clone()),
    });
    Ok(Packet { root, error })
}

fn parse_document(xml: &str) -> Result<Element> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(start)) => {
                stack.push(element_from_start(&start)?);
            }
            Ok(XmlEvent::Empty(start)) => {
                let element = element_from_start(&start)?;
                attach(&mut stack, &mut root, element)?;
            }
            Ok(XmlEvent::End(_)) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| Error::format("unbalanced closing tag"))?;
                attach(&mut stack, &mut root, element)?;
            }
            Ok(XmlEvent::Text(text)) => {
                let unescaped = text
                    .unescape()
                    .map_err(|err| Error::format(format!("malformed XML text: {err}")))?;
                append_text(&mut stack, unescaped.trim());
            }
            Ok(XmlEvent::CData(cdata)) => {
                let raw = String::from_utf8_lossy(&cdata.into_inner()).into_owned();
                append_text(&mut stack, &raw);
            }
            Ok(XmlEvent::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(Error::format(format!("malformed XML payload: {err}"))),
        }
    }

    if !stack.is_empty() {
        return Err(Error::format("unclosed element in packet payload"));
    }
    root.ok_or_else(|| Error::format("packet payload contains no root element"))
}

fn element_from_start(start: &quick_xml::events::BytesStart<'_>) -> Result<Element> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut element = Element::new(name);
    for attribute in start.attributes() {
        let attribute =
            attribute.map_err(|err| Error::format(format!("malformed attribute: {err}")))?;
        let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
        let value = attribute
            .unescape_value()
            .map_err(|err| Error::format(format!("malformed attribute value: {err}")))?
            .into_owned();
        element.attributes.insert(key, value);
    }
    Ok(element)
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> Result<()> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(element);
        Ok(())
    } else if root.is_none() {
        *root = Some(element);
        Ok(())
    } else {
        Err(Error::format("packet payload has multiple root elements"))
    }
}

fn append_text(stack: &mut [Element], text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(parent) = stack.last_mut() {
        match &mut parent.text {
            Some(existing) => existing.push_str(text),
            None => parent.text = Some(text.to_string()),
        }
    }
}

/// Serializes a command for the engine, injecting the next transaction id as
/// the reserved `-i` argument. Returns the NUL-terminated frame and the id
/// assigned to it.
pub fn format_command(name: &str, args: &CommandArgs, data: Option<&[u8]>) -> (Bytes, u64) {
    let transaction = next_transaction_id();
    let mut wire = String::from(name);
    for (key, value) in args {
        if key == TRANSACTION_ARG {
            continue;
        }
        wire.push_str(" -");
        wire.push_str(key);
        wire.push(' ');
        wire.push_str(value);
    }
    wire.push_str(" -");
    wire.push_str(TRANSACTION_ARG);
    wire.push(' ');
    wire.push_str(&transaction.to_string());
    if let Some(data) = data {
        wire.push_str(" --");
        wire.push_str(&BASE64.encode(data));
    }
    wire.push('\0');
    (Bytes::from(wire.into_bytes()), transaction)
}

/// Recovers the text carried by a stream element, decoding base64 when the
/// element says so.
pub fn decode_stream_text(element: &Element) -> String {
    let raw = element.text.as_deref().unwrap_or("");
    if element.attribute("encoding") == Some("base64") {
        if let Ok(bytes) = BASE64.decode(raw.trim()) {
            if let Ok(text) = String::from_utf8(bytes) {
                return text;
            }
        }
    }
    raw.to_string()
}
