//! INDI wire vocabulary: typed messages decoded from and encoded to XML.

use crate::blob;
use crate::error::{IndiError, Result};
use crate::parser::XmlElement;
use crate::property::{
    BlobElement, Elements, LightElement, NumberElement, PropertyVector, SwitchElement, TextElement,
};
use chrono::NaiveDateTime;
use serde::Serialize;
use std::borrow::Cow;
use std::str::FromStr;
use strum::{Display, EnumString};

/// INDI protocol version announced in `getProperties`
pub const INDI_PROTOCOL_VERSION: &str = "1.7";

/// Server-reported status of a vector (also the value of a light element)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, Serialize)]
pub enum PropertyState {
    Idle,
    Ok,
    Busy,
    Alert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, Serialize)]
pub enum PropertyPerm {
    #[strum(serialize = "ro")]
    #[serde(rename = "ro")]
    ReadOnly,
    #[strum(serialize = "wo")]
    #[serde(rename = "wo")]
    WriteOnly,
    #[strum(serialize = "rw")]
    #[serde(rename = "rw")]
    ReadWrite,
}

impl PropertyPerm {
    pub fn is_writable(&self) -> bool {
        matches!(self, PropertyPerm::WriteOnly | PropertyPerm::ReadWrite)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, Serialize)]
pub enum SwitchState {
    On,
    Off,
}

impl From<bool> for SwitchState {
    fn from(on: bool) -> Self {
        if on {
            SwitchState::On
        } else {
            SwitchState::Off
        }
    }
}

/// How many switches of a vector may be `On` at once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, Serialize)]
pub enum SwitchRule {
    OneOfMany,
    AtMostOne,
    AnyOfMany,
}

/// Whether the server should interleave BLOBs with regular traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, Serialize)]
pub enum BlobMode {
    Never,
    Also,
    Only,
}

/// The five vector kinds; the name is what appears in tag names such as `defBLOBVector`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, Serialize)]
pub enum VectorKind {
    Number,
    Text,
    Switch,
    Light,
    #[strum(serialize = "BLOB")]
    #[serde(rename = "BLOB")]
    Blob,
}

impl VectorKind {
    /// Child tag used inside `def*Vector`, e.g. `defNumber`
    pub fn def_element_tag(&self) -> String {
        format!("def{}", self)
    }

    /// Child tag used inside `set*Vector` and `new*Vector`, e.g. `oneNumber`
    pub fn one_element_tag(&self) -> String {
        format!("one{}", self)
    }

    pub fn vector_tag(&self, verb: &str) -> String {
        format!("{}{}Vector", verb, self)
    }
}

/// A human-readable status line from the server
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerMessage {
    pub device: Option<String>,
    pub timestamp: Option<NaiveDateTime>,
    pub message: String,
}

/// Base64 BLOB body as received, before decoding
#[derive(Debug, Clone, PartialEq)]
pub struct BlobPayload {
    /// Decoded byte count announced by the server
    pub size: usize,
    /// Length of the transmitted (possibly compressed) payload, when announced
    pub len: Option<usize>,
    pub format: String,
    pub encoded: String,
}

/// New value for one element carried by a `set*Vector`
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateValue {
    Number(f64),
    Text(String),
    Switch(SwitchState),
    Light(PropertyState),
    Blob(BlobPayload),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElementUpdate {
    pub name: String,
    pub value: UpdateValue,
}

/// A `set*Vector`: new state plus values for some (often not all) elements
#[derive(Debug, Clone, PartialEq)]
pub struct SetVector {
    pub kind: VectorKind,
    pub device: String,
    pub name: String,
    pub state: Option<PropertyState>,
    pub timeout: Option<f64>,
    pub timestamp: Option<NaiveDateTime>,
    pub message: Option<String>,
    pub updates: Vec<ElementUpdate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteProperty {
    pub device: String,
    /// `None` removes the whole device
    pub name: Option<String>,
    pub timestamp: Option<NaiveDateTime>,
    pub message: Option<String>,
}

/// Server → client messages
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Def(PropertyVector),
    Set(SetVector),
    Delete(DeleteProperty),
    Message(ServerMessage),
}

impl InboundMessage {
    /// Decode one top-level element.
    ///
    /// Returns `Ok(None)` for client-side elements (`getProperties`,
    /// `new*Vector`, `enableBLOB`) that some servers echo back.
    pub fn from_element(element: XmlElement) -> Result<Option<Self>> {
        match element.name.as_str() {
            "message" => return decode_message(&element).map(|m| Some(InboundMessage::Message(m))),
            "deleteProperty" | "delProperty" => {
                return decode_delete(&element).map(|d| Some(InboundMessage::Delete(d)))
            }
            "getProperties" | "enableBLOB" => return Ok(None),
            _ => {}
        }

        match split_vector_tag(&element.name) {
            Some(("def", kind)) => decode_def(kind, element).map(|v| Some(InboundMessage::Def(v))),
            Some(("set", kind)) => decode_set(kind, element).map(|s| Some(InboundMessage::Set(s))),
            Some(("new", _)) => Ok(None),
            _ => Err(IndiError::protocol(
                format!("unknown element <{}>", element.name),
                element.summary(),
            )),
        }
    }

    /// Device the message concerns, if any
    pub fn device(&self) -> Option<&str> {
        match self {
            InboundMessage::Def(v) => Some(&v.device),
            InboundMessage::Set(s) => Some(&s.device),
            InboundMessage::Delete(d) => Some(&d.device),
            InboundMessage::Message(m) => m.device.as_deref(),
        }
    }
}

/// Value for one element of a `new*Vector` command
#[derive(Debug, Clone, PartialEq)]
pub enum ElementValue {
    Number(f64),
    Text(String),
    Switch(SwitchState),
    Blob { data: Vec<u8>, format: String },
}

impl ElementValue {
    pub fn kind(&self) -> VectorKind {
        match self {
            ElementValue::Number(_) => VectorKind::Number,
            ElementValue::Text(_) => VectorKind::Text,
            ElementValue::Switch(_) => VectorKind::Switch,
            ElementValue::Blob { .. } => VectorKind::Blob,
        }
    }
}

impl From<f64> for ElementValue {
    fn from(value: f64) -> Self {
        ElementValue::Number(value)
    }
}

impl From<&str> for ElementValue {
    fn from(value: &str) -> Self {
        ElementValue::Text(value.to_string())
    }
}

impl From<String> for ElementValue {
    fn from(value: String) -> Self {
        ElementValue::Text(value)
    }
}

impl From<SwitchState> for ElementValue {
    fn from(value: SwitchState) -> Self {
        ElementValue::Switch(value)
    }
}

/// A `new*Vector` command
#[derive(Debug, Clone, PartialEq)]
pub struct NewVector {
    pub kind: VectorKind,
    pub device: String,
    pub name: String,
    pub elements: Vec<(String, ElementValue)>,
}

/// Client → server messages
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    GetProperties {
        device: Option<String>,
        name: Option<String>,
    },
    EnableBlob {
        device: String,
        name: Option<String>,
        mode: BlobMode,
    },
    NewVector(NewVector),
}

impl OutboundMessage {
    /// Serialize to the XML text sent on the wire
    pub fn to_xml(&self) -> String {
        match self {
            OutboundMessage::GetProperties { device, name } => {
                let mut xml = format!("<getProperties version=\"{}\"", INDI_PROTOCOL_VERSION);
                if let Some(device) = device {
                    xml.push_str(&format!(" device=\"{}\"", escape(device)));
                }
                if let Some(name) = name {
                    xml.push_str(&format!(" name=\"{}\"", escape(name)));
                }
                xml.push_str("/>\n");
                xml
            }
            OutboundMessage::EnableBlob { device, name, mode } => {
                let mut xml = format!("<enableBLOB device=\"{}\"", escape(device));
                if let Some(name) = name {
                    xml.push_str(&format!(" name=\"{}\"", escape(name)));
                }
                xml.push_str(&format!(">{}</enableBLOB>\n", mode));
                xml
            }
            OutboundMessage::NewVector(command) => {
                let tag = command.kind.vector_tag("new");
                let one = command.kind.one_element_tag();
                let mut xml = format!(
                    "<{} device=\"{}\" name=\"{}\">\n",
                    tag,
                    escape(&command.device),
                    escape(&command.name)
                );
                for (name, value) in &command.elements {
                    match value {
                        ElementValue::Number(v) => xml.push_str(&format!(
                            "  <{} name=\"{}\">{}</{}>\n",
                            one,
                            escape(name),
                            v,
                            one
                        )),
                        ElementValue::Text(v) => xml.push_str(&format!(
                            "  <{} name=\"{}\">{}</{}>\n",
                            one,
                            escape(name),
                            escape(v),
                            one
                        )),
                        ElementValue::Switch(v) => xml.push_str(&format!(
                            "  <{} name=\"{}\">{}</{}>\n",
                            one,
                            escape(name),
                            v,
                            one
                        )),
                        ElementValue::Blob { data, format } => xml.push_str(&format!(
                            "  <{} name=\"{}\" size=\"{}\" format=\"{}\">{}</{}>\n",
                            one,
                            escape(name),
                            data.len(),
                            escape(format),
                            blob::encode(data),
                            one
                        )),
                    }
                }
                xml.push_str(&format!("</{}>\n", tag));
                xml
            }
        }
    }
}

/// Parse an INDI number, accepting plain decimals and sexagesimal `D:M:S` forms.
///
/// Sexagesimal fields may be separated by `:`, `;` or spaces, e.g.
/// `"-12:30:15"` or `"12 30"`.
pub fn parse_number(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(value) = text.parse::<f64>() {
        return Some(value);
    }

    let (negative, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };

    let mut value = 0.0;
    let mut scale = 1.0;
    let mut fields = 0;
    for field in body.split([':', ';', ' ']).filter(|f| !f.is_empty()) {
        let part: f64 = field.parse().ok()?;
        if part < 0.0 || fields == 3 {
            return None;
        }
        value += part / scale;
        scale *= 60.0;
        fields += 1;
    }

    if fields == 0 {
        return None;
    }
    Some(if negative { -value } else { value })
}

/// Parse an INDI timestamp (`YYYY-MM-DDTHH:MM:SS[.fff]`, UTC)
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim().trim_end_matches('Z');
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S"))
        .ok()
}

/// Escape text for use in XML attribute values and character data
pub fn escape(text: &str) -> Cow<'_, str> {
    if !text.contains(['<', '>', '&', '"', '\'']) {
        return Cow::Borrowed(text);
    }

    let mut escaped = String::with_capacity(text.len() + 8);
    for ch in text.chars() {
        match ch {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(ch),
        }
    }
    Cow::Owned(escaped)
}

/// Split `defNumberVector` into `("def", Number)`
fn split_vector_tag(tag: &str) -> Option<(&str, VectorKind)> {
    let body = tag.strip_suffix("Vector")?;
    let verb = ["def", "set", "new"]
        .into_iter()
        .find(|verb| body.starts_with(verb))?;
    let kind = body[verb.len()..].parse().ok()?;
    Some((verb, kind))
}

fn parse_enum<E: FromStr>(element: &XmlElement, key: &str) -> Result<Option<E>> {
    element
        .attr(key)
        .map(|value| {
            value.trim().parse::<E>().map_err(|_| {
                IndiError::protocol(
                    format!("invalid {} '{}' on <{}>", key, value, element.name),
                    element.summary(),
                )
            })
        })
        .transpose()
}

fn parse_number_attr(element: &XmlElement, key: &str) -> Result<Option<f64>> {
    element
        .attr(key)
        .map(|value| {
            parse_number(value).ok_or_else(|| {
                IndiError::protocol(
                    format!("invalid number '{}' for {} on <{}>", value, key, element.name),
                    element.summary(),
                )
            })
        })
        .transpose()
}

fn parse_text_value<E: FromStr>(element: &XmlElement) -> Result<E> {
    element.text.trim().parse::<E>().map_err(|_| {
        IndiError::protocol(
            format!("invalid value '{}' in <{}>", element.text.trim(), element.name),
            element.summary(),
        )
    })
}

fn timestamp_attr(element: &XmlElement) -> Option<NaiveDateTime> {
    let raw = element.attr("timestamp")?;
    let parsed = parse_timestamp(raw);
    if parsed.is_none() {
        log::debug!("Ignoring unparseable timestamp '{}' on <{}>", raw, element.name);
    }
    parsed
}

fn decode_message(element: &XmlElement) -> Result<ServerMessage> {
    Ok(ServerMessage {
        device: element.attr("device").map(str::to_string),
        timestamp: timestamp_attr(element),
        message: element.attr("message").unwrap_or_default().to_string(),
    })
}

fn decode_delete(element: &XmlElement) -> Result<DeleteProperty> {
    Ok(DeleteProperty {
        device: element.require("device")?.to_string(),
        name: element
            .attr("name")
            .filter(|n| !n.is_empty())
            .map(str::to_string),
        timestamp: timestamp_attr(element),
        message: element.attr("message").map(str::to_string),
    })
}

fn decode_def(kind: VectorKind, element: XmlElement) -> Result<PropertyVector> {
    let device = element.require("device")?.to_string();
    let name = element.require("name")?.to_string();
    let state = parse_enum::<PropertyState>(&element, "state")?.ok_or_else(|| {
        IndiError::protocol(
            format!("<{}> is missing required attribute 'state'", element.name),
            element.summary(),
        )
    })?;

    // Lights are status indicators and never writable
    let perm = match kind {
        VectorKind::Light => PropertyPerm::ReadOnly,
        _ => parse_enum::<PropertyPerm>(&element, "perm")?.ok_or_else(|| {
            IndiError::protocol(
                format!("<{}> is missing required attribute 'perm'", element.name),
                element.summary(),
            )
        })?,
    };

    let rule = match kind {
        VectorKind::Switch => {
            Some(parse_enum::<SwitchRule>(&element, "rule")?.unwrap_or(SwitchRule::AnyOfMany))
        }
        _ => None,
    };

    let child_tag = kind.def_element_tag();
    let mut seen = Vec::with_capacity(element.children.len());
    for child in &element.children {
        if child.name != child_tag {
            return Err(IndiError::protocol(
                format!("unexpected <{}> inside <{}>", child.name, element.name),
                child.summary(),
            ));
        }
        let child_name = child.require("name")?;
        if seen.contains(&child_name) {
            return Err(IndiError::protocol(
                format!("duplicate element '{}' in {}.{}", child_name, device, name),
                child.summary(),
            ));
        }
        seen.push(child_name);
    }

    let elements = match kind {
        VectorKind::Number => Elements::Number(
            element
                .children
                .iter()
                .map(decode_def_number)
                .collect::<Result<_>>()?,
        ),
        VectorKind::Text => Elements::Text(
            element
                .children
                .iter()
                .map(|child| TextElement {
                    name: element_name(child),
                    label: element_label(child),
                    value: text_content(&child.text),
                })
                .collect(),
        ),
        VectorKind::Switch => Elements::Switch(
            element
                .children
                .iter()
                .map(|child| {
                    Ok(SwitchElement {
                        name: element_name(child),
                        label: element_label(child),
                        value: parse_text_value(child)?,
                    })
                })
                .collect::<Result<_>>()?,
        ),
        VectorKind::Light => Elements::Light(
            element
                .children
                .iter()
                .map(|child| {
                    Ok(LightElement {
                        name: element_name(child),
                        label: element_label(child),
                        value: parse_text_value(child)?,
                    })
                })
                .collect::<Result<_>>()?,
        ),
        VectorKind::Blob => Elements::Blob(
            element
                .children
                .iter()
                .map(|child| BlobElement {
                    name: element_name(child),
                    label: element_label(child),
                    blob: None,
                })
                .collect(),
        ),
    };

    Ok(PropertyVector {
        label: element.attr("label").unwrap_or(&name).to_string(),
        group: element.attr("group").unwrap_or_default().to_string(),
        state,
        perm,
        rule,
        timeout: parse_number_attr(&element, "timeout")?.unwrap_or(0.0),
        timestamp: timestamp_attr(&element),
        message: element.attr("message").map(str::to_string),
        revision: 0,
        device,
        name,
        elements,
    })
}

fn element_name(child: &XmlElement) -> String {
    child.attr("name").unwrap_or_default().to_string()
}

/// Text value without the line breaks and indentation that pretty-printing
/// puts around it. Whitespace on the same line as the value is kept.
fn text_content(raw: &str) -> String {
    let mut value = raw;
    let start = value.trim_start();
    if value[..value.len() - start.len()].contains('\n') {
        value = start;
    }
    let end = value.trim_end();
    if value[end.len()..].contains('\n') {
        value = end;
    }
    value.to_string()
}

fn element_label(child: &XmlElement) -> String {
    child
        .attr("label")
        .or_else(|| child.attr("name"))
        .unwrap_or_default()
        .to_string()
}

fn decode_def_number(child: &XmlElement) -> Result<NumberElement> {
    let value = parse_number(&child.text).ok_or_else(|| {
        IndiError::protocol(
            format!("invalid number '{}' in <{}>", child.text.trim(), child.name),
            child.summary(),
        )
    })?;

    Ok(NumberElement {
        name: element_name(child),
        label: element_label(child),
        format: child.attr("format").unwrap_or("%g").to_string(),
        min: parse_number_attr(child, "min")?.unwrap_or(0.0),
        max: parse_number_attr(child, "max")?.unwrap_or(0.0),
        step: parse_number_attr(child, "step")?.unwrap_or(0.0),
        value,
    })
}

fn decode_set(kind: VectorKind, element: XmlElement) -> Result<SetVector> {
    let device = element.require("device")?.to_string();
    let name = element.require("name")?.to_string();
    let state = parse_enum::<PropertyState>(&element, "state")?;
    let timeout = parse_number_attr(&element, "timeout")?;
    let timestamp = timestamp_attr(&element);
    let message = element.attr("message").map(str::to_string);
    let summary = element.summary();

    let child_tag = kind.one_element_tag();
    let mut updates = Vec::with_capacity(element.children.len());
    for child in element.children {
        if child.name != child_tag {
            return Err(IndiError::protocol(
                format!("unexpected <{}> inside {}", child.name, summary),
                child.summary(),
            ));
        }
        let child_name = child.require("name")?.to_string();

        let value = match kind {
            VectorKind::Number => {
                UpdateValue::Number(parse_number(&child.text).ok_or_else(|| {
                    IndiError::protocol(
                        format!("invalid number '{}' for {}", child.text.trim(), child_name),
                        child.summary(),
                    )
                })?)
            }
            VectorKind::Text => UpdateValue::Text(text_content(&child.text)),
            VectorKind::Switch => UpdateValue::Switch(parse_text_value(&child)?),
            VectorKind::Light => UpdateValue::Light(parse_text_value(&child)?),
            VectorKind::Blob => {
                let size = parse_number_attr(&child, "size")?.ok_or_else(|| {
                    IndiError::protocol(
                        format!("<oneBLOB name=\"{}\"> is missing 'size'", child_name),
                        child.summary(),
                    )
                })?;
                let len = parse_number_attr(&child, "len")?;
                let format = child.attr("format").unwrap_or_default().to_string();
                UpdateValue::Blob(BlobPayload {
                    size: size.max(0.0) as usize,
                    len: len.map(|l| l.max(0.0) as usize),
                    format,
                    encoded: child.text,
                })
            }
        };

        updates.push(ElementUpdate {
            name: child_name,
            value,
        });
    }

    Ok(SetVector {
        kind,
        device,
        name,
        state,
        timeout,
        timestamp,
        message,
        updates,
    })
}
