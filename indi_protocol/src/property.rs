//! In-memory mirror of the devices, vectors and elements a server has advertised.

use crate::blob;
use crate::error::{IndiError, Result};
use crate::protocol::{
    PropertyPerm, PropertyState, SetVector, SwitchRule, SwitchState, UpdateValue, VectorKind,
};
use chrono::NaiveDateTime;
use indexmap::IndexMap;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NumberElement {
    pub name: String,
    pub label: String,
    /// printf-style format as declared by the server, kept verbatim
    pub format: String,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextElement {
    pub name: String,
    pub label: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwitchElement {
    pub name: String,
    pub label: String,
    pub value: SwitchState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LightElement {
    pub name: String,
    pub label: String,
    pub value: PropertyState,
}

/// A decoded binary frame. Each BLOB update replaces the previous one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Blob {
    #[serde(skip)]
    pub data: Vec<u8>,
    /// Decoded byte count, always `data.len()`
    pub size: usize,
    pub format: String,
}

impl Blob {
    /// Format with any trailing `.z` compression marker removed, e.g. `.fits`
    pub fn plain_format(&self) -> &str {
        self.format.strip_suffix(".z").unwrap_or(&self.format)
    }

    pub fn is_compressed(&self) -> bool {
        self.format.ends_with(".z")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlobElement {
    pub name: String,
    pub label: String,
    /// `None` until the first frame arrives
    pub blob: Option<Blob>,
}

/// Elements of a vector, one variant per kind
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "elements")]
pub enum Elements {
    Number(Vec<NumberElement>),
    Text(Vec<TextElement>),
    Switch(Vec<SwitchElement>),
    Light(Vec<LightElement>),
    #[serde(rename = "BLOB")]
    Blob(Vec<BlobElement>),
}

impl Elements {
    pub fn kind(&self) -> VectorKind {
        match self {
            Elements::Number(_) => VectorKind::Number,
            Elements::Text(_) => VectorKind::Text,
            Elements::Switch(_) => VectorKind::Switch,
            Elements::Light(_) => VectorKind::Light,
            Elements::Blob(_) => VectorKind::Blob,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Elements::Number(e) => e.len(),
            Elements::Text(e) => e.len(),
            Elements::Switch(e) => e.len(),
            Elements::Light(e) => e.len(),
            Elements::Blob(e) => e.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Borrowed view of a single element, whatever its kind
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ElementRef<'a> {
    Number(&'a NumberElement),
    Text(&'a TextElement),
    Switch(&'a SwitchElement),
    Light(&'a LightElement),
    Blob(&'a BlobElement),
}

impl<'a> ElementRef<'a> {
    pub fn name(&self) -> &'a str {
        match self {
            ElementRef::Number(e) => &e.name,
            ElementRef::Text(e) => &e.name,
            ElementRef::Switch(e) => &e.name,
            ElementRef::Light(e) => &e.name,
            ElementRef::Blob(e) => &e.name,
        }
    }

    pub fn label(&self) -> &'a str {
        match self {
            ElementRef::Number(e) => &e.label,
            ElementRef::Text(e) => &e.label,
            ElementRef::Switch(e) => &e.label,
            ElementRef::Light(e) => &e.label,
            ElementRef::Blob(e) => &e.label,
        }
    }

    /// Value rendered as text, as the CLI prints it
    pub fn display_value(&self) -> String {
        match self {
            ElementRef::Number(e) => e.value.to_string(),
            ElementRef::Text(e) => e.value.clone(),
            ElementRef::Switch(e) => e.value.to_string(),
            ElementRef::Light(e) => e.value.to_string(),
            ElementRef::Blob(e) => match &e.blob {
                Some(blob) => format!("<{} bytes, {}>", blob.data.len(), blob.format),
                None => "<empty>".to_string(),
            },
        }
    }
}

/// One named, typed property of a device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyVector {
    pub device: String,
    pub name: String,
    pub label: String,
    pub group: String,
    pub state: PropertyState,
    pub perm: PropertyPerm,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<SwitchRule>,
    pub timeout: f64,
    pub timestamp: Option<NaiveDateTime>,
    pub message: Option<String>,
    #[serde(flatten)]
    pub elements: Elements,
    /// Model-wide counter value at the last def or set of this vector
    #[serde(skip)]
    pub(crate) revision: u64,
}

impl PropertyVector {
    pub fn kind(&self) -> VectorKind {
        self.elements.kind()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_writable(&self) -> bool {
        self.kind() != VectorKind::Light && self.perm.is_writable()
    }

    pub fn element(&self, name: &str) -> Option<ElementRef<'_>> {
        match &self.elements {
            Elements::Number(e) => e.iter().find(|x| x.name == name).map(ElementRef::Number),
            Elements::Text(e) => e.iter().find(|x| x.name == name).map(ElementRef::Text),
            Elements::Switch(e) => e.iter().find(|x| x.name == name).map(ElementRef::Switch),
            Elements::Light(e) => e.iter().find(|x| x.name == name).map(ElementRef::Light),
            Elements::Blob(e) => e.iter().find(|x| x.name == name).map(ElementRef::Blob),
        }
    }

    pub fn has_element(&self, name: &str) -> bool {
        self.element(name).is_some()
    }

    /// Element names in server-declared order
    pub fn element_names(&self) -> Vec<&str> {
        self.iter_elements().map(|e| e.name()).collect()
    }

    pub fn iter_elements(&self) -> impl Iterator<Item = ElementRef<'_>> {
        let refs: Vec<ElementRef<'_>> = match &self.elements {
            Elements::Number(e) => e.iter().map(ElementRef::Number).collect(),
            Elements::Text(e) => e.iter().map(ElementRef::Text).collect(),
            Elements::Switch(e) => e.iter().map(ElementRef::Switch).collect(),
            Elements::Light(e) => e.iter().map(ElementRef::Light).collect(),
            Elements::Blob(e) => e.iter().map(ElementRef::Blob).collect(),
        };
        refs.into_iter()
    }

    /// Find an element by label, falling back to its name
    pub fn find_by_label(&self, label: &str) -> Option<ElementRef<'_>> {
        self.iter_elements()
            .find(|e| e.label() == label)
            .or_else(|| self.element(label))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub name: String,
    /// Vectors keyed by name, in discovery order
    pub vectors: IndexMap<String, PropertyVector>,
}

impl Device {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            vectors: IndexMap::new(),
        }
    }

    pub fn vector(&self, name: &str) -> Option<&PropertyVector> {
        self.vectors.get(name)
    }
}

/// What a successful `set` changed
#[derive(Debug, Default)]
pub struct UpdateOutcome {
    /// Elements whose value was replaced, in message order
    pub updated: Vec<String>,
    /// BLOB elements that received a new frame
    pub blobs: Vec<String>,
    /// Per-element problems; the rest of the update still applied
    pub rejected: Vec<IndiError>,
}

/// Devices keyed by name, in discovery order
#[derive(Debug, Default)]
pub struct PropertyModel {
    devices: IndexMap<String, Device>,
    revision: u64,
}

impl PropertyModel {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    /// Current model-wide revision; strictly increases on every def or set
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Install or wholesale replace a vector, creating its device if needed
    pub fn define(&mut self, mut vector: PropertyVector) {
        vector.revision = self.next_revision();
        let device = self
            .devices
            .entry(vector.device.clone())
            .or_insert_with(|| Device::new(&vector.device));
        device.vectors.insert(vector.name.clone(), vector);
    }

    /// Apply a `set*Vector` in place.
    ///
    /// An unknown vector or a kind mismatch is an error and leaves the model
    /// untouched. Problems with individual elements are collected in
    /// [`UpdateOutcome::rejected`]; the offending element keeps its previous
    /// value while state and the remaining elements still apply.
    pub fn apply_set(&mut self, set: &SetVector) -> Result<UpdateOutcome> {
        let revision = self.revision + 1;
        let vector = self
            .devices
            .get_mut(&set.device)
            .and_then(|d| d.vectors.get_mut(&set.name))
            .ok_or_else(|| {
                IndiError::protocol(
                    format!("set for undefined vector {}.{}", set.device, set.name),
                    set.kind.vector_tag("set"),
                )
            })?;

        if vector.kind() != set.kind {
            return Err(IndiError::protocol(
                format!(
                    "{}.{} is a {} vector but received a {} update",
                    set.device,
                    set.name,
                    vector.kind(),
                    set.kind
                ),
                set.kind.vector_tag("set"),
            ));
        }

        let mut outcome = UpdateOutcome::default();
        for update in &set.updates {
            match apply_element(&mut vector.elements, &update.name, &update.value) {
                Ok(true) => {
                    if matches!(update.value, UpdateValue::Blob(_)) {
                        outcome.blobs.push(update.name.clone());
                    }
                    outcome.updated.push(update.name.clone());
                }
                Ok(false) => outcome.rejected.push(IndiError::protocol(
                    format!(
                        "{}.{} has no element '{}'",
                        set.device, set.name, update.name
                    ),
                    set.kind.one_element_tag(),
                )),
                Err(e) => outcome.rejected.push(e),
            }
        }

        if let Some(state) = set.state {
            vector.state = state;
        }
        if let Some(timeout) = set.timeout {
            vector.timeout = timeout;
        }
        if set.timestamp.is_some() {
            vector.timestamp = set.timestamp;
        }
        if set.message.is_some() {
            vector.message = set.message.clone();
        }
        vector.revision = revision;
        self.revision = revision;

        Ok(outcome)
    }

    /// Remove one vector, or the whole device when `name` is `None`.
    /// Returns whether anything was removed.
    pub fn delete(&mut self, device: &str, name: Option<&str>) -> bool {
        match name {
            None => self.devices.shift_remove(device).is_some(),
            Some(name) => match self.devices.get_mut(device) {
                Some(d) => d.vectors.shift_remove(name).is_some(),
                None => false,
            },
        }
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn device(&self, name: &str) -> Option<&Device> {
        self.devices.get(name)
    }

    pub fn get_vector(&self, device: &str, name: &str) -> Option<&PropertyVector> {
        self.devices.get(device)?.vectors.get(name)
    }

    pub fn get_element(&self, device: &str, vector: &str, element: &str) -> Option<ElementRef<'_>> {
        self.get_vector(device, vector)?.element(element)
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Returns `Ok(false)` when no element of that name exists
fn apply_element(elements: &mut Elements, name: &str, value: &UpdateValue) -> Result<bool> {
    match (elements, value) {
        (Elements::Number(items), UpdateValue::Number(v)) => {
            Ok(update_named(items, |e| e.name == name, |e| e.value = *v))
        }
        (Elements::Text(items), UpdateValue::Text(v)) => {
            Ok(update_named(items, |e| e.name == name, |e| e.value = v.clone()))
        }
        (Elements::Switch(items), UpdateValue::Switch(v)) => {
            Ok(update_named(items, |e| e.name == name, |e| e.value = *v))
        }
        (Elements::Light(items), UpdateValue::Light(v)) => {
            Ok(update_named(items, |e| e.name == name, |e| e.value = *v))
        }
        (Elements::Blob(items), UpdateValue::Blob(payload)) => {
            let Some(element) = items.iter_mut().find(|e| e.name == name) else {
                return Ok(false);
            };
            // Decode before touching the element so a bad frame keeps the old one
            let data = blob::decode(payload)?;
            element.blob = Some(Blob {
                size: data.len(),
                format: payload.format.clone(),
                data,
            });
            Ok(true)
        }
        (elements, _) => Err(IndiError::protocol(
            format!("value for '{}' does not match {} vector", name, elements.kind()),
            name,
        )),
    }
}

fn update_named<E>(items: &mut [E], matches: impl Fn(&E) -> bool, apply: impl FnOnce(&mut E)) -> bool {
    match items.iter_mut().find(|e| matches(e)) {
        Some(element) => {
            apply(element);
            true
        }
        None => false,
    }
}
