//! Routes decoded server messages into the property model and out to callers.

use crate::error::Result;
use crate::property::{ElementRef, PropertyModel, PropertyVector};
use crate::protocol::{InboundMessage, PropertyState, ServerMessage, VectorKind};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

/// Callback fired after a vector is defined or updated
pub type VectorCallback = Box<dyn FnMut(&PropertyVector) + Send>;

/// Callback fired for every server message, standalone or attached to a vector
pub type MessageCallback = Box<dyn FnMut(&ServerMessage) + Send>;

/// Something that happened while processing server traffic, for callers that poll
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum Event {
    Defined {
        device: String,
        name: String,
        kind: VectorKind,
    },
    Updated {
        device: String,
        name: String,
        state: PropertyState,
    },
    Deleted {
        device: String,
        name: Option<String>,
    },
    BlobReceived {
        device: String,
        vector: String,
        element: String,
        size: usize,
        format: String,
    },
    Message(ServerMessage),
    /// A server element that was skipped, with the reason
    Rejected { reason: String },
}

pub struct Dispatcher {
    vector_callbacks: HashMap<(String, String), Vec<VectorCallback>>,
    message_callbacks: Vec<MessageCallback>,
    events: VecDeque<Event>,
    capacity: usize,
    dropped: u64,
}

impl Dispatcher {
    pub fn new(capacity: usize) -> Self {
        Self {
            vector_callbacks: HashMap::new(),
            message_callbacks: Vec::new(),
            events: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    pub fn on_vector(&mut self, device: &str, vector: &str, callback: VectorCallback) {
        self.vector_callbacks
            .entry((device.to_string(), vector.to_string()))
            .or_default()
            .push(callback);
    }

    pub fn on_message(&mut self, callback: MessageCallback) {
        self.message_callbacks.push(callback);
    }

    /// Apply one message to the model, then notify callbacks and queue events.
    ///
    /// A `set` for an unknown vector returns the protocol error untouched;
    /// per-element problems inside a known vector are queued as
    /// [`Event::Rejected`] and logged, and do not fail the call.
    pub fn dispatch(&mut self, model: &mut PropertyModel, message: InboundMessage) -> Result<()> {
        match message {
            InboundMessage::Def(vector) => {
                let (device, name, kind) = (vector.device.clone(), vector.name.clone(), vector.kind());
                debug!("📥 def{}Vector {}.{}", kind, device, name);
                let attached = vector.message.clone().map(|text| ServerMessage {
                    device: Some(device.clone()),
                    timestamp: vector.timestamp,
                    message: text,
                });

                model.define(vector);
                self.push(Event::Defined {
                    device: device.clone(),
                    name: name.clone(),
                    kind,
                });
                if let Some(msg) = attached {
                    self.deliver_message(msg);
                }
                self.notify_vector(model, &device, &name);
            }
            InboundMessage::Set(set) => {
                let outcome = model.apply_set(&set)?;
                debug!(
                    "📥 set{}Vector {}.{} ({} elements)",
                    set.kind,
                    set.device,
                    set.name,
                    outcome.updated.len()
                );

                for problem in outcome.rejected {
                    warn!("⚠️ Skipped element: {}", problem);
                    self.push(Event::Rejected {
                        reason: problem.to_string(),
                    });
                }

                if let Some(vector) = model.get_vector(&set.device, &set.name) {
                    let state = vector.state;
                    let blobs: Vec<Event> = outcome
                        .blobs
                        .iter()
                        .filter_map(|element| match vector.element(element) {
                            Some(ElementRef::Blob(b)) => {
                                b.blob.as_ref().map(|blob| Event::BlobReceived {
                                    device: set.device.clone(),
                                    vector: set.name.clone(),
                                    element: element.clone(),
                                    size: blob.data.len(),
                                    format: blob.format.clone(),
                                })
                            }
                            _ => None,
                        })
                        .collect();

                    self.push(Event::Updated {
                        device: set.device.clone(),
                        name: set.name.clone(),
                        state,
                    });
                    for event in blobs {
                        self.push(event);
                    }
                }

                if let Some(text) = set.message {
                    self.deliver_message(ServerMessage {
                        device: Some(set.device.clone()),
                        timestamp: set.timestamp,
                        message: text,
                    });
                }
                self.notify_vector(model, &set.device, &set.name);
            }
            InboundMessage::Delete(delete) => {
                let removed = model.delete(&delete.device, delete.name.as_deref());
                match &delete.name {
                    Some(name) => debug!("🗑️ deleteProperty {}.{} (found: {})", delete.device, name, removed),
                    None => debug!("🗑️ deleteProperty {} (found: {})", delete.device, removed),
                }
                self.push(Event::Deleted {
                    device: delete.device.clone(),
                    name: delete.name,
                });
                if let Some(text) = delete.message {
                    self.deliver_message(ServerMessage {
                        device: Some(delete.device),
                        timestamp: delete.timestamp,
                        message: text,
                    });
                }
            }
            InboundMessage::Message(msg) => self.deliver_message(msg),
        }
        Ok(())
    }

    /// Record a skipped element that never reached the model
    pub fn reject(&mut self, reason: String) {
        self.push(Event::Rejected { reason });
    }

    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn drain_events(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    /// Events discarded because nobody drained the queue in time
    pub fn dropped_events(&self) -> u64 {
        self.dropped
    }

    fn deliver_message(&mut self, msg: ServerMessage) {
        match (&msg.device, &msg.timestamp) {
            (Some(device), Some(ts)) => info!("💬 [{}] {} {}", device, ts, msg.message),
            (Some(device), None) => info!("💬 [{}] {}", device, msg.message),
            (None, _) => info!("💬 {}", msg.message),
        }
        for callback in self.message_callbacks.iter_mut() {
            callback(&msg);
        }
        self.push(Event::Message(msg));
    }

    fn notify_vector(&mut self, model: &PropertyModel, device: &str, name: &str) {
        let Some(vector) = model.get_vector(device, name) else {
            return;
        };
        if let Some(callbacks) = self
            .vector_callbacks
            .get_mut(&(device.to_string(), name.to_string()))
        {
            for callback in callbacks.iter_mut() {
                callback(vector);
            }
        }
    }

    fn push(&mut self, event: Event) {
        if self.events.len() >= self.capacity {
            self.events.pop_front();
            self.dropped += 1;
            if self.dropped == 1 || self.dropped % 100 == 0 {
                warn!(
                    "⚠️ Event queue full ({} events), dropped {} so far",
                    self.capacity, self.dropped
                );
            }
        }
        self.events.push_back(event);
    }
}
