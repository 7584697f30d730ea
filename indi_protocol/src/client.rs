use crate::config::ClientConfig;
use crate::dispatch::{Dispatcher, Event, MessageCallback, VectorCallback};
use crate::error::{IndiError, Result};
use crate::parser::{StreamParser, XmlElement};
use crate::property::{Blob, Device, ElementRef, Elements, PropertyModel, PropertyVector};
use crate::protocol::{
    BlobMode, ElementValue, InboundMessage, NewVector, OutboundMessage, PropertyState,
    SwitchRule, SwitchState, VectorKind,
};
use crate::transport::{TcpTransport, Transport};
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Longest single read while waiting inside `wait_for`
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// High-level INDI client: one connection, one property mirror.
///
/// Nothing happens in the background. Server traffic is only read and applied
/// inside [`IndiClient::process_events`] (directly, through the wait helpers,
/// or from an opt-in [`crate::poller::Poller`]).
pub struct IndiClient<T: Transport = TcpTransport> {
    transport: T,
    parser: StreamParser,
    model: PropertyModel,
    dispatcher: Dispatcher,
    config: ClientConfig,
    /// Devices we already sent `enableBLOB` for
    blob_enabled: HashSet<String>,
    /// Vector revision observed when the last command was sent to it
    pending: HashMap<(String, String), u64>,
}

impl IndiClient<TcpTransport> {
    /// Connect with default settings
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        Self::connect_with_config(ClientConfig::new(host, port))
    }

    pub fn connect_with_config(config: ClientConfig) -> Result<Self> {
        let transport = TcpTransport::connect(
            &config.host,
            config.port,
            config.connect_timeout,
            config.write_timeout,
        )?;
        Ok(Self::with_transport(transport, config))
    }

    /// Open a fresh session to the same server.
    ///
    /// The property mirror is cleared since the server will define everything
    /// again; callers must re-issue `get_properties`.
    pub fn reconnect(&mut self) -> Result<()> {
        info!("🔄 Reconnecting to INDI server at {}", self.config.address());
        self.transport.close();
        self.transport = TcpTransport::connect(
            &self.config.host,
            self.config.port,
            self.config.connect_timeout,
            self.config.write_timeout,
        )?;
        self.parser.reset();
        self.model = PropertyModel::new();
        self.blob_enabled.clear();
        self.pending.clear();
        info!("✅ Reconnected to INDI server");
        Ok(())
    }
}

impl<T: Transport> IndiClient<T> {
    /// Wrap an already-open transport
    pub fn with_transport(transport: T, config: ClientConfig) -> Self {
        Self {
            transport,
            parser: StreamParser::new(),
            model: PropertyModel::new(),
            dispatcher: Dispatcher::new(config.event_queue_capacity),
            config,
            blob_enabled: HashSet::new(),
            pending: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_open()
    }

    /// Close the connection. The property mirror stays as last observed.
    pub fn disconnect(&mut self) {
        self.transport.close();
    }

    /// Ask the server to define its properties, optionally for one device
    pub fn get_properties(&mut self, device: Option<&str>) -> Result<()> {
        self.send(&OutboundMessage::GetProperties {
            device: device.map(str::to_string),
            name: None,
        })
    }

    /// Ask the server to (re)define a single vector
    pub fn get_property(&mut self, device: &str, name: &str) -> Result<()> {
        self.send(&OutboundMessage::GetProperties {
            device: Some(device.to_string()),
            name: Some(name.to_string()),
        })
    }

    /// Tell the server whether to send BLOBs for a device or one of its vectors
    pub fn enable_blob(&mut self, device: &str, name: Option<&str>, mode: BlobMode) -> Result<()> {
        self.send(&OutboundMessage::EnableBlob {
            device: device.to_string(),
            name: name.map(str::to_string),
            mode,
        })?;
        if name.is_none() {
            self.blob_enabled.insert(device.to_string());
        }
        Ok(())
    }

    /// Send a `new*Vector` command after checking it against the mirror.
    ///
    /// Fails with [`IndiError::Validation`] without sending anything if the
    /// vector is unknown or not writable, an element is unknown, or a value
    /// does not match the vector kind.
    pub fn new_vector<I, S>(&mut self, device: &str, vector: &str, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (S, ElementValue)>,
        S: Into<String>,
    {
        let elements: Vec<(String, ElementValue)> = values
            .into_iter()
            .map(|(name, value)| (name.into(), value))
            .collect();

        let target = self.model.get_vector(device, vector).ok_or_else(|| {
            IndiError::Validation(format!("unknown vector {}.{}", device, vector))
        })?;
        let kind = target.kind();

        if kind == VectorKind::Light {
            return Err(IndiError::Validation(format!(
                "{}.{} is a light vector and cannot be set",
                device, vector
            )));
        }
        if !target.perm.is_writable() {
            return Err(IndiError::Validation(format!(
                "{}.{} is read-only",
                device, vector
            )));
        }
        if elements.is_empty() {
            return Err(IndiError::Validation(format!(
                "no element values given for {}.{}",
                device, vector
            )));
        }
        for (name, value) in &elements {
            if !target.has_element(name) {
                return Err(IndiError::Validation(format!(
                    "{}.{} has no element '{}'",
                    device, vector, name
                )));
            }
            if value.kind() != kind {
                return Err(IndiError::Validation(format!(
                    "{}.{}.{} expects a {} value, got {}",
                    device,
                    vector,
                    name,
                    kind,
                    value.kind()
                )));
            }
        }
        let revision = target.revision();

        self.send(&OutboundMessage::NewVector(NewVector {
            kind,
            device: device.to_string(),
            name: vector.to_string(),
            elements,
        }))?;
        self.pending
            .insert((device.to_string(), vector.to_string()), revision);
        Ok(())
    }

    pub fn set_number(&mut self, device: &str, vector: &str, element: &str, value: f64) -> Result<()> {
        self.new_vector(device, vector, [(element, ElementValue::Number(value))])
    }

    pub fn set_text(&mut self, device: &str, vector: &str, element: &str, value: &str) -> Result<()> {
        self.new_vector(device, vector, [(element, ElementValue::from(value))])
    }

    pub fn set_switch(
        &mut self,
        device: &str,
        vector: &str,
        element: &str,
        value: SwitchState,
    ) -> Result<()> {
        self.new_vector(device, vector, [(element, ElementValue::Switch(value))])
    }

    /// Turn on the switch whose label (or name) is `label`.
    ///
    /// For `OneOfMany` and `AtMostOne` vectors every other switch is sent
    /// `Off` in the same command.
    pub fn set_switch_by_label(&mut self, device: &str, vector: &str, label: &str) -> Result<()> {
        let target = self.model.get_vector(device, vector).ok_or_else(|| {
            IndiError::Validation(format!("unknown vector {}.{}", device, vector))
        })?;
        let Elements::Switch(switches) = &target.elements else {
            return Err(IndiError::Validation(format!(
                "{}.{} is not a switch vector",
                device, vector
            )));
        };
        let chosen = target
            .find_by_label(label)
            .map(|e| e.name().to_string())
            .ok_or_else(|| {
                IndiError::Validation(format!("{}.{} has no switch labelled '{}'", device, vector, label))
            })?;

        let exclusive = matches!(
            target.rule,
            Some(SwitchRule::OneOfMany) | Some(SwitchRule::AtMostOne)
        );
        let values: Vec<(String, ElementValue)> = if exclusive {
            switches
                .iter()
                .map(|s| {
                    let state = SwitchState::from(s.name == chosen);
                    (s.name.clone(), ElementValue::Switch(state))
                })
                .collect()
        } else {
            vec![(chosen, ElementValue::Switch(SwitchState::On))]
        };

        self.new_vector(device, vector, values)
    }

    /// Read, parse and apply whatever the server sent within `max_wait`.
    ///
    /// Returns the number of server elements applied. Malformed or
    /// inconsistent elements are logged, queued as [`Event::Rejected`] and
    /// skipped. Only transport failures are returned as errors, and they
    /// close the session.
    pub fn process_events(&mut self, max_wait: Duration) -> Result<usize> {
        if !self.transport.is_open() {
            return Err(IndiError::Connection("not connected".to_string()));
        }

        // No deadline when max_wait is too large to add to the clock
        let deadline = Instant::now().checked_add(max_wait);
        let mut wait = max_wait;
        let mut processed = 0;

        loop {
            let bytes = match self.transport.read_available(wait) {
                Ok(bytes) => bytes,
                Err(e) => return Err(self.fail(e)),
            };
            if bytes.is_empty() {
                break;
            }
            processed += self.handle_bytes(&bytes)?;

            // Keep reading only to finish an element that is still arriving
            if !self.parser.has_partial() {
                break;
            }
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                wait = deadline - now;
            }
        }

        Ok(processed)
    }

    /// Process events until `predicate` holds for the vector, or time out.
    pub fn wait_for<F>(
        &mut self,
        device: &str,
        vector: &str,
        timeout: Duration,
        mut predicate: F,
    ) -> Result<&PropertyVector>
    where
        F: FnMut(&PropertyVector) -> bool,
    {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let satisfied = self
                .model
                .get_vector(device, vector)
                .map(&mut predicate)
                .unwrap_or(false);
            if satisfied {
                break;
            }

            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(IndiError::Timeout(format!(
                            "{}.{} did not reach the expected state within {:?}",
                            device, vector, timeout
                        )));
                    }
                    (deadline - now).min(WAIT_SLICE)
                }
                None => WAIT_SLICE,
            };
            self.process_events(slice)?;
        }

        self.model
            .get_vector(device, vector)
            .ok_or_else(|| IndiError::Timeout(format!("{}.{} disappeared", device, vector)))
    }

    /// Wait until the server reports the outcome of the last command sent to
    /// a vector, and return its final state (`Ok`, `Alert` or `Idle`).
    ///
    /// Only updates newer than that command count, so a vector that was
    /// already `Ok` before the command does not complete early.
    pub fn wait_for_completion(
        &mut self,
        device: &str,
        vector: &str,
        timeout: Duration,
    ) -> Result<PropertyState> {
        let key = (device.to_string(), vector.to_string());
        let since = self.pending.get(&key).copied().unwrap_or(0);

        let state = self
            .wait_for(device, vector, timeout, |v| {
                v.revision() > since && v.state != PropertyState::Busy
            })?
            .state;

        self.pending.remove(&key);
        debug!("🏁 {}.{} completed with state {}", device, vector, state);
        Ok(state)
    }

    pub fn on_vector<F>(&mut self, device: &str, vector: &str, callback: F)
    where
        F: FnMut(&PropertyVector) + Send + 'static,
    {
        let callback: VectorCallback = Box::new(callback);
        self.dispatcher.on_vector(device, vector, callback);
    }

    pub fn on_message<F>(&mut self, callback: F)
    where
        F: FnMut(&crate::protocol::ServerMessage) + Send + 'static,
    {
        let callback: MessageCallback = Box::new(callback);
        self.dispatcher.on_message(callback);
    }

    pub fn poll_event(&mut self) -> Option<Event> {
        self.dispatcher.poll_event()
    }

    pub fn drain_events(&mut self) -> Vec<Event> {
        self.dispatcher.drain_events()
    }

    pub fn model(&self) -> &PropertyModel {
        &self.model
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.model.devices()
    }

    pub fn get_vector(&self, device: &str, vector: &str) -> Option<&PropertyVector> {
        self.model.get_vector(device, vector)
    }

    pub fn get_element(&self, device: &str, vector: &str, element: &str) -> Option<ElementRef<'_>> {
        self.model.get_element(device, vector, element)
    }

    pub fn get_number(&self, device: &str, vector: &str, element: &str) -> Option<f64> {
        match self.get_element(device, vector, element)? {
            ElementRef::Number(e) => Some(e.value),
            _ => None,
        }
    }

    pub fn get_text(&self, device: &str, vector: &str, element: &str) -> Option<&str> {
        match self.get_element(device, vector, element)? {
            ElementRef::Text(e) => Some(&e.value),
            _ => None,
        }
    }

    pub fn get_switch(&self, device: &str, vector: &str, element: &str) -> Option<SwitchState> {
        match self.get_element(device, vector, element)? {
            ElementRef::Switch(e) => Some(e.value),
            _ => None,
        }
    }

    pub fn get_light(&self, device: &str, vector: &str, element: &str) -> Option<PropertyState> {
        match self.get_element(device, vector, element)? {
            ElementRef::Light(e) => Some(e.value),
            _ => None,
        }
    }

    /// Latest frame of a BLOB element, if one has arrived
    pub fn get_blob(&self, device: &str, vector: &str, element: &str) -> Option<&Blob> {
        match self.get_element(device, vector, element)? {
            ElementRef::Blob(e) => e.blob.as_ref(),
            _ => None,
        }
    }

    fn send(&mut self, message: &OutboundMessage) -> Result<()> {
        if !self.transport.is_open() {
            return Err(IndiError::Connection("not connected".to_string()));
        }
        let xml = message.to_xml();
        debug!("📤 Sending {}", xml.lines().next().unwrap_or_default());
        self.transport.send(xml.as_bytes()).map_err(|e| self.fail(e))
    }

    /// Close the session on fatal errors and hand the error back
    fn fail(&mut self, e: IndiError) -> IndiError {
        if e.is_fatal() {
            error!("❌ INDI session lost: {}", e);
            self.transport.close();
            self.parser.reset();
        }
        e
    }

    fn handle_bytes(&mut self, bytes: &[u8]) -> Result<usize> {
        let mut processed = 0;
        for result in self.parser.feed(bytes) {
            match result.and_then(|element| self.handle_element(element)) {
                Ok(true) => processed += 1,
                Ok(false) => {}
                Err(e) if e.is_fatal() => return Err(self.fail(e)),
                Err(e) => {
                    warn!("⚠️ Skipping server element: {}", e);
                    self.dispatcher.reject(e.to_string());
                }
            }
        }
        Ok(processed)
    }

    fn handle_element(&mut self, element: XmlElement) -> Result<bool> {
        let Some(message) = InboundMessage::from_element(element)? else {
            return Ok(false);
        };

        let blob_device = match &message {
            InboundMessage::Def(v) if v.kind() == VectorKind::Blob => Some(v.device.clone()),
            InboundMessage::Delete(d) if d.name.is_none() => {
                self.blob_enabled.remove(&d.device);
                None
            }
            _ => None,
        };

        self.dispatcher.dispatch(&mut self.model, message)?;

        if let Some(device) = blob_device {
            let mode = self.config.blob_mode;
            if mode != BlobMode::Never && !self.blob_enabled.contains(&device) {
                info!("📦 Enabling BLOBs ({}) for {}", mode, device);
                self.enable_blob(&device, None, mode)?;
            }
        }
        Ok(true)
    }
}
