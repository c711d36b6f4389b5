//! Element registry: identifier-keyed control values shared by codec, links and controller.
//!
//! The registry is built once at startup (standard table plus any custom elements the
//! application declares) and then shared behind an `Arc`. The set of elements never changes
//! after `build`; only values and observers do. Each value sits behind its own lock so links
//! writing different identifiers never contend, and concurrent writes to one identifier are
//! last-write-wins.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// Wire identifier of an element. One byte so it fits the binary frame header.
pub type ElementId = u8;

pub const SYSTEM_MESSAGE: ElementId = 1;
pub const DEVICE_INFO: ElementId = 2;
pub const PLAYER_INDEX: ElementId = 3;
pub const PAUSE_BUTTON: ElementId = 4;
pub const LEFT_SHOULDER: ElementId = 5;
pub const RIGHT_SHOULDER: ElementId = 6;
pub const DPAD_X_AXIS: ElementId = 7;
pub const DPAD_Y_AXIS: ElementId = 8;
pub const BUTTON_A: ElementId = 9;
pub const BUTTON_B: ElementId = 10;
pub const LEFT_TRIGGER: ElementId = 11;
pub const RIGHT_TRIGGER: ElementId = 12;
pub const BUTTON_X: ElementId = 13;
pub const BUTTON_Y: ElementId = 14;
pub const IMAGE: ElementId = 31;

/// First identifier available to application-declared elements.
pub const FIRST_CUSTOM_ID: ElementId = 100;

/// (id, name, kind, clear_after_send)
const STANDARD_ELEMENTS: &[(ElementId, &str, ValueKind, bool)] = &[
    (SYSTEM_MESSAGE, "systemMessage", ValueKind::Int, false),
    (DEVICE_INFO, "deviceInfo", ValueKind::Bytes, false),
    (PLAYER_INDEX, "playerIndex", ValueKind::Int, false),
    (PAUSE_BUTTON, "pauseButton", ValueKind::Float, false),
    (LEFT_SHOULDER, "leftShoulder", ValueKind::Float, false),
    (RIGHT_SHOULDER, "rightShoulder", ValueKind::Float, false),
    (DPAD_X_AXIS, "dpadXAxis", ValueKind::Float, false),
    (DPAD_Y_AXIS, "dpadYAxis", ValueKind::Float, false),
    (BUTTON_A, "buttonA", ValueKind::Float, false),
    (BUTTON_B, "buttonB", ValueKind::Float, false),
    (LEFT_TRIGGER, "leftTrigger", ValueKind::Float, false),
    (RIGHT_TRIGGER, "rightTrigger", ValueKind::Float, false),
    (BUTTON_X, "buttonX", ValueKind::Float, false),
    (BUTTON_Y, "buttonY", ValueKind::Float, false),
    (15, "leftThumbstickXAxis", ValueKind::Float, false),
    (16, "leftThumbstickYAxis", ValueKind::Float, false),
    (17, "rightThumbstickXAxis", ValueKind::Float, false),
    (18, "rightThumbstickYAxis", ValueKind::Float, false),
    (19, "leftThumbstickButton", ValueKind::Float, false),
    (20, "rightThumbstickButton", ValueKind::Float, false),
    (21, "motionUserAccelerationX", ValueKind::Float, false),
    (22, "motionUserAccelerationY", ValueKind::Float, false),
    (23, "motionUserAccelerationZ", ValueKind::Float, false),
    (24, "motionRotationRateX", ValueKind::Float, false),
    (25, "motionRotationRateY", ValueKind::Float, false),
    (26, "motionRotationRateZ", ValueKind::Float, false),
    (27, "motionAttitudeX", ValueKind::Float, false),
    (28, "motionAttitudeY", ValueKind::Float, false),
    (29, "motionAttitudeZ", ValueKind::Float, false),
    (30, "motionAttitudeW", ValueKind::Float, false),
    (IMAGE, "image", ValueKind::Bytes, true),
];

/// Value kind of an element. Decides checksum term and which stream carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Int,
    Float,
    String,
    Bytes,
}

impl ValueKind {
    /// Numeric kinds contribute their value to the text checksum.
    pub fn is_numeric(self) -> bool {
        matches!(self, ValueKind::Int | ValueKind::Float)
    }

    /// Byte payloads travel as binary frames on the large stream.
    pub fn is_binary(self) -> bool {
        matches!(self, ValueKind::Bytes)
    }

    pub fn zero(self) -> ElementValue {
        match self {
            ValueKind::Int => ElementValue::Int(0),
            ValueKind::Float => ElementValue::Float(0.0),
            ValueKind::String => ElementValue::Text(String::new()),
            ValueKind::Bytes => ElementValue::Bytes(Vec::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ElementValue {
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl ElementValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            ElementValue::Int(_) => ValueKind::Int,
            ElementValue::Float(_) => ValueKind::Float,
            ElementValue::Text(_) => ValueKind::String,
            ElementValue::Bytes(_) => ValueKind::Bytes,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ElementValue::Int(v) => Some(*v as f64),
            ElementValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Text form used in a text frame. `None` for byte payloads.
    pub fn to_wire_string(&self) -> Option<String> {
        match self {
            ElementValue::Int(v) => Some(v.to_string()),
            ElementValue::Float(v) => Some(v.to_string()),
            ElementValue::Text(s) => Some(s.clone()),
            ElementValue::Bytes(_) => None,
        }
    }

    /// Parse the text form of a value of `kind`. Integers also accept a float
    /// form with no fractional part, which is how some peers print them.
    pub fn parse(kind: ValueKind, s: &str) -> Option<ElementValue> {
        match kind {
            ValueKind::Int => s.parse::<i64>().ok().map(ElementValue::Int).or_else(|| {
                let f = s.parse::<f64>().ok()?;
                (f.fract() == 0.0).then_some(ElementValue::Int(f as i64))
            }),
            ValueKind::Float => s.parse::<f64>().ok().map(ElementValue::Float),
            ValueKind::String => Some(ElementValue::Text(s.to_string())),
            ValueKind::Bytes => None,
        }
    }
}

impl fmt::Display for ElementValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            other => write!(f, "{}", other.to_wire_string().unwrap_or_default()),
        }
    }
}

/// Values carried by the `systemMessage` element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemMessage {
    ConnectionAcknowledgement = 1,
    ReceivedInvalidMessage = 2,
    DisconnectRequest = 3,
}

impl SystemMessage {
    pub fn from_value(value: &ElementValue) -> Option<Self> {
        match value {
            ElementValue::Int(1) => Some(SystemMessage::ConnectionAcknowledgement),
            ElementValue::Int(2) => Some(SystemMessage::ReceivedInvalidMessage),
            ElementValue::Int(3) => Some(SystemMessage::DisconnectRequest),
            _ => None,
        }
    }

    pub fn value(self) -> ElementValue {
        ElementValue::Int(self as i64)
    }
}

/// Declaration of an element, used by the registry builder.
#[derive(Debug, Clone)]
pub struct ElementSpec {
    pub id: ElementId,
    pub name: String,
    pub kind: ValueKind,
    pub clear_after_send: bool,
}

impl ElementSpec {
    pub fn new(id: ElementId, name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            clear_after_send: false,
        }
    }

    pub fn clear_after_send(mut self) -> Self {
        self.clear_after_send = true;
        self
    }
}

pub struct Element {
    id: ElementId,
    name: String,
    kind: ValueKind,
    clear_after_send: bool,
    value: RwLock<ElementValue>,
}

impl Element {
    fn from_spec(spec: ElementSpec) -> Self {
        Self {
            id: spec.id,
            value: RwLock::new(spec.kind.zero()),
            name: spec.name,
            kind: spec.kind,
            clear_after_send: spec.clear_after_send,
        }
    }

    pub fn id(&self) -> ElementId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn clears_after_send(&self) -> bool {
        self.clear_after_send
    }

    pub fn value(&self) -> ElementValue {
        match self.value.read() {
            Ok(v) => v.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn store(&self, value: ElementValue) {
        match self.value.write() {
            Ok(mut v) => *v = value,
            Err(poisoned) => *poisoned.into_inner() = value,
        }
    }
}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Element")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("value", &self.value())
            .finish()
    }
}

/// Callback fired synchronously after an element's value is updated.
pub type Observer = Box<dyn Fn(ElementId, &ElementValue) + Send + Sync>;

/// Registry of every element known to this process.
pub struct ElementRegistry {
    elements: HashMap<ElementId, Element>,
    by_name: HashMap<String, ElementId>,
    observers: RwLock<HashMap<ElementId, Vec<Observer>>>,
}

impl ElementRegistry {
    /// Registry holding only the standard elements.
    pub fn standard() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> ElementRegistryBuilder {
        ElementRegistryBuilder::new()
    }

    pub fn get(&self, id: ElementId) -> Option<&Element> {
        self.elements.get(&id)
    }

    pub fn id_of(&self, name: &str) -> Option<ElementId> {
        self.by_name.get(name).copied()
    }

    pub fn kind(&self, id: ElementId) -> Option<ValueKind> {
        self.elements.get(&id).map(|e| e.kind)
    }

    pub fn value(&self, id: ElementId) -> Option<ElementValue> {
        self.elements.get(&id).map(|e| e.value())
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Update a value and notify its observers.
    pub fn set(&self, id: ElementId, value: ElementValue) -> Result<(), RegistryError> {
        let element = self.elements.get(&id).ok_or(RegistryError::Unknown(id))?;
        if value.kind() != element.kind {
            return Err(RegistryError::KindMismatch {
                id,
                expected: element.kind,
                got: value.kind(),
            });
        }
        element.store(value.clone());
        self.notify(id, &value);
        Ok(())
    }

    /// Reset to the kind's zero without notifying observers.
    pub fn clear(&self, id: ElementId) {
        if let Some(element) = self.elements.get(&id) {
            element.store(element.kind.zero());
        }
    }

    /// Register an observer for one identifier. Observers must not register
    /// further observers from inside the callback.
    pub fn observe<F>(&self, id: ElementId, f: F) -> Result<(), RegistryError>
    where
        F: Fn(ElementId, &ElementValue) + Send + Sync + 'static,
    {
        if !self.elements.contains_key(&id) {
            return Err(RegistryError::Unknown(id));
        }
        let mut observers = match self.observers.write() {
            Ok(o) => o,
            Err(poisoned) => poisoned.into_inner(),
        };
        observers.entry(id).or_default().push(Box::new(f));
        Ok(())
    }

    fn notify(&self, id: ElementId, value: &ElementValue) {
        let observers = match self.observers.read() {
            Ok(o) => o,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(list) = observers.get(&id) {
            for observer in list {
                observer(id, value);
            }
        }
    }
}

impl Default for ElementRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for ElementRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementRegistry")
            .field("elements", &self.elements.len())
            .finish()
    }
}

pub struct ElementRegistryBuilder {
    specs: Vec<ElementSpec>,
}

impl ElementRegistryBuilder {
    fn new() -> Self {
        let specs = STANDARD_ELEMENTS
            .iter()
            .map(|&(id, name, kind, clear)| ElementSpec {
                id,
                name: name.to_string(),
                kind,
                clear_after_send: clear,
            })
            .collect();
        Self { specs }
    }

    /// Declare an application element. Identifiers below `FIRST_CUSTOM_ID` are reserved.
    pub fn custom(mut self, spec: ElementSpec) -> Result<Self, RegistryError> {
        if spec.id < FIRST_CUSTOM_ID {
            return Err(RegistryError::Reserved(spec.id));
        }
        if self.specs.iter().any(|s| s.id == spec.id) {
            return Err(RegistryError::DuplicateId(spec.id));
        }
        if self.specs.iter().any(|s| s.name == spec.name) {
            return Err(RegistryError::DuplicateName(spec.name));
        }
        self.specs.push(spec);
        Ok(self)
    }

    pub fn build(self) -> ElementRegistry {
        let mut elements = HashMap::with_capacity(self.specs.len());
        let mut by_name = HashMap::with_capacity(self.specs.len());
        for spec in self.specs {
            by_name.insert(spec.name.clone(), spec.id);
            elements.insert(spec.id, Element::from_spec(spec));
        }
        ElementRegistry {
            elements,
            by_name,
            observers: RwLock::new(HashMap::new()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown element {0}")]
    Unknown(ElementId),
    #[error("element id {0} is reserved for standard elements")]
    Reserved(ElementId),
    #[error("duplicate element id {0}")]
    DuplicateId(ElementId),
    #[error("duplicate element name {0}")]
    DuplicateName(String),
    #[error("element {id} expects {expected:?}, got {got:?}")]
    KindMismatch {
        id: ElementId,
        expected: ValueKind,
        got: ValueKind,
    },
}
