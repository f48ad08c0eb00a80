//! Endpoint description - the property map a discovery layer ships between
//! peers.
//!
//! An exported service is advertised as a flat, string-keyed map. The
//! importing side reads from it the interfaces, the service id, the URIs to
//! dial, the intents, the serializer and the compressed method table
//! (`index=signature` pairs) that lets call frames carry a 2-byte index
//! instead of a signature.
//!
//! # Example
//!
//! ```
//! use remotewire::endpoint::{EndpointDescription, PropertyValue, REMOTE_URIS};
//!
//! let json = r#"{
//!     "objectClass": ["example.Math"],
//!     "endpoint.id": "6f1c0a9e-2b7d-4c55-9a61-0d2f4e8b7c31",
//!     "endpoint.framework.uuid": "node-a",
//!     "remote.uris": ["tcp://127.0.0.1:9410"],
//!     "remote.methods": ["0=length()", "1=coprime(long,long,Promise)"],
//!     "remote.timeout.ms": 1500
//! }"#;
//!
//! let endpoint = EndpointDescription::from_json(json).unwrap();
//! assert_eq!(endpoint.methods().unwrap()[&1], "coprime(long,long,Promise)");
//! assert_eq!(endpoint.get(REMOTE_URIS), Some(&PropertyValue::from(vec!["tcp://127.0.0.1:9410"])));
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::transport::TransportUri;

/// Interfaces the service implements.
pub const OBJECT_CLASS: &str = "objectClass";
/// Exported service id (UUID string).
pub const ENDPOINT_ID: &str = "endpoint.id";
/// Identifier of the exporting process.
pub const FRAMEWORK_UUID: &str = "endpoint.framework.uuid";
/// URIs to dial.
pub const REMOTE_URIS: &str = "remote.uris";
/// Intents the endpoint requires or provides.
pub const SERVICE_INTENTS: &str = "service.intents";
/// Compressed method table, `index=signature` pairs.
pub const REMOTE_METHODS: &str = "remote.methods";
/// Per-call timeout in milliseconds.
pub const REMOTE_TIMEOUT: &str = "remote.timeout.ms";
/// Name of the serializer the exporter uses.
pub const REMOTE_SERIALIZER: &str = "remote.serializer";

const IMMUTABLE: [&str; 2] = [ENDPOINT_ID, FRAMEWORK_UUID];

/// A single property value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// Scalar string.
    String(String),
    /// List of strings.
    List(Vec<String>),
    /// Integer.
    Long(i64),
}

impl PropertyValue {
    /// Values as a list; a scalar string becomes a one-element list.
    pub fn as_list(&self) -> Vec<String> {
        match self {
            PropertyValue::String(s) => vec![s.clone()],
            PropertyValue::List(items) => items.clone(),
            PropertyValue::Long(n) => vec![n.to_string()],
        }
    }

    /// Scalar string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            PropertyValue::List(items) if items.len() == 1 => Some(&items[0]),
            _ => None,
        }
    }

    /// Integer value; numeric strings are accepted.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            PropertyValue::Long(n) => Some(*n),
            PropertyValue::String(s) => s.trim().parse().ok(),
            PropertyValue::List(_) => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::String(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::String(s)
    }
}

impl From<i64> for PropertyValue {
    fn from(n: i64) -> Self {
        PropertyValue::Long(n)
    }
}

impl From<Vec<String>> for PropertyValue {
    fn from(items: Vec<String>) -> Self {
        PropertyValue::List(items)
    }
}

impl From<Vec<&str>> for PropertyValue {
    fn from(items: Vec<&str>) -> Self {
        PropertyValue::List(items.into_iter().map(str::to_string).collect())
    }
}

/// Typed view over an endpoint's property map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointDescription {
    properties: BTreeMap<String, PropertyValue>,
}

impl EndpointDescription {
    /// Wrap a property map, validating the required keys.
    pub fn new(properties: BTreeMap<String, PropertyValue>) -> Result<Self> {
        let endpoint = Self { properties };
        endpoint.validate()?;
        Ok(endpoint)
    }

    /// Wrap a property map without validation.
    pub fn unchecked(properties: BTreeMap<String, PropertyValue>) -> Self {
        Self { properties }
    }

    /// Parse and validate a JSON object.
    pub fn from_json(json: &str) -> Result<Self> {
        let properties: BTreeMap<String, PropertyValue> = serde_json::from_str(json)?;
        Self::new(properties)
    }

    /// Encode as a JSON object.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.properties)?)
    }

    /// Check that the keys an importer relies on are present and well formed.
    pub fn validate(&self) -> Result<()> {
        if self.interfaces().is_empty() {
            return Err(Error::InvalidEndpoint(format!("{} is missing", OBJECT_CLASS)));
        }
        self.id()?;
        if self.uris()?.is_empty() {
            return Err(Error::InvalidEndpoint(format!("{} is empty", REMOTE_URIS)));
        }
        self.methods()?;
        if let Some(value) = self.properties.get(REMOTE_TIMEOUT) {
            match value.as_long() {
                Some(ms) if ms > 0 => {}
                _ => return Err(Error::InvalidEndpoint(format!("{} must be a positive integer", REMOTE_TIMEOUT))),
            }
        }
        Ok(())
    }

    /// Raw property.
    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    /// Set a property.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        self.properties.insert(key.into(), value.into());
    }

    /// All properties.
    pub fn properties(&self) -> &BTreeMap<String, PropertyValue> {
        &self.properties
    }

    /// Interfaces (`objectClass`).
    pub fn interfaces(&self) -> Vec<String> {
        self.list(OBJECT_CLASS)
    }

    /// Exported service id (`endpoint.id`).
    pub fn id(&self) -> Result<Uuid> {
        let raw = self
            .properties
            .get(ENDPOINT_ID)
            .and_then(PropertyValue::as_str)
            .ok_or_else(|| Error::InvalidEndpoint(format!("{} is missing", ENDPOINT_ID)))?;
        Uuid::parse_str(raw).map_err(|e| Error::InvalidEndpoint(format!("{} is not a UUID: {}", ENDPOINT_ID, e)))
    }

    /// Exporting process (`endpoint.framework.uuid`).
    pub fn framework_uuid(&self) -> Option<&str> {
        self.properties.get(FRAMEWORK_UUID).and_then(PropertyValue::as_str)
    }

    /// URIs to dial, in preference order.
    pub fn uris(&self) -> Result<Vec<TransportUri>> {
        self.list(REMOTE_URIS).iter().map(|s| s.parse()).collect()
    }

    /// Intents (`service.intents`).
    pub fn intents(&self) -> Vec<String> {
        self.list(SERVICE_INTENTS)
    }

    /// Serializer name, if advertised.
    pub fn serializer(&self) -> Option<&str> {
        self.properties.get(REMOTE_SERIALIZER).and_then(PropertyValue::as_str)
    }

    /// Per-call timeout, if advertised.
    pub fn timeout(&self) -> Option<Duration> {
        self.properties
            .get(REMOTE_TIMEOUT)
            .and_then(PropertyValue::as_long)
            .filter(|ms| *ms > 0)
            .map(|ms| Duration::from_millis(ms as u64))
    }

    /// Compressed method table, `index → signature`.
    pub fn methods(&self) -> Result<BTreeMap<u16, String>> {
        let mut table = BTreeMap::new();
        for entry in self.list(REMOTE_METHODS) {
            let (index, signature) = entry
                .split_once('=')
                .ok_or_else(|| Error::InvalidEndpoint(format!("Bad method entry: {}", entry)))?;
            let index: u16 = index
                .trim()
                .parse()
                .map_err(|_| Error::InvalidEndpoint(format!("Bad method index: {}", entry)))?;
            if table.insert(index, signature.trim().to_string()).is_some() {
                return Err(Error::InvalidEndpoint(format!("Duplicate method index {}", index)));
            }
        }
        Ok(table)
    }

    /// Store a method table as `index=signature` pairs.
    pub fn set_methods(&mut self, methods: &BTreeMap<u16, String>) {
        let entries: Vec<String> = methods.iter().map(|(i, s)| format!("{}={}", i, s)).collect();
        self.set(REMOTE_METHODS, entries);
    }

    /// Overlay `properties`. The endpoint id and framework id never change.
    pub fn merge(&mut self, properties: BTreeMap<String, PropertyValue>) {
        for (key, value) in properties {
            if IMMUTABLE.contains(&key.as_str()) {
                if self.properties.get(&key) != Some(&value) {
                    warn!(key = %key, "Ignoring update of immutable endpoint property");
                }
                continue;
            }
            self.properties.insert(key, value);
        }
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.properties.get(key).map(PropertyValue::as_list).unwrap_or_default()
    }
}
