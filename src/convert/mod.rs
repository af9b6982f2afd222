//! Translation of core configuration documents between core schemas.
//!
//! Converters are pure functions of their input: the same document always
//! yields the same output and the same warnings. Anything the target schema
//! cannot express is left out of the output and named in `warnings`.

pub mod singbox_to_xray;
pub mod xray_to_singbox;

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::error::{Error, Result};
use crate::types::CoreType;

pub use singbox_to_xray::SingBoxToXray;
pub use xray_to_singbox::XrayToSingBox;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversion {
    pub document: Value,
    pub warnings: Vec<String>,
}

pub trait ConfigConverter: Send + Sync {
    fn source(&self) -> CoreType;
    fn target(&self) -> CoreType;
    fn convert(&self, document: &Value) -> Result<Conversion>;
}

pub struct ConverterRegistry {
    converters: HashMap<(CoreType, CoreType), Box<dyn ConfigConverter>>,
}

impl ConverterRegistry {
    /// Registry with the built-in xray <-> sing-box converters.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(XrayToSingBox);
        registry.register(SingBoxToXray);
        registry
    }

    pub fn empty() -> Self {
        Self {
            converters: HashMap::new(),
        }
    }

    pub fn register<C: ConfigConverter + 'static>(&mut self, converter: C) {
        self.converters
            .insert((converter.source(), converter.target()), Box::new(converter));
    }

    pub fn convert(
        &self,
        source: CoreType,
        target: CoreType,
        document: &Value,
    ) -> Result<Conversion> {
        if source == target {
            return Ok(Conversion {
                document: document.clone(),
                warnings: Vec::new(),
            });
        }

        let converter =
            self.converters
                .get(&(source, target))
                .ok_or_else(|| Error::UnsupportedCorePair {
                    source_core: source.to_string(),
                    target_core: target.to_string(),
                })?;

        let conversion = converter.convert(document)?;
        debug!(
            "Converted {} config to {} with {} warning(s)",
            source,
            target,
            conversion.warnings.len()
        );
        Ok(conversion)
    }
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn port_key(core: CoreType) -> &'static str {
    match core {
        CoreType::Xray => "port",
        CoreType::SingBox => "listen_port",
    }
}

fn type_key(core: CoreType) -> &'static str {
    match core {
        CoreType::Xray => "protocol",
        CoreType::SingBox => "type",
    }
}

/// Inbound listen ports declared by `document`, sorted and deduplicated.
pub fn listen_ports(core: CoreType, document: &Value) -> Vec<u16> {
    let key = port_key(core);
    let mut ports: Vec<u16> = document
        .get("inbounds")
        .and_then(Value::as_array)
        .map(|inbounds| {
            inbounds
                .iter()
                .filter_map(|inbound| inbound.get(key))
                .filter_map(port_value)
                .collect()
        })
        .unwrap_or_default();
    ports.sort_unstable();
    ports.dedup();
    ports
}

/// Structural checks shared by instance creation and switches.
pub fn validate(core: CoreType, document: &Value) -> Result<()> {
    let root = document
        .as_object()
        .ok_or_else(|| Error::invalid_input(format!("{} config must be a JSON object", core)))?;

    if let Some(outbounds) = root.get("outbounds") {
        if !outbounds.is_array() {
            return Err(Error::invalid_input("outbounds must be an array"));
        }
    }

    let Some(inbounds) = root.get("inbounds") else {
        return Ok(());
    };
    let inbounds = inbounds
        .as_array()
        .ok_or_else(|| Error::invalid_input("inbounds must be an array"))?;

    let (type_key, port_key) = (type_key(core), port_key(core));
    let mut seen = HashSet::new();
    for (i, inbound) in inbounds.iter().enumerate() {
        let inbound = inbound
            .as_object()
            .ok_or_else(|| Error::invalid_input(format!("inbounds[{}] must be an object", i)))?;

        if !inbound.get(type_key).map_or(false, Value::is_string) {
            return Err(Error::invalid_input(format!(
                "inbounds[{}] is missing '{}'",
                i, type_key
            )));
        }

        if let Some(port) = inbound.get(port_key) {
            let port = port_value(port).ok_or_else(|| {
                Error::invalid_input(format!(
                    "inbounds[{}].{} must be a port between 1 and 65535",
                    i, port_key
                ))
            })?;
            if !seen.insert(port) {
                return Err(Error::invalid_input(format!(
                    "port {} is declared by more than one inbound",
                    port
                )));
            }
        }
    }
    Ok(())
}

/// A single port given as a number or a numeric string.
pub(crate) fn port_value(value: &Value) -> Option<u16> {
    let port = match value {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse::<u64>().ok()?,
        _ => return None,
    };
    match port {
        1..=65535 => Some(port as u16),
        _ => None,
    }
}

/// Accumulates what a conversion could not carry over.
pub(crate) struct Warnings {
    target: CoreType,
    items: Vec<String>,
}

impl Warnings {
    pub(crate) fn new(target: CoreType) -> Self {
        Self {
            target,
            items: Vec::new(),
        }
    }

    pub(crate) fn dropped(&mut self, path: &str) {
        self.items
            .push(format!("{}: no {} equivalent, dropped", path, self.target));
    }

    pub(crate) fn note(&mut self, path: &str, message: impl fmt::Display) {
        self.items.push(format!("{}: {}", path, message));
    }

    pub(crate) fn into_vec(self) -> Vec<String> {
        self.items
    }
}

pub(crate) fn join(path: &str, key: &str) -> String {
    format!("{}.{}", path, key)
}

pub(crate) fn as_object<'a>(
    value: &'a Value,
    path: &str,
    warnings: &mut Warnings,
) -> Option<&'a Map<String, Value>> {
    let object = value.as_object();
    if object.is_none() {
        warnings.note(path, "expected an object, dropped");
    }
    object
}

/// Object elements of an array with their paths; anything else is reported.
pub(crate) fn objects<'a>(
    value: &'a Value,
    path: &str,
    warnings: &mut Warnings,
) -> Vec<(String, &'a Map<String, Value>)> {
    let Some(items) = value.as_array() else {
        warnings.note(path, "expected an array, dropped");
        return Vec::new();
    };
    items
        .iter()
        .enumerate()
        .filter_map(|(i, item)| {
            let item_path = format!("{}[{}]", path, i);
            match item.as_object() {
                Some(object) => Some((item_path, object)),
                None => {
                    warnings.note(&item_path, "expected an object, dropped");
                    None
                }
            }
        })
        .collect()
}

/// A string or an array of strings.
pub(crate) fn string_items(value: &Value) -> Option<Vec<&str>> {
    match value {
        Value::String(s) => Some(vec![s.as_str()]),
        Value::Array(items) => items.iter().map(Value::as_str).collect(),
        _ => None,
    }
}

/// xray client field -> sing-box user field
pub(crate) const CLIENT_FIELDS: &[(&str, &str)] = &[
    ("id", "uuid"),
    ("email", "name"),
    ("password", "password"),
    ("flow", "flow"),
    ("alterId", "alterId"),
];

/// xray socks/http account field -> sing-box user field
pub(crate) const ACCOUNT_FIELDS: &[(&str, &str)] = &[("user", "username"), ("pass", "password")];

#[derive(Debug, Clone, Copy)]
pub(crate) enum Direction {
    ToSingBox,
    ToXray,
}

/// Copy `source` renaming keys through `fields`; unknown keys are reported.
pub(crate) fn rename_fields(
    path: &str,
    source: &Map<String, Value>,
    fields: &[(&str, &str)],
    direction: Direction,
    warnings: &mut Warnings,
) -> Value {
    let mut out = Map::new();
    for (key, value) in source {
        let renamed = fields.iter().find_map(|(xray, singbox)| match direction {
            Direction::ToSingBox if *xray == key.as_str() => Some(*singbox),
            Direction::ToXray if *singbox == key.as_str() => Some(*xray),
            _ => None,
        });
        match renamed {
            Some(target) => {
                out.insert(target.to_string(), value.clone());
            }
            None => warnings.dropped(&join(path, key)),
        }
    }
    Value::Object(out)
}
