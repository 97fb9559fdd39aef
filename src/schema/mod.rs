//! Structural JSON Schema inference without runtime reflection.
//!
//! A value of the target type is built by driving its `Deserialize` impl with
//! a [`placeholder`] source that answers every request with a zero-like value
//! and never runs out of data. That instance is then fed through its
//! `Serialize` impl into a [`sink`] that records the shape of each write
//! instead of producing bytes.
//!
//! The result describes shape and requiredness only: numeric ranges, string
//! formats and enumerated value sets are not captured. Sequences are assumed
//! homogeneous and their `items` come from the first element.

mod placeholder;
mod sink;

use std::collections::BTreeMap;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};

use crate::error::SchemaError;

use placeholder::PlaceholderSource;
use sink::SchemaSink;

/// Nesting limit for inference. Self-referential types hit it instead of
/// looping forever.
pub const MAX_SCHEMA_DEPTH: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Boolean,
    String,
    Number,
    Integer,
    Object,
    Array,
    Null,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Boolean => "boolean",
            Kind::String => "string",
            Kind::Number => "number",
            Kind::Integer => "integer",
            Kind::Object => "object",
            Kind::Array => "array",
            Kind::Null => "null",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Schema {
    pub kind: Kind,
    pub properties: Option<BTreeMap<String, Schema>>,
    pub required: Option<Vec<String>>,
    pub items: Option<Box<Schema>>,
    /// Value shape of open-keyed maps.
    pub additional_properties: Option<Box<Schema>>,
    pub description: Option<String>,
}

impl Schema {
    pub fn of(kind: Kind) -> Self {
        Self {
            kind,
            properties: None,
            required: None,
            items: None,
            additional_properties: None,
            description: None,
        }
    }

    pub fn object() -> Self {
        Self {
            properties: Some(BTreeMap::new()),
            required: Some(Vec::new()),
            ..Self::of(Kind::Object)
        }
    }

    pub fn array(items: Option<Schema>) -> Self {
        Self {
            items: items.map(Box::new),
            ..Self::of(Kind::Array)
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn property(&self, name: &str) -> Option<&Schema> {
        self.properties.as_ref()?.get(name)
    }

    pub fn is_required(&self, name: &str) -> bool {
        self.required
            .as_ref()
            .is_some_and(|required| required.iter().any(|key| key == name))
    }

    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        object.insert("type".to_string(), json!(self.kind.as_str()));

        if let Some(properties) = &self.properties {
            let properties = properties
                .iter()
                .map(|(name, schema)| (name.clone(), schema.to_json()))
                .collect::<Map<_, _>>();
            object.insert("properties".to_string(), Value::Object(properties));
        }
        if let Some(required) = &self.required {
            object.insert("required".to_string(), json!(required));
        }
        if let Some(items) = &self.items {
            object.insert("items".to_string(), items.to_json());
        }
        if let Some(additional) = &self.additional_properties {
            object.insert("additionalProperties".to_string(), additional.to_json());
        }
        if let Some(description) = &self.description {
            object.insert("description".to_string(), json!(description));
        }

        Value::Object(object)
    }
}

/// Derives the structural schema of `T` from its own serde impls.
///
/// Fails with [`SchemaError::UnsupportedRecursiveSchema`] for types that
/// contain themselves, and with [`SchemaError::Inference`] for shapes the
/// placeholder cannot satisfy (internally tagged enums, flattened fields).
pub fn infer<T>() -> Result<Schema, SchemaError>
where
    T: Serialize + DeserializeOwned,
{
    let placeholder = T::deserialize(PlaceholderSource::root())?;
    let inferred = placeholder.serialize(SchemaSink::root())?;
    Ok(inferred.schema)
}
