//! Object mapping: associates a Rust type with a wire key and the attributes sent for it.
//!
//! Encoded form is JSON `{"<wire key>": {<mapped attributes>}}` (or a list of objects under
//! the key). Attributes are keypaths; `address.city` maps a nested field.

use std::any::{type_name, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::route::{PathPattern, RouteError};

/// One registered mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    key: String,
    type_id: TypeId,
    type_name: &'static str,
    attributes: Vec<String>,
}

impl Mapping {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn attributes(&self) -> &[String] {
        &self.attributes
    }

    /// Keep only the mapped attributes of `source`.
    fn project(&self, source: &Value) -> Value {
        match source {
            Value::Array(items) => Value::Array(items.iter().map(|v| self.project(v)).collect()),
            _ => {
                let mut out = Value::Object(Map::new());
                for attr in &self.attributes {
                    if let Some(v) = get_keypath(source, attr) {
                        set_keypath(&mut out, attr, v.clone());
                    }
                }
                out
            }
        }
    }
}

#[derive(Default)]
struct Tables {
    by_key: BTreeMap<String, Mapping>,
    by_type: HashMap<TypeId, String>,
    resources: HashMap<TypeId, PathPattern>,
}

/// Registry of mappings and resource paths. Wire keys are unique per mapper.
#[derive(Default)]
pub struct ObjectMapper {
    tables: RwLock<Tables>,
}

impl ObjectMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under `key`. A key that is already taken is rejected and the existing
    /// mapping stays in effect. The first key registered for a type is the one used to encode it.
    pub fn add_mapping<T: 'static>(&self, key: &str, attributes: &[&str]) -> Result<(), MappingError> {
        if key.is_empty() {
            return Err(MappingError::EmptyKey);
        }
        if attributes.is_empty() {
            return Err(MappingError::NoAttributes(key.to_string()));
        }
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        if tables.by_key.contains_key(key) {
            return Err(MappingError::Conflict(key.to_string()));
        }
        let mapping = Mapping {
            key: key.to_string(),
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            attributes: attributes.iter().map(|a| a.to_string()).collect(),
        };
        tables
            .by_type
            .entry(mapping.type_id)
            .or_insert_with(|| key.to_string());
        tracing::debug!(key, ty = mapping.type_name, "mapping registered");
        tables.by_key.insert(key.to_string(), mapping);
        Ok(())
    }

    pub fn mapping_for_key(&self, key: &str) -> Option<Mapping> {
        self.tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_key
            .get(key)
            .cloned()
    }

    pub fn mapping_for<T: 'static>(&self) -> Option<Mapping> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let key = tables.by_type.get(&TypeId::of::<T>())?;
        tables.by_key.get(key).cloned()
    }

    /// Serializer for a mapped object.
    pub fn serializer_for_object<T: Serialize + 'static>(
        &self,
        object: &T,
    ) -> Result<Serializer, MappingError> {
        let mapping = self
            .mapping_for::<T>()
            .ok_or_else(|| MappingError::Unmapped(type_name::<T>().to_string()))?;
        let value = serde_json::to_value(object)?;
        if !value.is_object() {
            return Err(MappingError::NotAnObject(type_name::<T>().to_string()));
        }
        Ok(Serializer {
            key: mapping.key.clone(),
            object: mapping.project(&value),
        })
    }

    /// Serializer for a list of mapped objects (encoded as a JSON array under the key).
    pub fn serializer_for_objects<T: Serialize + 'static>(
        &self,
        objects: &[T],
    ) -> Result<Serializer, MappingError> {
        let mapping = self
            .mapping_for::<T>()
            .ok_or_else(|| MappingError::Unmapped(type_name::<T>().to_string()))?;
        let value = serde_json::to_value(objects)?;
        Ok(Serializer {
            key: mapping.key.clone(),
            object: mapping.project(&value),
        })
    }

    pub fn encode<T: Serialize + 'static>(&self, object: &T) -> Result<Vec<u8>, MappingError> {
        self.serializer_for_object(object)?.to_bytes()
    }

    /// Decode a payload by finding a registered wire key at its top level.
    pub fn deserialize(&self, bytes: &[u8]) -> Result<MappingResult, MappingError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let Value::Object(mut map) = value else {
            return Err(MappingError::NoRegisteredKey);
        };
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let mapping = map
            .keys()
            .find_map(|k| tables.by_key.get(k))
            .ok_or(MappingError::NoRegisteredKey)?;
        let inner = map.remove(&mapping.key).unwrap_or(Value::Null);
        Ok(MappingResult {
            key: mapping.key.clone(),
            value: mapping.project(&inner),
        })
    }

    /// Decode the object stored under a specific wire key.
    pub fn decode(&self, bytes: &[u8], key: &str) -> Result<MappingResult, MappingError> {
        let mapping = self
            .mapping_for_key(key)
            .ok_or_else(|| MappingError::Unmapped(key.to_string()))?;
        let mut value: Value = serde_json::from_slice(bytes)?;
        let inner = value
            .get_mut(key)
            .map(Value::take)
            .ok_or_else(|| MappingError::MissingKey(key.to_string()))?;
        let value = mapping.project(&inner);
        Ok(MappingResult {
            key: mapping.key,
            value,
        })
    }

    /// Default resource path for a type, e.g. `/contacts/:identifier`.
    pub fn route_type<T: 'static>(&self, pattern: &str) -> Result<(), MappingError> {
        let pattern = PathPattern::parse(pattern)?;
        self.tables
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .resources
            .insert(TypeId::of::<T>(), pattern);
        Ok(())
    }

    /// Resource path of `object`: its type's pattern with `:attr` segments filled in from
    /// the object's serialized attributes.
    pub fn resource_path_for<T: Serialize + 'static>(&self, object: &T) -> Result<String, MappingError> {
        let pattern = self
            .tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .resources
            .get(&TypeId::of::<T>())
            .cloned()
            .ok_or_else(|| MappingError::NoResourcePath(type_name::<T>().to_string()))?;
        let value = serde_json::to_value(object)?;
        let lookup = |name: &str| get_keypath(&value, name).and_then(scalar_to_string);
        if let Some(missing) = pattern.param_names().find(|n| lookup(n).is_none()) {
            return Err(MappingError::MissingAttribute(missing.to_string()));
        }
        pattern
            .interpolate(lookup)
            .ok_or_else(|| MappingError::NoResourcePath(type_name::<T>().to_string()))
    }
}

/// Encodes one object (or list) under its wire key.
#[derive(Debug, Clone, PartialEq)]
pub struct Serializer {
    key: String,
    object: Value,
}

impl Serializer {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The projected object, without the key wrapper.
    pub fn object(&self) -> &Value {
        &self.object
    }

    pub fn mime_type(&self) -> &'static str {
        "application/json"
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(self.key.clone(), self.object.clone());
        Value::Object(map)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MappingError> {
        Ok(serde_json::to_vec(&self.to_value())?)
    }
}

/// Decoded payload: the wire key found and the projected value under it.
#[derive(Debug, Clone, PartialEq)]
pub struct MappingResult {
    key: String,
    value: Value,
}

impl MappingResult {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// A single object. A list under the key is an error; use `into_objects`.
    pub fn into_object<T: DeserializeOwned>(self) -> Result<T, MappingError> {
        if self.value.is_array() {
            return Err(MappingError::ExpectedObject(self.key));
        }
        Ok(serde_json::from_value(self.value)?)
    }

    /// All objects under the key; a single object yields a one-element list.
    pub fn into_objects<T: DeserializeOwned>(self) -> Result<Vec<T>, MappingError> {
        match self.value {
            Value::Array(items) => items
                .into_iter()
                .map(|v| serde_json::from_value(v).map_err(MappingError::from))
                .collect(),
            other => Ok(vec![serde_json::from_value(other)?]),
        }
    }
}

fn get_keypath<'a>(value: &'a Value, keypath: &str) -> Option<&'a Value> {
    keypath
        .split('.')
        .try_fold(value, |v, part| v.as_object()?.get(part))
}

fn set_keypath(target: &mut Value, keypath: &str, value: Value) {
    let mut parts = keypath.split('.').peekable();
    let mut cur = target;
    while let Some(part) = parts.next() {
        if !cur.is_object() {
            *cur = Value::Object(Map::new());
        }
        let Some(map) = cur.as_object_mut() else {
            return;
        };
        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return;
        }
        cur = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("wire key {0:?} is already mapped")]
    Conflict(String),
    #[error("mapping for {0:?} has no attributes")]
    NoAttributes(String),
    #[error("wire key must not be empty")]
    EmptyKey,
    #[error("no mapping registered for {0}")]
    Unmapped(String),
    #[error("payload has no registered wire key")]
    NoRegisteredKey,
    #[error("payload has no {0:?} key")]
    MissingKey(String),
    #[error("{0} does not serialize to a JSON object")]
    NotAnObject(String),
    #[error("expected a single object under {0:?}, found a list")]
    ExpectedObject(String),
    #[error("no resource path routed for {0}")]
    NoResourcePath(String),
    #[error("attribute {0:?} needed by the resource path is missing")]
    MissingAttribute(String),
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Contact {
        identifier: u32,
        first_name: String,
        last_name: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Address {
        city: String,
        street: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Place {
        name: String,
        address: Address,
    }

    fn ada() -> Contact {
        Contact {
            identifier: 7,
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
        }
    }

    fn contact_mapper() -> ObjectMapper {
        let mapper = ObjectMapper::new();
        mapper
            .add_mapping::<Contact>("contacts", &["identifier", "firstName", "lastName"])
            .unwrap();
        mapper
    }

    #[test]
    fn decode_of_encode_is_identity() {
        let mapper = contact_mapper();
        let bytes = mapper.encode(&ada()).unwrap();
        let back: Contact = mapper.deserialize(&bytes).unwrap().into_object().unwrap();
        assert_eq!(back, ada());
        let back: Contact = mapper.decode(&bytes, "contacts").unwrap().into_object().unwrap();
        assert_eq!(back, ada());
    }

    #[test]
    fn duplicate_key_rejected_first_kept() {
        let mapper = contact_mapper();
        let err = mapper.add_mapping::<Place>("contacts", &["name"]).unwrap_err();
        assert!(matches!(err, MappingError::Conflict(k) if k == "contacts"));
        assert_eq!(mapper.mapping_for_key("contacts").unwrap().attributes().len(), 3);
        assert!(mapper.mapping_for::<Place>().is_none());
    }

    #[test]
    fn empty_attributes_or_key_rejected() {
        let mapper = ObjectMapper::new();
        assert!(matches!(
            mapper.add_mapping::<Contact>("contacts", &[]),
            Err(MappingError::NoAttributes(_))
        ));
        assert!(matches!(
            mapper.add_mapping::<Contact>("", &["firstName"]),
            Err(MappingError::EmptyKey)
        ));
    }

    #[test]
    fn only_mapped_attributes_are_sent() {
        let mapper = ObjectMapper::new();
        mapper.add_mapping::<Contact>("people", &["firstName"]).unwrap();
        let s = mapper.serializer_for_object(&ada()).unwrap();
        assert_eq!(s.key(), "people");
        assert_eq!(s.to_value(), json!({"people": {"firstName": "Ada"}}));
    }

    #[test]
    fn nested_keypaths() {
        let mapper = ObjectMapper::new();
        mapper
            .add_mapping::<Place>("places", &["name", "address.city"])
            .unwrap();
        let place = Place {
            name: "Lab".into(),
            address: Address {
                city: "Calgary".into(),
                street: "Main".into(),
            },
        };
        let s = mapper.serializer_for_object(&place).unwrap();
        assert_eq!(
            s.object(),
            &json!({"name": "Lab", "address": {"city": "Calgary"}})
        );
    }

    #[test]
    fn lists_decode_with_into_objects() {
        let mapper = contact_mapper();
        let list = vec![ada(), Contact { identifier: 8, ..ada() }];
        let bytes = mapper.serializer_for_objects(&list).unwrap().to_bytes().unwrap();
        let result = mapper.deserialize(&bytes).unwrap();
        assert!(matches!(
            result.clone().into_object::<Contact>(),
            Err(MappingError::ExpectedObject(_))
        ));
        assert_eq!(result.into_objects::<Contact>().unwrap(), list);
    }

    #[test]
    fn unregistered_payloads() {
        let mapper = contact_mapper();
        assert!(matches!(
            mapper.deserialize(br#"{"other": {}}"#),
            Err(MappingError::NoRegisteredKey)
        ));
        assert!(matches!(
            mapper.decode(br#"{"other": {}}"#, "contacts"),
            Err(MappingError::MissingKey(_))
        ));
        assert!(matches!(
            mapper.encode(&Place {
                name: "x".into(),
                address: Address {
                    city: "c".into(),
                    street: "s".into()
                }
            }),
            Err(MappingError::Unmapped(_))
        ));
    }

    #[test]
    fn resource_path_interpolates_attributes() {
        let mapper = contact_mapper();
        mapper.route_type::<Contact>("/contacts/:identifier").unwrap();
        assert_eq!(mapper.resource_path_for(&ada()).unwrap(), "/contacts/7");

        mapper.route_type::<Place>("/places/:id").unwrap();
        let place = Place {
            name: "Lab".into(),
            address: Address {
                city: "c".into(),
                street: "s".into(),
            },
        };
        assert!(matches!(
            mapper.resource_path_for(&place),
            Err(MappingError::MissingAttribute(a)) if a == "id"
        ));
    }
}
