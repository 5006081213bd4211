//! Provider schemas
//!
//! Static lookup tables describing the attributes of each resource type,
//! data source and provider configuration block.

use crate::addrs::{Resource, ResourceMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use valuekit::{Path, PathSet, Value};

/// Flags for a single attribute
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSchema {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub optional: bool,
    /// Set by the provider when not configured
    #[serde(default)]
    pub computed: bool,
    #[serde(default)]
    pub sensitive: bool,
}

impl AttributeSchema {
    pub fn required() -> Self {
        Self {
            required: true,
            ..Self::default()
        }
    }

    pub fn optional() -> Self {
        Self {
            optional: true,
            ..Self::default()
        }
    }

    pub fn computed() -> Self {
        Self {
            computed: true,
            ..Self::default()
        }
    }

    /// Optional and computed: the provider fills it in when not configured
    pub fn optional_computed() -> Self {
        Self {
            optional: true,
            computed: true,
            ..Self::default()
        }
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }
}

/// Attributes of one object type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSchema {
    pub attributes: BTreeMap<String, AttributeSchema>,
}

impl BlockSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style attribute registration
    pub fn attr(mut self, name: impl Into<String>, schema: AttributeSchema) -> Self {
        self.attributes.insert(name.into(), schema);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeSchema> {
        self.attributes.get(name)
    }

    /// Paths of attributes the schema declares sensitive
    pub fn sensitive_paths(&self) -> PathSet {
        self.attributes
            .iter()
            .filter(|(_, a)| a.sensitive)
            .map(|(name, _)| Path::root().key(name.as_str()))
            .collect()
    }

    /// Attributes that must be present in configuration but are not
    pub fn missing_required(&self, config: &Value) -> Vec<String> {
        self.attributes
            .iter()
            .filter(|(_, a)| a.required)
            .filter(|(name, _)| config.attr(name).is_none_or(Value::is_null))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Fill every declared attribute the value lacks with null, so that
    /// values from configuration and from providers compare like for like
    pub fn normalize(&self, value: Value) -> Value {
        match value {
            Value::Object(mut attrs) => {
                for name in self.attributes.keys() {
                    attrs.entry(name.clone()).or_insert(Value::Null);
                }
                Value::Object(attrs)
            }
            Value::Null if !self.attributes.is_empty() => Value::Object(
                self.attributes
                    .keys()
                    .map(|k| (k.clone(), Value::Null))
                    .collect(),
            ),
            other => other,
        }
    }

    /// True for attributes that only the provider sets
    pub fn is_computed_only(&self, name: &str) -> bool {
        self.attribute(name)
            .is_some_and(|a| a.computed && !a.optional && !a.required)
    }
}

/// Everything a provider declares about itself
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSchema {
    /// Provider configuration block
    pub provider: BlockSchema,
    pub resource_types: BTreeMap<String, BlockSchema>,
    pub data_sources: BTreeMap<String, BlockSchema>,
}

impl ProviderSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, block: BlockSchema) -> Self {
        self.provider = block;
        self
    }

    pub fn with_resource(mut self, type_name: impl Into<String>, block: BlockSchema) -> Self {
        self.resource_types.insert(type_name.into(), block);
        self
    }

    pub fn with_data_source(mut self, type_name: impl Into<String>, block: BlockSchema) -> Self {
        self.data_sources.insert(type_name.into(), block);
        self
    }
}

/// Schemas of every registered provider, by provider type name
#[derive(Debug, Clone, Default)]
pub struct Schemas {
    providers: BTreeMap<String, ProviderSchema>,
}

impl Schemas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, provider_type: impl Into<String>, schema: ProviderSchema) {
        self.providers.insert(provider_type.into(), schema);
    }

    pub fn provider(&self, provider_type: &str) -> Option<&ProviderSchema> {
        self.providers.get(provider_type)
    }

    /// Schema of a managed resource type or data source
    pub fn resource(&self, provider_type: &str, resource: &Resource) -> Option<&BlockSchema> {
        let schema = self.providers.get(provider_type)?;
        match resource.mode {
            ResourceMode::Managed => schema.resource_types.get(&resource.type_name),
            ResourceMode::Data => schema.data_sources.get(&resource.type_name),
        }
    }

    /// Marks the schema imposes on a resource's value
    pub fn sensitive_paths(&self, provider_type: &str, resource: &Resource) -> PathSet {
        self.resource(provider_type, resource)
            .map(BlockSchema::sensitive_paths)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> BlockSchema {
        BlockSchema::new()
            .attr("id", AttributeSchema::computed())
            .attr("name", AttributeSchema::required())
            .attr("password", AttributeSchema::optional().sensitive())
    }

    #[test]
    fn test_sensitive_paths() {
        let paths = block().sensitive_paths();
        assert_eq!(paths.len(), 1);
        assert!(paths.contains(&Path::root().key("password")));
    }

    #[test]
    fn test_normalize_fills_nulls() {
        let value = block().normalize(Value::object([("name", Value::from("x"))]));
        assert_eq!(value.attr("id"), Some(&Value::Null));
        assert_eq!(value.attr("name"), Some(&Value::from("x")));
        assert_eq!(block().normalize(Value::Null).as_object().map(|m| m.len()), Some(3));
    }

    #[test]
    fn test_missing_required() {
        assert_eq!(block().missing_required(&Value::empty_object()), vec!["name"]);
        assert!(
            block()
                .missing_required(&Value::object([("name", Value::from("a"))]))
                .is_empty()
        );
    }

    #[test]
    fn test_schemas_lookup_by_mode() {
        let mut schemas = Schemas::new();
        schemas.insert(
            "test",
            ProviderSchema::new()
                .with_resource("test_object", block())
                .with_data_source("test_data", BlockSchema::new()),
        );
        assert!(schemas.resource("test", &Resource::managed("test_object", "a")).is_some());
        assert!(schemas.resource("test", &Resource::data("test_object", "a")).is_none());
        assert!(schemas.resource("test", &Resource::data("test_data", "d")).is_some());
        assert_eq!(
            schemas
                .sensitive_paths("test", &Resource::managed("test_object", "a"))
                .len(),
            1
        );
        assert!(schemas.provider("other").is_none());
    }

    #[test]
    fn test_computed_only() {
        assert!(block().is_computed_only("id"));
        assert!(!block().is_computed_only("name"));
        assert!(!block().is_computed_only("missing"));
    }
}
