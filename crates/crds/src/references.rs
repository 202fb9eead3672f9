//! Kubernetes object references for Forklift CRDs
//!
//! Plans, maps and migrations reference each other by name and optional namespace.
//! Source inventory objects (VMs, networks, datastores) are referenced by `id` and/or `name`.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to another namespaced object
///
/// When `namespace` is omitted the referencing object's namespace is assumed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    /// Name of the referenced object
    pub name: String,

    /// Namespace of the referenced object (defaults to the referencing object's namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ResourceRef {
    /// Create a reference in the same namespace
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
        }
    }

    /// Create a reference with an explicit namespace
    pub fn with_namespace(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
        }
    }

    /// Namespace to look the object up in
    pub fn namespace_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(default)
    }
}

/// Reference to an object in a provider's inventory
///
/// Either field may be empty; `id` wins on lookup.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    /// Inventory identifier
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    /// Inventory name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

impl SourceRef {
    /// Reference by identifier
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
        }
    }

    /// Reference by name
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
        }
    }

    /// True when this reference denotes the inventory object with the given id and name
    pub fn matches(&self, id: &str, name: &str) -> bool {
        if !self.id.is_empty() {
            return self.id == id;
        }
        !self.name.is_empty() && self.name == name
    }

    /// The identifier if present, else the name
    pub fn key(&self) -> &str {
        if self.id.is_empty() { &self.name } else { &self.id }
    }
}
