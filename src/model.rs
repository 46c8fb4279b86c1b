//! Schema-driven conversion between provider state and Kubernetes objects.
//!
//! State uses the schema's snake_case names; objects use the JSON names
//! recorded on each attribute and block. Attributes and blocks without a JSON
//! name (`id`, `api_version`, `kind`, `wait_for_delete`, `yaml`) are provider
//! bookkeeping and never reach the API server.

use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::catalog::{API_VERSION, ID, KIND};
use crate::error::ProviderError;
use crate::schema::{Block, BlockNestingMode, NestedBlock, Schema};

/// A value did not have the shape its schema requires.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("expected {expected} at {}", display_path(.path))]
pub struct ShapeError {
    /// Dot-separated path of the offending value.
    pub path: String,
    /// What the schema expects there.
    pub expected: &'static str,
}

fn display_path(path: &str) -> &str {
    if path.is_empty() {
        "the root"
    } else {
        path
    }
}

/// The namespace and name of one object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// Namespace; `None` for cluster-scoped objects.
    pub namespace: Option<String>,
    /// Object name.
    pub name: String,
}

impl ObjectKey {
    /// Key of a namespaced object.
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key of a cluster-scoped object.
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Read the key from the `metadata` of a state or object value.
    pub fn from_metadata(value: &Value) -> Option<Self> {
        let metadata = value.get("metadata")?;
        let name = metadata.get("name")?.as_str()?.to_string();
        let namespace = metadata
            .get("namespace")
            .and_then(Value::as_str)
            .map(str::to_string);
        Some(Self { namespace, name })
    }

    /// Parse an import id: `namespace/name` for namespaced kinds, `name` otherwise.
    pub fn parse(id: &str, namespaced: bool) -> Result<Self, ProviderError> {
        let invalid = |expected: &str| {
            ProviderError::InvalidRequest(format!(
                "Invalid import id {:?}: expected {}",
                id, expected
            ))
        };

        if namespaced {
            match id.split_once('/') {
                Some((namespace, name))
                    if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
                {
                    Ok(Self::namespaced(namespace, name))
                },
                _ => Err(invalid("<namespace>/<name>")),
            }
        } else if id.is_empty() || id.contains('/') {
            Err(invalid("<name>"))
        } else {
            Ok(Self::cluster(id))
        }
    }

    /// The namespace as a borrowed `Option<&str>`.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
}

/// Formats as the state id: `namespace/name` or `name`.
impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}/{}", namespace, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Build the Kubernetes object for a state value.
///
/// Null values and provider-only attributes are dropped; `apiVersion` and
/// `kind` are stamped.
pub fn to_object(
    api_version: &str,
    kind: &str,
    schema: &Schema,
    state: &Value,
) -> Result<Value, ShapeError> {
    let state = expect_object(state, "")?;
    let mut object = Map::new();
    object.insert("apiVersion".to_string(), Value::String(api_version.to_string()));
    object.insert("kind".to_string(), Value::String(kind.to_string()));
    object.extend(block_to_object(&schema.block, state, "")?);
    Ok(Value::Object(object))
}

fn block_to_object(
    block: &Block,
    state: &Map<String, Value>,
    path: &str,
) -> Result<Map<String, Value>, ShapeError> {
    let mut object = Map::new();

    for (name, attr) in &block.attributes {
        let Some(json_name) = &attr.json_name else { continue };
        match state.get(name) {
            None | Some(Value::Null) => {},
            Some(value) => {
                object.insert(json_name.clone(), value.clone());
            },
        }
    }

    for (name, nested) in &block.blocks {
        let Some(json_name) = &nested.json_name else { continue };
        let value = match state.get(name) {
            None | Some(Value::Null) => continue,
            Some(value) => value,
        };
        let nested_path = join(path, name);
        object.insert(json_name.clone(), nested_to_object(nested, value, &nested_path)?);
    }

    Ok(object)
}

fn nested_to_object(nested: &NestedBlock, value: &Value, path: &str) -> Result<Value, ShapeError> {
    match nested.nesting_mode {
        BlockNestingMode::Single => {
            let fields = expect_object(value, path)?;
            Ok(Value::Object(block_to_object(&nested.block, fields, path)?))
        },
        BlockNestingMode::List | BlockNestingMode::Set => {
            let items = expect_array(value, path)?;
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                let item_path = join(path, &i.to_string());
                let fields = expect_object(item, &item_path)?;
                out.push(Value::Object(block_to_object(&nested.block, fields, &item_path)?));
            }
            Ok(Value::Array(out))
        },
        BlockNestingMode::Map => {
            let entries = expect_object(value, path)?;
            let mut out = Map::new();
            for (key, item) in entries {
                let item_path = join(path, key);
                let fields = expect_object(item, &item_path)?;
                out.insert(
                    key.clone(),
                    Value::Object(block_to_object(&nested.block, fields, &item_path)?),
                );
            }
            Ok(Value::Object(out))
        },
    }
}

/// Build the state value for a Kubernetes object returned by the server.
///
/// Fields missing from the object become null. Provider-only attributes are
/// copied from `carry` (the prior state or configuration). `id`,
/// `api_version` and `kind` are stamped, falling back to the given
/// `api_version`/`kind` when the object lacks them.
pub fn from_object(
    api_version: &str,
    kind: &str,
    schema: &Schema,
    object: &Value,
    carry: Option<&Value>,
) -> Result<Value, ShapeError> {
    let fields = expect_object(object, "")?;
    let carry = carry.and_then(Value::as_object);
    let mut state = block_from_object(&schema.block, fields, carry, "")?;

    let key = ObjectKey::from_metadata(object).ok_or(ShapeError {
        path: "metadata.name".to_string(),
        expected: "string",
    })?;
    let api_version = object
        .get("apiVersion")
        .and_then(Value::as_str)
        .unwrap_or(api_version);
    let kind = object.get("kind").and_then(Value::as_str).unwrap_or(kind);

    state.insert(ID.to_string(), Value::String(key.to_string()));
    state.insert(API_VERSION.to_string(), Value::String(api_version.to_string()));
    state.insert(KIND.to_string(), Value::String(kind.to_string()));
    Ok(Value::Object(state))
}

fn carried(carry: Option<&Map<String, Value>>, name: &str) -> Value {
    carry
        .and_then(|carry| carry.get(name))
        .cloned()
        .unwrap_or(Value::Null)
}

fn block_from_object(
    block: &Block,
    object: &Map<String, Value>,
    carry: Option<&Map<String, Value>>,
    path: &str,
) -> Result<Map<String, Value>, ShapeError> {
    let mut state = Map::new();

    for (name, attr) in &block.attributes {
        let value = match &attr.json_name {
            Some(json_name) => object.get(json_name).cloned().unwrap_or(Value::Null),
            None => carried(carry, name),
        };
        state.insert(name.clone(), value);
    }

    for (name, nested) in &block.blocks {
        let value = match &nested.json_name {
            None => carried(carry, name),
            Some(json_name) => match object.get(json_name) {
                None | Some(Value::Null) => Value::Null,
                Some(value) => {
                    let nested_carry = carry.and_then(|carry| carry.get(name));
                    nested_from_object(nested, value, nested_carry, &join(path, name))?
                },
            },
        };
        state.insert(name.clone(), value);
    }

    Ok(state)
}

fn nested_from_object(
    nested: &NestedBlock,
    value: &Value,
    carry: Option<&Value>,
    path: &str,
) -> Result<Value, ShapeError> {
    match nested.nesting_mode {
        BlockNestingMode::Single => {
            let fields = expect_object(value, path)?;
            let carry = carry.and_then(Value::as_object);
            Ok(Value::Object(block_from_object(&nested.block, fields, carry, path)?))
        },
        BlockNestingMode::List | BlockNestingMode::Set => {
            let items = expect_array(value, path)?;
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                let item_path = join(path, &i.to_string());
                let fields = expect_object(item, &item_path)?;
                let item_carry = carry
                    .and_then(|carry| carry.get(i))
                    .and_then(Value::as_object);
                out.push(Value::Object(block_from_object(
                    &nested.block,
                    fields,
                    item_carry,
                    &item_path,
                )?));
            }
            Ok(Value::Array(out))
        },
        BlockNestingMode::Map => {
            let entries = expect_object(value, path)?;
            let mut out = Map::new();
            for (key, item) in entries {
                let item_path = join(path, key);
                let fields = expect_object(item, &item_path)?;
                let item_carry = carry
                    .and_then(|carry| carry.get(key))
                    .and_then(Value::as_object);
                out.insert(
                    key.clone(),
                    Value::Object(block_from_object(&nested.block, fields, item_carry, &item_path)?),
                );
            }
            Ok(Value::Object(out))
        },
    }
}

/// Render an object as a YAML manifest.
pub fn to_yaml(object: &Value) -> Result<String, serde_yaml::Error> {
    serde_yaml::to_string(object)
}

fn expect_object<'a>(value: &'a Value, path: &str) -> Result<&'a Map<String, Value>, ShapeError> {
    value.as_object().ok_or_else(|| ShapeError {
        path: path.to_string(),
        expected: "object",
    })
}

fn expect_array<'a>(value: &'a Value, path: &str) -> Result<&'a Vec<Value>, ShapeError> {
    value.as_array().ok_or_else(|| ShapeError {
        path: path.to_string(),
        expected: "list",
    })
}

fn join(base: &str, segment: &str) -> String {
    if base.is_empty() {
        segment.to_string()
    } else {
        format!("{}.{}", base, segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Attribute, AttributeType, AttributeFlags};
    use serde_json::json;

    fn schema() -> Schema {
        Schema::v0()
            .with_attribute(ID, Attribute::computed_string())
            .with_attribute(API_VERSION, Attribute::computed_string())
            .with_attribute(KIND, Attribute::computed_string())
            .with_block(
                "metadata",
                NestedBlock::single(
                    Block::new()
                        .with_attribute("name", Attribute::required_string().with_json_name("name"))
                        .with_attribute(
                            "namespace",
                            Attribute::required_string().with_json_name("namespace"),
                        )
                        .with_attribute(
                            "labels",
                            Attribute::optional_string_map().with_json_name("labels"),
                        ),
                )
                .with_json_name("metadata"),
            )
            .with_block(
                "spec",
                NestedBlock::single(
                    Block::new()
                        .with_attribute(
                            "secret_name",
                            Attribute::required_string().with_json_name("secretName"),
                        )
                        .with_attribute(
                            "dns_names",
                            Attribute::new(
                                AttributeType::list(AttributeType::String),
                                AttributeFlags::optional(),
                            )
                            .with_json_name("dnsNames"),
                        )
                        .with_block(
                            "issuer_ref",
                            NestedBlock::single(Block::new().with_attribute(
                                "name",
                                Attribute::required_string().with_json_name("name"),
                            ))
                            .with_json_name("issuerRef"),
                        )
                        .with_block(
                            "ports",
                            NestedBlock::list(Block::new().with_attribute(
                                "container_port",
                                Attribute::optional_int64().with_json_name("containerPort"),
                            ))
                            .with_json_name("ports"),
                        ),
                )
                .with_json_name("spec"),
            )
            .with_block(
                "wait_for_delete",
                NestedBlock::single(
                    Block::new().with_attribute("timeout", Attribute::optional_string()),
                ),
            )
    }

    fn state() -> Value {
        json!({
            "id": null,
            "api_version": null,
            "kind": null,
            "metadata": {"name": "demo", "namespace": "default", "labels": {"app": "web"}},
            "spec": {
                "secret_name": "demo-tls",
                "dns_names": ["example.com"],
                "issuer_ref": {"name": "letsencrypt"},
                "ports": [{"container_port": 8443}]
            },
            "wait_for_delete": {"timeout": "1m"}
        })
    }

    #[test]
    fn test_to_object() {
        let object = to_object("cert-manager.io/v1", "Certificate", &schema(), &state()).unwrap();
        assert_eq!(
            object,
            json!({
                "apiVersion": "cert-manager.io/v1",
                "kind": "Certificate",
                "metadata": {"name": "demo", "namespace": "default", "labels": {"app": "web"}},
                "spec": {
                    "secretName": "demo-tls",
                    "dnsNames": ["example.com"],
                    "issuerRef": {"name": "letsencrypt"},
                    "ports": [{"containerPort": 8443}]
                }
            })
        );
    }

    #[test]
    fn test_to_object_drops_nulls() {
        let state = json!({
            "metadata": {"name": "demo", "namespace": "default", "labels": null},
            "spec": {"secret_name": "demo-tls", "issuer_ref": null}
        });
        let object = to_object("cert-manager.io/v1", "Certificate", &schema(), &state).unwrap();
        assert_eq!(object["metadata"], json!({"name": "demo", "namespace": "default"}));
        assert_eq!(object["spec"], json!({"secretName": "demo-tls"}));
    }

    #[test]
    fn test_to_object_shape_errors() {
        let err = to_object("v1", "Widget", &schema(), &json!([])).unwrap_err();
        assert_eq!(err.to_string(), "expected object at the root");

        let state = json!({"metadata": {"name": "demo"}, "spec": {"ports": {"a": 1}}});
        let err = to_object("v1", "Widget", &schema(), &state).unwrap_err();
        assert_eq!(err, ShapeError { path: "spec.ports".to_string(), expected: "list" });
    }

    #[test]
    fn test_round_trip() {
        let state = state();
        let object = to_object("cert-manager.io/v1", "Certificate", &schema(), &state).unwrap();
        let back =
            from_object("cert-manager.io/v1", "Certificate", &schema(), &object, Some(&state))
                .unwrap();

        assert_eq!(back["metadata"], state["metadata"]);
        assert_eq!(back["spec"], state["spec"]);
        assert_eq!(back["wait_for_delete"], json!({"timeout": "1m"}));
        assert_eq!(back["id"], "default/demo");
        assert_eq!(back["api_version"], "cert-manager.io/v1");
        assert_eq!(back["kind"], "Certificate");
    }

    #[test]
    fn test_from_object_server_fields() {
        let object = json!({
            "apiVersion": "cert-manager.io/v1",
            "kind": "Certificate",
            "metadata": {
                "name": "demo",
                "namespace": "default",
                "uid": "8f9c",
                "resourceVersion": "12",
                "managedFields": []
            },
            "spec": {"secretName": "demo-tls", "issuerRef": {"name": "ca"}},
            "status": {"conditions": []}
        });
        let state = from_object("ignored/v1", "Ignored", &schema(), &object, None).unwrap();

        assert_eq!(
            state["metadata"],
            json!({"name": "demo", "namespace": "default", "labels": null})
        );
        assert_eq!(state["spec"]["dns_names"], Value::Null);
        assert_eq!(state["spec"]["ports"], Value::Null);
        assert_eq!(state["spec"]["issuer_ref"], json!({"name": "ca"}));
        assert_eq!(state["wait_for_delete"], Value::Null);
        assert!(state.get("status").is_none());
        assert_eq!(state["api_version"], "cert-manager.io/v1");
    }

    #[test]
    fn test_from_object_requires_name() {
        let err = from_object("v1", "Widget", &schema(), &json!({"metadata": {}}), None).unwrap_err();
        assert_eq!(err.path, "metadata.name");
    }

    #[test]
    fn test_object_key() {
        assert_eq!(ObjectKey::namespaced("default", "demo").to_string(), "default/demo");
        assert_eq!(ObjectKey::cluster("demo").to_string(), "demo");

        let key = ObjectKey::from_metadata(&json!({"metadata": {"name": "demo"}})).unwrap();
        assert_eq!(key, ObjectKey::cluster("demo"));
        assert!(ObjectKey::from_metadata(&json!({"spec": {}})).is_none());
    }

    #[test]
    fn test_parse_import_id() {
        assert_eq!(
            ObjectKey::parse("default/demo", true).unwrap(),
            ObjectKey::namespaced("default", "demo")
        );
        assert_eq!(ObjectKey::parse("demo", false).unwrap(), ObjectKey::cluster("demo"));

        for id in ["demo", "/demo", "default/", "a/b/c", ""] {
            assert!(ObjectKey::parse(id, true).is_err(), "{:?}", id);
        }
        for id in ["default/demo", ""] {
            assert!(ObjectKey::parse(id, false).is_err(), "{:?}", id);
        }
    }

    #[test]
    fn test_to_yaml() {
        let yaml = to_yaml(&json!({"apiVersion": "example.com/v1", "kind": "Widget"})).unwrap();
        assert!(yaml.contains("apiVersion: example.com/v1"));
        assert!(yaml.contains("kind: Widget"));
    }
}
