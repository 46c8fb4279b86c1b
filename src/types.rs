//! Plain Rust types exchanged between [`crate::ProviderService`] and the gRPC layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One leaf that differs between prior and planned state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeChange {
    /// Dot-separated path to the attribute, e.g. `spec.issuer_ref.name`.
    pub path: String,
    /// The value before the change, `None` when the attribute is new.
    pub before: Option<Value>,
    /// The value after the change, `None` when the attribute is removed.
    pub after: Option<Value>,
}

impl AttributeChange {
    #[allow(missing_docs)]
    pub fn new(path: impl Into<String>, before: Option<Value>, after: Option<Value>) -> Self {
        Self {
            path: path.into(),
            before,
            after,
        }
    }

    /// A value that appears in the proposed state only.
    pub fn added(path: impl Into<String>, value: Value) -> Self {
        Self::new(path, None, Some(value))
    }

    /// A value that disappears from the proposed state.
    pub fn removed(path: impl Into<String>, value: Value) -> Self {
        Self::new(path, Some(value), None)
    }

    /// A value that differs between prior and proposed state.
    pub fn modified(path: impl Into<String>, before: Value, after: Value) -> Self {
        Self::new(path, Some(before), Some(after))
    }
}

fn decode_optional(bytes: &[u8]) -> Option<Value> {
    if bytes.is_empty() {
        None
    } else {
        serde_json::from_slice(bytes).ok()
    }
}

fn encode_optional(value: Option<Value>) -> Vec<u8> {
    value
        .and_then(|v| serde_json::to_vec(&v).ok())
        .unwrap_or_default()
}

impl From<crate::generated::AttributeChange> for AttributeChange {
    fn from(proto: crate::generated::AttributeChange) -> Self {
        Self {
            path: proto.path,
            before: decode_optional(&proto.before),
            after: decode_optional(&proto.after),
        }
    }
}

impl From<AttributeChange> for crate::generated::AttributeChange {
    fn from(change: AttributeChange) -> Self {
        Self {
            path: change.path,
            before: encode_optional(change.before),
            after: encode_optional(change.after),
        }
    }
}

/// What `Plan` proposes for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    /// State the host should expect after apply; `id`, `api_version` and `kind` are filled in.
    pub planned_state: Value,
    /// Leaf differences, see [`crate::plan::diff`].
    pub changes: Vec<AttributeChange>,
    /// Whether a changed attribute forces the object to be recreated.
    pub requires_replace: bool,
}

impl PlanResult {
    /// Prior state carried over unchanged.
    pub fn no_change(state: Value) -> Self {
        Self {
            planned_state: state,
            changes: Vec::new(),
            requires_replace: false,
        }
    }

    #[allow(missing_docs)]
    pub fn with_changes(
        planned_state: Value,
        changes: Vec<AttributeChange>,
        requires_replace: bool,
    ) -> Self {
        Self {
            planned_state,
            changes,
            requires_replace,
        }
    }

    /// False when prior and planned state agree.
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }
}

/// An object brought under management by an import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportedResource {
    /// Type name, e.g. `k8s_example_com_widget_v1`.
    pub resource_type: String,
    /// State read back from the cluster.
    pub state: Value,
}

impl ImportedResource {
    #[allow(missing_docs)]
    pub fn new(resource_type: impl Into<String>, state: Value) -> Self {
        Self {
            resource_type: resource_type.into(),
            state,
        }
    }
}

/// Type names advertised through `GetMetadata`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProviderMetadata {
    /// One per served CRD version.
    pub resources: Vec<String>,
    /// Data source type names, manifest data sources included.
    pub data_sources: Vec<String>,
    #[allow(missing_docs)]
    pub capabilities: ServerCapabilities,
}

/// Optional protocol features the provider implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServerCapabilities {
    /// Destroy plans arrive as `Plan` with a null proposed state.
    pub plan_destroy: bool,
}

/// Second field of the handshake line.
pub const PROTOCOL_VERSION: u32 = 1;

/// First field of the handshake line printed to stdout.
pub const HANDSHAKE_PREFIX: &str = "KUBECRD_PROVIDER";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_attribute_change_constructors() {
        let added = AttributeChange::added("metadata.labels.app", json!("web"));
        assert!(added.before.is_none());
        assert_eq!(added.after, Some(json!("web")));

        let removed = AttributeChange::removed("spec.duration", json!("1h"));
        assert_eq!(removed.before, Some(json!("1h")));
        assert!(removed.after.is_none());

        let modified = AttributeChange::modified("spec.replicas", json!(1), json!(2));
        assert_eq!(modified.before, Some(json!(1)));
        assert_eq!(modified.after, Some(json!(2)));
    }

    #[test]
    fn test_attribute_change_to_proto() {
        let proto: crate::generated::AttributeChange =
            AttributeChange::added("spec.secret_name", json!("tls")).into();
        assert_eq!(proto.path, "spec.secret_name");
        assert!(proto.before.is_empty());
        assert_eq!(proto.after, b"\"tls\"".to_vec());

        let back: AttributeChange = proto.into();
        assert_eq!(back.before, None);
        assert_eq!(back.after, Some(json!("tls")));
    }

    #[test]
    fn test_plan_result() {
        let no_change = PlanResult::no_change(json!({"id": "default/demo"}));
        assert!(!no_change.has_changes());
        assert!(!no_change.requires_replace);

        let replace = PlanResult::with_changes(
            json!({"metadata": {"name": "other"}}),
            vec![AttributeChange::modified(
                "metadata.name",
                json!("demo"),
                json!("other"),
            )],
            true,
        );
        assert!(replace.has_changes());
        assert!(replace.requires_replace);
    }
}
