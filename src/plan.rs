//! Planning: the difference between prior and proposed state.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use crate::catalog::{API_VERSION, ID, KIND};
use crate::model::ObjectKey;
use crate::schema::{Block, BlockNestingMode, Schema};
use crate::types::{AttributeChange, PlanResult};

/// Leaf changes between two state values.
///
/// Objects are compared key by key; arrays and scalars are compared whole.
/// Null, absent and (for nesting) empty objects are the same thing.
pub fn diff(prior: &Value, planned: &Value) -> Vec<AttributeChange> {
    let mut changes = Vec::new();
    diff_into(prior, planned, "", &mut changes);
    changes
}

fn diff_into(prior: &Value, planned: &Value, path: &str, changes: &mut Vec<AttributeChange>) {
    match (prior, planned) {
        (Value::Object(before), Value::Object(after)) => diff_fields(before, after, path, changes),
        (Value::Null, Value::Object(after)) => diff_fields(&Map::new(), after, path, changes),
        (Value::Object(before), Value::Null) => diff_fields(before, &Map::new(), path, changes),
        (before, after) if before == after => {},
        (Value::Null, after) => changes.push(AttributeChange::added(path, after.clone())),
        (before, Value::Null) => changes.push(AttributeChange::removed(path, before.clone())),
        (before, after) => changes.push(AttributeChange::modified(path, before.clone(), after.clone())),
    }
}

fn diff_fields(
    before: &Map<String, Value>,
    after: &Map<String, Value>,
    path: &str,
    changes: &mut Vec<AttributeChange>,
) {
    let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    for key in keys {
        let child = if path.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", path, key)
        };
        diff_into(
            before.get(key).unwrap_or(&Value::Null),
            after.get(key).unwrap_or(&Value::Null),
            &child,
            changes,
        );
    }
}

/// Plan a create (`prior` is `None`) or an update.
///
/// Computed attributes the proposal leaves null keep their prior value, and
/// `id`, `api_version` and `kind` are stamped. The plan requires replacement
/// when a force-new attribute such as `metadata.name` changes.
pub fn plan(
    api_version: &str,
    kind: &str,
    schema: &Schema,
    prior: Option<&Value>,
    proposed: &Value,
) -> PlanResult {
    let mut planned = proposed.clone();

    if let (Some(Value::Object(prior_fields)), Value::Object(planned_fields)) = (prior, &mut planned) {
        carry_computed(&schema.block, prior_fields, planned_fields);
    }

    if let Value::Object(fields) = &mut planned {
        if let Some(key) = ObjectKey::from_metadata(proposed) {
            fields.insert(ID.to_string(), Value::String(key.to_string()));
        }
        fields.insert(API_VERSION.to_string(), Value::String(api_version.to_string()));
        fields.insert(KIND.to_string(), Value::String(kind.to_string()));
    }

    let Some(prior) = prior else {
        let changes = diff(&Value::Null, &planned);
        return PlanResult::with_changes(planned, changes, false);
    };

    let changes = diff(prior, &planned);
    let requires_replace = changes
        .iter()
        .any(|change| schema.attribute_at(&change.path).is_some_and(|attr| attr.force_new));

    if changes.is_empty() {
        PlanResult::no_change(planned)
    } else {
        PlanResult::with_changes(planned, changes, requires_replace)
    }
}

fn carry_computed(block: &Block, prior: &Map<String, Value>, planned: &mut Map<String, Value>) {
    for (name, attr) in &block.attributes {
        if !attr.flags.computed {
            continue;
        }
        let unset = planned.get(name).map_or(true, Value::is_null);
        if let (true, Some(value)) = (unset, prior.get(name)) {
            planned.insert(name.clone(), value.clone());
        }
    }

    for (name, nested) in &block.blocks {
        let (Some(prior_value), Some(planned_value)) = (prior.get(name), planned.get_mut(name)) else {
            continue;
        };
        match nested.nesting_mode {
            BlockNestingMode::Single => {
                if let (Value::Object(p), Value::Object(n)) = (prior_value, planned_value) {
                    carry_computed(&nested.block, p, n);
                }
            },
            BlockNestingMode::List | BlockNestingMode::Set => {
                if let (Value::Array(p), Value::Array(n)) = (prior_value, planned_value) {
                    for (p, n) in p.iter().zip(n.iter_mut()) {
                        if let (Value::Object(p), Value::Object(n)) = (p, n) {
                            carry_computed(&nested.block, p, n);
                        }
                    }
                }
            },
            BlockNestingMode::Map => {
                if let (Value::Object(p), Value::Object(n)) = (prior_value, planned_value) {
                    for (key, n) in n.iter_mut() {
                        if let (Some(Value::Object(p)), Value::Object(n)) = (p.get(key), n) {
                            carry_computed(&nested.block, p, n);
                        }
                    }
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Attribute, AttributeFlags, AttributeType, NestedBlock};
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
                        .with_attribute("name", Attribute::required_string().with_force_new())
                        .with_attribute("namespace", Attribute::required_string().with_force_new())
                        .with_attribute("labels", Attribute::optional_string_map()),
                )
                .with_min_items(1),
            )
            .with_block(
                "spec",
                NestedBlock::single(
                    Block::new()
                        .with_attribute("size", Attribute::optional_int64())
                        .with_attribute(
                            "revision_history_limit",
                            Attribute::new(AttributeType::Int64, AttributeFlags::optional_computed()),
                        ),
                ),
            )
    }

    fn prior() -> Value {
        json!({
            "id": "default/demo",
            "api_version": "example.com/v1",
            "kind": "Widget",
            "metadata": {"name": "demo", "namespace": "default", "labels": {"app": "web"}},
            "spec": {"size": 1, "revision_history_limit": 1}
        })
    }

    #[test]
    fn test_diff() {
        let before = json!({"a": 1, "b": {"c": "x", "d": [1, 2]}, "e": null});
        let after = json!({"a": 1, "b": {"c": "y", "d": [1, 2, 3]}, "e": true, "f": null});
        let changes = diff(&before, &after);
        assert_eq!(
            changes,
            vec![
                AttributeChange::modified("b.c", json!("x"), json!("y")),
                AttributeChange::modified("b.d", json!([1, 2]), json!([1, 2, 3])),
                AttributeChange::added("e", json!(true)),
            ]
        );
    }

    #[test]
    fn test_diff_removed() {
        let changes = diff(&json!({"spec": {"size": 2}}), &json!({"spec": null}));
        assert_eq!(changes, vec![AttributeChange::removed("spec.size", json!(2))]);
    }

    #[test]
    fn test_plan_create() {
        let proposed = json!({
            "id": null,
            "metadata": {"name": "demo", "namespace": "default"},
            "spec": {"size": 1}
        });
        let result = plan("example.com/v1", "Widget", &schema(), None, &proposed);

        assert!(!result.requires_replace);
        assert_eq!(result.planned_state["id"], "default/demo");
        assert_eq!(result.planned_state["api_version"], "example.com/v1");
        assert_eq!(result.planned_state["kind"], "Widget");
        assert!(result
            .changes
            .iter()
            .any(|c| c.path == "metadata.name" && c.after == Some(json!("demo"))));
    }

    #[test]
    fn test_plan_no_change() {
        let proposed = json!({
            "id": null,
            "api_version": null,
            "kind": null,
            "metadata": {"name": "demo", "namespace": "default", "labels": {"app": "web"}},
            "spec": {"size": 1, "revision_history_limit": null}
        });
        let result = plan("example.com/v1", "Widget", &schema(), Some(&prior()), &proposed);

        assert!(!result.has_changes(), "{:?}", result.changes);
        assert_eq!(result.planned_state["spec"]["revision_history_limit"], 1);
    }

    #[test]
    fn test_plan_in_place_update() {
        let mut proposed = prior();
        proposed["spec"]["size"] = json!(3);
        proposed["metadata"]["labels"]["tier"] = json!("frontend");
        let result = plan("example.com/v1", "Widget", &schema(), Some(&prior()), &proposed);

        assert!(!result.requires_replace);
        assert_eq!(
            result.changes,
            vec![
                AttributeChange::added("metadata.labels.tier", json!("frontend")),
                AttributeChange::modified("spec.size", json!(1), json!(3)),
            ]
        );
    }

    #[test]
    fn test_plan_rename_requires_replace() {
        let mut proposed = prior();
        proposed["metadata"]["name"] = json!("other");
        let result = plan("example.com/v1", "Widget", &schema(), Some(&prior()), &proposed);

        assert!(result.requires_replace);
        assert_eq!(result.planned_state["id"], "default/other");
    }
}
