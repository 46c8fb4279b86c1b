//! Conversion of CRD OpenAPI v3 schemas into provider schemas.
//!
//! Each property of a CRD version's `openAPIV3Schema` becomes either an
//! [`Attribute`] or a [`NestedBlock`], named with [`snake_case`] and bound to
//! the original field through its JSON name:
//!
//! | OpenAPI                                          | Schema                  |
//! |--------------------------------------------------|-------------------------|
//! | `string` / `integer` / `number` / `boolean`      | primitive attribute     |
//! | `object` with `properties`                       | single block            |
//! | `array` of objects with `properties`             | list block              |
//! | `object` with `additionalProperties.properties`  | map block               |
//! | `object` with scalar `additionalProperties`      | map attribute           |
//! | `array` of anything else                         | list attribute          |
//! | int-or-string, preserve-unknown, untyped         | dynamic attribute       |

use std::collections::BTreeSet;

use regex::Regex;
use serde_json::Value;

use crate::naming::snake_case;
use crate::schema::{
    Attribute, AttributeFlags, AttributeType, Block, NestedBlock, Validator,
};

/// Root properties the provider manages itself.
const RESERVED_ROOT_FIELDS: [&str; 4] = ["apiVersion", "kind", "metadata", "status"];

/// Whether converted fields are set by the user or only read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionMode {
    /// Resources and manifest data sources: required/optional with validators.
    Configurable,
    /// Data sources: every field is computed.
    Computed,
}

/// Convert the root of an `openAPIV3Schema` into a block of top-level fields.
///
/// `apiVersion`, `kind`, `metadata` and `status` are skipped.
pub fn convert_root(open_api: &Value, mode: ConversionMode) -> Block {
    convert_object(open_api, mode, &RESERVED_ROOT_FIELDS)
}

fn convert_object(schema: &Value, mode: ConversionMode, skip: &[&str]) -> Block {
    let mut block = Block::new();
    if let Some(description) = schema.get("description").and_then(Value::as_str) {
        block = block.with_description(description);
    }

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return block;
    };
    let required = required_fields(schema);

    for (json_name, prop) in properties {
        if skip.contains(&json_name.as_str()) {
            continue;
        }
        let mut name = snake_case(json_name);
        if name.starts_with(|c: char| c.is_ascii_digit()) {
            name.insert(0, '_');
        }
        if name.is_empty() {
            tracing::warn!(field = %json_name, "Skipping field with no usable name");
            continue;
        }
        if block.attributes.contains_key(&name) || block.blocks.contains_key(&name) {
            tracing::warn!(field = %json_name, name = %name, "Skipping field whose name collides with another field");
            continue;
        }

        let is_required = mode == ConversionMode::Configurable && required.contains(json_name.as_str());
        match convert_property(json_name, prop, is_required, mode) {
            Converted::Attribute(attr) => {
                block.attributes.insert(name, attr);
            },
            Converted::Block(nested) => {
                block.blocks.insert(name, nested);
            },
        }
    }
    block
}

enum Converted {
    Attribute(Attribute),
    Block(NestedBlock),
}

fn convert_property(json_name: &str, prop: &Value, required: bool, mode: ConversionMode) -> Converted {
    let description = prop.get("description").and_then(Value::as_str);

    if let Some(nested) = nested_block(prop, required, mode) {
        let mut nested = nested.with_json_name(json_name);
        if let Some(description) = description {
            nested.block.description = Some(description.to_string());
        }
        return Converted::Block(nested);
    }

    let attr_type = attribute_type(prop);
    let flags = match mode {
        ConversionMode::Computed => AttributeFlags::computed(),
        ConversionMode::Configurable if required => AttributeFlags::required(),
        // the API server fills in defaulted fields
        ConversionMode::Configurable if prop.get("default").is_some() => {
            AttributeFlags::optional_computed()
        },
        ConversionMode::Configurable => AttributeFlags::optional(),
    };

    let mut attr = Attribute::new(attr_type, flags).with_json_name(json_name);
    if let Some(description) = description {
        attr = attr.with_description(description);
    }
    if mode == ConversionMode::Configurable {
        attr.validators = validators(json_name, prop, &attr.attr_type);
    }
    Converted::Attribute(attr)
}

fn nested_block(prop: &Value, required: bool, mode: ConversionMode) -> Option<NestedBlock> {
    if is_dynamic(prop) {
        return None;
    }
    let configurable = mode == ConversionMode::Configurable;

    match schema_type(prop) {
        Some("object") if has_properties(prop) => {
            let nested = NestedBlock::single(convert_object(prop, mode, &[]));
            Some(if required { nested.with_min_items(1) } else { nested })
        },
        Some("object") => {
            let additional = prop.get("additionalProperties")?;
            if !has_properties(additional) || is_dynamic(additional) {
                return None;
            }
            Some(NestedBlock::map(convert_object(additional, mode, &[])))
        },
        Some("array") => {
            let items = prop.get("items")?;
            if !has_properties(items) || is_dynamic(items) || schema_type(items) != Some("object") {
                return None;
            }
            let mut nested = NestedBlock::list(convert_object(items, mode, &[]));
            if configurable {
                let min_items = prop.get("minItems").and_then(Value::as_u64).unwrap_or(0);
                let min_items = if required { min_items.max(1) } else { min_items };
                nested = nested.with_min_items(clamp_u32(min_items));
                if let Some(max_items) = prop.get("maxItems").and_then(Value::as_u64) {
                    nested = nested.with_max_items(clamp_u32(max_items));
                }
            }
            Some(nested)
        },
        _ => None,
    }
}

/// The attribute type for a property that did not become a block.
fn attribute_type(prop: &Value) -> AttributeType {
    if is_dynamic(prop) {
        return AttributeType::Dynamic;
    }
    match schema_type(prop) {
        Some("string") => AttributeType::String,
        Some("integer") => AttributeType::Int64,
        Some("number") => AttributeType::Float64,
        Some("boolean") => AttributeType::Bool,
        Some("array") => match prop.get("items") {
            Some(items) => AttributeType::list(attribute_type(items)),
            None => AttributeType::list(AttributeType::Dynamic),
        },
        Some("object") => match prop.get("additionalProperties") {
            Some(additional @ Value::Object(_)) if !has_properties(additional) => {
                AttributeType::map(attribute_type(additional))
            },
            _ => AttributeType::Dynamic,
        },
        _ => AttributeType::Dynamic,
    }
}

fn validators(json_name: &str, prop: &Value, attr_type: &AttributeType) -> Vec<Validator> {
    let mut validators = Vec::new();

    if *attr_type == AttributeType::String {
        let min = prop.get("minLength").and_then(Value::as_u64);
        let max = prop.get("maxLength").and_then(Value::as_u64);
        if min.is_some() || max.is_some() {
            validators.push(Validator::length(min, max));
        }

        if let Some(pattern) = prop.get("pattern").and_then(Value::as_str) {
            match Regex::new(pattern) {
                Ok(_) => validators.push(Validator::pattern(pattern)),
                Err(e) => {
                    tracing::warn!(field = %json_name, pattern = %pattern, error = %e, "Dropping pattern that does not compile");
                },
            }
        }
    }

    if attr_type.is_numeric() {
        let min = prop.get("minimum").and_then(Value::as_f64);
        let max = prop.get("maximum").and_then(Value::as_f64);
        if min.is_some() || max.is_some() {
            validators.push(Validator::range(min, max));
        }
    }

    if attr_type.is_primitive() {
        if let Some(values) = prop.get("enum").and_then(Value::as_array) {
            let values: Vec<Value> = values.iter().filter(|v| !v.is_null()).cloned().collect();
            if !values.is_empty() {
                validators.push(Validator::one_of(values));
            }
        }
    }

    validators
}

fn schema_type(prop: &Value) -> Option<&str> {
    prop.get("type").and_then(Value::as_str)
}

fn has_properties(prop: &Value) -> bool {
    prop.get("properties")
        .and_then(Value::as_object)
        .is_some_and(|properties| !properties.is_empty())
}

fn flag(prop: &Value, name: &str) -> bool {
    prop.get(name).and_then(Value::as_bool).unwrap_or(false)
}

/// Fields whose shape the API server does not constrain.
fn is_dynamic(prop: &Value) -> bool {
    if flag(prop, "x-kubernetes-int-or-string") {
        return true;
    }
    if flag(prop, "x-kubernetes-preserve-unknown-fields") && !has_properties(prop) {
        return true;
    }
    (prop.get("anyOf").is_some() || prop.get("oneOf").is_some()) && schema_type(prop).is_none()
}

fn required_fields(schema: &Value) -> BTreeSet<&str> {
    schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
