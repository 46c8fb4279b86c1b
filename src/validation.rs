//! Schema validation helpers.
//!
//! Two checks live here:
//!
//! - [`validate`] checks a configuration value against a [`Schema`]: required
//!   attributes, types, nested block cardinality and the static [`Validator`]s.
//! - [`check_schema`] checks that a schema itself is well-formed, which every
//!   schema derived from a CRD must satisfy before it is served.
//!
//! # Example
//!
//! ```
//! use kubecrd_provider::schema::{Attribute, Schema, Validator};
//! use kubecrd_provider::validation::validate;
//! use serde_json::json;
//!
//! let schema = Schema::v0().with_attribute(
//!     "replicas",
//!     Attribute::optional_int64().with_validator(Validator::range(Some(0.0), Some(10.0))),
//! );
//!
//! assert!(validate(&schema, &json!({"replicas": 3})).is_empty());
//!
//! let diagnostics = validate(&schema, &json!({"replicas": 42}));
//! assert_eq!(diagnostics.len(), 1);
//! assert_eq!(diagnostics[0].attribute, Some("replicas".to_string()));
//! ```

use crate::schema::{
    Attribute, AttributeType, Block, BlockNestingMode, Diagnostic, NestedBlock, ProviderSchema,
    Schema, Validator,
};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;

/// Validate a JSON value against a schema.
///
/// Returns a list of diagnostics for any validation errors found.
/// An empty list means the value is valid.
///
/// # Validation Rules
///
/// - Required attributes must be present and non-null
/// - Optional attributes may be absent or null
/// - Computed attributes are skipped (provider sets these)
/// - Attribute types must match the schema
/// - Present values must satisfy every validator of their attribute
/// - Nested blocks are validated recursively with min/max item constraints
pub fn validate(schema: &Schema, value: &Value) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    validate_block(&schema.block, value, "", &mut diagnostics);
    diagnostics
}

/// Validate a JSON value against a schema, returning Ok if valid or Err with diagnostics.
pub fn validate_result(schema: &Schema, value: &Value) -> Result<(), Vec<Diagnostic>> {
    let diagnostics = validate(schema, value);
    if diagnostics.is_empty() {
        Ok(())
    } else {
        Err(diagnostics)
    }
}

/// Check if a JSON value is valid against a schema.
pub fn is_valid(schema: &Schema, value: &Value) -> bool {
    validate(schema, value).is_empty()
}

fn validate_block(block: &Block, value: &Value, path: &str, diagnostics: &mut Vec<Diagnostic>) {
    let obj = match value {
        Value::Object(map) => map,
        Value::Null => return,
        _ => {
            diagnostics.push(
                Diagnostic::error("Expected object")
                    .with_detail(format!("Got {}", value_type_name(value)))
                    .with_attribute_if_not_empty(path),
            );
            return;
        },
    };

    for (name, attr) in &block.attributes {
        let attr_path = join_path(path, name);
        validate_attribute(attr, obj.get(name), &attr_path, diagnostics);
    }

    for (name, nested_block) in &block.blocks {
        let block_path = join_path(path, name);
        validate_nested_block(nested_block, obj.get(name), &block_path, diagnostics);
    }
}

fn validate_attribute(
    attr: &Attribute,
    value: Option<&Value>,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    if attr.flags.is_computed_only() {
        return;
    }

    match value {
        None | Some(Value::Null) => {
            if attr.flags.required {
                diagnostics.push(
                    Diagnostic::error(format!("Missing required attribute '{}'", path))
                        .with_detail("This attribute is required and must be provided")
                        .with_attribute(path),
                );
            }
        },
        Some(v) => {
            let before = diagnostics.len();
            validate_attribute_type(&attr.attr_type, v, path, diagnostics);
            if diagnostics.len() == before {
                for validator in &attr.validators {
                    validate_constraint(validator, v, path, diagnostics);
                }
            }
        },
    }
}

fn validate_attribute_type(
    attr_type: &AttributeType,
    value: &Value,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match attr_type {
        AttributeType::String => {
            if !value.is_string() {
                diagnostics.push(type_error(path, "string", value));
            }
        },
        AttributeType::Int64 => {
            if !is_int64(value) {
                diagnostics.push(type_error(path, "int64", value));
            }
        },
        AttributeType::Float64 => {
            if !value.is_number() {
                diagnostics.push(type_error(path, "float64", value));
            }
        },
        AttributeType::Bool => {
            if !value.is_boolean() {
                diagnostics.push(type_error(path, "bool", value));
            }
        },
        AttributeType::List(element_type) | AttributeType::Set(element_type) => {
            if let Some(arr) = value.as_array() {
                for (i, elem) in arr.iter().enumerate() {
                    let elem_path = format!("{}.{}", path, i);
                    validate_attribute_type(element_type, elem, &elem_path, diagnostics);
                }
            } else {
                let expected = if matches!(attr_type, AttributeType::Set(_)) {
                    "set"
                } else {
                    "list"
                };
                diagnostics.push(type_error(path, expected, value));
            }
        },
        AttributeType::Map(value_type) => {
            if let Some(obj) = value.as_object() {
                for (key, val) in obj {
                    let key_path = format!("{}.{}", path, key);
                    validate_attribute_type(value_type, val, &key_path, diagnostics);
                }
            } else {
                diagnostics.push(type_error(path, "map", value));
            }
        },
        AttributeType::Object(attrs) => {
            if let Some(obj) = value.as_object() {
                validate_object_type(attrs, obj, path, diagnostics);
            } else {
                diagnostics.push(type_error(path, "object", value));
            }
        },
        AttributeType::Dynamic => {},
    }
}

fn validate_object_type(
    attrs: &BTreeMap<String, AttributeType>,
    obj: &serde_json::Map<String, Value>,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    for (name, attr_type) in attrs {
        if let Some(value) = obj.get(name) {
            let attr_path = join_path(path, name);
            validate_attribute_type(attr_type, value, &attr_path, diagnostics);
        }
    }
}

fn validate_constraint(
    validator: &Validator,
    value: &Value,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match validator {
        Validator::Length { min, max } => {
            let Some(s) = value.as_str() else { return };
            let len = s.chars().count() as u64;
            let too_short = min.is_some_and(|min| len < min);
            let too_long = max.is_some_and(|max| len > max);
            if too_short || too_long {
                diagnostics.push(
                    Diagnostic::error(format!("Invalid length for attribute '{}'", path))
                        .with_detail(format!(
                            "Length must be {}, got {}",
                            describe_bounds(min.map(|m| m as f64), max.map(|m| m as f64)),
                            len
                        ))
                        .with_attribute(path),
                );
            }
        },
        Validator::Pattern { pattern } => {
            let Some(s) = value.as_str() else { return };
            match Regex::new(pattern) {
                Ok(re) if re.is_match(s) => {},
                Ok(_) => diagnostics.push(
                    Diagnostic::error(format!("Invalid value for attribute '{}'", path))
                        .with_detail(format!("Value {:?} must match pattern {}", s, pattern))
                        .with_attribute(path),
                ),
                Err(e) => diagnostics.push(
                    Diagnostic::error(format!("Invalid pattern for attribute '{}'", path))
                        .with_detail(e.to_string())
                        .with_attribute(path),
                ),
            }
        },
        Validator::OneOf { values } => {
            if !values.iter().any(|allowed| values_equal(allowed, value)) {
                let allowed: Vec<String> = values.iter().map(Value::to_string).collect();
                diagnostics.push(
                    Diagnostic::error(format!("Invalid value for attribute '{}'", path))
                        .with_detail(format!(
                            "Value must be one of [{}], got {}",
                            allowed.join(", "),
                            value
                        ))
                        .with_attribute(path),
                );
            }
        },
        Validator::Range { min, max } => {
            let Some(n) = value.as_f64() else { return };
            let below = min.is_some_and(|min| n < min);
            let above = max.is_some_and(|max| n > max);
            if below || above {
                diagnostics.push(
                    Diagnostic::error(format!("Value out of range for attribute '{}'", path))
                        .with_detail(format!(
                            "Value must be {}, got {}",
                            describe_bounds(*min, *max),
                            value
                        ))
                        .with_attribute(path),
                );
            }
        },
    }
}

/// Compare allowed enum values with configured values, treating `1` and `1.0` alike.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn describe_bounds(min: Option<f64>, max: Option<f64>) -> String {
    match (min, max) {
        (Some(min), Some(max)) => format!("between {} and {}", min, max),
        (Some(min), None) => format!("at least {}", min),
        (None, Some(max)) => format!("at most {}", max),
        (None, None) => "unbounded".to_string(),
    }
}

fn validate_nested_block(
    nested: &NestedBlock,
    value: Option<&Value>,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match nested.nesting_mode {
        BlockNestingMode::Single => validate_single_block(nested, value, path, diagnostics),
        BlockNestingMode::List | BlockNestingMode::Set => {
            validate_list_block(nested, value, path, diagnostics)
        },
        BlockNestingMode::Map => validate_map_block(nested, value, path, diagnostics),
    }
}

fn validate_single_block(
    nested: &NestedBlock,
    value: Option<&Value>,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match value {
        None | Some(Value::Null) => {
            if nested.min_items > 0 {
                diagnostics.push(
                    Diagnostic::error(format!("Missing required block '{}'", path))
                        .with_detail("At least one block is required")
                        .with_attribute(path),
                );
            }
        },
        Some(v) => validate_block(&nested.block, v, path, diagnostics),
    }
}

fn check_item_count(nested: &NestedBlock, len: usize, path: &str, diagnostics: &mut Vec<Diagnostic>) {
    let len = len as u32;
    if len < nested.min_items {
        diagnostics.push(
            Diagnostic::error(format!(
                "Block '{}' requires at least {} item(s), got {}",
                path, nested.min_items, len
            ))
            .with_attribute(path),
        );
    }
    if nested.max_items > 0 && len > nested.max_items {
        diagnostics.push(
            Diagnostic::error(format!(
                "Block '{}' allows at most {} item(s), got {}",
                path, nested.max_items, len
            ))
            .with_attribute(path),
        );
    }
}

fn validate_list_block(
    nested: &NestedBlock,
    value: Option<&Value>,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match value {
        None | Some(Value::Null) => {
            if nested.min_items > 0 {
                diagnostics.push(
                    Diagnostic::error(format!(
                        "Block '{}' requires at least {} item(s)",
                        path, nested.min_items
                    ))
                    .with_attribute(path),
                );
            }
        },
        Some(Value::Array(arr)) => {
            check_item_count(nested, arr.len(), path, diagnostics);
            for (i, item) in arr.iter().enumerate() {
                let item_path = format!("{}.{}", path, i);
                validate_block(&nested.block, item, &item_path, diagnostics);
            }
        },
        Some(v) => {
            diagnostics.push(
                Diagnostic::error(format!("Expected list for block '{}'", path))
                    .with_detail(format!("Got {}", value_type_name(v)))
                    .with_attribute(path),
            );
        },
    }
}

fn validate_map_block(
    nested: &NestedBlock,
    value: Option<&Value>,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match value {
        None | Some(Value::Null) => {
            if nested.min_items > 0 {
                diagnostics.push(
                    Diagnostic::error(format!(
                        "Block '{}' requires at least {} item(s)",
                        path, nested.min_items
                    ))
                    .with_attribute(path),
                );
            }
        },
        Some(Value::Object(obj)) => {
            check_item_count(nested, obj.len(), path, diagnostics);
            for (key, item) in obj {
                let item_path = format!("{}.{}", path, key);
                validate_block(&nested.block, item, &item_path, diagnostics);
            }
        },
        Some(v) => {
            diagnostics.push(
                Diagnostic::error(format!("Expected map for block '{}'", path))
                    .with_detail(format!("Got {}", value_type_name(v)))
                    .with_attribute(path),
            );
        },
    }
}

// =========================================================================
// Schema well-formedness
// =========================================================================

/// Check that a schema is well-formed.
///
/// Returns one error diagnostic per problem:
///
/// - each attribute is exactly one of required, optional, optional+computed,
///   or computed-only (never required+computed, never nothing)
/// - attribute and block names are lowercase identifiers and do not collide
/// - validators fit the attribute type, patterns compile, bounds are ordered
/// - defaults have the declared type
/// - nested block item bounds are ordered; single blocks allow at most one item
pub fn check_schema(schema: &Schema) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    check_block(&schema.block, "", &mut diagnostics);
    diagnostics
}

/// Check the provider configuration schema and every resource and data source schema.
///
/// Attribute paths of the returned diagnostics are prefixed with the type name.
pub fn check_provider_schema(schema: &ProviderSchema) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    check_block(&schema.provider.block, "provider", &mut diagnostics);
    for (name, resource) in &schema.resources {
        check_block(&resource.block, name, &mut diagnostics);
    }
    for (name, data_source) in &schema.data_sources {
        check_block(&data_source.block, name, &mut diagnostics);
    }
    diagnostics
}

fn check_block(block: &Block, path: &str, diagnostics: &mut Vec<Diagnostic>) {
    for (name, attr) in &block.attributes {
        let attr_path = join_path(path, name);
        check_name(name, &attr_path, diagnostics);
        if block.blocks.contains_key(name) {
            diagnostics.push(
                Diagnostic::error(format!("Name '{}' is both an attribute and a block", attr_path))
                    .with_attribute(&attr_path),
            );
        }
        check_attribute(attr, &attr_path, diagnostics);
    }

    for (name, nested) in &block.blocks {
        let block_path = join_path(path, name);
        check_name(name, &block_path, diagnostics);
        if nested.max_items > 0 && nested.min_items > nested.max_items {
            diagnostics.push(
                Diagnostic::error(format!("Block '{}' has min_items greater than max_items", block_path))
                    .with_detail(format!("min_items={}, max_items={}", nested.min_items, nested.max_items))
                    .with_attribute(&block_path),
            );
        }
        if nested.nesting_mode == BlockNestingMode::Single && nested.max_items != 1 {
            diagnostics.push(
                Diagnostic::error(format!("Single block '{}' must allow exactly one item", block_path))
                    .with_attribute(&block_path),
            );
        }
        check_block(&nested.block, &block_path, diagnostics);
    }
}

fn check_name(name: &str, path: &str, diagnostics: &mut Vec<Diagnostic>) {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid {
        diagnostics.push(
            Diagnostic::error(format!("Invalid name '{}'", path))
                .with_detail("Names must match [a-z_][a-z0-9_]*")
                .with_attribute(path),
        );
    }
}

fn check_attribute(attr: &Attribute, path: &str, diagnostics: &mut Vec<Diagnostic>) {
    let flags = attr.flags;
    let flag_error = if flags.required && (flags.optional || flags.computed) {
        Some("Required attributes cannot also be optional or computed")
    } else if !flags.required && !flags.optional && !flags.computed {
        Some("Attributes must be required, optional, or computed")
    } else {
        None
    };
    if let Some(detail) = flag_error {
        diagnostics.push(
            Diagnostic::error(format!("Invalid flags for attribute '{}'", path))
                .with_detail(detail)
                .with_attribute(path),
        );
    }

    if let Some(default) = &attr.default {
        let mut type_errors = Vec::new();
        validate_attribute_type(&attr.attr_type, default, path, &mut type_errors);
        if !type_errors.is_empty() {
            diagnostics.push(
                Diagnostic::error(format!("Default for attribute '{}' has the wrong type", path))
                    .with_attribute(path),
            );
        }
    }

    for validator in &attr.validators {
        check_validator(validator, &attr.attr_type, path, diagnostics);
    }
}

fn check_validator(
    validator: &Validator,
    attr_type: &AttributeType,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let mismatch = |expected: &str| {
        Diagnostic::error(format!("Validator does not apply to attribute '{}'", path))
            .with_detail(format!("Expected a {} attribute", expected))
            .with_attribute(path)
    };
    let unordered = || {
        Diagnostic::error(format!("Validator bounds for attribute '{}' are reversed", path))
            .with_attribute(path)
    };

    match validator {
        Validator::Length { min, max } => {
            if *attr_type != AttributeType::String {
                diagnostics.push(mismatch("string"));
            }
            if let (Some(min), Some(max)) = (min, max) {
                if min > max {
                    diagnostics.push(unordered());
                }
            }
        },
        Validator::Pattern { pattern } => {
            if *attr_type != AttributeType::String {
                diagnostics.push(mismatch("string"));
            }
            if let Err(e) = Regex::new(pattern) {
                diagnostics.push(
                    Diagnostic::error(format!("Invalid pattern for attribute '{}'", path))
                        .with_detail(e.to_string())
                        .with_attribute(path),
                );
            }
        },
        Validator::OneOf { values } => {
            if !attr_type.is_primitive() {
                diagnostics.push(mismatch("primitive"));
            } else if values.is_empty() {
                diagnostics.push(
                    Diagnostic::error(format!("Validator for attribute '{}' allows no values", path))
                        .with_attribute(path),
                );
            }
        },
        Validator::Range { min, max } => {
            if !attr_type.is_numeric() {
                diagnostics.push(mismatch("numeric"));
            }
            if let (Some(min), Some(max)) = (min, max) {
                if min > max {
                    diagnostics.push(unordered());
                }
            }
        },
    }
}

// Helper functions

fn join_path(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", base, name)
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn is_int64(value: &Value) -> bool {
    match value {
        Value::Number(n) => {
            n.is_i64()
                || n.as_f64().is_some_and(|f| {
                    f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64
                })
        },
        _ => false,
    }
}

fn type_error(path: &str, expected: &str, got: &Value) -> Diagnostic {
    Diagnostic::error(format!("Invalid type for attribute '{}'", path))
        .with_detail(format!("Expected {}, got {}", expected, value_type_name(got)))
        .with_attribute(path)
}

trait DiagnosticExt {
    fn with_attribute_if_not_empty(self, path: &str) -> Self;
}

impl DiagnosticExt for Diagnostic {
    fn with_attribute_if_not_empty(self, path: &str) -> Self {
        if path.is_empty() {
            self
        } else {
            self.with_attribute(path)
        }
    }
}
