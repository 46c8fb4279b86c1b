//! The attribute and block model shared by provider config, resources and
//! data sources.
//!
//! Custom resource schemas are derived from a CRD's OpenAPI schema by
//! [`crate::openapi`]. Every attribute or block that stands for a field of the
//! Kubernetes object carries that field's JSON name; [`crate::model`] walks
//! these names to convert between state and objects.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Value type of an attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    /// Text.
    String,
    /// Whole number.
    Int64,
    /// Floating point number.
    Float64,
    /// `true` or `false`.
    Bool,
    /// Ordered elements.
    List(Box<AttributeType>),
    /// Unordered unique elements.
    Set(Box<AttributeType>),
    /// String-keyed entries.
    Map(Box<AttributeType>),
    /// Fixed fields.
    Object(BTreeMap<String, AttributeType>),
    /// Any JSON value.
    ///
    /// Free-form CRD fields land here: `x-kubernetes-preserve-unknown-fields`
    /// and `x-kubernetes-int-or-string`.
    Dynamic,
}

impl AttributeType {
    /// `list(element)`
    pub fn list(element: AttributeType) -> Self {
        Self::List(Box::new(element))
    }

    /// `map(element)`
    pub fn map(element: AttributeType) -> Self {
        Self::Map(Box::new(element))
    }

    /// Int64 or Float64.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Int64 | Self::Float64)
    }

    /// String, number or bool.
    pub fn is_primitive(&self) -> bool {
        matches!(self, Self::String | Self::Int64 | Self::Float64 | Self::Bool)
    }
}

/// Who may set an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AttributeFlags {
    /// Must be present in configuration.
    pub required: bool,
    /// May be present in configuration.
    pub optional: bool,
    /// Filled in by the provider.
    pub computed: bool,
    /// Redacted by the host.
    pub sensitive: bool,
}

impl AttributeFlags {
    /// Set in configuration, always.
    pub fn required() -> Self {
        Self {
            required: true,
            ..Default::default()
        }
    }

    /// Set in configuration, or left null.
    pub fn optional() -> Self {
        Self {
            optional: true,
            ..Default::default()
        }
    }

    /// Read-only.
    pub fn computed() -> Self {
        Self {
            computed: true,
            ..Default::default()
        }
    }

    /// Configurable, with the provider supplying a value when unset.
    pub fn optional_computed() -> Self {
        Self {
            optional: true,
            computed: true,
            ..Default::default()
        }
    }

    /// Neither required nor optional: only the provider writes it.
    pub fn is_computed_only(&self) -> bool {
        self.computed && !self.optional && !self.required
    }
}

/// A constraint on an attribute's value, checked without the cluster.
///
/// These carry the OpenAPI validations declared by a CRD: `minLength` and
/// `maxLength`, `pattern`, `enum`, `minimum` and `maximum`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Validator {
    /// Character count bounds, both inclusive.
    Length {
        /// At least this many.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<u64>,
        /// At most this many.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<u64>,
    },
    /// Regular expression the whole string is searched with.
    Pattern {
        /// Regex source.
        pattern: String,
    },
    /// Enumerated values.
    OneOf {
        /// Allowed values, compared as JSON.
        values: Vec<serde_json::Value>,
    },
    /// Numeric bounds, both inclusive.
    Range {
        /// Lower bound.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        /// Upper bound.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
}

#[allow(missing_docs)]
impl Validator {
    pub fn length(min: Option<u64>, max: Option<u64>) -> Self {
        Self::Length { min, max }
    }

    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self::Pattern {
            pattern: pattern.into(),
        }
    }

    pub fn one_of(values: Vec<serde_json::Value>) -> Self {
        Self::OneOf { values }
    }

    pub fn range(min: Option<f64>, max: Option<f64>) -> Self {
        Self::Range { min, max }
    }
}

/// One leaf field of a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    /// Value type.
    #[serde(rename = "type")]
    pub attr_type: AttributeType,
    /// Required, optional, computed, sensitive.
    #[serde(flatten)]
    pub flags: AttributeFlags,
    /// Shown in generated docs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// A change to this attribute replaces the resource.
    #[serde(default)]
    pub force_new: bool,
    /// Value the planner fills in when configuration leaves it null.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    /// Checked by [`crate::validation`].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validators: Vec<Validator>,
    /// Object field this attribute maps to; `None` means provider-only
    /// (`id`, `yaml`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_name: Option<String>,
}

#[allow(missing_docs)]
impl Attribute {
    /// A bare attribute with no description, default or validators.
    pub fn new(attr_type: AttributeType, flags: AttributeFlags) -> Self {
        Self {
            attr_type,
            flags,
            description: None,
            force_new: false,
            default: None,
            validators: Vec::new(),
            json_name: None,
        }
    }

    pub fn required_string() -> Self {
        Self::new(AttributeType::String, AttributeFlags::required())
    }

    pub fn optional_string() -> Self {
        Self::new(AttributeType::String, AttributeFlags::optional())
    }

    /// Read-only string, e.g. `id`.
    pub fn computed_string() -> Self {
        Self::new(AttributeType::String, AttributeFlags::computed())
    }

    pub fn optional_int64() -> Self {
        Self::new(AttributeType::Int64, AttributeFlags::optional())
    }

    pub fn optional_bool() -> Self {
        Self::new(AttributeType::Bool, AttributeFlags::optional())
    }

    /// `map(string)`, as used for labels and annotations.
    pub fn optional_string_map() -> Self {
        Self::new(
            AttributeType::map(AttributeType::String),
            AttributeFlags::optional(),
        )
    }

    /// Read-only `map(string)`.
    pub fn computed_string_map() -> Self {
        Self::new(
            AttributeType::map(AttributeType::String),
            AttributeFlags::computed(),
        )
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Plan a replacement whenever this attribute changes.
    pub fn with_force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validators.push(validator);
        self
    }

    /// Map this attribute to the object field `json_name`.
    pub fn with_json_name(mut self, json_name: impl Into<String>) -> Self {
        self.json_name = Some(json_name.into());
        self
    }
}

/// How many instances of a nested block may appear and how they are keyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlockNestingMode {
    /// Zero or one.
    #[default]
    Single,
    /// Ordered, any number.
    List,
    /// Unordered, any number, no duplicates.
    Set,
    /// Keyed by string.
    Map,
}

/// A group of attributes and child blocks.
///
/// For custom resources a block is an object-typed field such as `spec`, or
/// each element of a list of objects like `spec.ports`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Block {
    /// Leaf fields, keyed by attribute name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Attribute>,
    /// Child blocks, keyed by attribute name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub blocks: BTreeMap<String, NestedBlock>,
    /// Taken from the OpenAPI `description`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[allow(missing_docs)]
impl Block {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attribute(mut self, name: impl Into<String>, attr: Attribute) -> Self {
        self.attributes.insert(name.into(), attr);
        self
    }

    pub fn with_block(mut self, name: impl Into<String>, block: NestedBlock) -> Self {
        self.blocks.insert(name.into(), block);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Find the attribute governing a dot-separated path below this block.
    ///
    /// List indices and map keys of nested blocks are skipped, and any
    /// segments past a collection attribute (e.g. a label key) resolve to
    /// that attribute.
    pub fn attribute_at(&self, path: &str) -> Option<&Attribute> {
        let mut segments = path.split('.');
        let mut block = self;
        loop {
            let segment = segments.next()?;
            if let Some(attr) = block.attributes.get(segment) {
                return Some(attr);
            }
            let nested = block.blocks.get(segment)?;
            if nested.nesting_mode != BlockNestingMode::Single {
                // index or map key
                segments.next()?;
            }
            block = &nested.block;
        }
    }
}

/// A [`Block`] placed inside another, with its nesting constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedBlock {
    /// Contents of each instance.
    #[serde(flatten)]
    pub block: Block,
    /// Single, list, set or map.
    #[serde(default)]
    pub nesting_mode: BlockNestingMode,
    /// Fewest instances accepted.
    #[serde(default)]
    pub min_items: u32,
    /// Zero means no upper bound.
    #[serde(default)]
    pub max_items: u32,
    /// Object field this block maps to; `None` means provider-only
    /// (`wait_for_delete`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_name: Option<String>,
}

#[allow(missing_docs)]
impl NestedBlock {
    fn with_mode(block: Block, nesting_mode: BlockNestingMode, max_items: u32) -> Self {
        Self {
            block,
            nesting_mode,
            min_items: 0,
            max_items,
            json_name: None,
        }
    }

    /// At most one instance.
    pub fn single(block: Block) -> Self {
        Self::with_mode(block, BlockNestingMode::Single, 1)
    }

    /// Unbounded list.
    pub fn list(block: Block) -> Self {
        Self::with_mode(block, BlockNestingMode::List, 0)
    }

    /// Unbounded string-keyed map.
    pub fn map(block: Block) -> Self {
        Self::with_mode(block, BlockNestingMode::Map, 0)
    }

    pub fn with_min_items(mut self, min: u32) -> Self {
        self.min_items = min;
        self
    }

    pub fn with_max_items(mut self, max: u32) -> Self {
        self.max_items = max;
        self
    }

    /// Map this block to the object field `json_name`.
    pub fn with_json_name(mut self, json_name: impl Into<String>) -> Self {
        self.json_name = Some(json_name.into());
        self
    }
}

/// A versioned root block: the full shape of one type's configuration and state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Schema {
    /// State version, consulted by `upgrade_resource_state`.
    #[serde(default)]
    pub version: u64,
    /// Root attributes and blocks.
    #[serde(flatten)]
    pub block: Block,
}

#[allow(missing_docs)]
impl Schema {
    pub fn new(version: u64) -> Self {
        Self {
            version,
            block: Block::new(),
        }
    }

    /// Every custom resource type is served at version 0.
    pub fn v0() -> Self {
        Self::new(0)
    }

    pub fn with_attribute(mut self, name: impl Into<String>, attr: Attribute) -> Self {
        self.block.attributes.insert(name.into(), attr);
        self
    }

    pub fn with_block(mut self, name: impl Into<String>, block: NestedBlock) -> Self {
        self.block.blocks.insert(name.into(), block);
        self
    }

    /// See [`Block::attribute_at`].
    pub fn attribute_at(&self, path: &str) -> Option<&Attribute> {
        self.block.attribute_at(path)
    }
}

/// Everything `GetSchema` returns: the provider block plus one schema per
/// resource and data source type name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProviderSchema {
    /// The provider configuration block.
    #[serde(default)]
    pub provider: Schema,
    /// Keyed by type name.
    #[serde(default)]
    pub resources: BTreeMap<String, Schema>,
    /// Includes the `_manifest` types.
    #[serde(default)]
    pub data_sources: BTreeMap<String, Schema>,
}

#[allow(missing_docs)]
impl ProviderSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider_config(mut self, schema: Schema) -> Self {
        self.provider = schema;
        self
    }

    pub fn with_resource(mut self, name: impl Into<String>, schema: Schema) -> Self {
        self.resources.insert(name.into(), schema);
        self
    }

    pub fn with_data_source(mut self, name: impl Into<String>, schema: Schema) -> Self {
        self.data_sources.insert(name.into(), schema);
        self
    }
}

/// Errors fail the operation; warnings are only displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum DiagnosticSeverity {
    Error,
    Warning,
}

/// A problem reported back to the host, optionally pinned to an attribute path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Error or warning.
    pub severity: DiagnosticSeverity,
    /// One line, shown first.
    pub summary: String,
    /// Longer explanation, often the failing value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Dot-separated path, e.g. `spec.ports.0.port`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

#[allow(missing_docs)]
impl Diagnostic {
    fn with_severity(severity: DiagnosticSeverity, summary: impl Into<String>) -> Self {
        Self {
            severity,
            summary: summary.into(),
            detail: None,
            attribute: None,
        }
    }

    pub fn error(summary: impl Into<String>) -> Self {
        Self::with_severity(DiagnosticSeverity::Error, summary)
    }

    pub fn warning(summary: impl Into<String>) -> Self {
        Self::with_severity(DiagnosticSeverity::Warning, summary)
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == DiagnosticSeverity::Error
    }
}

/// True when at least one diagnostic is an error.
pub fn has_errors(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(Diagnostic::is_error)
}
