//! The catalog of custom resource types served by the provider.
//!
//! A [`ResourceCatalog`] is built from CustomResourceDefinition manifests at
//! startup. Every served version of every CRD becomes one
//! [`CustomResourceType`], which carries the resource, data source and
//! manifest data source schemas plus the group/version/resource coordinates
//! used by the dynamic client.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, CustomResourceDefinitionVersion,
};
use kube::discovery::ApiResource;
use serde::Deserialize;
use serde_json::Value;

use crate::error::ProviderError;
use crate::naming;
use crate::openapi::{convert_root, ConversionMode};
use crate::schema::{Attribute, Block, NestedBlock, ProviderSchema, Schema, Validator};

/// Attribute holding the object identifier (`namespace/name` or `name`).
pub const ID: &str = "id";
/// Attribute holding the object's `apiVersion`.
pub const API_VERSION: &str = "api_version";
/// Attribute holding the object's `kind`.
pub const KIND: &str = "kind";
/// Block holding the object's metadata.
pub const METADATA: &str = "metadata";
/// Provider-only block configuring the delete-wait poller.
pub const WAIT_FOR_DELETE: &str = "wait_for_delete";
/// Attribute of manifest data sources holding the rendered YAML.
pub const YAML: &str = "yaml";

const DNS_SUBDOMAIN_PATTERN: &str = r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$";
const DNS_LABEL_PATTERN: &str = r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$";

/// One served version of a custom resource definition.
#[derive(Debug, Clone)]
pub struct CustomResourceType {
    /// API group, e.g. `cert-manager.io`.
    pub group: String,
    /// API version, e.g. `v1`.
    pub version: String,
    /// Kind, e.g. `Certificate`.
    pub kind: String,
    /// Plural resource name used in REST paths, e.g. `certificates`.
    pub plural: String,
    /// Whether objects of this kind live in a namespace.
    pub namespaced: bool,
    /// Resource type name.
    pub resource_type: String,
    /// Data source type name (same as the resource type name).
    pub data_source_type: String,
    /// Manifest data source type name.
    pub manifest_type: String,
    /// Schema of the resource.
    pub resource_schema: Schema,
    /// Schema of the data source.
    pub data_source_schema: Schema,
    /// Schema of the manifest data source.
    pub manifest_schema: Schema,
    /// Group/version/resource coordinates for the dynamic client.
    pub api_resource: ApiResource,
}

impl CustomResourceType {
    /// The `apiVersion` of objects of this type.
    pub fn api_version(&self) -> &str {
        &self.api_resource.api_version
    }

    /// Human-readable reference to one object, used in error messages.
    pub fn describe(&self, namespace: Option<&str>, name: &str) -> String {
        match namespace {
            Some(namespace) => format!("{} {}/{}", self.kind, namespace, name),
            None => format!("{} {}", self.kind, name),
        }
    }

    fn build(
        prefix: &str,
        crd: &CustomResourceDefinition,
        version: &CustomResourceDefinitionVersion,
    ) -> Result<Self, ProviderError> {
        let spec = &crd.spec;
        let group = spec.group.clone();
        let kind = spec.names.kind.clone();
        let plural = spec.names.plural.clone();
        let namespaced = spec.scope != "Cluster";

        let open_api = match version
            .schema
            .as_ref()
            .and_then(|validation| validation.open_api_v3_schema.as_ref())
        {
            Some(props) => serde_json::to_value(props)?,
            None => {
                tracing::warn!(kind = %kind, version = %version.name, "CRD version has no openAPIV3Schema");
                Value::Null
            },
        };

        let mut description = format!("{} ({})", kind, naming::api_version(&group, &version.name));
        if version.deprecated.unwrap_or(false) {
            let warning = version
                .deprecation_warning
                .clone()
                .unwrap_or_else(|| "This version is deprecated.".to_string());
            description = format!("{}. {}", description, warning);
        }

        let configurable = convert_root(&open_api, ConversionMode::Configurable);
        let computed = convert_root(&open_api, ConversionMode::Computed);

        let resource_schema = resource_schema(&configurable, namespaced, &description);
        let manifest_schema = manifest_schema(&configurable, namespaced, &description);
        let data_source_schema = data_source_schema(&computed, namespaced, &description);

        let resource_type = naming::type_name(prefix, &group, &kind, &version.name);
        let manifest_type = naming::manifest_type_name(prefix, &group, &kind, &version.name);

        Ok(Self {
            api_resource: ApiResource {
                group: group.clone(),
                version: version.name.clone(),
                api_version: naming::api_version(&group, &version.name),
                kind: kind.clone(),
                plural: plural.clone(),
            },
            group,
            version: version.name.clone(),
            kind,
            plural,
            namespaced,
            data_source_type: resource_type.clone(),
            resource_type,
            manifest_type,
            resource_schema,
            data_source_schema,
            manifest_schema,
        })
    }
}

fn metadata_block(namespaced: bool, computed_maps: bool) -> NestedBlock {
    let mut metadata = Block::new()
        .with_description("Standard object metadata.")
        .with_attribute(
            "name",
            Attribute::required_string()
                .with_description("Name of the object, unique within its namespace.")
                .with_json_name("name")
                .with_force_new()
                .with_validator(Validator::length(Some(1), Some(253)))
                .with_validator(Validator::pattern(DNS_SUBDOMAIN_PATTERN)),
        );

    if namespaced {
        metadata = metadata.with_attribute(
            "namespace",
            Attribute::required_string()
                .with_description("Namespace of the object.")
                .with_json_name("namespace")
                .with_force_new()
                .with_validator(Validator::length(Some(1), Some(63)))
                .with_validator(Validator::pattern(DNS_LABEL_PATTERN)),
        );
    }

    let (labels, annotations) = if computed_maps {
        (Attribute::computed_string_map(), Attribute::computed_string_map())
    } else {
        (Attribute::optional_string_map(), Attribute::optional_string_map())
    };
    metadata = metadata
        .with_attribute(
            "labels",
            labels
                .with_description("Labels to organize and select objects.")
                .with_json_name("labels"),
        )
        .with_attribute(
            "annotations",
            annotations
                .with_description("Unstructured key/value data stored with the object.")
                .with_json_name("annotations"),
        );

    NestedBlock::single(metadata)
        .with_min_items(1)
        .with_json_name("metadata")
}

fn wait_for_delete_block() -> NestedBlock {
    NestedBlock::single(
        Block::new()
            .with_description("Wait for the object to disappear after it is deleted.")
            .with_attribute(
                "timeout",
                Attribute::optional_string()
                    .with_description("How long to wait, e.g. `30s` or `2m`. Defaults to `30s`."),
            )
            .with_attribute(
                "poll_interval",
                Attribute::optional_string()
                    .with_description("How often to check, e.g. `5s`. Defaults to `5s`."),
            ),
    )
}

/// Root attributes shared by every schema of a type.
fn base_schema(description: &str) -> Schema {
    let mut schema = Schema::v0()
        .with_attribute(
            ID,
            Attribute::computed_string().with_description("`namespace/name`, or `name` for cluster-scoped objects."),
        )
        .with_attribute(
            API_VERSION,
            Attribute::computed_string().with_description("API version of the object."),
        )
        .with_attribute(KIND, Attribute::computed_string().with_description("Kind of the object."));
    schema.block.description = Some(description.to_string());
    schema
}

/// Add converted CRD fields, skipping any that shadow a provider-managed name.
fn merge_fields(mut schema: Schema, fields: &Block) -> Schema {
    let taken = |schema: &Schema, name: &str| {
        schema.block.attributes.contains_key(name) || schema.block.blocks.contains_key(name)
    };
    for (name, attr) in &fields.attributes {
        if taken(&schema, name) {
            tracing::warn!(field = %name, "Skipping CRD field that shadows a provider attribute");
            continue;
        }
        schema.block.attributes.insert(name.clone(), attr.clone());
    }
    for (name, block) in &fields.blocks {
        if taken(&schema, name) {
            tracing::warn!(field = %name, "Skipping CRD field that shadows a provider attribute");
            continue;
        }
        schema.block.blocks.insert(name.clone(), block.clone());
    }
    schema
}

fn resource_schema(fields: &Block, namespaced: bool, description: &str) -> Schema {
    let schema = base_schema(description)
        .with_block(METADATA, metadata_block(namespaced, false))
        .with_block(WAIT_FOR_DELETE, wait_for_delete_block());
    merge_fields(schema, fields)
}

fn manifest_schema(fields: &Block, namespaced: bool, description: &str) -> Schema {
    let schema = base_schema(description)
        .with_block(METADATA, metadata_block(namespaced, false))
        .with_attribute(
            YAML,
            Attribute::computed_string().with_description("The object rendered as a YAML manifest."),
        );
    merge_fields(schema, fields)
}

fn data_source_schema(fields: &Block, namespaced: bool, description: &str) -> Schema {
    let schema = base_schema(description).with_block(METADATA, metadata_block(namespaced, true));
    merge_fields(schema, fields)
}

/// Every custom resource type the provider serves, indexed by type name.
#[derive(Debug, Clone)]
pub struct ResourceCatalog {
    prefix: String,
    entries: Vec<CustomResourceType>,
    resources: BTreeMap<String, usize>,
    data_sources: BTreeMap<String, usize>,
    manifests: BTreeMap<String, usize>,
}

impl ResourceCatalog {
    /// Create an empty catalog whose type names start with `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            entries: Vec::new(),
            resources: BTreeMap::new(),
            data_sources: BTreeMap::new(),
            manifests: BTreeMap::new(),
        }
    }

    /// Build a catalog from CRD files and directories.
    pub fn from_paths<P: AsRef<Path>>(
        prefix: impl Into<String>,
        paths: &[P],
    ) -> Result<Self, ProviderError> {
        let mut catalog = Self::new(prefix);
        for path in paths {
            catalog.load_path(path.as_ref())?;
        }
        Ok(catalog)
    }

    /// The type name prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Load a CRD file, or every `*.yaml`, `*.yml` and `*.json` file of a directory.
    ///
    /// Returns the number of types added.
    pub fn load_path(&mut self, path: &Path) -> Result<usize, ProviderError> {
        if path.is_dir() {
            let mut files: Vec<PathBuf> = fs::read_dir(path)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && is_manifest_file(p))
                .collect();
            files.sort();

            let mut added = 0;
            for file in files {
                added += self.load_file(&file)?;
            }
            Ok(added)
        } else {
            self.load_file(path)
        }
    }

    fn load_file(&mut self, path: &Path) -> Result<usize, ProviderError> {
        let source = fs::read_to_string(path).map_err(|e| {
            ProviderError::Configuration(format!("Unable to read {}: {}", path.display(), e))
        })?;
        let added = self.load_str(&source, &path.display().to_string())?;
        tracing::debug!(path = %path.display(), types = added, "Loaded CRD manifest");
        Ok(added)
    }

    /// Load CRDs from a (multi-document) YAML or JSON string.
    ///
    /// Documents of other kinds are ignored; `List` documents are unpacked.
    /// Returns the number of types added.
    pub fn load_str(&mut self, source: &str, origin: &str) -> Result<usize, ProviderError> {
        let mut added = 0;
        for document in serde_yaml::Deserializer::from_str(source) {
            let value = Value::deserialize(document).map_err(|e| {
                ProviderError::Configuration(format!("Invalid YAML in {}: {}", origin, e))
            })?;
            added += self.add_document(value, origin)?;
        }
        Ok(added)
    }

    fn add_document(&mut self, value: Value, origin: &str) -> Result<usize, ProviderError> {
        match value.get("kind").and_then(Value::as_str) {
            Some("CustomResourceDefinition") => {
                let crd: CustomResourceDefinition = serde_json::from_value(value).map_err(|e| {
                    ProviderError::Configuration(format!(
                        "Invalid CustomResourceDefinition in {}: {}",
                        origin, e
                    ))
                })?;
                self.add_crd(&crd)
            },
            Some("List") => {
                let items = match value.get("items").and_then(Value::as_array) {
                    Some(items) => items.clone(),
                    None => Vec::new(),
                };
                let mut added = 0;
                for item in items {
                    added += self.add_document(item, origin)?;
                }
                Ok(added)
            },
            Some(kind) => {
                tracing::debug!(origin = %origin, kind = %kind, "Ignoring non-CRD document");
                Ok(0)
            },
            None => Ok(0),
        }
    }

    /// Add every served version of a CRD. Returns the number of types added.
    pub fn add_crd(&mut self, crd: &CustomResourceDefinition) -> Result<usize, ProviderError> {
        let mut added = 0;
        for version in crd.spec.versions.iter().filter(|v| v.served) {
            let entry = CustomResourceType::build(&self.prefix, crd, version)?;
            self.insert(entry)?;
            added += 1;
        }
        Ok(added)
    }

    fn insert(&mut self, entry: CustomResourceType) -> Result<(), ProviderError> {
        let duplicate = self.resources.contains_key(&entry.resource_type)
            || self.data_sources.contains_key(&entry.manifest_type)
            || self.manifests.contains_key(&entry.data_source_type)
            || self.manifests.contains_key(&entry.manifest_type);
        if duplicate {
            return Err(ProviderError::Configuration(format!(
                "Duplicate type name {} ({} {})",
                entry.resource_type,
                entry.api_version(),
                entry.kind
            )));
        }

        tracing::debug!(
            resource = %entry.resource_type,
            api_version = %entry.api_version(),
            kind = %entry.kind,
            namespaced = entry.namespaced,
            "Registered custom resource type"
        );

        let index = self.entries.len();
        self.resources.insert(entry.resource_type.clone(), index);
        self.data_sources.insert(entry.data_source_type.clone(), index);
        self.manifests.insert(entry.manifest_type.clone(), index);
        self.entries.push(entry);
        Ok(())
    }

    /// Look up a resource type.
    pub fn resource(&self, type_name: &str) -> Option<&CustomResourceType> {
        self.resources.get(type_name).map(|&i| &self.entries[i])
    }

    /// Look up a (non-manifest) data source type.
    pub fn data_source(&self, type_name: &str) -> Option<&CustomResourceType> {
        self.data_sources.get(type_name).map(|&i| &self.entries[i])
    }

    /// Look up a manifest data source type.
    pub fn manifest(&self, type_name: &str) -> Option<&CustomResourceType> {
        self.manifests.get(type_name).map(|&i| &self.entries[i])
    }

    /// All types, in load order.
    pub fn iter(&self) -> impl Iterator<Item = &CustomResourceType> {
        self.entries.iter()
    }

    /// Number of types.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the catalog holds no types.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resource type names, sorted.
    pub fn resource_names(&self) -> Vec<String> {
        self.resources.keys().cloned().collect()
    }

    /// Data source and manifest data source type names, sorted.
    pub fn data_source_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .data_sources
            .keys()
            .chain(self.manifests.keys())
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// The complete provider schema with `provider_config` as the configuration schema.
    pub fn provider_schema(&self, provider_config: Schema) -> ProviderSchema {
        let mut schema = ProviderSchema::new().with_provider_config(provider_config);
        for entry in &self.entries {
            schema
                .resources
                .insert(entry.resource_type.clone(), entry.resource_schema.clone());
            schema
                .data_sources
                .insert(entry.data_source_type.clone(), entry.data_source_schema.clone());
            schema
                .data_sources
                .insert(entry.manifest_type.clone(), entry.manifest_schema.clone());
        }
        schema
    }
}

fn is_manifest_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml" | "yml" | "json")
    )
}
