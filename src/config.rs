//! Provider configuration.

use std::path::PathBuf;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::client::ApplyOptions;
use crate::error::ProviderError;
use crate::schema::{Attribute, Diagnostic, Schema, Validator};

/// Field manager used for server-side apply unless configured otherwise.
pub const DEFAULT_FIELD_MANAGER: &str = "kubecrd-provider";

/// Longest field manager name the API server accepts.
pub const MAX_FIELD_MANAGER_LEN: u64 = 128;

/// Settings from the provider configuration block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Path of a kubeconfig file. Unset means the default inference chain.
    pub kubeconfig: Option<PathBuf>,
    /// Kubeconfig context to use instead of the current one.
    pub context: Option<String>,
    /// Serve without a cluster. Only manifest data sources work.
    pub offline: bool,
    /// Field manager for server-side apply.
    pub field_manager: String,
    /// Force server-side apply through field ownership conflicts.
    pub force_conflicts: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            context: None,
            offline: false,
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            force_conflicts: false,
        }
    }
}

impl ProviderConfig {
    /// The provider configuration schema.
    pub fn schema() -> Schema {
        Schema::v0()
            .with_attribute(
                "kubeconfig",
                Attribute::optional_string()
                    .with_description("Path to a kubeconfig file. Defaults to in-cluster configuration, `KUBECONFIG`, or `~/.kube/config`."),
            )
            .with_attribute(
                "context",
                Attribute::optional_string()
                    .with_description("Kubeconfig context to use. Defaults to the current context."),
            )
            .with_attribute(
                "offline",
                Attribute::optional_bool()
                    .with_description("Do not contact a cluster. Only manifest data sources can be used.")
                    .with_default(json!(false)),
            )
            .with_attribute(
                "field_manager",
                Attribute::optional_string()
                    .with_description("Field manager name for server-side apply.")
                    .with_default(json!(DEFAULT_FIELD_MANAGER))
                    .with_validator(Validator::length(Some(1), Some(MAX_FIELD_MANAGER_LEN))),
            )
            .with_attribute(
                "force_conflicts",
                Attribute::optional_bool()
                    .with_description("Take ownership of fields managed by other field managers.")
                    .with_default(json!(false)),
            )
    }

    /// Decode the configuration value sent by the host.
    ///
    /// Null attributes take their defaults.
    pub fn from_value(value: &Value) -> Result<Self, ProviderError> {
        let set: serde_json::Map<String, Value> = match value {
            Value::Null => serde_json::Map::new(),
            Value::Object(map) => map
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            other => {
                return Err(ProviderError::Configuration(format!(
                    "Provider configuration must be an object, got {}",
                    other
                )))
            },
        };
        serde_json::from_value(Value::Object(set))
            .map_err(|e| ProviderError::Configuration(format!("Invalid provider configuration: {}", e)))
    }

    /// Check combinations the schema cannot express.
    pub fn validate(&self) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();

        if self.offline {
            for (attribute, set) in [
                ("kubeconfig", self.kubeconfig.is_some()),
                ("context", self.context.is_some()),
            ] {
                if set {
                    diagnostics.push(
                        Diagnostic::error(format!("'{}' cannot be combined with 'offline'", attribute))
                            .with_detail("An offline provider does not connect to a cluster.")
                            .with_attribute(attribute),
                    );
                }
            }
        }

        let len = self.field_manager.chars().count() as u64;
        if len == 0 || len > MAX_FIELD_MANAGER_LEN {
            diagnostics.push(
                Diagnostic::error("Invalid field manager")
                    .with_detail(format!(
                        "The field manager must be between 1 and {} characters, got {}",
                        MAX_FIELD_MANAGER_LEN, len
                    ))
                    .with_attribute("field_manager"),
            );
        }

        diagnostics
    }

    /// Options for every server-side apply issued with this configuration.
    pub fn apply_options(&self) -> ApplyOptions {
        ApplyOptions {
            field_manager: self.field_manager.clone(),
            force: self.force_conflicts,
        }
    }

    /// Connect to the cluster this configuration points at.
    pub async fn connect(&self) -> Result<Client, ProviderError> {
        if self.offline {
            return Err(ProviderError::Offline(
                "no cluster connection is made in offline mode".to_string(),
            ));
        }

        if self.kubeconfig.is_none() && self.context.is_none() {
            return Client::try_default().await.map_err(|e| {
                ProviderError::Configuration(format!(
                    "Unable to infer Kubernetes configuration: {}",
                    e
                ))
            });
        }

        let options = KubeConfigOptions {
            context: self.context.clone(),
            ..Default::default()
        };
        let config = match &self.kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    ProviderError::Configuration(format!(
                        "Unable to read kubeconfig {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &options).await
            },
            None => Config::from_kubeconfig(&options).await,
        }
        .map_err(|e| ProviderError::Configuration(format!("Invalid kubeconfig: {}", e)))?;

        tracing::debug!(cluster_url = %config.cluster_url, context = ?self.context, "Connecting to cluster");
        Client::try_from(config)
            .map_err(|e| ProviderError::Configuration(format!("Unable to create client: {}", e)))
    }
}
