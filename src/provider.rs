//! The provider engine.
//!
//! [`CrdProvider`] serves every type in a [`ResourceCatalog`] through one
//! [`DynamicClient`]. Each operation follows the same steps: look up the
//! type, convert the state into an object, issue one REST verb and convert
//! the server's answer back into state.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::catalog::{CustomResourceType, ResourceCatalog, API_VERSION, ID, KIND, YAML};
use crate::client::{is_not_found, DynamicClient, KubeDynamicClient};
use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::model::{from_object, to_object, to_yaml, ObjectKey, ShapeError};
use crate::plan;
use crate::schema::{has_errors, Diagnostic, ProviderSchema, Schema};
use crate::server::ProviderService;
use crate::types::{ImportedResource, PlanResult, ProviderMetadata, ServerCapabilities};
use crate::validation::validate;
use crate::wait::WaitForDelete;

/// State set by `configure`.
#[derive(Clone)]
struct Configured {
    config: ProviderConfig,
    /// `None` in offline mode.
    client: Option<Arc<dyn DynamicClient>>,
}

/// Provider for the custom resource types of a catalog.
pub struct CrdProvider {
    catalog: Arc<ResourceCatalog>,
    schema: ProviderSchema,
    client: Option<Arc<dyn DynamicClient>>,
    configured: RwLock<Option<Configured>>,
}

impl CrdProvider {
    /// Create a provider serving `catalog`.
    pub fn new(catalog: ResourceCatalog) -> Self {
        let schema = catalog.provider_schema(ProviderConfig::schema());
        Self {
            catalog: Arc::new(catalog),
            schema,
            client: None,
            configured: RwLock::new(None),
        }
    }

    /// Use `client` instead of connecting to the cluster named by the
    /// provider configuration.
    pub fn with_client(mut self, client: impl DynamicClient + 'static) -> Self {
        self.client = Some(Arc::new(client));
        self
    }

    /// The CRD types this provider serves.
    pub fn catalog(&self) -> &ResourceCatalog {
        &self.catalog
    }

    fn resource(&self, type_name: &str) -> Result<&CustomResourceType, ProviderError> {
        self.catalog
            .resource(type_name)
            .ok_or_else(|| ProviderError::UnknownResource(type_name.to_string()))
    }

    async fn configured(&self) -> Result<Configured, ProviderError> {
        self.configured.read().await.clone().ok_or_else(|| {
            ProviderError::Configuration("the provider has not been configured".to_string())
        })
    }

    /// The configuration and client for an operation against `target`.
    async fn cluster(
        &self,
        verb: &str,
        target: &str,
    ) -> Result<(ProviderConfig, Arc<dyn DynamicClient>), ProviderError> {
        let configured = self.configured().await?;
        match configured.client {
            Some(client) => Ok((configured.config, client)),
            None => Err(ProviderError::Offline(format!("cannot {} {}", verb, target))),
        }
    }

    /// Server-side apply the object described by `planned`.
    async fn apply(
        &self,
        entry: &CustomResourceType,
        planned: &Value,
    ) -> Result<Value, ProviderError> {
        let key = object_key(planned)?;
        let target = entry.describe(key.namespace(), &key.name);
        let (config, client) = self.cluster("apply", &target).await?;

        let object = to_object(entry.api_version(), &entry.kind, &entry.resource_schema, planned)
            .map_err(|e| marshal(&target, e))?;
        let applied = client
            .apply(
                &entry.api_resource,
                key.namespace(),
                &key.name,
                &object,
                &config.apply_options(),
            )
            .await
            .map_err(|source| ProviderError::Patch {
                target: target.clone(),
                source,
            })?;

        info!(
            target_object = %target,
            field_manager = %config.field_manager,
            force = config.force_conflicts,
            "Applied object"
        );
        from_object(
            entry.api_version(),
            &entry.kind,
            &entry.resource_schema,
            &applied,
            Some(planned),
        )
        .map_err(|e| unmarshal(&target, e))
    }

    /// GET an object, converting it with `schema`.
    ///
    /// Returns `Ok(None)` when the server answers 404.
    async fn fetch(
        &self,
        entry: &CustomResourceType,
        schema: &Schema,
        key: &ObjectKey,
        carry: Option<&Value>,
    ) -> Result<Option<Value>, ProviderError> {
        let target = entry.describe(key.namespace(), &key.name);
        let (_, client) = self.cluster("read", &target).await?;

        let object = match client.get(&entry.api_resource, key.namespace(), &key.name).await {
            Ok(object) => object,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(source) => return Err(ProviderError::Get { target, source }),
        };
        from_object(entry.api_version(), &entry.kind, schema, &object, carry)
            .map(Some)
            .map_err(|e| unmarshal(&target, e))
    }

    /// Render a manifest data source. Needs no cluster.
    fn render_manifest(
        &self,
        entry: &CustomResourceType,
        config: &Value,
    ) -> Result<Value, ProviderError> {
        let key = object_key(config)?;
        let target = entry.describe(key.namespace(), &key.name);

        let object = to_object(entry.api_version(), &entry.kind, &entry.manifest_schema, config)
            .map_err(|e| marshal(&target, e))?;
        let yaml = to_yaml(&object).map_err(|e| ProviderError::Marshal {
            target: target.clone(),
            message: e.to_string(),
        })?;

        let mut state = config.clone();
        if let Value::Object(fields) = &mut state {
            fields.insert(ID.to_string(), Value::String(key.to_string()));
            fields.insert(API_VERSION.to_string(), Value::String(entry.api_version().to_string()));
            fields.insert(KIND.to_string(), Value::String(entry.kind.clone()));
            fields.insert(YAML.to_string(), Value::String(yaml));
        }
        debug!(target_object = %target, "Rendered manifest");
        Ok(state)
    }
}

fn object_key(state: &Value) -> Result<ObjectKey, ProviderError> {
    ObjectKey::from_metadata(state)
        .ok_or_else(|| ProviderError::InvalidRequest("metadata.name is required".to_string()))
}

/// Key of the object a resource state refers to, falling back to its `id`.
fn state_key(entry: &CustomResourceType, state: &Value) -> Result<ObjectKey, ProviderError> {
    match ObjectKey::from_metadata(state) {
        Some(key) => Ok(key),
        None => match state.get(ID).and_then(Value::as_str) {
            Some(id) => ObjectKey::parse(id, entry.namespaced),
            None => Err(ProviderError::InvalidRequest(
                "state has neither metadata.name nor id".to_string(),
            )),
        },
    }
}

fn marshal(target: &str, err: ShapeError) -> ProviderError {
    ProviderError::Marshal {
        target: target.to_string(),
        message: err.to_string(),
    }
}

fn unmarshal(target: &str, err: ShapeError) -> ProviderError {
    ProviderError::Unmarshal {
        target: target.to_string(),
        message: err.to_string(),
    }
}

#[async_trait::async_trait]
impl ProviderService for CrdProvider {
    fn schema(&self) -> ProviderSchema {
        self.schema.clone()
    }

    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            resources: self.catalog.resource_names(),
            data_sources: self.catalog.data_source_names(),
            capabilities: ServerCapabilities { plan_destroy: true },
        }
    }

    async fn validate_provider_config(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        let mut diagnostics = validate(&self.schema.provider, &config);
        if has_errors(&diagnostics) {
            return Ok(diagnostics);
        }
        match ProviderConfig::from_value(&config) {
            Ok(parsed) => diagnostics.extend(parsed.validate()),
            Err(e) => diagnostics.push(Diagnostic::error(e.to_string())),
        }
        Ok(diagnostics)
    }

    async fn configure(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        let diagnostics = self.validate_provider_config(config.clone()).await?;
        if has_errors(&diagnostics) {
            warn!(diagnostics = diagnostics.len(), "Provider configuration is invalid");
            return Ok(diagnostics);
        }
        let config = ProviderConfig::from_value(&config)?;

        let client: Option<Arc<dyn DynamicClient>> = if config.offline {
            None
        } else if let Some(client) = &self.client {
            Some(Arc::clone(client))
        } else {
            Some(Arc::new(KubeDynamicClient::new(config.connect().await?)))
        };

        info!(
            offline = config.offline,
            field_manager = %config.field_manager,
            force_conflicts = config.force_conflicts,
            types = self.catalog.len(),
            "Provider configured"
        );
        *self.configured.write().await = Some(Configured { config, client });
        Ok(diagnostics)
    }

    async fn stop(&self) -> Result<(), ProviderError> {
        *self.configured.write().await = None;
        debug!("Provider stopped");
        Ok(())
    }

    async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        let entry = self.resource(resource_type)?;
        let mut diagnostics = validate(&entry.resource_schema, &config);
        if let Err(errors) = WaitForDelete::from_state(&config) {
            diagnostics.extend(errors);
        }
        Ok(diagnostics)
    }

    async fn upgrade_resource_state(
        &self,
        resource_type: &str,
        version: i64,
        state: Value,
    ) -> Result<Value, ProviderError> {
        let entry = self.resource(resource_type)?;
        if version == entry.resource_schema.version as i64 {
            Ok(state)
        } else {
            Err(ProviderError::Unimplemented(format!(
                "upgrading {} state from version {}",
                resource_type, version
            )))
        }
    }

    async fn plan(
        &self,
        resource_type: &str,
        prior_state: Option<Value>,
        proposed_state: Value,
        _config: Value,
    ) -> Result<PlanResult, ProviderError> {
        let entry = self.resource(resource_type)?;
        let prior_state = prior_state.filter(|state| !state.is_null());

        if proposed_state.is_null() {
            return Ok(match prior_state {
                Some(prior) => {
                    PlanResult::with_changes(Value::Null, plan::diff(&prior, &Value::Null), false)
                },
                None => PlanResult::no_change(Value::Null),
            });
        }

        Ok(plan::plan(
            entry.api_version(),
            &entry.kind,
            &entry.resource_schema,
            prior_state.as_ref(),
            &proposed_state,
        ))
    }

    async fn create(&self, resource_type: &str, planned_state: Value) -> Result<Value, ProviderError> {
        let entry = self.resource(resource_type)?;
        self.apply(entry, &planned_state).await
    }

    async fn read(&self, resource_type: &str, current_state: Value) -> Result<Value, ProviderError> {
        let entry = self.resource(resource_type)?;
        let key = state_key(entry, &current_state)?;

        match self
            .fetch(entry, &entry.resource_schema, &key, Some(&current_state))
            .await?
        {
            Some(state) => Ok(state),
            None => {
                info!(target_object = %entry.describe(key.namespace(), &key.name), "Object is gone, removing it from state");
                Ok(Value::Null)
            },
        }
    }

    async fn update(
        &self,
        resource_type: &str,
        _prior_state: Value,
        planned_state: Value,
    ) -> Result<Value, ProviderError> {
        let entry = self.resource(resource_type)?;
        self.apply(entry, &planned_state).await
    }

    async fn delete(&self, resource_type: &str, current_state: Value) -> Result<(), ProviderError> {
        let entry = self.resource(resource_type)?;
        let key = state_key(entry, &current_state)?;
        let target = entry.describe(key.namespace(), &key.name);
        let wait = WaitForDelete::from_state(&current_state).map_err(|diagnostics| {
            ProviderError::Validation(
                diagnostics
                    .iter()
                    .map(|d| d.summary.as_str())
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })?;
        let (_, client) = self.cluster("delete", &target).await?;

        match client.delete(&entry.api_resource, key.namespace(), &key.name).await {
            Ok(()) => info!(target_object = %target, "Deleted object"),
            Err(e) if is_not_found(&e) => {
                debug!(target_object = %target, "Object was already gone");
                return Ok(());
            },
            Err(source) => return Err(ProviderError::Delete { target, source }),
        }

        if let Some(wait) = wait {
            debug!(
                target_object = %target,
                timeout = ?wait.timeout,
                poll_interval = ?wait.poll_interval,
                "Waiting for deletion"
            );
            wait.wait(client.as_ref(), &entry.api_resource, key.namespace(), &key.name, &target)
                .await?;
        }
        Ok(())
    }

    async fn import_resource(&self, resource_type: &str, id: &str) -> Result<Vec<ImportedResource>, ProviderError> {
        let entry = self.resource(resource_type)?;
        let key = ObjectKey::parse(id, entry.namespaced)?;

        match self.fetch(entry, &entry.resource_schema, &key, None).await? {
            Some(state) => {
                info!(target_object = %entry.describe(key.namespace(), &key.name), "Imported object");
                Ok(vec![ImportedResource::new(resource_type, state)])
            },
            None => Err(ProviderError::NotFound(entry.describe(key.namespace(), &key.name))),
        }
    }

    async fn validate_data_source_config(
        &self,
        data_source_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        if let Some(entry) = self.catalog.manifest(data_source_type) {
            return Ok(validate(&entry.manifest_schema, &config));
        }
        match self.catalog.data_source(data_source_type) {
            Some(entry) => Ok(validate(&entry.data_source_schema, &config)),
            None => Err(ProviderError::UnknownResource(data_source_type.to_string())),
        }
    }

    async fn read_data_source(&self, data_source_type: &str, config: Value) -> Result<Value, ProviderError> {
        if let Some(entry) = self.catalog.manifest(data_source_type) {
            return self.render_manifest(entry, &config);
        }
        let entry = self
            .catalog
            .data_source(data_source_type)
            .ok_or_else(|| ProviderError::UnknownResource(data_source_type.to_string()))?;

        let key = object_key(&config)?;
        match self
            .fetch(entry, &entry.data_source_schema, &key, Some(&config))
            .await?
        {
            Some(state) => Ok(state),
            None => Err(ProviderError::NotFound(entry.describe(key.namespace(), &key.name))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{assert_error_contains, MockDynamicClient};
    use serde_json::json;

    const WIDGET_CRD: &str = r#"
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: widgets.example.com
spec:
  group: example.com
  scope: Namespaced
  names:
    kind: Widget
    plural: widgets
  versions:
    - name: v1
      served: true
      storage: true
      schema:
        openAPIV3Schema:
          type: object
          properties:
            spec:
              type: object
              properties:
                size:
                  type: integer
"#;

    const RESOURCE: &str = "k8s_example_com_widget_v1";

    fn provider() -> (CrdProvider, MockDynamicClient) {
        let mut catalog = ResourceCatalog::new("k8s");
        catalog.load_str(WIDGET_CRD, "widgets.yaml").unwrap();
        let client = MockDynamicClient::new();
        (CrdProvider::new(catalog).with_client(client.clone()), client)
    }

    fn widget() -> Value {
        json!({
            "metadata": {"name": "demo", "namespace": "default"},
            "spec": {"size": 2}
        })
    }

    #[tokio::test]
    async fn test_unconfigured() {
        let (provider, client) = provider();
        let err = provider.create(RESOURCE, widget()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Configuration(_)));
        assert_eq!(client.counts().apply, 0);
    }

    #[tokio::test]
    async fn test_unknown_type() {
        let (provider, _) = provider();
        let err = provider.read("k8s_example_com_gizmo_v1", widget()).await.unwrap_err();
        assert_eq!(err.to_string(), "Unknown resource type: k8s_example_com_gizmo_v1");

        let err = provider
            .read_data_source("k8s_example_com_gizmo_v1_manifest", widget())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::UnknownResource(_)));
    }

    #[tokio::test]
    async fn test_offline_rejects_cluster_operations() {
        let (provider, client) = provider();
        let diagnostics = provider.configure(json!({"offline": true})).await.unwrap();
        assert!(diagnostics.is_empty());

        let err = provider.create(RESOURCE, widget()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Provider is offline: cannot apply Widget default/demo"
        );
        let err = provider.delete(RESOURCE, widget()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Offline(_)));
        let err = provider.read_data_source(RESOURCE, widget()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Offline(_)));
        assert_eq!(client.counts(), Default::default());

        let plan = provider.plan(RESOURCE, None, widget(), widget()).await.unwrap();
        assert!(plan.has_changes());
    }

    #[tokio::test]
    async fn test_configure_reports_conflicts() {
        let (provider, _) = provider();
        let diagnostics = provider
            .configure(json!({"offline": true, "context": "prod"}))
            .await
            .unwrap();
        assert_error_contains(&diagnostics, "cannot be combined with 'offline'");

        let err = provider.create(RESOURCE, widget()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_read_missing_returns_null() {
        let (provider, _) = provider();
        provider.configure(json!({})).await.unwrap();
        let state = provider.read(RESOURCE, widget()).await.unwrap();
        assert!(state.is_null());
    }

    #[tokio::test]
    async fn test_read_by_id() {
        let (provider, client) = provider();
        provider.configure(json!({})).await.unwrap();
        client.insert(
            &provider.catalog().resource(RESOURCE).unwrap().api_resource,
            Some("default"),
            json!({
                "apiVersion": "example.com/v1",
                "kind": "Widget",
                "metadata": {"name": "demo", "namespace": "default"},
                "spec": {"size": 5}
            }),
        );

        let state = provider.read(RESOURCE, json!({"id": "default/demo"})).await.unwrap();
        assert_eq!(state["spec"]["size"], 5);
        assert_eq!(state["id"], "default/demo");
    }

    #[tokio::test]
    async fn test_get_failure_is_reported() {
        let (provider, client) = provider();
        provider.configure(json!({})).await.unwrap();
        client.fail_next_get(403, "Forbidden");

        let err = provider.read(RESOURCE, widget()).await.unwrap_err();
        assert!(err.to_string().starts_with("Unable to GET Widget default/demo: "));
    }

    #[tokio::test]
    async fn test_plan_destroy() {
        let (provider, _) = provider();
        let prior = json!({"metadata": {"name": "demo", "namespace": "default"}});
        let plan = provider
            .plan(RESOURCE, Some(prior), Value::Null, Value::Null)
            .await
            .unwrap();
        assert!(plan.planned_state.is_null());
        assert!(plan.has_changes());
        assert!(!plan.requires_replace);
    }

    #[tokio::test]
    async fn test_upgrade_state() {
        let (provider, _) = provider();
        let state = provider
            .upgrade_resource_state(RESOURCE, 0, widget())
            .await
            .unwrap();
        assert_eq!(state, widget());
        assert!(provider.upgrade_resource_state(RESOURCE, 3, widget()).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_clears_configuration() {
        let (provider, _) = provider();
        provider.configure(json!({})).await.unwrap();
        provider.stop().await.unwrap();
        let err = provider.read(RESOURCE, widget()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Configuration(_)));
    }
}
