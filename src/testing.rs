//! Testing utilities.
//!
//! [`ProviderTester`] drives a [`ProviderService`] in-process, without a gRPC
//! server. [`MockDynamicClient`] is an in-memory API server standing in for a
//! cluster.
//!
//! # Example
//!
//! ```ignore
//! use kubecrd_provider::testing::{MockDynamicClient, ProviderTester};
//! use kubecrd_provider::{CrdProvider, ResourceCatalog};
//! use serde_json::json;
//!
//! #[tokio::test]
//! async fn test_create_widget() {
//!     let client = MockDynamicClient::new();
//!     let provider = CrdProvider::new(catalog).with_client(client.clone());
//!     let tester = ProviderTester::new(provider);
//!     tester.configure(json!({})).await.unwrap();
//!
//!     let state = tester
//!         .lifecycle_create("k8s_example_com_widget_v1", widget_config())
//!         .await
//!         .unwrap();
//!     assert_eq!(state["id"], "default/demo");
//!     assert_eq!(client.counts().apply, 1);
//! }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};

use async_trait::async_trait;
use kube::core::ErrorResponse;
use kube::discovery::ApiResource;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::client::{ApplyOptions, DynamicClient};
use crate::error::ProviderError;
use crate::schema::{Diagnostic, ProviderSchema};
use crate::server::ProviderService;
use crate::types::{ImportedResource, PlanResult};

/// A test harness for provider implementations.
pub struct ProviderTester<P: ProviderService> {
    provider: P,
}

impl<P: ProviderService> ProviderTester<P> {
    /// Create a new tester for the given provider.
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    /// The provider under test.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn schema(&self) -> ProviderSchema {
        self.provider.schema()
    }

    pub fn resource_types(&self) -> Vec<String> {
        self.provider.metadata().resources
    }

    pub fn data_source_types(&self) -> Vec<String> {
        self.provider.metadata().data_sources
    }

    /// Validate provider configuration, failing on error diagnostics.
    pub async fn validate_provider_config(&self, config: Value) -> Result<(), TestError> {
        let diagnostics = self.provider.validate_provider_config(config).await?;
        check_diagnostics(diagnostics)
    }

    /// Configure the provider, failing on error diagnostics.
    pub async fn configure(&self, config: Value) -> Result<(), TestError> {
        let diagnostics = self.provider.configure(config).await?;
        check_diagnostics(diagnostics)
    }

    pub async fn stop(&self) -> Result<(), ProviderError> {
        self.provider.stop().await
    }

    /// Validate a resource configuration, failing on error diagnostics.
    pub async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<(), TestError> {
        let diagnostics = self
            .provider
            .validate_resource_config(resource_type, config)
            .await?;
        check_diagnostics(diagnostics)
    }

    /// Plan a create. The configuration doubles as the proposed state.
    pub async fn plan_create(
        &self,
        resource_type: &str,
        proposed_state: Value,
    ) -> Result<PlanResult, ProviderError> {
        self.provider
            .plan(resource_type, None, proposed_state.clone(), proposed_state)
            .await
    }

    /// Plan an update of `prior_state`.
    pub async fn plan_update(
        &self,
        resource_type: &str,
        prior_state: Value,
        proposed_state: Value,
    ) -> Result<PlanResult, ProviderError> {
        self.provider
            .plan(
                resource_type,
                Some(prior_state),
                proposed_state.clone(),
                proposed_state,
            )
            .await
    }

    pub async fn create(
        &self,
        resource_type: &str,
        planned_state: Value,
    ) -> Result<Value, ProviderError> {
        self.provider.create(resource_type, planned_state).await
    }

    pub async fn read(
        &self,
        resource_type: &str,
        current_state: Value,
    ) -> Result<Value, ProviderError> {
        self.provider.read(resource_type, current_state).await
    }

    pub async fn update(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
    ) -> Result<Value, ProviderError> {
        self.provider
            .update(resource_type, prior_state, planned_state)
            .await
    }

    pub async fn delete(
        &self,
        resource_type: &str,
        current_state: Value,
    ) -> Result<(), ProviderError> {
        self.provider.delete(resource_type, current_state).await
    }

    pub async fn import_resource(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError> {
        self.provider.import_resource(resource_type, id).await
    }

    /// Validate a data source configuration, failing on error diagnostics.
    pub async fn validate_data_source_config(
        &self,
        data_source_type: &str,
        config: Value,
    ) -> Result<(), TestError> {
        let diagnostics = self
            .provider
            .validate_data_source_config(data_source_type, config)
            .await?;
        check_diagnostics(diagnostics)
    }

    pub async fn read_data_source(
        &self,
        data_source_type: &str,
        config: Value,
    ) -> Result<Value, ProviderError> {
        self.provider
            .read_data_source(data_source_type, config)
            .await
    }

    /// Plan, create, then read back. Returns the state after the read.
    pub async fn lifecycle_create(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Value, ProviderError> {
        let plan = self.plan_create(resource_type, config).await?;
        let created = self.create(resource_type, plan.planned_state).await?;
        self.read(resource_type, created).await
    }

    /// Plan, update, then read back. Returns the state after the read.
    pub async fn lifecycle_update(
        &self,
        resource_type: &str,
        prior_state: Value,
        proposed_state: Value,
    ) -> Result<Value, ProviderError> {
        let plan = self
            .plan_update(resource_type, prior_state.clone(), proposed_state)
            .await?;
        let updated = self
            .update(resource_type, prior_state, plan.planned_state)
            .await?;
        self.read(resource_type, updated).await
    }

    /// Create, update, then delete. Returns the state after the update.
    pub async fn lifecycle_crud(
        &self,
        resource_type: &str,
        initial_config: Value,
        updated_config: Value,
    ) -> Result<Value, ProviderError> {
        let created = self.lifecycle_create(resource_type, initial_config).await?;
        let updated = self
            .lifecycle_update(resource_type, created, updated_config)
            .await?;
        self.delete(resource_type, updated.clone()).await?;
        Ok(updated)
    }
}

/// Failure of a tester operation.
#[derive(Debug, Error)]
pub enum TestError {
    /// The operation returned error diagnostics.
    #[error("operation failed with {} diagnostic(s): {}", .0.len(), summarize(.0))]
    Diagnostics(Vec<Diagnostic>),
    /// The operation returned a provider error.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}

fn summarize(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(|d| {
            let mut line = d.summary.clone();
            if let Some(detail) = &d.detail {
                line.push_str(": ");
                line.push_str(detail);
            }
            if let Some(attribute) = &d.attribute {
                line.push_str(&format!(" (at {})", attribute));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn check_diagnostics(diagnostics: Vec<Diagnostic>) -> Result<(), TestError> {
    let errors: Vec<_> = diagnostics.into_iter().filter(Diagnostic::is_error).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(TestError::Diagnostics(errors))
    }
}

// =========================================================================
// Assertion Helpers
// =========================================================================

/// Assert that a plan has changes and does not replace.
pub fn assert_plan_creates(plan: &PlanResult) {
    assert!(
        plan.has_changes(),
        "Expected plan to have changes for create, but got no changes"
    );
    assert!(!plan.requires_replace, "Expected plan to create, not replace");
}

/// Assert that a plan has no changes.
pub fn assert_plan_no_changes(plan: &PlanResult) {
    assert!(
        !plan.has_changes(),
        "Expected no changes, but got {:?}",
        plan.changes.iter().map(|c| &c.path).collect::<Vec<_>>()
    );
}

pub fn assert_plan_replaces(plan: &PlanResult) {
    assert!(
        plan.requires_replace,
        "Expected plan to require replacement, but it does not"
    );
}

pub fn assert_plan_updates_in_place(plan: &PlanResult) {
    assert!(plan.has_changes(), "Expected plan to have changes");
    assert!(
        !plan.requires_replace,
        "Expected plan to update in place, but it requires replacement"
    );
}

/// Assert that a plan changes the attribute at `path` (dotted).
pub fn assert_plan_changes_attribute(plan: &PlanResult, path: &str) {
    assert!(
        plan.changes.iter().any(|c| c.path == path),
        "Expected plan to change '{}'. Changed attributes: {:?}",
        path,
        plan.changes.iter().map(|c| &c.path).collect::<Vec<_>>()
    );
}

pub fn assert_no_errors(diagnostics: &[Diagnostic]) {
    let errors: Vec<_> = diagnostics.iter().filter(|d| d.is_error()).collect();
    assert!(
        errors.is_empty(),
        "Expected no errors, but got {:?}",
        errors.iter().map(|d| &d.summary).collect::<Vec<_>>()
    );
}

/// Assert that some error diagnostic's summary contains `substring`.
pub fn assert_error_contains(diagnostics: &[Diagnostic], substring: &str) {
    assert!(
        diagnostics
            .iter()
            .any(|d| d.is_error() && d.summary.contains(substring)),
        "Expected an error containing '{}'. Errors: {:?}",
        substring,
        diagnostics
            .iter()
            .filter(|d| d.is_error())
            .map(|d| &d.summary)
            .collect::<Vec<_>>()
    );
}

// =========================================================================
// Mock dynamic client
// =========================================================================

/// Number of calls made to a [`MockDynamicClient`], failed ones included.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OperationCounts {
    pub get: usize,
    pub apply: usize,
    pub delete: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Verb {
    Get,
    Apply,
    Delete,
}

/// `(group/version/plural, namespace, name)`
type ObjectRef = (String, Option<String>, String);

#[derive(Default)]
struct MockState {
    objects: HashMap<ObjectRef, Value>,
    /// Deleted objects still visible to GET, with the number of GETs left.
    terminating: HashMap<ObjectRef, (Value, u32)>,
    linger: u32,
    failures: HashMap<Verb, VecDeque<ErrorResponse>>,
    counts: OperationCounts,
    last_apply: Option<ApplyOptions>,
    resource_version: u64,
}

impl MockState {
    fn take_failure(&mut self, verb: Verb) -> Option<kube::Error> {
        self.failures
            .get_mut(&verb)
            .and_then(VecDeque::pop_front)
            .map(kube::Error::Api)
    }

    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

/// In-memory [`DynamicClient`].
///
/// Apply merges the applied object into the stored one the way server-side
/// apply does for a single manager, assigning `metadata.uid` on create and a
/// fresh `metadata.resourceVersion` on every write. Clones share storage.
#[derive(Clone, Default)]
pub struct MockDynamicClient {
    state: Arc<RwLock<MockState>>,
}

fn object_ref(resource: &ApiResource, namespace: Option<&str>, name: &str) -> ObjectRef {
    (
        format!("{}/{}", resource.api_version, resource.plural),
        namespace.map(str::to_string),
        name.to_string(),
    )
}

/// A `kube::Error::Api` as the API server reports it.
pub fn api_error(code: u16, reason: &str, message: impl Into<String>) -> kube::Error {
    kube::Error::Api(error_response(code, reason, message))
}

fn error_response(code: u16, reason: &str, message: impl Into<String>) -> ErrorResponse {
    ErrorResponse {
        status: "Failure".to_string(),
        message: message.into(),
        reason: reason.to_string(),
        code,
    }
}

fn not_found(resource: &ApiResource, name: &str) -> kube::Error {
    api_error(
        404,
        "NotFound",
        format!("{}.{} \"{}\" not found", resource.plural, resource.group, name),
    )
}

fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => merge(existing, value),
                    _ => {
                        target.insert(key.clone(), value.clone());
                    },
                }
            }
        },
        (target, patch) => *target = patch.clone(),
    }
}

fn metadata_mut(object: &mut Value) -> Option<&mut Map<String, Value>> {
    let fields = object.as_object_mut()?;
    fields
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
}

impl MockDynamicClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> RwLockWriteGuard<'_, MockState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an object as if it already existed on the server.
    pub fn insert(&self, resource: &ApiResource, namespace: Option<&str>, object: Value) {
        let name = object
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let key = object_ref(resource, namespace, &name);
        self.lock().objects.insert(key, object);
    }

    /// The stored object, if any. Terminating objects are not included.
    pub fn object(&self, resource: &ApiResource, namespace: Option<&str>, name: &str) -> Option<Value> {
        self.lock()
            .objects
            .get(&object_ref(resource, namespace, name))
            .cloned()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keep each object deleted from now on visible for `gets` more GETs,
    /// like an object held back by a finalizer.
    pub fn linger_on_delete(&self, gets: u32) {
        self.lock().linger = gets;
    }

    /// Fail the next GET with the given HTTP status and reason.
    pub fn fail_next_get(&self, code: u16, reason: &str) {
        self.fail_next(Verb::Get, code, reason);
    }

    /// Fail the next apply with the given HTTP status and reason.
    pub fn fail_next_apply(&self, code: u16, reason: &str) {
        self.fail_next(Verb::Apply, code, reason);
    }

    /// Fail the next DELETE with the given HTTP status and reason.
    pub fn fail_next_delete(&self, code: u16, reason: &str) {
        self.fail_next(Verb::Delete, code, reason);
    }

    fn fail_next(&self, verb: Verb, code: u16, reason: &str) {
        self.lock()
            .failures
            .entry(verb)
            .or_default()
            .push_back(error_response(code, reason, format!("injected {} failure", reason)));
    }

    pub fn counts(&self) -> OperationCounts {
        self.lock().counts
    }

    pub fn reset_counts(&self) {
        self.lock().counts = OperationCounts::default();
    }

    /// Options of the most recent apply.
    pub fn last_apply_options(&self) -> Option<ApplyOptions> {
        self.lock().last_apply.clone()
    }
}

#[async_trait]
impl DynamicClient for MockDynamicClient {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Value, kube::Error> {
        let mut state = self.lock();
        state.counts.get += 1;
        if let Some(err) = state.take_failure(Verb::Get) {
            return Err(err);
        }

        let key = object_ref(resource, namespace, name);
        if let Some(object) = state.objects.get(&key) {
            return Ok(object.clone());
        }

        match state.terminating.get_mut(&key) {
            Some((object, remaining)) => {
                let object = object.clone();
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    state.terminating.remove(&key);
                }
                Ok(object)
            },
            None => Err(not_found(resource, name)),
        }
    }

    async fn apply(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        object: &Value,
        options: &ApplyOptions,
    ) -> Result<Value, kube::Error> {
        let mut state = self.lock();
        state.counts.apply += 1;
        state.last_apply = Some(options.clone());
        if let Some(err) = state.take_failure(Verb::Apply) {
            return Err(err);
        }
        if !object.is_object() {
            return Err(api_error(400, "BadRequest", "the applied object must be a JSON object"));
        }

        let key = object_ref(resource, namespace, name);
        let uid = format!("uid-{}", state.objects.len() + state.terminating.len() + 1);
        let resource_version = state.next_resource_version();
        let stored = state.objects.entry(key).or_insert_with(|| {
            let mut created = Value::Object(Map::new());
            if let Some(metadata) = metadata_mut(&mut created) {
                metadata.insert("uid".to_string(), Value::String(uid));
            }
            created
        });
        merge(stored, object);
        if let Some(metadata) = metadata_mut(stored) {
            metadata.insert("resourceVersion".to_string(), Value::String(resource_version));
        }
        Ok(stored.clone())
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), kube::Error> {
        let mut state = self.lock();
        state.counts.delete += 1;
        if let Some(err) = state.take_failure(Verb::Delete) {
            return Err(err);
        }

        let key = object_ref(resource, namespace, name);
        match state.objects.remove(&key) {
            Some(object) => {
                if state.linger > 0 {
                    let linger = state.linger;
                    state.terminating.insert(key, (object, linger));
                }
                Ok(())
            },
            None if state.terminating.contains_key(&key) => Ok(()),
            None => Err(not_found(resource, name)),
        }
    }
}
