//! The Kubernetes dynamic client used by every resource and data source.
//!
//! All custom resource types share one client; each call names the
//! group/version/resource it targets through a [`ApiResource`].

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::Value;

/// Whether a client error is the API server's 404.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

/// Options for a server-side apply PATCH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOptions {
    /// The field manager that owns the applied fields.
    pub field_manager: String,
    /// Take ownership of fields managed by someone else.
    pub force: bool,
}

/// REST verbs on arbitrary custom resources.
///
/// Objects are exchanged as JSON values carrying `apiVersion`, `kind`,
/// `metadata` and the rest of the object's fields.
#[async_trait]
pub trait DynamicClient: Send + Sync {
    /// GET an object.
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Value, kube::Error>;

    /// Server-side apply an object and return what the server stored.
    async fn apply(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        object: &Value,
        options: &ApplyOptions,
    ) -> Result<Value, kube::Error>;

    /// DELETE an object. Returns once the server accepted the request.
    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), kube::Error>;
}

/// [`DynamicClient`] backed by a live cluster.
#[derive(Clone)]
pub struct KubeDynamicClient {
    client: Client,
}

impl KubeDynamicClient {
    /// Wrap a configured kube client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(namespace) => Api::namespaced_with(self.client.clone(), namespace, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }
}

fn to_value(object: DynamicObject) -> Result<Value, kube::Error> {
    serde_json::to_value(object).map_err(kube::Error::SerdeError)
}

#[async_trait]
impl DynamicClient for KubeDynamicClient {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Value, kube::Error> {
        tracing::debug!(kind = %resource.kind, ?namespace, name, "GET");
        to_value(self.api(resource, namespace).get(name).await?)
    }

    async fn apply(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        object: &Value,
        options: &ApplyOptions,
    ) -> Result<Value, kube::Error> {
        tracing::debug!(
            kind = %resource.kind,
            ?namespace,
            name,
            field_manager = %options.field_manager,
            force = options.force,
            "PATCH (server-side apply)"
        );
        let mut params = PatchParams::apply(&options.field_manager);
        params.force = options.force;
        let applied = self
            .api(resource, namespace)
            .patch(name, &params, &Patch::Apply(object))
            .await?;
        to_value(applied)
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), kube::Error> {
        tracing::debug!(kind = %resource.kind, ?namespace, name, "DELETE");
        self.api(resource, namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }
}
