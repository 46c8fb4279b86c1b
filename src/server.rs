//! The provider-protocol gRPC server.
//!
//! [`ProviderService`] is the Rust-typed view of the protocol; [`serve`] and
//! friends wrap an implementation in the generated tonic service, print the
//! handshake line and run until SIGTERM or SIGINT.
//!
//! # Handshake
//!
//! Once listening, the server prints exactly one line to stdout:
//!
//! ```text
//! KUBECRD_PROVIDER|1|127.0.0.1:50051
//! ```
//!
//! Everything else (logs included) goes to stderr.
//!
//! # Shutdown
//!
//! On a signal the server stops accepting connections and gives in-flight
//! requests [`ServeOptions::shutdown_timeout`] to finish. The provider's
//! `stop()` runs last.

use std::error::Error as _;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpListener;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, instrument, warn};

use crate::error::ProviderError;
use crate::generated as proto;
use crate::schema::{Attribute, Block, BlockNestingMode, Diagnostic, DiagnosticSeverity, ProviderSchema, Schema};
use crate::types::{ImportedResource, PlanResult, ProviderMetadata, HANDSHAKE_PREFIX, PROTOCOL_VERSION};

/// The operations of the provider protocol.
///
/// States, configurations and plans are JSON values shaped by the schemas
/// returned from [`schema`](ProviderService::schema). A null state means
/// "no object".
#[async_trait::async_trait]
pub trait ProviderService: Send + Sync + 'static {
    /// The provider, resource and data source schemas.
    fn schema(&self) -> ProviderSchema;

    /// Type names and capabilities. Derived from the schema by default.
    fn metadata(&self) -> ProviderMetadata {
        let schema = self.schema();
        ProviderMetadata {
            resources: schema.resources.keys().cloned().collect(),
            data_sources: schema.data_sources.keys().cloned().collect(),
            capabilities: Default::default(),
        }
    }

    /// Check the provider block before `configure`.
    async fn validate_provider_config(&self, _config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        Ok(vec![])
    }

    /// Apply the provider block; called once before any cluster operation.
    async fn configure(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError>;

    /// Release the configuration.
    async fn stop(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Static checks of a resource block, without the cluster.
    async fn validate_resource_config(
        &self,
        _resource_type: &str,
        _config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        Ok(vec![])
    }

    /// Bring a state written under an older schema version up to date.
    async fn upgrade_resource_state(
        &self,
        _resource_type: &str,
        _version: i64,
        state: Value,
    ) -> Result<Value, ProviderError> {
        Ok(state)
    }

    /// Plan a create (`prior_state` is `None`), an update, or a destroy
    /// (`proposed_state` is null).
    async fn plan(
        &self,
        resource_type: &str,
        prior_state: Option<Value>,
        proposed_state: Value,
        config: Value,
    ) -> Result<PlanResult, ProviderError>;

    /// Create the object described by `planned_state` and return the resulting state.
    async fn create(&self, resource_type: &str, planned_state: Value) -> Result<Value, ProviderError>;

    /// Refresh a state. Returns null when the object no longer exists.
    async fn read(&self, resource_type: &str, current_state: Value) -> Result<Value, ProviderError>;

    /// Apply `planned_state` over an existing object.
    async fn update(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
    ) -> Result<Value, ProviderError>;

    /// Remove the object behind `current_state`.
    async fn delete(&self, resource_type: &str, current_state: Value) -> Result<(), ProviderError>;

    /// Adopt an existing object by id.
    async fn import_resource(&self, resource_type: &str, _id: &str) -> Result<Vec<ImportedResource>, ProviderError> {
        Err(ProviderError::Unimplemented(format!(
            "import of {}",
            resource_type
        )))
    }

    /// Static checks of a data source block.
    async fn validate_data_source_config(
        &self,
        _data_source_type: &str,
        _config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        Ok(vec![])
    }

    /// Compute a data source's state from its configuration.
    async fn read_data_source(&self, data_source_type: &str, _config: Value) -> Result<Value, ProviderError> {
        Err(ProviderError::UnknownResource(data_source_type.to_string()))
    }
}

/// Adapter from [`ProviderService`] to the generated gRPC trait.
///
/// Provider errors never become gRPC errors; they are reported as error
/// diagnostics in the response.
struct ProviderGrpcService<P: ProviderService> {
    provider: Arc<P>,
}

fn diagnostics_to_proto(diagnostics: Vec<Diagnostic>) -> Vec<proto::Diagnostic> {
    diagnostics
        .into_iter()
        .map(|d| proto::Diagnostic {
            severity: match d.severity {
                DiagnosticSeverity::Error => proto::diagnostic::Severity::Error as i32,
                DiagnosticSeverity::Warning => proto::diagnostic::Severity::Warning as i32,
            },
            summary: d.summary,
            detail: d.detail.unwrap_or_default(),
            attribute: d.attribute.unwrap_or_default(),
        })
        .collect()
}

/// One error diagnostic; the detail lists the error's sources.
fn error_to_diagnostics(err: &ProviderError) -> Vec<proto::Diagnostic> {
    let mut causes = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        causes.push(cause.to_string());
        source = cause.source();
    }
    vec![proto::Diagnostic {
        severity: proto::diagnostic::Severity::Error as i32,
        summary: err.to_string(),
        detail: causes.join(": "),
        attribute: String::new(),
    }]
}

/// Decode a JSON payload. Empty bytes are null.
fn decode(bytes: &[u8]) -> Result<Value, ProviderError> {
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(bytes)
        .map_err(|e| ProviderError::InvalidRequest(format!("malformed JSON payload: {}", e)))
}

/// Encode a JSON payload. Null is sent as empty bytes.
fn encode(value: &Value) -> Vec<u8> {
    if value.is_null() {
        Vec::new()
    } else {
        serde_json::to_vec(value).unwrap_or_default()
    }
}

/// Log a validation outcome and convert it for the wire.
fn validation_response(
    operation: &str,
    type_name: &str,
    result: Result<Vec<Diagnostic>, ProviderError>,
) -> Vec<proto::Diagnostic> {
    match result {
        Ok(diagnostics) => {
            if crate::schema::has_errors(&diagnostics) {
                warn!(operation, type_name, diagnostics = diagnostics.len(), "Completed with errors");
            } else {
                debug!(operation, type_name, "Completed");
            }
            diagnostics_to_proto(diagnostics)
        },
        Err(e) => {
            error!(operation, type_name, error = %e, "Failed");
            error_to_diagnostics(&e)
        },
    }
}

fn schema_to_proto(schema: &Schema) -> proto::Schema {
    proto::Schema {
        version: schema.version as i64,
        block: Some(block_to_proto(&schema.block)),
    }
}

fn attribute_to_proto(name: &str, attr: &Attribute) -> proto::Attribute {
    proto::Attribute {
        name: name.to_string(),
        r#type: serde_json::to_vec(&attr.attr_type).unwrap_or_default(),
        required: attr.flags.required,
        optional: attr.flags.optional,
        computed: attr.flags.computed,
        sensitive: attr.flags.sensitive,
        description: attr.description.clone().unwrap_or_default(),
        force_new: attr.force_new,
        default_value: attr
            .default
            .as_ref()
            .and_then(|v| serde_json::to_vec(v).ok())
            .unwrap_or_default(),
        validators: if attr.validators.is_empty() {
            Vec::new()
        } else {
            serde_json::to_vec(&attr.validators).unwrap_or_default()
        },
    }
}

fn block_to_proto(block: &Block) -> proto::Block {
    proto::Block {
        attributes: block
            .attributes
            .iter()
            .map(|(name, attr)| attribute_to_proto(name, attr))
            .collect(),
        block_types: block
            .blocks
            .iter()
            .map(|(name, nested)| proto::NestedBlock {
                type_name: name.clone(),
                block: Some(block_to_proto(&nested.block)),
                nesting_mode: match nested.nesting_mode {
                    BlockNestingMode::Single => proto::nested_block::NestingMode::Single as i32,
                    BlockNestingMode::List => proto::nested_block::NestingMode::List as i32,
                    BlockNestingMode::Set => proto::nested_block::NestingMode::Set as i32,
                    BlockNestingMode::Map => proto::nested_block::NestingMode::Map as i32,
                },
                min_items: nested.min_items as i32,
                max_items: nested.max_items as i32,
            })
            .collect(),
        description: block.description.clone().unwrap_or_default(),
    }
}

#[tonic::async_trait]
impl<P: ProviderService> proto::provider_server::Provider for ProviderGrpcService<P> {
    #[instrument(skip_all, name = "grpc.get_metadata")]
    async fn get_metadata(
        &self,
        _request: Request<proto::GetMetadataRequest>,
    ) -> Result<Response<proto::GetMetadataResponse>, Status> {
        let metadata = self.provider.metadata();
        debug!(
            resources = metadata.resources.len(),
            data_sources = metadata.data_sources.len(),
            "GetMetadata"
        );
        Ok(Response::new(proto::GetMetadataResponse {
            server_capabilities: Some(proto::ServerCapabilities {
                plan_destroy: metadata.capabilities.plan_destroy,
            }),
            resources: metadata.resources,
            data_sources: metadata.data_sources,
            diagnostics: vec![],
        }))
    }

    #[instrument(skip_all, name = "grpc.get_schema")]
    async fn get_schema(
        &self,
        _request: Request<proto::GetSchemaRequest>,
    ) -> Result<Response<proto::GetSchemaResponse>, Status> {
        let schema = self.provider.schema();
        debug!(
            resources = schema.resources.len(),
            data_sources = schema.data_sources.len(),
            "GetSchema"
        );
        Ok(Response::new(proto::GetSchemaResponse {
            provider: Some(schema_to_proto(&schema.provider)),
            resources: schema
                .resources
                .iter()
                .map(|(name, schema)| (name.clone(), schema_to_proto(schema)))
                .collect(),
            data_sources: schema
                .data_sources
                .iter()
                .map(|(name, schema)| (name.clone(), schema_to_proto(schema)))
                .collect(),
            diagnostics: vec![],
        }))
    }

    #[instrument(skip_all, name = "grpc.validate_provider_config")]
    async fn validate_provider_config(
        &self,
        request: Request<proto::ValidateProviderConfigRequest>,
    ) -> Result<Response<proto::ValidateProviderConfigResponse>, Status> {
        let req = request.into_inner();
        let result = match decode(&req.config) {
            Ok(config) => self.provider.validate_provider_config(config).await,
            Err(e) => Err(e),
        };
        Ok(Response::new(proto::ValidateProviderConfigResponse {
            diagnostics: validation_response("ValidateProviderConfig", "provider", result),
        }))
    }

    #[instrument(skip_all, name = "grpc.configure")]
    async fn configure(
        &self,
        request: Request<proto::ConfigureRequest>,
    ) -> Result<Response<proto::ConfigureResponse>, Status> {
        let req = request.into_inner();
        let result = match decode(&req.config) {
            Ok(config) => self.provider.configure(config).await,
            Err(e) => Err(e),
        };
        Ok(Response::new(proto::ConfigureResponse {
            diagnostics: validation_response("Configure", "provider", result),
        }))
    }

    #[instrument(skip_all, name = "grpc.stop")]
    async fn stop(
        &self,
        _request: Request<proto::StopRequest>,
    ) -> Result<Response<proto::StopResponse>, Status> {
        info!("Stop requested");
        let error = match self.provider.stop().await {
            Ok(()) => String::new(),
            Err(e) => {
                error!(error = %e, "Stop failed");
                e.to_string()
            },
        };
        Ok(Response::new(proto::StopResponse { error }))
    }

    #[instrument(skip_all, name = "grpc.validate_resource_config", fields(resource_type))]
    async fn validate_resource_config(
        &self,
        request: Request<proto::ValidateResourceConfigRequest>,
    ) -> Result<Response<proto::ValidateResourceConfigResponse>, Status> {
        let req = request.into_inner();
        tracing::Span::current().record("resource_type", req.resource_type.as_str());
        let result = match decode(&req.config) {
            Ok(config) => {
                self.provider
                    .validate_resource_config(&req.resource_type, config)
                    .await
            },
            Err(e) => Err(e),
        };
        Ok(Response::new(proto::ValidateResourceConfigResponse {
            diagnostics: validation_response("ValidateResourceConfig", &req.resource_type, result),
        }))
    }

    #[instrument(skip_all, name = "grpc.upgrade_resource_state", fields(resource_type))]
    async fn upgrade_resource_state(
        &self,
        request: Request<proto::UpgradeResourceStateRequest>,
    ) -> Result<Response<proto::UpgradeResourceStateResponse>, Status> {
        let req = request.into_inner();
        tracing::Span::current().record("resource_type", req.resource_type.as_str());
        let result = match decode(&req.raw_state) {
            Ok(state) => {
                self.provider
                    .upgrade_resource_state(&req.resource_type, req.version, state)
                    .await
            },
            Err(e) => Err(e),
        };
        let response = match result {
            Ok(upgraded) => proto::UpgradeResourceStateResponse {
                upgraded_state: encode(&upgraded),
                diagnostics: vec![],
            },
            Err(e) => {
                error!(version = req.version, error = %e, "UpgradeResourceState failed");
                proto::UpgradeResourceStateResponse {
                    upgraded_state: vec![],
                    diagnostics: error_to_diagnostics(&e),
                }
            },
        };
        Ok(Response::new(response))
    }

    #[instrument(skip_all, name = "grpc.plan", fields(resource_type))]
    async fn plan(
        &self,
        request: Request<proto::PlanRequest>,
    ) -> Result<Response<proto::PlanResponse>, Status> {
        let req = request.into_inner();
        tracing::Span::current().record("resource_type", req.resource_type.as_str());

        let decoded = (|| {
            let prior = decode(&req.prior_state)?;
            Ok::<_, ProviderError>((
                (!prior.is_null()).then_some(prior),
                decode(&req.proposed_state)?,
                decode(&req.config)?,
            ))
        })();
        let result = match decoded {
            Ok((prior, proposed, config)) => {
                self.provider
                    .plan(&req.resource_type, prior, proposed, config)
                    .await
            },
            Err(e) => Err(e),
        };

        let response = match result {
            Ok(plan) => {
                info!(
                    changes = plan.changes.len(),
                    requires_replace = plan.requires_replace,
                    "Plan completed"
                );
                proto::PlanResponse {
                    planned_state: encode(&plan.planned_state),
                    changes: plan.changes.into_iter().map(Into::into).collect(),
                    requires_replace: plan.requires_replace,
                    diagnostics: vec![],
                }
            },
            Err(e) => {
                error!(error = %e, "Plan failed");
                proto::PlanResponse {
                    planned_state: vec![],
                    changes: vec![],
                    requires_replace: false,
                    diagnostics: error_to_diagnostics(&e),
                }
            },
        };
        Ok(Response::new(response))
    }

    #[instrument(skip_all, name = "grpc.create", fields(resource_type))]
    async fn create(
        &self,
        request: Request<proto::CreateRequest>,
    ) -> Result<Response<proto::CreateResponse>, Status> {
        let req = request.into_inner();
        tracing::Span::current().record("resource_type", req.resource_type.as_str());
        let result = match decode(&req.planned_state) {
            Ok(planned) => self.provider.create(&req.resource_type, planned).await,
            Err(e) => Err(e),
        };
        let (state, diagnostics) = state_response("Create", result);
        Ok(Response::new(proto::CreateResponse { state, diagnostics }))
    }

    #[instrument(skip_all, name = "grpc.read", fields(resource_type))]
    async fn read(
        &self,
        request: Request<proto::ReadRequest>,
    ) -> Result<Response<proto::ReadResponse>, Status> {
        let req = request.into_inner();
        tracing::Span::current().record("resource_type", req.resource_type.as_str());
        let result = match decode(&req.current_state) {
            Ok(current) => self.provider.read(&req.resource_type, current).await,
            Err(e) => Err(e),
        };
        let (state, diagnostics) = state_response("Read", result);
        Ok(Response::new(proto::ReadResponse { state, diagnostics }))
    }

    #[instrument(skip_all, name = "grpc.update", fields(resource_type))]
    async fn update(
        &self,
        request: Request<proto::UpdateRequest>,
    ) -> Result<Response<proto::UpdateResponse>, Status> {
        let req = request.into_inner();
        tracing::Span::current().record("resource_type", req.resource_type.as_str());
        let result = match (decode(&req.prior_state), decode(&req.planned_state)) {
            (Ok(prior), Ok(planned)) => {
                self.provider
                    .update(&req.resource_type, prior, planned)
                    .await
            },
            (Err(e), _) | (_, Err(e)) => Err(e),
        };
        let (state, diagnostics) = state_response("Update", result);
        Ok(Response::new(proto::UpdateResponse { state, diagnostics }))
    }

    #[instrument(skip_all, name = "grpc.delete", fields(resource_type))]
    async fn delete(
        &self,
        request: Request<proto::DeleteRequest>,
    ) -> Result<Response<proto::DeleteResponse>, Status> {
        let req = request.into_inner();
        tracing::Span::current().record("resource_type", req.resource_type.as_str());
        let result = match decode(&req.current_state) {
            Ok(current) => self.provider.delete(&req.resource_type, current).await,
            Err(e) => Err(e),
        };
        let diagnostics = match result {
            Ok(()) => {
                info!("Delete completed");
                vec![]
            },
            Err(e) => {
                error!(error = %e, "Delete failed");
                error_to_diagnostics(&e)
            },
        };
        Ok(Response::new(proto::DeleteResponse { diagnostics }))
    }

    #[instrument(skip_all, name = "grpc.import_resource_state", fields(resource_type))]
    async fn import_resource_state(
        &self,
        request: Request<proto::ImportResourceStateRequest>,
    ) -> Result<Response<proto::ImportResourceStateResponse>, Status> {
        let req = request.into_inner();
        tracing::Span::current().record("resource_type", req.resource_type.as_str());
        let response = match self
            .provider
            .import_resource(&req.resource_type, &req.id)
            .await
        {
            Ok(imported) => {
                info!(id = %req.id, imported = imported.len(), "Import completed");
                proto::ImportResourceStateResponse {
                    imported: imported
                        .into_iter()
                        .map(|r| proto::ImportedResource {
                            resource_type: r.resource_type,
                            state: encode(&r.state),
                        })
                        .collect(),
                    diagnostics: vec![],
                }
            },
            Err(e) => {
                error!(id = %req.id, error = %e, "Import failed");
                proto::ImportResourceStateResponse {
                    imported: vec![],
                    diagnostics: error_to_diagnostics(&e),
                }
            },
        };
        Ok(Response::new(response))
    }

    #[instrument(skip_all, name = "grpc.validate_data_source_config", fields(data_source_type))]
    async fn validate_data_source_config(
        &self,
        request: Request<proto::ValidateDataSourceConfigRequest>,
    ) -> Result<Response<proto::ValidateDataSourceConfigResponse>, Status> {
        let req = request.into_inner();
        tracing::Span::current().record("data_source_type", req.data_source_type.as_str());
        let result = match decode(&req.config) {
            Ok(config) => {
                self.provider
                    .validate_data_source_config(&req.data_source_type, config)
                    .await
            },
            Err(e) => Err(e),
        };
        Ok(Response::new(proto::ValidateDataSourceConfigResponse {
            diagnostics: validation_response(
                "ValidateDataSourceConfig",
                &req.data_source_type,
                result,
            ),
        }))
    }

    #[instrument(skip_all, name = "grpc.read_data_source", fields(data_source_type))]
    async fn read_data_source(
        &self,
        request: Request<proto::ReadDataSourceRequest>,
    ) -> Result<Response<proto::ReadDataSourceResponse>, Status> {
        let req = request.into_inner();
        tracing::Span::current().record("data_source_type", req.data_source_type.as_str());
        let result = match decode(&req.config) {
            Ok(config) => {
                self.provider
                    .read_data_source(&req.data_source_type, config)
                    .await
            },
            Err(e) => Err(e),
        };
        let (state, diagnostics) = state_response("ReadDataSource", result);
        Ok(Response::new(proto::ReadDataSourceResponse { state, diagnostics }))
    }
}

/// Encoded state and diagnostics of an operation returning a state.
fn state_response(
    operation: &str,
    result: Result<Value, ProviderError>,
) -> (Vec<u8>, Vec<proto::Diagnostic>) {
    match result {
        Ok(state) => {
            debug!(operation, gone = state.is_null(), "Completed");
            (encode(&state), vec![])
        },
        Err(e) => {
            error!(operation, error = %e, "Failed");
            (vec![], error_to_diagnostics(&e))
        },
    }
}

/// Options for running the provider server.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// How long in-flight requests may run after a shutdown signal.
    /// Default: 30 seconds.
    pub shutdown_timeout: Duration,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ServeOptions {
    /// Defaults: a 30 second shutdown timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grace period for in-flight requests once a shutdown signal arrives.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Wait for SIGTERM or SIGINT (CTRL+C on Windows).
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                    _ = sigint.recv() => info!("Received SIGINT, shutting down"),
                }
            },
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "Unable to install signal handlers");
                std::future::pending::<()>().await;
            },
        }
    }

    #[cfg(windows)]
    {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received CTRL+C, shutting down"),
            Err(e) => {
                error!(error = %e, "Unable to install CTRL+C handler");
                std::future::pending::<()>().await;
            },
        }
    }

    #[cfg(not(any(unix, windows)))]
    std::future::pending::<()>().await;
}

/// Serve on a free loopback port with default options.
pub async fn serve<P: ProviderService>(provider: P) -> Result<(), ProviderError> {
    serve_with_options(provider, ServeOptions::default()).await
}

/// Serve on a free loopback port.
pub async fn serve_with_options<P: ProviderService>(
    provider: P,
    options: ServeOptions,
) -> Result<(), ProviderError> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    serve_with_shutdown(provider, listener, options, wait_for_shutdown_signal()).await
}

/// Serve on `addr`. Port 0 picks a free port.
pub async fn serve_on_with_options<P: ProviderService>(
    provider: P,
    addr: SocketAddr,
    options: ServeOptions,
) -> Result<(), ProviderError> {
    let listener = TcpListener::bind(addr).await?;
    serve_with_shutdown(provider, listener, options, wait_for_shutdown_signal()).await
}

/// Serve on a bound listener until `signal` completes.
pub async fn serve_with_shutdown<P, F>(
    provider: P,
    listener: TcpListener,
    options: ServeOptions,
    signal: F,
) -> Result<(), ProviderError>
where
    P: ProviderService,
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    println!("{}|{}|{}", HANDSHAKE_PREFIX, PROTOCOL_VERSION, addr);
    info!(address = %addr, "Provider server starting");

    let provider = Arc::new(provider);
    let service = proto::provider_server::ProviderServer::new(ProviderGrpcService {
        provider: Arc::clone(&provider),
    });

    let (signalled_tx, signalled_rx) = tokio::sync::oneshot::channel::<()>();
    let server = Server::builder()
        .add_service(service)
        .serve_with_incoming_shutdown(
            tokio_stream::wrappers::TcpListenerStream::new(listener),
            async move {
                signal.await;
                let _ = signalled_tx.send(());
            },
        );
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => result?,
        _ = signalled_rx => {
            match tokio::time::timeout(options.shutdown_timeout, &mut server).await {
                Ok(result) => result?,
                Err(_) => warn!(
                    timeout = ?options.shutdown_timeout,
                    "Shutdown timeout exceeded, abandoning in-flight requests"
                ),
            }
        },
    }

    if let Err(e) = provider.stop().await {
        warn!(error = %e, "Provider stop failed");
    }
    info!("Provider shutdown complete");
    Ok(())
}
