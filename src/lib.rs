//! Kubernetes custom resources as infrastructure-as-code resources.
//!
//! The provider reads CustomResourceDefinition manifests at startup and serves
//! each served CRD version as three types:
//!
//! - a **resource** (`k8s_<group>_<kind>_<version>`), created and updated with
//!   server-side apply and removed with DELETE plus an optional delete-wait,
//! - a **data source** of the same name, reading one object with GET,
//! - a **manifest data source** (`..._manifest`), rendering the configured
//!   object as YAML without contacting the cluster.
//!
//! All types share one schema-driven engine ([`CrdProvider`]) and one
//! Kubernetes dynamic client ([`client::DynamicClient`]).
//!
//! # Quick Start
//!
//! ```no_run
//! use kubecrd_provider::{serve, CrdProvider, ResourceCatalog};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), kubecrd_provider::ProviderError> {
//!     kubecrd_provider::init_logging();
//!     let catalog = ResourceCatalog::from_paths("k8s", &["crds/"])?;
//!     serve(CrdProvider::new(catalog)).await
//! }
//! ```
//!
//! # Handshake Protocol
//!
//! Once listening, the server prints one line to stdout:
//!
//! ```text
//! KUBECRD_PROVIDER|1|127.0.0.1:50051
//! ```
//!
//! The host spawns the provider as a subprocess, reads this line and connects
//! over gRPC.
//!
//! # Provider Protocol
//!
//! - **GetMetadata** / **GetSchema**: type names and schemas
//! - **ValidateProviderConfig** / **Configure** / **Stop**
//! - **ValidateResourceConfig**, **UpgradeResourceState**, **Plan**
//! - **Create** / **Read** / **Update** / **Delete**, **ImportResourceState**
//! - **ValidateDataSourceConfig** / **ReadDataSource**

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod catalog;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod naming;
pub mod openapi;
pub mod plan;
pub mod provider;
pub mod schema;
pub mod server;
pub mod testing;
pub mod types;
pub mod validation;
pub mod wait;

/// Types generated from `proto/provider.proto`.
#[allow(missing_docs)]
#[allow(clippy::all)]
pub mod generated {
    tonic::include_proto!("kubecrd.provider.v1");
}

pub use catalog::{CustomResourceType, ResourceCatalog};
pub use client::{DynamicClient, KubeDynamicClient};
pub use config::ProviderConfig;
pub use error::ProviderError;
pub use logging::{init_logging, init_logging_with_default, try_init_logging};
pub use provider::CrdProvider;
pub use schema::ProviderSchema;
pub use server::{
    serve, serve_on_with_options, serve_with_options, serve_with_shutdown, ProviderService,
    ServeOptions,
};
pub use types::{
    AttributeChange, ImportedResource, PlanResult, ProviderMetadata, ServerCapabilities,
    HANDSHAKE_PREFIX, PROTOCOL_VERSION,
};
pub use validation::{check_provider_schema, is_valid, validate, validate_result};
pub use wait::WaitForDelete;

pub use async_trait::async_trait;
