use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use kubecrd_provider::schema::has_errors;
use kubecrd_provider::{
    check_provider_schema, init_logging_with_default, serve_on_with_options, serve_with_options,
    CrdProvider, ProviderError, ProviderService, ResourceCatalog, ServeOptions,
};
use tracing::{error, info, warn};

/// Serve Kubernetes custom resources to an infrastructure-as-code host.
#[derive(Debug, Parser)]
#[command(name = "kubecrd-provider", version, about)]
struct Cli {
    /// CRD manifest files or directories of them
    #[arg(long, env = "KUBECRD_PROVIDER_CRDS", value_delimiter = ',', required = true, num_args = 1..)]
    crds: Vec<PathBuf>,

    /// Prefix of every type name
    #[arg(long, default_value = "k8s")]
    type_prefix: String,

    /// Listen address; a free loopback port when unset
    #[arg(long)]
    address: Option<SocketAddr>,

    /// Grace period for in-flight requests after SIGTERM/SIGINT
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    shutdown_timeout: Duration,

    /// Default log level; RUST_LOG overrides it
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Check the CRDs, print the type names and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), ProviderError> {
    let cli = Cli::parse();
    init_logging_with_default(&cli.log_level);

    let catalog = ResourceCatalog::from_paths(cli.type_prefix.as_str(), cli.crds.as_slice())?;
    if catalog.is_empty() {
        warn!(paths = ?cli.crds, "No served CRD versions found");
    }

    let provider = CrdProvider::new(catalog);
    let diagnostics = check_provider_schema(&provider.schema());
    for diagnostic in &diagnostics {
        error!(
            attribute = diagnostic.attribute.as_deref().unwrap_or_default(),
            detail = diagnostic.detail.as_deref().unwrap_or_default(),
            "{}",
            diagnostic.summary
        );
    }
    if has_errors(&diagnostics) {
        return Err(ProviderError::Validation(format!(
            "{} schema error(s) in the loaded CRDs",
            diagnostics.iter().filter(|d| d.is_error()).count()
        )));
    }

    if cli.check {
        let metadata = provider.metadata();
        for name in metadata.resources.iter().chain(&metadata.data_sources) {
            println!("{}", name);
        }
        return Ok(());
    }

    info!(
        types = provider.catalog().len(),
        prefix = %cli.type_prefix,
        "Loaded custom resource types"
    );
    let options = ServeOptions::new().with_shutdown_timeout(cli.shutdown_timeout);
    match cli.address {
        Some(addr) => serve_on_with_options(provider, addr, options).await,
        None => serve_with_options(provider, options).await,
    }
}
