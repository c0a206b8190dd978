use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

mod approver;
mod cli;
mod config;
mod controller;
mod csr;
mod k8s;
mod machines;
mod metrics;
mod net;
mod probe;

use cli::Args;
use config::ApproverConfig;
use controller::Ctx;
use k8s::K8sClient;
use machines::{ApiGroupSpec, MachineLister};

const DEFAULT_METRICS_PORT: u16 = 9191;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();

    if let Ok(version) = std::env::var("RELEASE_VERSION") {
        info!("release version {}", version);
    }

    let config = ApproverConfig::load(args.config_file.as_deref().map(Path::new))?;
    if config.node_client_cert.disabled {
        info!("client certificate approval is disabled by configuration");
    }

    let api_groups = if args.api_groups.is_empty() {
        ApiGroupSpec::defaults()
    } else {
        args.api_groups
            .iter()
            .map(|g| ApiGroupSpec::parse(g))
            .collect::<Result<Vec<_>>>()?
    };

    let k8s = K8sClient::new(
        args.kubeconfig.as_deref(),
        args.machine_kubeconfig.as_deref(),
    )
    .await?;
    let machines = MachineLister::new(k8s.control().clone(), api_groups);

    let metrics_addr = metrics_bind_addr()?;
    tokio::spawn(async move {
        if let Err(e) = metrics::serve(metrics_addr).await {
            warn!("metrics server stopped: {:#}", e);
        }
    });
    info!("serving metrics on {}", metrics_addr);

    info!("starting node CSR approver");
    controller::run(Ctx::new(k8s, machines, config)).await?;
    info!("shutdown complete");
    Ok(())
}

fn metrics_bind_addr() -> Result<SocketAddr> {
    let port = match std::env::var("METRICS_PORT") {
        Ok(raw) => raw
            .parse::<u16>()
            .with_context(|| format!("invalid METRICS_PORT {:?}", raw))?,
        Err(_) => DEFAULT_METRICS_PORT,
    };
    Ok(SocketAddr::from(([0, 0, 0, 0], port)))
}
