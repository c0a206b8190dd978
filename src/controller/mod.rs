//! The watch-and-reconcile loop. Reconciles are keyed by CSR name; the
//! framework serializes work per key and runs distinct keys in parallel.
//! The engine only ever writes the Approved condition, never Denied.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use kube::api::{Api, ListParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::{watcher, WatchStreamExt};
use kube::ResourceExt;
use log::{debug, error, info, warn};
use openssl::x509::X509;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::approver::{
    authorize_node_client, authorize_node_serving, client_pipeline_enabled, max_pending_csrs,
    recently_pending_csrs,
};
use crate::config::ApproverConfig;
use crate::csr::{
    approval_condition, classify, has_our_approval, is_approved, is_recently_approved_by_other,
    node_name_from_cn, node_name_from_username, parse_csr, NodeCsrKind, NODE_BOOTSTRAPPER_USERNAME,
    NODE_CLIENT_SIGNER, NODE_GROUP, NODE_SERVING_SIGNER,
};
use crate::k8s::K8sClient;
use crate::machines::MachineLister;
use crate::metrics;
use crate::net::{egress_context_for_node, network_assigns_egress_ips};
use crate::probe::{fetch_serving_cert, parse_ca_bundle};

/// Configmap carrying the roots that sign kubelet serving certificates.
pub const CA_CONFIGMAP_NAME: &str = "csr-controller-ca";
pub const CA_CONFIGMAP_NAMESPACE: &str = "openshift-config-managed";
pub const CA_BUNDLE_KEY: &str = "ca-bundle.crt";

const ERROR_REQUEUE: Duration = Duration::from_secs(15);
const RATE_LIMITED_REQUEUE: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum Error {
    #[error("kube API: {0}")]
    Kube(#[from] kube::Error),
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(format!("{:#}", e))
    }
}

pub struct Ctx {
    pub k8s: K8sClient,
    pub machines: MachineLister,
    pub config: ApproverConfig,
    /// Raw `ca-bundle.crt` value, maintained by the configmap watcher and
    /// populated lazily on first use.
    pub ca_bundle: Arc<RwLock<Option<String>>>,
}

impl Ctx {
    pub fn new(k8s: K8sClient, machines: MachineLister, config: ApproverConfig) -> Self {
        Self {
            k8s,
            machines,
            config,
            ca_bundle: Arc::new(RwLock::new(None)),
        }
    }

    /// Current kubelet CA roots, or None when the configmap (or key) is
    /// absent or unparseable. Absence only disables the renewal fast-path.
    async fn load_ca_bundle(&self) -> Result<Option<Vec<X509>>, Error> {
        let cached = self.ca_bundle.read().await.clone();
        let pem = match cached {
            Some(pem) => Some(pem),
            None => {
                let cm = self
                    .k8s
                    .config_maps(CA_CONFIGMAP_NAMESPACE)
                    .get_opt(CA_CONFIGMAP_NAME)
                    .await?;
                let value = cm
                    .and_then(|c| c.data)
                    .and_then(|d| d.get(CA_BUNDLE_KEY).cloned());
                *self.ca_bundle.write().await = value.clone();
                value
            }
        };
        match pem {
            Some(pem) => match parse_ca_bundle(&pem) {
                Ok(bundle) if !bundle.is_empty() => Ok(Some(bundle)),
                Ok(_) => Ok(None),
                Err(e) => {
                    warn!("kubelet CA bundle is unparseable: {}", e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }
}

/// CSRs with any other signer never enter the decision pipeline.
pub fn is_node_csr(csr: &CertificateSigningRequest) -> bool {
    matches!(
        csr.spec.signer_name.as_str(),
        NODE_CLIENT_SIGNER | NODE_SERVING_SIGNER
    )
}

/// Queue-admission predicate. A CSR is worth reconciling iff it has a
/// recognized signer, the requester identity fits that signer, and it is
/// either unapproved or was just approved by someone else (the latter only
/// to refresh the pending gauge).
pub fn should_reconcile(csr: &CertificateSigningRequest) -> bool {
    let identity_ok = match csr.spec.signer_name.as_str() {
        NODE_SERVING_SIGNER => csr
            .spec
            .groups
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|g| g == NODE_GROUP),
        NODE_CLIENT_SIGNER => {
            csr.spec.username.as_deref() == Some(NODE_BOOTSTRAPPER_USERNAME)
        }
        _ => return false,
    };
    if !identity_ok {
        return false;
    }
    if !is_approved(csr) {
        return true;
    }
    is_recently_approved_by_other(csr)
}

async fn reconcile(
    csr: Arc<CertificateSigningRequest>,
    ctx: Arc<Ctx>,
) -> Result<Action, Error> {
    let name = csr.name_any();
    if !should_reconcile(&csr) {
        return Ok(Action::await_change());
    }
    debug!("reconciling CSR {}", name);

    let csr_api = ctx.k8s.csrs();
    let node_csrs: Vec<CertificateSigningRequest> = csr_api
        .list(&ListParams::default())
        .await?
        .items
        .into_iter()
        .filter(is_node_csr)
        .collect();
    let machines = ctx.machines.list_all().await?;
    let nodes = ctx.k8s.nodes().list(&ListParams::default()).await?.items;

    let pending = recently_pending_csrs(&node_csrs, Utc::now());
    let ceiling = max_pending_csrs(machines.len(), nodes.len());
    metrics::set_pending_csrs(pending);
    metrics::set_max_pending_csrs(ceiling);
    if pending > ceiling {
        warn!(
            "{} recently pending node CSRs exceed the ceiling of {}; holding all approvals",
            pending, ceiling
        );
        return Ok(Action::requeue(RATE_LIMITED_REQUEUE));
    }

    let current = match node_csrs
        .iter()
        .find(|c| c.metadata.name.as_deref() == Some(name.as_str()))
    {
        Some(c) => c,
        None => {
            info!("CSR {} no longer in the node CSR list", name);
            return Ok(Action::await_change());
        }
    };

    if is_approved(current) {
        return Ok(Action::await_change());
    }

    let parsed = match parse_csr(current) {
        Ok(p) => p,
        Err(e) => {
            // The payload is immutable; retrying cannot succeed.
            error!("CSR {} has a malformed payload, leaving pending: {:#}", name, e);
            return Ok(Action::await_change());
        }
    };

    let kind = match classify(current, &parsed) {
        Some(kind) => kind,
        None => {
            debug!("CSR {} is not a recognized node CSR", name);
            return Ok(Action::await_change());
        }
    };

    let ca_bundle = ctx.load_ca_bundle().await?;

    match kind {
        NodeCsrKind::Client => {
            if !client_pipeline_enabled(&ctx.config) {
                info!(
                    "client certificate approval is disabled; leaving CSR {} pending",
                    name
                );
                return Ok(Action::await_change());
            }
            let node_exists = node_name_from_cn(&parsed.common_name)
                .map(|n| nodes.iter().any(|node| node.metadata.name.as_deref() == Some(n)))
                .unwrap_or(false);
            authorize_node_client(current, &parsed, &machines, node_exists)?;
        }
        NodeCsrKind::Serving => {
            // Classification guarantees a node name is present.
            let node_name = node_name_from_username(current).unwrap_or_default();
            let node = nodes
                .iter()
                .find(|n| n.metadata.name.as_deref() == Some(node_name));
            let leaf = match (&ca_bundle, node) {
                (Some(bundle), Some(node)) => match fetch_serving_cert(node, bundle).await {
                    Ok(leaf) => Some(leaf),
                    Err(e) => {
                        debug!("serving certificate probe for {} failed: {}", node_name, e);
                        None
                    }
                },
                _ => None,
            };
            let egress = if leaf.is_some()
                && network_assigns_egress_ips(ctx.k8s.control()).await?
            {
                Some(egress_context_for_node(ctx.k8s.control(), node_name).await?)
            } else {
                None
            };
            authorize_node_serving(
                current,
                &parsed,
                &machines,
                leaf.as_ref(),
                ca_bundle.as_deref(),
                egress.as_ref(),
            )?;
        }
    }

    approve(&csr_api, current).await?;
    info!("approved CSR {}", name);

    // Recount from a fresh list so the gauge reflects this approval.
    let fresh: Vec<CertificateSigningRequest> = csr_api
        .list(&ListParams::default())
        .await?
        .items
        .into_iter()
        .filter(is_node_csr)
        .collect();
    metrics::set_pending_csrs(recently_pending_csrs(&fresh, Utc::now()));

    Ok(Action::await_change())
}

/// Write the Approved condition through the approval sub-resource. Skipped
/// when an equivalent condition is already present, preserving the original
/// transition time.
async fn approve(
    api: &Api<CertificateSigningRequest>,
    csr: &CertificateSigningRequest,
) -> Result<(), Error> {
    if has_our_approval(csr) {
        return Ok(());
    }
    let mut updated = csr.clone();
    updated
        .status
        .get_or_insert_with(Default::default)
        .conditions
        .get_or_insert_with(Vec::new)
        .push(approval_condition());
    let name = updated.metadata.name.clone().unwrap_or_default();
    let body = serde_json::to_vec(&updated).map_err(|e| Error::Other(e.to_string()))?;
    api.replace_subresource("approval", &name, &PostParams::default(), body)
        .await?;
    Ok(())
}

fn error_policy(csr: Arc<CertificateSigningRequest>, err: &Error, _ctx: Arc<Ctx>) -> Action {
    error!("reconcile of CSR {} failed: {}", csr.name_any(), err);
    Action::requeue(ERROR_REQUEUE)
}

/// Run the controller until shutdown. The configmap watcher keeps the CA
/// cache current and re-enqueues every CSR when the bundle changes, so
/// renewal fast-paths are retried against the new roots.
pub async fn run(ctx: Ctx) -> anyhow::Result<()> {
    let csr_api = ctx.k8s.csrs();
    let cm_api = ctx.k8s.config_maps(CA_CONFIGMAP_NAMESPACE);
    let cache = ctx.ca_bundle.clone();

    let (trigger_tx, trigger_rx) = futures::channel::mpsc::unbounded::<()>();
    tokio::spawn(async move {
        let cfg =
            watcher::Config::default().fields(&format!("metadata.name={}", CA_CONFIGMAP_NAME));
        let mut stream = watcher(cm_api, cfg).applied_objects().boxed();
        while let Some(event) = stream.next().await {
            let cm = match event {
                Ok(cm) => cm,
                Err(e) => {
                    warn!("kubelet CA configmap watch error: {}", e);
                    continue;
                }
            };
            let value = cm
                .data
                .as_ref()
                .and_then(|d| d.get(CA_BUNDLE_KEY))
                .cloned();
            let mut cached = cache.write().await;
            if *cached != value {
                info!("kubelet CA bundle changed; re-evaluating pending CSRs");
                *cached = value;
                if trigger_tx.unbounded_send(()).is_err() {
                    break;
                }
            }
        }
    });

    Controller::new(csr_api, watcher::Config::default())
        .reconcile_all_on(trigger_rx)
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(ctx))
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!("reconciled {}", obj.name),
                Err(e) => debug!("controller dispatch: {}", e),
            }
        })
        .await;

    Ok(())
}
