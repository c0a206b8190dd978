use anyhow::{Context, Result};
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};

/// Holds the two API connections the approver uses. CSRs, nodes, and the
/// kubelet-CA configmap live on the workload plane; machines, network
/// config, and egress records on the control plane. When the planes are
/// not split both fields point at the same connection.
#[derive(Clone)]
pub struct K8sClient {
    workload: Client,
    control: Client,
}

impl K8sClient {
    pub async fn new(
        workload_kubeconfig: Option<&str>,
        control_kubeconfig: Option<&str>,
    ) -> Result<Self> {
        let workload = build_client(workload_kubeconfig).await?;
        let control = match control_kubeconfig {
            Some(path) if Some(path) != workload_kubeconfig => build_client(Some(path)).await?,
            _ => workload.clone(),
        };
        Ok(Self { workload, control })
    }

    pub fn workload(&self) -> &Client {
        &self.workload
    }

    pub fn control(&self) -> &Client {
        &self.control
    }

    pub fn csrs(&self) -> Api<CertificateSigningRequest> {
        Api::all(self.workload.clone())
    }

    pub fn nodes(&self) -> Api<Node> {
        Api::all(self.workload.clone())
    }

    pub fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.workload.clone(), namespace)
    }
}

async fn build_client(kubeconfig: Option<&str>) -> Result<Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("read kubeconfig {}", path))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .with_context(|| format!("load kubeconfig {}", path))?
        }
        None => Config::infer().await.context("infer cluster config")?,
    };
    Client::try_from(config).context("build kube client")
}
