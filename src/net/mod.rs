//! Cluster-network introspection for the egress-IP fallback: which plugin
//! the cluster runs, and which extra source addresses a node may serve
//! under.

use anyhow::Result;
use kube::api::{Api, DynamicObject, GroupVersionKind};
use kube::core::ApiResource;
use kube::Client;
use log::debug;
use serde::Deserialize;

use crate::approver::EgressContext;

/// The one network type that assigns egress IPs to nodes.
pub const SDN_NETWORK_TYPE: &str = "OpenShiftSDN";

const NETWORK_CONFIG_NAME: &str = "cluster";

fn network_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("config.openshift.io", "v1", "Network"))
}

fn host_subnet_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("network.openshift.io", "v1", "HostSubnet"))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkSpec {
    #[serde(default)]
    network_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HostSubnetRecord {
    #[serde(default, rename = "egressIPs")]
    egress_ips: Option<Vec<String>>,
    #[serde(default, rename = "egressCIDRs")]
    egress_cidrs: Option<Vec<String>>,
}

/// True when the cluster network is of the egress-IP-bearing kind. A
/// missing network config object means no.
pub async fn network_assigns_egress_ips(client: &Client) -> Result<bool> {
    let api: Api<DynamicObject> = Api::all_with(client.clone(), &network_resource());
    let network = match api.get_opt(NETWORK_CONFIG_NAME).await? {
        Some(obj) => obj,
        None => return Ok(false),
    };
    let spec: NetworkSpec = network
        .data
        .get("spec")
        .map(|v| serde_json::from_value(v.clone()))
        .transpose()?
        .unwrap_or_default();
    Ok(spec.network_type.as_deref() == Some(SDN_NETWORK_TYPE))
}

/// Egress addresses declared for a node. A node without a record gets an
/// empty context; the record is optional by design.
pub async fn egress_context_for_node(client: &Client, node_name: &str) -> Result<EgressContext> {
    let api: Api<DynamicObject> = Api::all_with(client.clone(), &host_subnet_resource());
    let subnet = match api.get_opt(node_name).await? {
        Some(obj) => obj,
        None => {
            debug!("node {} has no host subnet record", node_name);
            return Ok(EgressContext::default());
        }
    };
    let record: HostSubnetRecord = serde_json::from_value(subnet.data)?;
    Ok(EgressContext {
        egress_ips: record.egress_ips.unwrap_or_default(),
        egress_cidrs: record.egress_cidrs.unwrap_or_default(),
    })
}
