//! Machine collaborator: lists Machine objects across the configured API
//! groups and exposes the two lookups the authorizers need. Records from
//! different groups are kept as independent entries; nothing is deduplicated.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use kube::api::{Api, DynamicObject, GroupVersionKind, ListParams};
use kube::core::ApiResource;
use kube::{discovery, Client};
use log::{debug, warn};
use serde::Deserialize;

pub const DEFAULT_API_GROUPS: [&str; 2] = ["machine.openshift.io", "cluster.k8s.io"];

const MACHINE_KIND: &str = "Machine";

pub const INTERNAL_IP: &str = "InternalIP";
pub const EXTERNAL_IP: &str = "ExternalIP";
pub const INTERNAL_DNS: &str = "InternalDNS";
pub const EXTERNAL_DNS: &str = "ExternalDNS";
pub const HOSTNAME: &str = "Hostname";

/// One API group to list machines from. A bare group name resolves to the
/// server's preferred version at list time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiGroupSpec {
    pub group: String,
    pub version: Option<String>,
}

impl ApiGroupSpec {
    /// Parse `group` or `group/version`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(anyhow!("API group name must not be empty"));
        }
        match raw.split_once('/') {
            None => Ok(Self {
                group: raw.to_string(),
                version: None,
            }),
            Some((group, version)) if !group.is_empty() && !version.is_empty() => Ok(Self {
                group: group.to_string(),
                version: Some(version.to_string()),
            }),
            Some(_) => Err(anyhow!("invalid API group {:?}", raw)),
        }
    }

    pub fn defaults() -> Vec<Self> {
        DEFAULT_API_GROUPS
            .iter()
            .map(|g| Self {
                group: (*g).to_string(),
                version: None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MachineAddress {
    #[serde(rename = "type")]
    pub address_type: String,
    pub address: String,
}

/// Homogeneous machine record, independent of the source API group.
#[derive(Debug, Clone, Default)]
pub struct MachineRecord {
    pub name: String,
    pub created: Option<DateTime<Utc>>,
    pub node_ref_name: Option<String>,
    pub addresses: Vec<MachineAddress>,
}

impl MachineRecord {
    /// Addresses of the given type, in object order.
    pub fn addresses_of<'a>(&'a self, address_type: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.addresses
            .iter()
            .filter(move |a| a.address_type == address_type)
            .map(|a| a.address.as_str())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MachineStatus {
    #[serde(default)]
    node_ref: Option<NodeRef>,
    #[serde(default)]
    addresses: Vec<MachineAddress>,
}

#[derive(Debug, Deserialize)]
struct NodeRef {
    name: Option<String>,
}

pub struct MachineLister {
    client: Client,
    groups: Vec<ApiGroupSpec>,
}

impl MachineLister {
    pub fn new(client: Client, groups: Vec<ApiGroupSpec>) -> Self {
        Self { client, groups }
    }

    /// List machines across every configured group. A group that is not
    /// installed on the cluster is skipped with a warning so clusters
    /// carrying only one of the two machine APIs keep working.
    pub async fn list_all(&self) -> Result<Vec<MachineRecord>> {
        let mut records = Vec::new();
        for spec in &self.groups {
            let resource = match self.resolve(spec).await {
                Ok(r) => r,
                Err(e) => {
                    warn!("skipping machine API group {}: {}", spec.group, e);
                    continue;
                }
            };
            let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
            let list = api.list(&ListParams::default()).await?;
            debug!(
                "listed {} machines in group {}",
                list.items.len(),
                spec.group
            );
            for obj in list.items {
                records.push(to_record(obj)?);
            }
        }
        Ok(records)
    }

    async fn resolve(&self, spec: &ApiGroupSpec) -> Result<ApiResource> {
        if let Some(version) = &spec.version {
            let gvk = GroupVersionKind::gvk(&spec.group, version, MACHINE_KIND);
            return Ok(ApiResource::from_gvk(&gvk));
        }
        let group = discovery::group(&self.client, &spec.group).await?;
        let (resource, _caps) = group
            .recommended_kind(MACHINE_KIND)
            .ok_or_else(|| anyhow!("group {} does not serve {}", spec.group, MACHINE_KIND))?;
        Ok(resource)
    }
}

fn to_record(obj: DynamicObject) -> Result<MachineRecord> {
    let name = obj.metadata.name.clone().unwrap_or_default();
    let created = obj.metadata.creation_timestamp.as_ref().map(|t| t.0);
    let status: MachineStatus = match obj.data.get("status") {
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| anyhow!("machine {} has malformed status: {}", name, e))?,
        None => MachineStatus::default(),
    };
    Ok(MachineRecord {
        name,
        created,
        node_ref_name: status.node_ref.and_then(|r| r.name),
        addresses: status.addresses,
    })
}

/// Machine whose node reference points at the given node.
pub fn find_by_node_ref<'a>(
    machines: &'a [MachineRecord],
    node_name: &str,
) -> Option<&'a MachineRecord> {
    machines
        .iter()
        .find(|m| m.node_ref_name.as_deref() == Some(node_name))
}

/// Machine advertising the given name as an `InternalDNS` address. This is
/// how a machine is tied to a node that does not exist yet.
pub fn find_by_internal_dns<'a>(
    machines: &'a [MachineRecord],
    name: &str,
) -> Option<&'a MachineRecord> {
    machines
        .iter()
        .find(|m| m.addresses_of(INTERNAL_DNS).any(|a| a == name))
}
