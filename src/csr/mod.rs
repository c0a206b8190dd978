//! CSR payload parsing, classification, and approval-condition helpers.
//! Classification is deliberately strict: anything ambiguous is ignored
//! rather than approved.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use anyhow::{anyhow, bail, Result};
use chrono::{Duration, Utc};
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use x509_parser::prelude::*;

pub const NODE_CLIENT_SIGNER: &str = "kubernetes.io/kube-apiserver-client-kubelet";
pub const NODE_SERVING_SIGNER: &str = "kubernetes.io/kubelet-serving";

pub const NODE_BOOTSTRAPPER_USERNAME: &str =
    "system:serviceaccount:openshift-machine-config-operator:node-bootstrapper";
pub const NODE_USER_PREFIX: &str = "system:node:";
pub const NODE_GROUP: &str = "system:nodes";
pub const AUTHENTICATED_GROUP: &str = "system:authenticated";

pub const APPROVED_CONDITION: &str = "Approved";
pub const APPROVAL_REASON: &str = "NodeCSRApprove";
pub const APPROVAL_MESSAGE: &str =
    "This CSR was approved by the Node CSR Approver (cluster-machine-approver)";

const PEM_BLOCK_TYPE: &str = "CERTIFICATE REQUEST";

/// Usage sets admissible for a node client certificate. The shorter set is
/// what an ECDSA-keyed kubelet requests.
const CLIENT_USAGES: [&[&str]; 2] = [
    &["digital signature", "key encipherment", "client auth"],
    &["digital signature", "client auth"],
];

const SERVING_USAGES: [&[&str]; 2] = [
    &["digital signature", "key encipherment", "server auth"],
    &["digital signature", "server auth"],
];

/// How long after a foreign approval the CSR is still let through the queue
/// predicates so the pending gauge can be refreshed.
pub const FOREIGN_APPROVAL_GRACE: i64 = 30;

/// Owned summary of the inner X.509 request. Extracted once per reconcile so
/// the rest of the pipeline works on plain strings instead of parser
/// lifetimes.
#[derive(Debug, Clone, Default)]
pub struct ParsedRequest {
    pub common_name: String,
    pub organizations: Vec<String>,
    pub dns_names: Vec<String>,
    pub email_addresses: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    pub uris: Vec<String>,
}

impl ParsedRequest {
    pub fn has_san(&self) -> bool {
        !self.dns_names.is_empty()
            || !self.email_addresses.is_empty()
            || !self.ip_addresses.is_empty()
            || !self.uris.is_empty()
    }

    /// IP SANs as canonical strings, for set comparison against live
    /// certificates and machine addresses.
    pub fn ip_strings(&self) -> BTreeSet<String> {
        self.ip_addresses.iter().map(|ip| ip.to_string()).collect()
    }
}

/// Decode the PEM payload of a CSR object and parse the inner X.509
/// certification request. The block label must be `CERTIFICATE REQUEST`.
pub fn parse_csr(csr: &CertificateSigningRequest) -> Result<ParsedRequest> {
    let raw = &csr.spec.request.0;
    let pem = Pem::iter_from_buffer(raw)
        .next()
        .ok_or_else(|| anyhow!("CSR payload contains no PEM block"))?
        .map_err(|e| anyhow!("CSR payload is not valid PEM: {}", e))?;
    if pem.label != PEM_BLOCK_TYPE {
        bail!("PEM block type is {:?}, expected {:?}", pem.label, PEM_BLOCK_TYPE);
    }
    let (_, req) = X509CertificationRequest::from_der(&pem.contents)
        .map_err(|e| anyhow!("failed to parse certification request: {}", e))?;

    let subject = &req.certification_request_info.subject;
    let common_name = subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();
    let organizations = subject
        .iter_organization()
        .filter_map(|o| o.as_str().ok())
        .map(str::to_string)
        .collect();

    let mut parsed = ParsedRequest {
        common_name,
        organizations,
        ..Default::default()
    };

    if let Some(extensions) = req.requested_extensions() {
        for ext in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = ext {
                for name in &san.general_names {
                    match name {
                        GeneralName::DNSName(dns) => parsed.dns_names.push(dns.to_string()),
                        GeneralName::RFC822Name(mail) => {
                            parsed.email_addresses.push(mail.to_string())
                        }
                        GeneralName::URI(uri) => parsed.uris.push(uri.to_string()),
                        GeneralName::IPAddress(bytes) => {
                            parsed.ip_addresses.push(ip_from_bytes(bytes)?)
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    Ok(parsed)
}

pub(crate) fn ip_from_bytes(bytes: &[u8]) -> Result<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().unwrap();
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().unwrap();
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        n => bail!("IP SAN has invalid length {}", n),
    }
}

/// The two CSR flows this engine recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCsrKind {
    /// Bootstrap client certificate for a node joining the cluster.
    Client,
    /// Serving certificate for the kubelet's own endpoint.
    Serving,
}

/// Classify a CSR, or return None for anything that is not unambiguously
/// one of the two node flows.
pub fn classify(csr: &CertificateSigningRequest, req: &ParsedRequest) -> Option<NodeCsrKind> {
    if is_node_client(csr, req) {
        Some(NodeCsrKind::Client)
    } else if is_node_serving(csr, req) {
        Some(NodeCsrKind::Serving)
    } else {
        None
    }
}

fn is_node_client(csr: &CertificateSigningRequest, req: &ParsedRequest) -> bool {
    csr.spec.signer_name == NODE_CLIENT_SIGNER
        && req.organizations == [NODE_GROUP]
        && req.common_name.starts_with(NODE_USER_PREFIX)
        && !req.has_san()
        && usages_allowed(csr, &CLIENT_USAGES)
}

fn is_node_serving(csr: &CertificateSigningRequest, req: &ParsedRequest) -> bool {
    let username = csr.spec.username.as_deref().unwrap_or_default();
    let node_name = username.strip_prefix(NODE_USER_PREFIX).unwrap_or_default();
    let groups = csr.spec.groups.as_deref().unwrap_or_default();

    csr.spec.signer_name == NODE_SERVING_SIGNER
        && !node_name.is_empty()
        && groups.iter().any(|g| g == NODE_GROUP)
        && groups.iter().any(|g| g == AUTHENTICATED_GROUP)
        && usages_allowed(csr, &SERVING_USAGES)
        && req.common_name == username
        && req.organizations.iter().any(|o| o == NODE_GROUP)
}

/// Unordered comparison of the requested usages against the admissible sets.
fn usages_allowed(csr: &CertificateSigningRequest, allowed: &[&[&str]]) -> bool {
    let usages: BTreeSet<&str> = match &csr.spec.usages {
        Some(u) => u.iter().map(String::as_str).collect(),
        None => return false,
    };
    allowed
        .iter()
        .any(|set| usages == set.iter().copied().collect())
}

/// Node name carried in a subject common name, e.g. `system:node:panda`.
pub fn node_name_from_cn(common_name: &str) -> Option<&str> {
    match common_name.strip_prefix(NODE_USER_PREFIX) {
        Some(name) if !name.is_empty() => Some(name),
        _ => None,
    }
}

/// Node name carried in the requester username of a serving CSR.
pub fn node_name_from_username(csr: &CertificateSigningRequest) -> Option<&str> {
    csr.spec
        .username
        .as_deref()
        .and_then(|u| u.strip_prefix(NODE_USER_PREFIX))
        .filter(|n| !n.is_empty())
}

pub fn is_approved(csr: &CertificateSigningRequest) -> bool {
    conditions(csr)
        .iter()
        .any(|c| c.type_ == APPROVED_CONDITION && c.status == "True")
}

/// True when some other approver wrote the approval within the last
/// `FOREIGN_APPROVAL_GRACE` seconds. Such CSRs re-enter the queue once so
/// the pending gauge reflects them; they are never re-approved.
pub fn is_recently_approved_by_other(csr: &CertificateSigningRequest) -> bool {
    let cutoff = Utc::now() - Duration::seconds(FOREIGN_APPROVAL_GRACE);
    conditions(csr).iter().any(|c| {
        c.type_ == APPROVED_CONDITION
            && c.status == "True"
            && c.message.as_deref() != Some(APPROVAL_MESSAGE)
            && c.last_update_time
                .as_ref()
                .map(|t| t.0 > cutoff)
                .unwrap_or(false)
    })
}

fn conditions(csr: &CertificateSigningRequest) -> &[CertificateSigningRequestCondition] {
    csr.status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default()
}

/// The approval condition this engine writes. Both timestamps are set to
/// now; an identical condition already present means the write is skipped
/// upstream, preserving the original transition time.
pub fn approval_condition() -> CertificateSigningRequestCondition {
    let now = Time(Utc::now());
    CertificateSigningRequestCondition {
        type_: APPROVED_CONDITION.to_string(),
        status: "True".to_string(),
        reason: Some(APPROVAL_REASON.to_string()),
        message: Some(APPROVAL_MESSAGE.to_string()),
        last_update_time: Some(now.clone()),
        last_transition_time: Some(now),
    }
}

/// Whether the approval write can be skipped because an equivalent
/// condition is already present.
pub fn has_our_approval(csr: &CertificateSigningRequest) -> bool {
    conditions(csr).iter().any(|c| {
        c.type_ == APPROVED_CONDITION
            && c.status == "True"
            && c.reason.as_deref() == Some(APPROVAL_REASON)
            && c.message.as_deref() == Some(APPROVAL_MESSAGE)
    })
}
